//! Attached-disk behavior: LUN allocation, grant-and-retry, unwind on
//! failure, and persistence across VM restarts.

mod common;

use std::sync::Arc;

use common::*;
use lxhost::plugin::PluginManager;
use lxhost::SessionFactory;

fn factory(env: &TestEnv) -> SessionFactory {
    SessionFactory::new(
        env.platform.clone(),
        env.config.clone(),
        Arc::new(PluginManager::empty()),
    )
}

fn vhd(env: &TestEnv, name: &str) -> std::path::PathBuf {
    let path = env.dir.path().join(name);
    std::fs::write(&path, b"vhd").unwrap();
    path
}

#[test]
fn luns_are_allocated_smallest_first() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-2000", 1).unwrap();

    let first = vhd(&env, "x.vhdx");
    let second = vhd(&env, "y.vhdx");
    let third = vhd(&env, "z.vhdx");

    let (lun_a, device_a) = session.attach_disk(&first, false).unwrap();
    let (lun_b, _) = session.attach_disk(&second, false).unwrap();
    assert_eq!(lun_a, 0);
    assert_eq!(lun_b, 1);
    assert_eq!(device_a, "/dev/sdc");

    // Detaching LUN 0 frees the smallest slot for the next attach.
    session.detach_disk(&first).unwrap();
    let (lun_c, _) = session.attach_disk(&third, false).unwrap();
    assert_eq!(lun_c, 0);

    factory.clear_all_and_block();
}

#[test]
fn access_denied_is_granted_and_retried_once() {
    init_tracing();
    let env = test_env();
    env.compute.set_require_disk_grant(true);

    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-2001", 1).unwrap();

    let disk = vhd(&env, "granted.vhdx");
    let (lun, _) = session.attach_disk(&disk, false).unwrap();
    assert_eq!(lun, 0);

    // The grant was recorded against the VM.
    let vm_id = env.compute.systems_ids()[0];
    assert_eq!(env.compute.granted_paths(vm_id), vec![disk.clone()]);

    // Detach revokes the paired grant.
    session.detach_disk(&disk).unwrap();
    assert!(env.compute.granted_paths(vm_id).is_empty());

    factory.clear_all_and_block();
}

#[test]
fn failed_attach_leaves_tables_unchanged() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-2002", 1).unwrap();

    let first = vhd(&env, "a.vhdx");
    let failing = vhd(&env, "failing.vhdx");

    session.attach_disk(&first, false).unwrap();

    let vm_id = env.compute.systems_ids()[0];
    let system = env.compute.system(vm_id).unwrap();
    system.fail_next_vhd_add();

    session.attach_disk(&failing, false).unwrap_err();

    // LUN pool, grant set and compute-system disk table are unchanged.
    let disks = system.attached_disks();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks.get(&0), Some(&first));
    assert!(env.compute.granted_paths(vm_id).is_empty());

    // The failed LUN is immediately reusable.
    let next = vhd(&env, "next.vhdx");
    let (lun, _) = session.attach_disk(&next, false).unwrap();
    assert_eq!(lun, 1);

    factory.clear_all_and_block();
}

#[test]
fn disk_state_replays_on_next_vm() {
    init_tracing();
    let mut env = test_env();
    env.config.vm_idle_timeout = Some(std::time::Duration::from_millis(150));

    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-2003", 1).unwrap();

    let disk = vhd(&env, "persistent.vhdx");
    session.attach_disk(&disk, true).unwrap();
    assert!(session.has_vm());

    // Idle timeout drops the VM and persists the attached-disk state.
    assert!(wait_until(|| !session.has_vm()));

    // The next VM re-attaches the disk during creation.
    let distro = register_test_distribution(&session, "replay").unwrap();
    let (client, _alive) = fake_client(700);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    let vm_id = *env.compute.systems_ids().last().unwrap();
    let system = env.compute.system(vm_id).unwrap();
    assert!(wait_until(|| system
        .attached_disks()
        .values()
        .any(|path| path == &disk)));

    factory.clear_all_and_block();
}

#[test]
fn explicit_shutdown_clears_persisted_disk_state() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-2004", 1).unwrap();

    let disk = vhd(&env, "cleared.vhdx");
    session.attach_disk(&disk, false).unwrap();

    session.shutdown(false, lxhost::ShutdownBehavior::Wait);

    let store: Arc<dyn lxhost::registry::Store> = env.store.clone();
    assert!(lxhost::registry::disk_state::load(&store).unwrap().is_empty());

    factory.clear_all_and_block();
}
