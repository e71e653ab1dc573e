//! Forced-shutdown semantics: the escalation path must complete in bounded
//! time even when a blocked operation holds the session lock, and every
//! path must tolerate an already-terminated compute system.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use lxhost::instance::CreateProcessParams;
use lxhost::platform::ComputeSystem;
use lxhost::plugin::PluginManager;
use lxhost::{SessionFactory, ShutdownBehavior};

fn factory(env: &TestEnv) -> SessionFactory {
    SessionFactory::new(
        env.platform.clone(),
        env.config.clone(),
        Arc::new(PluginManager::empty()),
    )
}

#[test]
fn force_after_timeout_escalates_past_a_blocked_operation() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-3000", 1).unwrap();
    let distro = register_test_distribution(&session, "wedged").unwrap();

    let (client, _alive) = fake_client(800);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    // Wedge the guest: the next create-process never gets a reply, so the
    // operation blocks while holding the session operation lock.
    env.behavior
        .block_create_process
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let blocked = {
        let session = session.clone();
        let client = client.try_clone().unwrap();
        std::thread::spawn(move || {
            let result = session.create_process(
                Some(distro),
                Some(&client),
                console_for(&client),
                CreateProcessParams {
                    filename: "/bin/sleep".to_string(),
                    current_directory: "/".to_string(),
                    command_line: vec!["sleep".to_string(), "forever".to_string()],
                    ..Default::default()
                },
            );
            // The wedged operation surfaces a channel error once the VM is
            // torn down underneath it.
            assert!(result.is_err());
        })
    };

    // Give the blocked operation time to take the lock.
    std::thread::sleep(Duration::from_millis(300));

    let started = Instant::now();
    session.shutdown(false, ShutdownBehavior::ForceAfter30Seconds);
    let elapsed = started.elapsed();

    // Lock timeout (500 ms in the test config) plus teardown; well under
    // the production 30 s bound.
    assert!(
        elapsed < Duration::from_secs(10),
        "shutdown took {elapsed:?}"
    );
    assert!(!session.has_vm());

    // The compute system is guaranteed not to be running after return.
    for vm_id in env.compute.systems_ids() {
        let system = env.compute.system(vm_id).unwrap();
        assert!(!system.is_running());
    }

    blocked.join().unwrap();
    factory.clear_all_and_block();
}

#[test]
fn force_shutdown_tolerates_already_terminated_system() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-3001", 1).unwrap();
    let distro = register_test_distribution(&session, "gone").unwrap();

    let (client, _alive) = fake_client(801);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    // Terminate the compute system out-of-band, as a concurrent idle
    // shutdown would.
    let vm_id = *env.compute.systems_ids().last().unwrap();
    env.compute
        .system(vm_id)
        .unwrap()
        .terminate()
        .unwrap();

    // Force shutdown must not trip over the missing system.
    session.shutdown(false, ShutdownBehavior::Force);
    assert!(!session.has_vm());

    factory.clear_all_and_block();
}

#[test]
fn wait_shutdown_stops_instances_and_vm() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-3002", 1).unwrap();

    let distro_a = register_test_distribution(&session, "one").unwrap();
    let distro_b = register_test_distribution(&session, "two").unwrap();
    let (client, _alive) = fake_client(802);
    session.create_instance(Some(distro_a), Some(&client)).unwrap();
    session.create_instance(Some(distro_b), Some(&client)).unwrap();

    session.shutdown(false, ShutdownBehavior::Wait);
    assert_eq!(session.running_instance_count(), 0);
    assert!(!session.has_vm());

    // The session is reusable after a non-blocking shutdown.
    session.create_instance(Some(distro_a), Some(&client)).unwrap();
    assert!(session.has_vm());

    factory.clear_all_and_block();
}

#[test]
fn busy_instance_refuses_graceful_stop_but_yields_to_force() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-3003", 1).unwrap();
    let distro = register_test_distribution(&session, "busy").unwrap();

    let (client, _alive) = fake_client(803);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    env.behavior
        .refuse_graceful_stop
        .store(true, std::sync::atomic::Ordering::SeqCst);

    // Graceful terminate is refused; the instance stays.
    session.terminate_distribution(Some(distro)).unwrap();
    assert_eq!(session.running_instance_count(), 1);

    // Shutdown force-stops it regardless.
    session.shutdown(false, ShutdownBehavior::Wait);
    assert_eq!(session.running_instance_count(), 0);

    factory.clear_all_and_block();
}

#[test]
fn unexpected_vm_exit_drops_hosted_instances() {
    init_tracing();
    let env = test_env();
    let factory = factory(&env);
    let session = factory.get_or_create("S-1-5-21-3004", 1).unwrap();
    let distro = register_test_distribution(&session, "crashy").unwrap();

    let (client, _alive) = fake_client(804);
    session.create_instance(Some(distro), Some(&client)).unwrap();

    // Simulate a kernel panic.
    let vm_id = *env.compute.systems_ids().last().unwrap();
    env.compute.system(vm_id).unwrap().signal_exit(
        lxhost::platform::SystemExitEvent::CrashInitiated {
            crash_log: "panic: test".to_string(),
        },
    );

    assert!(wait_until(|| !session.has_vm()));
    assert!(wait_until(|| session.running_instance_count() == 0));

    factory.clear_all_and_block();
}
