//! Crash capture: process dump collection over the crash channel, pruning,
//! and kernel-panic log files.

mod common;

use std::io::{Read, Write};
use std::time::Duration;

use common::*;
use lxhost::platform::{SystemExitEvent, VmTransport};
use lxhost::vm::{crash, VirtualMachine, CRASH_DUMP_PORT};
use lxhost_shared::protocol::{Message, ProcessCrash};

fn start_vm(env: &TestEnv) -> std::sync::Arc<VirtualMachine> {
    let mut settings = env.config.vm.clone();
    settings.crash_dump_dir = env.dir.path().join("crashes");
    VirtualMachine::start(
        settings,
        "S-1-5-21-5000",
        env.platform.compute.clone(),
        env.platform.transport.clone(),
        env.platform.shares.clone(),
    )
    .unwrap()
}

#[test]
fn process_crash_is_written_and_acknowledged() {
    init_tracing();
    let env = test_env();
    let vm = start_vm(&env);

    let mut stream = env
        .transport
        .connect(vm.id(), CRASH_DUMP_PORT, Duration::from_secs(5), None)
        .unwrap();

    let header = ProcessCrash {
        timestamp: 1700000001,
        pid: 4242,
        signal: 11,
        process_name: "my app".to_string(),
    };
    stream.write_all(&header.encode()).unwrap();

    // The server acknowledges with a zero result before draining the dump.
    let mut ack = [0u8; 12];
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.read_exact(&mut ack).unwrap();

    stream.write_all(b"CORE-DUMP-BYTES").unwrap();
    drop(stream);

    let expected = env
        .dir
        .path()
        .join("crashes")
        .join("wsl-crash-1700000001-4242-my_app-11.dmp");
    assert!(wait_until(|| expected.exists()));
    assert!(wait_until(|| std::fs::read(&expected).unwrap() == b"CORE-DUMP-BYTES"));

    drop(vm);
}

#[test]
fn old_dumps_are_pruned_to_the_cap() {
    init_tracing();
    let env = test_env();
    let crash_dir = env.dir.path().join("crashes");
    std::fs::create_dir_all(&crash_dir).unwrap();

    for index in 0..crash::MAX_CRASH_DUMPS {
        let path = crash_dir.join(format!("wsl-crash-{index}-1-old-9.dmp"));
        std::fs::write(&path, b"old").unwrap();
    }
    // A user's own file in the same directory must survive.
    std::fs::write(crash_dir.join("keep-me.dmp"), b"user data").unwrap();

    let vm = start_vm(&env);
    let mut stream = env
        .transport
        .connect(vm.id(), CRASH_DUMP_PORT, Duration::from_secs(5), None)
        .unwrap();
    stream
        .write_all(
            &ProcessCrash {
                timestamp: 1700009999,
                pid: 7,
                signal: 6,
                process_name: "abrt".to_string(),
            }
            .encode(),
        )
        .unwrap();
    let mut ack = [0u8; 12];
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.read_exact(&mut ack).unwrap();
    drop(stream);

    let new_dump = crash_dir.join("wsl-crash-1700009999-7-abrt-6.dmp");
    assert!(wait_until(|| new_dump.exists()));

    let dumps: Vec<_> = std::fs::read_dir(&crash_dir)
        .unwrap()
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(crash::CRASH_DUMP_PREFIX)
        })
        .collect();
    assert!(dumps.len() <= crash::MAX_CRASH_DUMPS);
    assert!(crash_dir.join("keep-me.dmp").exists());

    drop(vm);
}

#[test]
fn kernel_panic_writes_a_log_file() {
    init_tracing();
    let env = test_env();
    let vm = start_vm(&env);
    let vm_id = vm.id();

    env.compute
        .system(vm_id)
        .unwrap()
        .signal_exit(SystemExitEvent::CrashInitiated {
            crash_log: "kernel BUG at mm/slub.c".to_string(),
        });

    let crash_dir = env.dir.path().join("crashes");
    assert!(wait_until(|| {
        std::fs::read_dir(&crash_dir)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    let name = entry.file_name().to_string_lossy().to_string();
                    name.starts_with(crash::KERNEL_PANIC_PREFIX) && name.ends_with(".txt")
                })
            })
            .unwrap_or(false)
    }));

    drop(vm);
}

#[test]
fn shares_are_routed_to_the_provider() {
    init_tracing();
    let env = test_env();
    let vm = start_vm(&env);

    let host_path = env.dir.path().join("shared");
    std::fs::create_dir_all(&host_path).unwrap();

    let share_id = vm.add_share(&host_path, "/mnt/host/shared", false).unwrap();
    assert_eq!(env.shares.shares().len(), 1);

    // Duplicate guest paths are rejected.
    let err = vm.add_share(&host_path, "/mnt/host/shared", true).unwrap_err();
    assert!(matches!(
        err,
        lxhost_shared::errors::LxError::InvalidArgument(_)
    ));

    vm.remove_share(share_id).unwrap();
    assert!(env.shares.shares().is_empty());

    drop(vm);
}
