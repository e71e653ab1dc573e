//! Guest crash capture.
//!
//! A dedicated thread accepts one crash connection at a time, reads the
//! crash header, acknowledges, and relays the core dump into a file in the
//! user's per-VM crash directory. Kernel-panic logs and preserved
//! saved-state files are written from the compute-system exit callback.
//! Every category is pruned oldest-first to a fixed cap, and only files
//! matching the expected prefix and extension are ever deleted.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use lxhost_shared::errors::{LxError, LxResult};
use lxhost_shared::protocol::{
    Message, MessageHeader, MessageType, ProcessCrash, ResultMessage, HEADER_SIZE,
};
use lxhost_shared::sync::Event;

use crate::platform::VmListener;

pub const CRASH_DUMP_PREFIX: &str = "wsl-crash";
pub const CRASH_DUMP_EXTENSION: &str = "dmp";
pub const KERNEL_PANIC_PREFIX: &str = "kernel-panic-";
pub const KERNEL_PANIC_EXTENSION: &str = "txt";
pub const SAVED_STATE_PREFIX: &str = "saved-state-";
pub const SAVED_STATE_EXTENSION: &str = "vmrs";

/// Keep at most this many process dumps.
pub const MAX_CRASH_DUMPS: usize = 10;
/// Keep at most this many kernel-panic logs and saved-state files.
pub const MAX_VM_CRASH_FILES: usize = 3;

/// Guests have this long to send the crash header after connecting.
const CRASH_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Replace anything that is not alphanumeric, '.', or '-'.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Delete the oldest files matching `prefix`/`extension` until fewer than
/// `limit` remain, making room for one more.
pub fn enforce_file_limit(dir: &Path, limit: usize, prefix: &str, extension: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut matching: Vec<(std::time::SystemTime, std::path::PathBuf)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?;
            if !name.starts_with(prefix) {
                return None;
            }
            if path.extension()?.to_str()? != extension {
                return None;
            }
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, path))
        })
        .collect();

    matching.sort();
    while matching.len() >= limit {
        let (_, path) = matching.remove(0);
        tracing::info!(path = %path.display(), "pruning old crash file");
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!(error = %err, path = %path.display(), "failed to prune crash file");
        }
    }
}

/// Accept crash connections until `exit_event` fires.
pub fn collect_crash_dumps(
    listener: Box<dyn VmListener>,
    exit_event: Arc<Event>,
    crash_dump_dir: std::path::PathBuf,
) {
    while !exit_event.is_set() {
        match listener.accept(None, Some(exit_event.as_ref())) {
            Ok(stream) => {
                if let Err(err) = collect_one_dump(stream, &crash_dump_dir) {
                    tracing::error!(error = %err, "failed to collect crash dump");
                }
            }
            Err(LxError::Cancelled) => break,
            Err(err) => {
                tracing::error!(error = %err, "crash dump accept failed");
                break;
            }
        }
    }
}

fn collect_one_dump(mut stream: std::os::unix::net::UnixStream, dir: &Path) -> LxResult<()> {
    stream.set_read_timeout(Some(CRASH_HEADER_TIMEOUT))?;

    let mut header_bytes = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_bytes)?;
    let header = MessageHeader::decode(&header_bytes);
    if header.message_type != MessageType::ProcessCrash as u32
        || (header.message_size as usize) < HEADER_SIZE
    {
        return Err(LxError::Protocol {
            channel: "crash-dump".to_string(),
            reason: format!("unexpected message type {}", header.message_type),
        });
    }

    let mut body = vec![0u8; header.message_size as usize - HEADER_SIZE];
    stream.read_exact(&mut body)?;
    let crash = ProcessCrash::decode(&body)?;

    let filename = sanitize_filename(&format!(
        "{}-{}-{}-{}-{}.{}",
        CRASH_DUMP_PREFIX,
        crash.timestamp,
        crash.pid,
        crash.process_name,
        crash.signal,
        CRASH_DUMP_EXTENSION
    ));
    let full_path = dir.join(filename);

    tracing::info!(
        path = %full_path.display(),
        pid = crash.pid,
        signal = crash.signal,
        process = %crash.process_name,
        "guest process crashed"
    );

    std::fs::create_dir_all(dir)?;
    enforce_file_limit(dir, MAX_CRASH_DUMPS, CRASH_DUMP_PREFIX, CRASH_DUMP_EXTENSION);

    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&full_path)?;

    // Acknowledge before draining the payload.
    stream.write_all(&ResultMessage { result: 0 }.encode())?;
    stream.set_read_timeout(None)?;
    std::io::copy(&mut stream, &mut file)?;
    Ok(())
}

/// Write a kernel-panic crash log, pruned to [`MAX_VM_CRASH_FILES`].
pub fn write_kernel_panic_log(dir: &Path, vm_id: &str, crash_log: &str) -> LxResult<()> {
    std::fs::create_dir_all(dir)?;
    enforce_file_limit(dir, MAX_VM_CRASH_FILES, KERNEL_PANIC_PREFIX, KERNEL_PANIC_EXTENSION);

    let filename = format!(
        "{}{}-{}.{}",
        KERNEL_PANIC_PREFIX,
        chrono::Utc::now().timestamp(),
        vm_id,
        KERNEL_PANIC_EXTENSION
    );
    let path = dir.join(filename);
    std::fs::write(&path, crash_log)?;
    tracing::info!(path = %path.display(), "captured kernel panic log");
    Ok(())
}

/// Prune preserved saved-state files to [`MAX_VM_CRASH_FILES`].
pub fn enforce_saved_state_limit(dir: &Path) {
    enforce_file_limit(
        dir,
        MAX_VM_CRASH_FILES + 1,
        SAVED_STATE_PREFIX,
        SAVED_STATE_EXTENSION,
    );
}
