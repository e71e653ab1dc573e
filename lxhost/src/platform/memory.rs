//! In-memory platform adapters.
//!
//! These back the test suite and local development: a compute service that
//! tracks system state without partitioning anything, NAT/firewall
//! registries that record rules, a share provider that records shares, and a
//! queue-backed user-callback pipe.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use lxhost_shared::errors::{LxError, LxResult};

use super::{
    ComputeService, ComputeSystem, FirewallRegistry, FirewallRule, NatRegistry, ShareProvider,
    SystemExitCallback, SystemExitEvent, UserCallbackSource,
};

pub struct MemoryComputeService {
    self_weak: std::sync::Weak<MemoryComputeService>,
    systems: Mutex<HashMap<Uuid, Arc<MemoryComputeSystem>>>,
    grants: Mutex<HashSet<(Uuid, PathBuf)>>,
    /// When set, `add_vhd` fails with access-denied until the path has been
    /// granted to the VM, mirroring the production service's behavior.
    require_disk_grant: AtomicBool,
}

impl MemoryComputeService {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_weak: weak.clone(),
            systems: Mutex::new(HashMap::new()),
            grants: Mutex::new(HashSet::new()),
            require_disk_grant: AtomicBool::new(false),
        })
    }

    pub fn set_require_disk_grant(&self, require: bool) {
        self.require_disk_grant.store(require, Ordering::SeqCst);
    }

    pub fn system(&self, id: Uuid) -> Option<Arc<MemoryComputeSystem>> {
        self.systems.lock().get(&id).cloned()
    }

    /// Ids of every system ever created, in creation order.
    pub fn systems_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<(std::time::Instant, Uuid)> = Vec::new();
        let systems = self.systems.lock();
        for (id, system) in systems.iter() {
            ids.push((system.created_at, *id));
        }
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    pub fn granted_paths(&self, vm_id: Uuid) -> Vec<PathBuf> {
        self.grants
            .lock()
            .iter()
            .filter(|(id, _)| *id == vm_id)
            .map(|(_, path)| path.clone())
            .collect()
    }

    fn is_granted(&self, vm_id: Uuid, path: &Path) -> bool {
        self.grants.lock().contains(&(vm_id, path.to_path_buf()))
    }
}

impl ComputeService for MemoryComputeService {
    fn create_system(&self, id: Uuid, document: &str) -> LxResult<Arc<dyn ComputeSystem>> {
        let mut systems = self.systems.lock();
        if systems.contains_key(&id) {
            return Err(LxError::Internal(format!("system {id} already exists")));
        }
        let system = Arc::new(MemoryComputeSystem {
            id,
            service: self.self_weak.clone(),
            created_at: std::time::Instant::now(),
            document: document.to_string(),
            state: Mutex::new(SystemState::Created),
            disks: Mutex::new(BTreeMap::new()),
            gpu_added: AtomicBool::new(false),
            fail_next_vhd_add: AtomicBool::new(false),
            exit_callbacks: Mutex::new(Vec::new()),
        });
        systems.insert(id, system.clone());
        Ok(system)
    }

    fn open_system(&self, id: Uuid) -> LxResult<Arc<dyn ComputeSystem>> {
        self.systems
            .lock()
            .get(&id)
            .cloned()
            .map(|s| s as Arc<dyn ComputeSystem>)
            .ok_or(LxError::ComputeSystemGone)
    }

    fn grant_vm_access(&self, vm_id: Uuid, path: &Path) -> LxResult<()> {
        self.grants.lock().insert((vm_id, path.to_path_buf()));
        Ok(())
    }

    fn revoke_vm_access(&self, vm_id: Uuid, path: &Path) -> LxResult<()> {
        self.grants.lock().remove(&(vm_id, path.to_path_buf()));
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SystemState {
    Created,
    Running,
    Terminated,
}

pub struct MemoryComputeSystem {
    id: Uuid,
    service: std::sync::Weak<MemoryComputeService>,
    created_at: std::time::Instant,
    document: String,
    state: Mutex<SystemState>,
    disks: Mutex<BTreeMap<u32, PathBuf>>,
    gpu_added: AtomicBool,
    fail_next_vhd_add: AtomicBool,
    exit_callbacks: Mutex<Vec<SystemExitCallback>>,
}

impl MemoryComputeSystem {
    pub fn document(&self) -> &str {
        &self.document
    }

    pub fn attached_disks(&self) -> BTreeMap<u32, PathBuf> {
        self.disks.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.state.lock() == SystemState::Running
    }

    pub fn gpu_added(&self) -> bool {
        self.gpu_added.load(Ordering::SeqCst)
    }

    /// Make the next `add_vhd` call fail, for unwind testing.
    pub fn fail_next_vhd_add(&self) {
        self.fail_next_vhd_add.store(true, Ordering::SeqCst);
    }

    /// Deliver a guest-originated exit event (kernel panic, crash report).
    pub fn signal_exit(&self, event: SystemExitEvent) {
        {
            let mut state = self.state.lock();
            if *state == SystemState::Terminated {
                return;
            }
            *state = SystemState::Terminated;
        }
        for callback in self.exit_callbacks.lock().iter() {
            callback(&event);
        }
    }
}

impl ComputeSystem for MemoryComputeSystem {
    fn start(&self) -> LxResult<()> {
        let mut state = self.state.lock();
        if *state != SystemState::Created {
            return Err(LxError::IllegalStateChange("compute-system start"));
        }
        *state = SystemState::Running;
        Ok(())
    }

    fn terminate(&self) -> LxResult<()> {
        self.signal_exit(SystemExitEvent::Exited);
        Ok(())
    }

    fn add_vhd(&self, path: &Path, lun: u32, read_only: bool) -> LxResult<()> {
        let _ = read_only;
        if self.fail_next_vhd_add.swap(false, Ordering::SeqCst) {
            return Err(LxError::Internal("injected vhd attach failure".into()));
        }

        if let Some(service) = self.service.upgrade() {
            if service.require_disk_grant.load(Ordering::SeqCst)
                && !service.is_granted(self.id, path)
            {
                return Err(LxError::AccessDenied(path.display().to_string()));
            }
        }

        let mut disks = self.disks.lock();
        if disks.contains_key(&lun) {
            return Err(LxError::Internal(format!("lun {lun} already attached")));
        }
        disks.insert(lun, path.to_path_buf());
        Ok(())
    }

    fn remove_vhd(&self, lun: u32) -> LxResult<()> {
        self.disks
            .lock()
            .remove(&lun)
            .map(|_| ())
            .ok_or_else(|| LxError::Internal(format!("lun {lun} not attached")))
    }

    fn add_gpu(&self) -> LxResult<()> {
        self.gpu_added.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn register_exit_callback(&self, callback: SystemExitCallback) -> LxResult<()> {
        self.exit_callbacks.lock().push(callback);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNatRegistry {
    names: Mutex<Vec<String>>,
}

impl MemoryNatRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-seed an entry, simulating state left behind by an earlier run.
    pub fn seed(&self, name: &str) {
        self.names.lock().push(name.to_string());
    }
}

impl NatRegistry for MemoryNatRegistry {
    fn create(&self, name: &str) -> LxResult<()> {
        let mut names = self.names.lock();
        if names.iter().any(|n| n == name) {
            return Err(LxError::Internal(format!("NAT '{name}' already exists")));
        }
        names.push(name.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> LxResult<()> {
        let mut names = self.names.lock();
        let before = names.len();
        names.retain(|n| n != name);
        if names.len() == before {
            return Err(LxError::Internal(format!("NAT '{name}' not found")));
        }
        Ok(())
    }

    fn list_names(&self) -> LxResult<Vec<String>> {
        Ok(self.names.lock().clone())
    }
}

#[derive(Default)]
pub struct MemoryFirewallRegistry {
    rules: Mutex<Vec<FirewallRule>>,
}

impl MemoryFirewallRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, name: &str, address: Ipv4Addr, port: u16) {
        self.rules.lock().push(FirewallRule {
            name: name.to_string(),
            address,
            port,
        });
    }
}

impl FirewallRegistry for MemoryFirewallRegistry {
    fn add_rule(&self, rule: &FirewallRule) -> LxResult<()> {
        self.rules.lock().push(rule.clone());
        Ok(())
    }

    fn remove_rule(&self, name: &str) -> LxResult<()> {
        let mut rules = self.rules.lock();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        if rules.len() == before {
            return Err(LxError::Internal(format!("rule '{name}' not found")));
        }
        Ok(())
    }

    fn list_rules(&self) -> LxResult<Vec<FirewallRule>> {
        Ok(self.rules.lock().clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShareRecord {
    Plan9 {
        vm_id: Uuid,
        name: String,
        host_path: PathBuf,
        port: u32,
        read_only: bool,
    },
    VirtioFs {
        vm_id: Uuid,
        tag: String,
        host_path: PathBuf,
        device_instance_id: Uuid,
    },
}

#[derive(Default)]
pub struct MemoryShareProvider {
    shares: Mutex<Vec<ShareRecord>>,
}

impl MemoryShareProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn shares(&self) -> Vec<ShareRecord> {
        self.shares.lock().clone()
    }
}

impl ShareProvider for MemoryShareProvider {
    fn add_plan9_share(
        &self,
        vm_id: Uuid,
        name: &str,
        host_path: &Path,
        port: u32,
        read_only: bool,
    ) -> LxResult<()> {
        self.shares.lock().push(ShareRecord::Plan9 {
            vm_id,
            name: name.to_string(),
            host_path: host_path.to_path_buf(),
            port,
            read_only,
        });
        Ok(())
    }

    fn remove_plan9_share(&self, vm_id: Uuid, name: &str) -> LxResult<()> {
        self.shares.lock().retain(|record| {
            !matches!(record, ShareRecord::Plan9 { vm_id: id, name: n, .. }
                if *id == vm_id && n == name)
        });
        Ok(())
    }

    fn add_virtiofs_device(
        &self,
        vm_id: Uuid,
        tag: &str,
        host_path: &Path,
        read_only: bool,
    ) -> LxResult<Uuid> {
        let _ = read_only;
        let device_instance_id = Uuid::new_v4();
        self.shares.lock().push(ShareRecord::VirtioFs {
            vm_id,
            tag: tag.to_string(),
            host_path: host_path.to_path_buf(),
            device_instance_id,
        });
        Ok(device_instance_id)
    }

    fn remove_virtiofs_device(&self, vm_id: Uuid, device_instance_id: Uuid) -> LxResult<()> {
        self.shares.lock().retain(|record| {
            !matches!(record, ShareRecord::VirtioFs { vm_id: id, device_instance_id: dev, .. }
                if *id == vm_id && *dev == device_instance_id)
        });
        Ok(())
    }
}

/// Queue-backed [`UserCallbackSource`]: tests submit request payloads and
/// inspect the responses written back.
pub struct QueueUserCallbackSource {
    state: Mutex<QueueState>,
    cond: Condvar,
    responses: Mutex<Vec<(u64, i32)>>,
    response_cond: Condvar,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<(u64, Vec<u8>)>,
    next_id: u64,
    cancelled: bool,
}

impl QueueUserCallbackSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            responses: Mutex::new(Vec::new()),
            response_cond: Condvar::new(),
        })
    }

    /// Queue a request payload; returns the callback id it was assigned.
    pub fn submit(&self, payload: Vec<u8>) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.push_back((id, payload));
        self.cond.notify_all();
        id
    }

    /// Block until a response for `callback_id` arrives.
    pub fn wait_for_response(&self, callback_id: u64) -> i32 {
        let mut responses = self.responses.lock();
        loop {
            if let Some((_, status)) = responses.iter().find(|(id, _)| *id == callback_id) {
                return *status;
            }
            self.response_cond.wait(&mut responses);
        }
    }

    pub fn responses(&self) -> Vec<(u64, i32)> {
        self.responses.lock().clone()
    }
}

impl UserCallbackSource for QueueUserCallbackSource {
    fn next_request(&self, buffer: &mut [u8]) -> LxResult<Option<(u64, usize)>> {
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Ok(None);
            }
            if let Some((id, payload)) = state.pending.pop_front() {
                let len = payload.len().min(buffer.len());
                buffer[..len].copy_from_slice(&payload[..len]);
                return Ok(Some((id, len)));
            }
            self.cond.wait(&mut state);
        }
    }

    fn send_response(&self, callback_id: u64, status: i32) -> LxResult<()> {
        self.responses.lock().push((callback_id, status));
        self.response_cond.notify_all();
        Ok(())
    }

    fn cancel(&self) {
        self.state.lock().cancelled = true;
        self.cond.notify_all();
    }
}
