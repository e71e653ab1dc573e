//! Distribution registrations over the opaque key/value store.
//!
//! The persistence layer itself is an external collaborator; the [`Store`]
//! trait captures the contract the core needs (typed values under
//! slash-separated keys) and [`MemoryStore`] is the in-process adapter.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use lxhost_shared::errors::{LxError, LxResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreValue {
    Dword(u32),
    Str(String),
    MultiStr(Vec<String>),
}

pub trait Store: Send + Sync {
    fn set_value(&self, key: &str, name: &str, value: StoreValue) -> LxResult<()>;

    fn get_value(&self, key: &str, name: &str) -> LxResult<Option<StoreValue>>;

    fn delete_value(&self, key: &str, name: &str) -> LxResult<()>;

    /// Delete a key and everything below it. Deleting a missing key is not
    /// an error.
    fn delete_tree(&self, key: &str) -> LxResult<()>;

    /// Immediate child key names under `key`.
    fn list_children(&self, key: &str) -> LxResult<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<BTreeMap<String, BTreeMap<String, StoreValue>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Store for MemoryStore {
    fn set_value(&self, key: &str, name: &str, value: StoreValue) -> LxResult<()> {
        self.keys
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    fn get_value(&self, key: &str, name: &str) -> LxResult<Option<StoreValue>> {
        Ok(self
            .keys
            .lock()
            .get(key)
            .and_then(|values| values.get(name))
            .cloned())
    }

    fn delete_value(&self, key: &str, name: &str) -> LxResult<()> {
        if let Some(values) = self.keys.lock().get_mut(key) {
            values.remove(name);
        }
        Ok(())
    }

    fn delete_tree(&self, key: &str) -> LxResult<()> {
        let prefix = format!("{key}/");
        self.keys
            .lock()
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }

    fn list_children(&self, key: &str) -> LxResult<Vec<String>> {
        let prefix = format!("{key}/");
        let keys = self.keys.lock();
        let mut children: Vec<String> = keys
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .map(|rest| match rest.find('/') {
                Some(pos) => rest[..pos].to_string(),
                None => rest.to_string(),
            })
            .collect();
        children.dedup();
        Ok(children)
    }
}

bitflags::bitflags! {
    /// Stable on-store encoding; `VM_MODE` is not mutable through the
    /// configure-distribution path.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DistributionFlags: u32 {
        const ENABLE_INTEROP = 0x1;
        const APPEND_NT_PATH = 0x2;
        const ENABLE_DRIVE_MOUNTING = 0x4;
        const VM_MODE = 0x8;
    }
}

impl DistributionFlags {
    pub fn default_flags() -> Self {
        Self::ENABLE_INTEROP | Self::APPEND_NT_PATH | Self::ENABLE_DRIVE_MOUNTING
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DistributionState {
    Invalid = 0,
    Installing = 1,
    Installed = 2,
    Uninstalling = 3,
    Converting = 4,
    Exporting = 5,
}

impl DistributionState {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Installing,
            2 => Self::Installed,
            3 => Self::Uninstalling,
            4 => Self::Converting,
            5 => Self::Exporting,
            _ => Self::Invalid,
        }
    }
}

const DISTRIBUTIONS_KEY: &str = "distributions";
const DEFAULT_DISTRIBUTION_VALUE: &str = "DefaultDistribution";

pub const DEFAULT_UID_ROOT: u32 = 0;
pub const CURRENT_DISTRIBUTION_VERSION: u32 = 2;
pub const VM_MODE_VHD_NAME: &str = "ext4.vhdx";

/// Environment given to distributions that do not override it.
pub fn default_environment() -> Vec<String> {
    vec![
        "HOSTTYPE=x86_64".to_string(),
        "LANG=en_US.UTF-8".to_string(),
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/usr/games:/usr/local/games".to_string(),
        "TERM=xterm-256color".to_string(),
    ]
}

pub struct RegistrationParams {
    pub id: Option<Uuid>,
    pub name: String,
    pub version: u32,
    pub base_path: PathBuf,
    pub flags: DistributionFlags,
    pub default_uid: u32,
    pub package_family_name: Option<String>,
    pub vhd_filename: String,
    pub enable_oobe: bool,
}

#[derive(Clone)]
pub struct DistributionRegistration {
    id: Uuid,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for DistributionRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionRegistration")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl DistributionRegistration {
    pub fn create(store: Arc<dyn Store>, params: RegistrationParams) -> LxResult<Self> {
        let id = params.id.unwrap_or_else(Uuid::new_v4);
        let registration = Self { id, store };

        registration.write_str("DistributionName", &params.name)?;
        registration.write_str("BasePath", &params.base_path.display().to_string())?;
        registration.write_str("VhdFileName", &params.vhd_filename)?;
        registration.write_dword("Version", params.version)?;
        registration.write_dword("Flags", params.flags.bits())?;
        registration.write_dword("DefaultUid", params.default_uid)?;
        registration.write_dword("State", DistributionState::Installing as u32)?;
        registration.write_dword("RunOOBE", params.enable_oobe as u32)?;
        if let Some(package_family_name) = &params.package_family_name {
            registration.write_str("PackageFamilyName", package_family_name)?;
        }
        registration.store.set_value(
            &registration.key(),
            "DefaultEnvironment",
            StoreValue::MultiStr(default_environment()),
        )?;
        Ok(registration)
    }

    pub fn open(store: Arc<dyn Store>, id: Uuid) -> LxResult<Self> {
        let registration = Self { id, store };
        if registration.read_str_opt("DistributionName")?.is_none() {
            return Err(LxError::DistroNotFound);
        }
        Ok(registration)
    }

    pub fn open_default(store: Arc<dyn Store>) -> LxResult<Option<Self>> {
        match store.get_value(DISTRIBUTIONS_KEY, DEFAULT_DISTRIBUTION_VALUE)? {
            Some(StoreValue::Str(id)) => {
                let id = Uuid::parse_str(&id)
                    .map_err(|_| LxError::Internal("malformed default distribution id".into()))?;
                match Self::open(store, id) {
                    Ok(registration) => Ok(Some(registration)),
                    Err(LxError::DistroNotFound) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            _ => Ok(None),
        }
    }

    /// Open by id, falling back to the default distribution.
    pub fn open_or_default(store: Arc<dyn Store>, id: Option<Uuid>) -> LxResult<Self> {
        match id {
            Some(id) => Self::open(store, id),
            None => Self::open_default(store)?.ok_or(LxError::DefaultDistroNotFound),
        }
    }

    pub fn set_default(store: &Arc<dyn Store>, registration: Option<&Self>) -> LxResult<()> {
        match registration {
            Some(registration) => store.set_value(
                DISTRIBUTIONS_KEY,
                DEFAULT_DISTRIBUTION_VALUE,
                StoreValue::Str(registration.id.to_string()),
            ),
            None => store.delete_value(DISTRIBUTIONS_KEY, DEFAULT_DISTRIBUTION_VALUE),
        }
    }

    pub fn default_id(store: &Arc<dyn Store>) -> LxResult<Option<Uuid>> {
        match store.get_value(DISTRIBUTIONS_KEY, DEFAULT_DISTRIBUTION_VALUE)? {
            Some(StoreValue::Str(id)) => Ok(Uuid::parse_str(&id).ok()),
            _ => Ok(None),
        }
    }

    pub fn list(store: &Arc<dyn Store>) -> LxResult<Vec<Self>> {
        let mut registrations = Vec::new();
        for child in store.list_children(DISTRIBUTIONS_KEY)? {
            if let Ok(id) = Uuid::parse_str(&child) {
                if let Ok(registration) = Self::open(store.clone(), id) {
                    registrations.push(registration);
                }
            }
        }
        Ok(registrations)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn key(&self) -> String {
        format!("{DISTRIBUTIONS_KEY}/{}", self.id)
    }

    pub fn name(&self) -> LxResult<String> {
        self.read_str_opt("DistributionName")?
            .ok_or(LxError::DistroNotFound)
    }

    pub fn base_path(&self) -> LxResult<PathBuf> {
        Ok(PathBuf::from(
            self.read_str_opt("BasePath")?.ok_or(LxError::DistroNotFound)?,
        ))
    }

    pub fn vhd_filename(&self) -> LxResult<String> {
        Ok(self
            .read_str_opt("VhdFileName")?
            .unwrap_or_else(|| VM_MODE_VHD_NAME.to_string()))
    }

    pub fn vhd_path(&self) -> LxResult<PathBuf> {
        Ok(self.base_path()?.join(self.vhd_filename()?))
    }

    pub fn version(&self) -> LxResult<u32> {
        Ok(self
            .read_dword_opt("Version")?
            .unwrap_or(CURRENT_DISTRIBUTION_VERSION))
    }

    pub fn flags(&self) -> LxResult<DistributionFlags> {
        Ok(DistributionFlags::from_bits_truncate(
            self.read_dword_opt("Flags")?
                .unwrap_or_else(|| DistributionFlags::default_flags().bits()),
        ))
    }

    pub fn default_uid(&self) -> LxResult<u32> {
        Ok(self.read_dword_opt("DefaultUid")?.unwrap_or(DEFAULT_UID_ROOT))
    }

    pub fn state(&self) -> LxResult<DistributionState> {
        Ok(DistributionState::from_u32(
            self.read_dword_opt("State")?
                .unwrap_or(DistributionState::Invalid as u32),
        ))
    }

    pub fn run_oobe(&self) -> LxResult<bool> {
        Ok(self.read_dword_opt("RunOOBE")?.unwrap_or(0) != 0)
    }

    pub fn package_family_name(&self) -> LxResult<Option<String>> {
        self.read_str_opt("PackageFamilyName")
    }

    pub fn flavor(&self) -> LxResult<Option<String>> {
        self.read_str_opt("Flavor")
    }

    pub fn os_version(&self) -> LxResult<Option<String>> {
        self.read_str_opt("OsVersion")
    }

    pub fn shortcut_path(&self) -> LxResult<Option<PathBuf>> {
        Ok(self.read_str_opt("ShortcutPath")?.map(PathBuf::from))
    }

    pub fn terminal_profile_path(&self) -> LxResult<Option<PathBuf>> {
        Ok(self.read_str_opt("TerminalProfilePath")?.map(PathBuf::from))
    }

    pub fn default_environment(&self) -> LxResult<Vec<String>> {
        match self.store.get_value(&self.key(), "DefaultEnvironment")? {
            Some(StoreValue::MultiStr(environment)) => Ok(environment),
            _ => Ok(default_environment()),
        }
    }

    pub fn set_state(&self, state: DistributionState) -> LxResult<()> {
        self.write_dword("State", state as u32)
    }

    pub fn set_default_uid(&self, uid: u32) -> LxResult<()> {
        self.write_dword("DefaultUid", uid)
    }

    pub fn set_flags(&self, flags: DistributionFlags) -> LxResult<()> {
        self.write_dword("Flags", flags.bits())
    }

    pub fn set_version(&self, version: u32) -> LxResult<()> {
        self.write_dword("Version", version)
    }

    pub fn set_run_oobe(&self, run_oobe: bool) -> LxResult<()> {
        self.write_dword("RunOOBE", run_oobe as u32)
    }

    pub fn set_flavor(&self, flavor: &str) -> LxResult<()> {
        self.write_str("Flavor", flavor)
    }

    pub fn set_os_version(&self, os_version: &str) -> LxResult<()> {
        self.write_str("OsVersion", os_version)
    }

    pub fn delete(&self) -> LxResult<()> {
        self.store.delete_tree(&self.key())
    }

    fn read_str_opt(&self, name: &str) -> LxResult<Option<String>> {
        match self.store.get_value(&self.key(), name)? {
            Some(StoreValue::Str(value)) => Ok(Some(value)),
            Some(_) => Err(LxError::Internal(format!("unexpected type for {name}"))),
            None => Ok(None),
        }
    }

    fn read_dword_opt(&self, name: &str) -> LxResult<Option<u32>> {
        match self.store.get_value(&self.key(), name)? {
            Some(StoreValue::Dword(value)) => Ok(Some(value)),
            Some(_) => Err(LxError::Internal(format!("unexpected type for {name}"))),
            None => Ok(None),
        }
    }

    fn write_str(&self, name: &str, value: &str) -> LxResult<()> {
        self.store
            .set_value(&self.key(), name, StoreValue::Str(value.to_string()))
    }

    fn write_dword(&self, name: &str, value: u32) -> LxResult<()> {
        self.store.set_value(&self.key(), name, StoreValue::Dword(value))
    }
}

/// Persisted attached-disk state, replayed after a VM crash.
pub mod disk_state {
    use super::*;

    const DISK_MOUNTS_KEY: &str = "disk-mounts";

    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct PersistedDisk {
        pub path: PathBuf,
        pub read_only: bool,
    }

    pub fn save(store: &Arc<dyn Store>, disks: &[PersistedDisk]) -> LxResult<()> {
        clear(store)?;
        for (index, disk) in disks.iter().enumerate() {
            let key = format!("{DISK_MOUNTS_KEY}/{index}");
            store.set_value(
                &key,
                "DiskPath",
                StoreValue::Str(disk.path.display().to_string()),
            )?;
            store.set_value(&key, "DiskType", StoreValue::Str("VHD".to_string()))?;
            store.set_value(&key, "ReadOnly", StoreValue::Dword(disk.read_only as u32))?;
        }
        Ok(())
    }

    pub fn load(store: &Arc<dyn Store>) -> LxResult<Vec<PersistedDisk>> {
        let mut disks = Vec::new();
        let mut children = store.list_children(DISK_MOUNTS_KEY)?;
        children.sort_by_key(|child| child.parse::<u32>().unwrap_or(u32::MAX));
        for child in children {
            let key = format!("{DISK_MOUNTS_KEY}/{child}");
            let Some(StoreValue::Str(path)) = store.get_value(&key, "DiskPath")? else {
                continue;
            };
            let read_only = matches!(
                store.get_value(&key, "ReadOnly")?,
                Some(StoreValue::Dword(value)) if value != 0
            );
            disks.push(PersistedDisk {
                path: PathBuf::from(path),
                read_only,
            });
        }
        Ok(disks)
    }

    pub fn clear(store: &Arc<dyn Store>) -> LxResult<()> {
        store.delete_tree(DISK_MOUNTS_KEY)
    }
}
