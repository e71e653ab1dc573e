//! Lifecycle plugin dispatch.
//!
//! Plugins are registered as hook tables (loading and activation glue are
//! external). Start hooks can veto the operation; stop hooks are
//! best-effort. A plugin built against a newer API than this host fails
//! every VM start with a dedicated error so the caller can prompt for an
//! update.
//!
//! Hooks run while the session operation lock is held and may call back
//! into read-only session operations; mutating registration state from a
//! hook is unsupported.

use parking_lot::Mutex;
use uuid::Uuid;

use lxhost_shared::errors::{LxError, LxResult};

/// API version implemented by this host.
pub const PLUGIN_API_VERSION: ApiVersion = ApiVersion { major: 1, minor: 2 };

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

/// Context handed to VM-level hooks.
#[derive(Clone, Debug)]
pub struct VmEventContext {
    pub vm_id: Uuid,
    pub user_sid: String,
}

/// Context handed to distribution-level hooks.
#[derive(Clone, Debug)]
pub struct DistributionInfo {
    pub id: Uuid,
    pub name: String,
    pub package_family_name: Option<String>,
    pub init_pid: u32,
}

/// `Err` carries the plugin's user-visible message.
pub type PluginHookResult = Result<(), String>;

type VmHook = Box<dyn Fn(&VmEventContext) -> PluginHookResult + Send + Sync>;
type DistributionHook =
    Box<dyn Fn(&VmEventContext, &DistributionInfo) -> PluginHookResult + Send + Sync>;

pub struct PluginHooks {
    pub name: String,
    pub required_version: ApiVersion,
    pub on_vm_started: Option<VmHook>,
    pub on_vm_stopping: Option<VmHook>,
    pub on_distribution_started: Option<DistributionHook>,
    pub on_distribution_stopping: Option<DistributionHook>,
}

impl PluginHooks {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required_version: PLUGIN_API_VERSION,
            on_vm_started: None,
            on_vm_stopping: None,
            on_distribution_started: None,
            on_distribution_stopping: None,
        }
    }
}

pub struct PluginManager {
    plugins: Vec<PluginHooks>,
    /// Plugins requiring a newer host; their presence fails VM start.
    incompatible: Vec<String>,
    last_error: Mutex<Option<String>>,
}

impl PluginManager {
    pub fn new(plugins: Vec<PluginHooks>) -> Self {
        let (compatible, incompatible): (Vec<_>, Vec<_>) = plugins
            .into_iter()
            .partition(|plugin| plugin.required_version <= PLUGIN_API_VERSION);

        let incompatible: Vec<String> = incompatible
            .into_iter()
            .map(|plugin| {
                tracing::warn!(
                    plugin = %plugin.name,
                    required = ?plugin.required_version,
                    "plugin requires a newer host"
                );
                plugin.name
            })
            .collect();

        Self {
            plugins: compatible,
            incompatible,
            last_error: Mutex::new(None),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Message from the most recent failing hook, for error reporting.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn on_vm_started(&self, context: &VmEventContext) -> LxResult<()> {
        if let Some(name) = self.incompatible.first() {
            return Err(LxError::PluginRequiresUpdate(name.clone()));
        }

        for plugin in &self.plugins {
            if let Some(hook) = &plugin.on_vm_started {
                hook(context).map_err(|message| self.record_failure(plugin, message))?;
            }
        }
        Ok(())
    }

    pub fn on_vm_stopping(&self, context: &VmEventContext) {
        for plugin in &self.plugins {
            if let Some(hook) = &plugin.on_vm_stopping {
                if let Err(message) = hook(context) {
                    tracing::warn!(plugin = %plugin.name, %message, "OnVmStopping failed");
                }
            }
        }
    }

    pub fn on_distribution_started(
        &self,
        context: &VmEventContext,
        distribution: &DistributionInfo,
    ) -> LxResult<()> {
        for plugin in &self.plugins {
            if let Some(hook) = &plugin.on_distribution_started {
                hook(context, distribution)
                    .map_err(|message| self.record_failure(plugin, message))?;
            }
        }
        Ok(())
    }

    pub fn on_distribution_stopping(
        &self,
        context: &VmEventContext,
        distribution: &DistributionInfo,
    ) {
        for plugin in &self.plugins {
            if let Some(hook) = &plugin.on_distribution_stopping {
                if let Err(message) = hook(context, distribution) {
                    tracing::warn!(
                        plugin = %plugin.name,
                        %message,
                        "OnDistributionStopping failed"
                    );
                }
            }
        }
    }

    fn record_failure(&self, plugin: &PluginHooks, message: String) -> LxError {
        tracing::error!(plugin = %plugin.name, %message, "plugin rejected operation");
        *self.last_error.lock() = Some(message.clone());
        LxError::PluginError {
            plugin: plugin.name.clone(),
            message,
        }
    }
}
