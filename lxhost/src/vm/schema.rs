//! Compute-system document model.
//!
//! The compute service consumes a JSON description of the virtual machine;
//! these types serialize to that document. Field names follow the service's
//! PascalCase schema; optional blocks are omitted when unset.

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemDocument {
    pub owner: String,
    pub should_terminate_on_last_handle_closed: bool,
    pub schema_version: SchemaVersion,
    pub virtual_machine: VirtualMachineSettings,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualMachineSettings {
    pub stop_on_reset: bool,
    pub chipset: Chipset,
    pub compute_topology: ComputeTopology,
    pub devices: Devices,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Chipset {
    pub use_utc: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linux_kernel_direct: Option<LinuxKernelDirect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uefi: Option<Uefi>,
}

/// Direct kernel boot (x86_64).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LinuxKernelDirect {
    pub kernel_file_path: String,
    pub init_rd_path: String,
    pub kernel_cmd_line: String,
}

/// UEFI boot from a VMBFS share (arm64).
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Uefi {
    pub boot_this: UefiBootEntry,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UefiBootEntry {
    pub device_type: String,
    pub vmb_fs_root_path: String,
    pub device_path: String,
    pub optional_data: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeTopology {
    pub memory: Memory,
    pub processor: Processor,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Memory {
    #[serde(rename = "SizeInMB")]
    pub size_in_mb: u64,
    pub allow_overcommit: bool,
    pub enable_deferred_commit: bool,
    pub enable_cold_discard_hint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backing_page_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_cluster_size_shift: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_map_fault_cluster_size_shift: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hosting_process_name_suffix: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Processor {
    pub count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_perfmon_pmu: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_perfmon_lbr: Option<bool>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Devices {
    pub scsi: BTreeMap<String, Scsi>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtio_serial: Option<VirtioSerial>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_socket: Option<HvSocket>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pmem: BTreeMap<String, PmemDevice>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Scsi {
    pub attachments: BTreeMap<String, ScsiAttachment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiAttachment {
    #[serde(rename = "Type")]
    pub attachment_type: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PmemDevice {
    pub image_path: String,
    pub read_only: bool,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtioSerial {
    pub ports: BTreeMap<String, VirtioSerialPort>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtioSerialPort {
    pub name: String,
    pub named_pipe: String,
    pub console_support: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocket {
    pub hv_socket_config: HvSocketSystemConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HvSocketSystemConfig {
    pub default_bind_security_descriptor: String,
    pub default_connect_security_descriptor: String,
}

/// Security descriptor granting the system account and `user_sid` full
/// access to guest socket binds and connects.
pub fn hvsocket_security_descriptor(user_sid: &str) -> String {
    format!("D:P(A;;FA;;;SY)(A;;FA;;;{user_sid})")
}
