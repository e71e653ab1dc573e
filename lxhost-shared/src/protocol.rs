//! Host <-> guest control protocol.
//!
//! Every message is `[u32 type][u32 size-including-header][body]`. Bodies are
//! flat: fixed-size fields first, then a trailing byte buffer. Variable-size
//! fields live in the trailing buffer and are referenced by offsets *into the
//! body*; strings are NUL-terminated. All integers are native byte order —
//! the channel never crosses a byte-order boundary. The only network-order
//! integers in the system are the DNS-over-TCP length prefixes, which are
//! opaque payload bytes at this layer.

use uuid::Uuid;

use crate::errors::{LxError, LxResult};

pub const HEADER_SIZE: usize = 8;

/// Maximum size of a DNS-over-UDP request (EDNS).
pub const DNS_MAX_UDP_MESSAGE_SIZE: usize = 4096;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    CreateSession = 1,
    ConfigurationInformation = 2,
    ConfigurationInformationResponse = 3,
    CreateProcess = 4,
    CreateProcessUtilityVm = 5,
    NetworkInformation = 6,
    TimezoneInformation = 7,
    TerminateInstance = 8,
    RemountDrvfs = 9,
    DnsTunneling = 10,
    ProcessCrash = 11,
    Result = 12,
    LaunchInit = 13,
    GetDisk = 14,
    Signal = 15,
    DisconnectConsole = 16,
    OobeResult = 17,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::CreateSession,
            2 => Self::ConfigurationInformation,
            3 => Self::ConfigurationInformationResponse,
            4 => Self::CreateProcess,
            5 => Self::CreateProcessUtilityVm,
            6 => Self::NetworkInformation,
            7 => Self::TimezoneInformation,
            8 => Self::TerminateInstance,
            9 => Self::RemountDrvfs,
            10 => Self::DnsTunneling,
            11 => Self::ProcessCrash,
            12 => Self::Result,
            13 => Self::LaunchInit,
            14 => Self::GetDisk,
            15 => Self::Signal,
            16 => Self::DisconnectConsole,
            17 => Self::OobeResult,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: u32,
    pub message_size: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&self.message_type.to_ne_bytes());
        out[4..].copy_from_slice(&self.message_size.to_ne_bytes());
        out
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            message_type: u32::from_ne_bytes(bytes[..4].try_into().unwrap()),
            message_size: u32::from_ne_bytes(bytes[4..].try_into().unwrap()),
        }
    }
}

fn malformed(message: &'static str, reason: impl Into<String>) -> LxError {
    LxError::Protocol {
        channel: message.to_string(),
        reason: reason.into(),
    }
}

/// Incremental body builder. Fixed fields are written first; trailing data is
/// appended afterwards and the recorded offsets patched into the fixed part.
#[derive(Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

/// Position of a reserved u32 field, to be patched once its value is known.
#[derive(Clone, Copy)]
pub struct FieldSlot(usize);

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn put_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    pub fn reserve_u32(&mut self) -> FieldSlot {
        let slot = FieldSlot(self.buf.len());
        self.put_u32(0);
        slot
    }

    pub fn patch_u32(&mut self, slot: FieldSlot, value: u32) {
        self.buf[slot.0..slot.0 + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Append a NUL-terminated string, returning its body offset.
    pub fn append_cstr(&mut self, value: &str) -> u32 {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.push(0);
        offset
    }

    /// Append a contiguous NUL-separated string array, returning its offset.
    pub fn append_string_array(&mut self, values: &[String]) -> u32 {
        let offset = self.buf.len() as u32;
        for value in values {
            self.buf.extend_from_slice(value.as_bytes());
            self.buf.push(0);
        }
        offset
    }

    pub fn append_bytes(&mut self, bytes: &[u8]) -> u32 {
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(bytes);
        offset
    }

    fn finish(self, message_type: MessageType) -> Vec<u8> {
        let header = MessageHeader {
            message_type: message_type as u32,
            message_size: (HEADER_SIZE + self.buf.len()) as u32,
        };
        let mut out = Vec::with_capacity(HEADER_SIZE + self.buf.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&self.buf);
        out
    }
}

/// Cursor over a received message body (header already stripped).
pub struct BodyReader<'a> {
    message: &'static str,
    body: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(message: &'static str, body: &'a [u8]) -> Self {
        Self {
            message,
            body,
            pos: 0,
        }
    }

    pub fn u32(&mut self) -> LxResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> LxResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> LxResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }

    pub fn uuid(&mut self) -> LxResult<Uuid> {
        let bytes = self.take(16)?;
        Ok(Uuid::from_bytes(bytes.try_into().unwrap()))
    }

    fn take(&mut self, len: usize) -> LxResult<&'a [u8]> {
        if self.pos + len > self.body.len() {
            return Err(malformed(self.message, "body truncated"));
        }
        let out = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// NUL-terminated string at a body offset. Offset 0 inside the fixed
    /// fields region is the conventional "absent" encoding; callers that
    /// allow absence use [`Self::cstr_at_opt`].
    pub fn cstr_at(&self, offset: u32) -> LxResult<String> {
        let start = offset as usize;
        if start >= self.body.len() {
            return Err(malformed(self.message, format!("string offset {offset} out of range")));
        }
        let tail = &self.body[start..];
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed(self.message, "unterminated string"))?;
        String::from_utf8(tail[..end].to_vec())
            .map_err(|_| malformed(self.message, "string is not valid utf-8"))
    }

    pub fn cstr_at_opt(&self, offset: u32) -> LxResult<Option<String>> {
        if offset == 0 {
            return Ok(None);
        }
        self.cstr_at(offset).map(Some)
    }

    /// `count` contiguous NUL-separated strings starting at a body offset.
    pub fn string_array_at(&self, offset: u32, count: u32) -> LxResult<Vec<String>> {
        let mut out = Vec::with_capacity(count as usize);
        let mut cursor = offset as usize;
        for _ in 0..count {
            if cursor >= self.body.len() {
                return Err(malformed(self.message, "string array out of range"));
            }
            let tail = &self.body[cursor..];
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| malformed(self.message, "unterminated string array"))?;
            out.push(
                String::from_utf8(tail[..end].to_vec())
                    .map_err(|_| malformed(self.message, "string is not valid utf-8"))?,
            );
            cursor += end + 1;
        }
        Ok(out)
    }

    pub fn bytes_from(&self, offset: u32) -> LxResult<&'a [u8]> {
        let start = offset as usize;
        if start > self.body.len() {
            return Err(malformed(self.message, "buffer offset out of range"));
        }
        Ok(&self.body[start..])
    }
}

/// A typed protocol message.
pub trait Message: Sized {
    const TYPE: MessageType;
    const NAME: &'static str;

    fn write_body(&self, writer: &mut BodyWriter);
    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self>;

    fn encode(&self) -> Vec<u8> {
        let mut writer = BodyWriter::new();
        self.write_body(&mut writer);
        writer.finish(Self::TYPE)
    }

    fn decode(body: &[u8]) -> LxResult<Self> {
        let mut reader = BodyReader::new(Self::NAME, body);
        Self::read_body(&mut reader)
    }
}

/// Ask init to spawn a session leader bound to a marshalled console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CreateSession {
    pub console_id: u32,
}

impl Message for CreateSession {
    const TYPE: MessageType = MessageType::CreateSession;
    const NAME: &'static str = "CreateSession";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.console_id);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            console_id: reader.u32()?,
        })
    }
}

/// Drop the session leader bound to a marshalled console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DisconnectConsole {
    pub console_id: u32,
}

impl Message for DisconnectConsole {
    const TYPE: MessageType = MessageType::DisconnectConsole;
    const NAME: &'static str = "DisconnectConsole";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.console_id);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            console_id: reader.u32()?,
        })
    }
}

/// Initial per-instance setup sent to init.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigurationInformation {
    pub feature_flags: u32,
    pub default_uid: u32,
    pub drive_bitmap: u32,
    pub mount_drives: bool,
    pub timezone: String,
    pub hostname: String,
    pub plan9_socket_path: String,
}

impl Message for ConfigurationInformation {
    const TYPE: MessageType = MessageType::ConfigurationInformation;
    const NAME: &'static str = "ConfigurationInformation";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.feature_flags);
        writer.put_u32(self.default_uid);
        writer.put_u32(self.drive_bitmap);
        writer.put_u32(self.mount_drives as u32);
        let timezone = writer.reserve_u32();
        let hostname = writer.reserve_u32();
        let plan9 = writer.reserve_u32();
        let offset = writer.append_cstr(&self.timezone);
        writer.patch_u32(timezone, offset);
        let offset = writer.append_cstr(&self.hostname);
        writer.patch_u32(hostname, offset);
        let offset = writer.append_cstr(&self.plan9_socket_path);
        writer.patch_u32(plan9, offset);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let feature_flags = reader.u32()?;
        let default_uid = reader.u32()?;
        let drive_bitmap = reader.u32()?;
        let mount_drives = reader.u32()? != 0;
        let timezone = reader.u32()?;
        let hostname = reader.u32()?;
        let plan9 = reader.u32()?;
        Ok(Self {
            feature_flags,
            default_uid,
            drive_bitmap,
            mount_drives,
            timezone: reader.cstr_at(timezone)?,
            hostname: reader.cstr_at(hostname)?,
            plan9_socket_path: reader.cstr_at(plan9)?,
        })
    }
}

/// Init's reply to [`ConfigurationInformation`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigurationInformationResponse {
    pub default_uid: u32,
    pub init_pid: u32,
    pub plan9_port: u32,
    pub flavor: Option<String>,
    pub os_version: Option<String>,
}

impl Message for ConfigurationInformationResponse {
    const TYPE: MessageType = MessageType::ConfigurationInformationResponse;
    const NAME: &'static str = "ConfigurationInformationResponse";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.default_uid);
        writer.put_u32(self.init_pid);
        writer.put_u32(self.plan9_port);
        let flavor = writer.reserve_u32();
        let os_version = writer.reserve_u32();
        if let Some(value) = &self.flavor {
            let offset = writer.append_cstr(value);
            writer.patch_u32(flavor, offset);
        }
        if let Some(value) = &self.os_version {
            let offset = writer.append_cstr(value);
            writer.patch_u32(os_version, offset);
        }
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let default_uid = reader.u32()?;
        let init_pid = reader.u32()?;
        let plan9_port = reader.u32()?;
        let flavor = reader.u32()?;
        let os_version = reader.u32()?;
        Ok(Self {
            default_uid,
            init_pid,
            plan9_port,
            flavor: reader.cstr_at_opt(flavor)?,
            os_version: reader.cstr_at_opt(os_version)?,
        })
    }
}

/// Fields common to both process-launch flavors, laid out in wire order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateProcessCommon {
    pub default_uid: u32,
    pub filename: String,
    pub current_directory: String,
    pub command_line: Vec<String>,
    pub environment: Vec<String>,
    pub nt_environment: Vec<String>,
    pub shell_options: u32,
    pub nt_path: String,
    pub username: String,
    pub flags: u32,
}

impl CreateProcessCommon {
    fn write(&self, writer: &mut BodyWriter) -> CommonSlots {
        writer.put_u32(self.default_uid);
        CommonSlots {
            filename: writer.reserve_u32(),
            cwd: writer.reserve_u32(),
            command_line: {
                let slot = writer.reserve_u32();
                writer.put_u32(self.command_line.len() as u32);
                slot
            },
            environment: {
                let slot = writer.reserve_u32();
                writer.put_u32(self.environment.len() as u32);
                slot
            },
            nt_environment: {
                let slot = writer.reserve_u32();
                writer.put_u32(self.nt_environment.len() as u32);
                slot
            },
            nt_path: {
                writer.put_u32(self.shell_options);
                writer.reserve_u32()
            },
            username: {
                let slot = writer.reserve_u32();
                writer.put_u32(self.flags);
                slot
            },
        }
    }

    fn append_trailing(&self, writer: &mut BodyWriter, slots: CommonSlots) {
        let offset = writer.append_cstr(&self.filename);
        writer.patch_u32(slots.filename, offset);
        let offset = writer.append_cstr(&self.current_directory);
        writer.patch_u32(slots.cwd, offset);
        let offset = writer.append_string_array(&self.command_line);
        writer.patch_u32(slots.command_line, offset);
        let offset = writer.append_string_array(&self.environment);
        writer.patch_u32(slots.environment, offset);
        let offset = writer.append_string_array(&self.nt_environment);
        writer.patch_u32(slots.nt_environment, offset);
        let offset = writer.append_cstr(&self.nt_path);
        writer.patch_u32(slots.nt_path, offset);
        let offset = writer.append_cstr(&self.username);
        writer.patch_u32(slots.username, offset);
    }

    fn read(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let default_uid = reader.u32()?;
        let filename = reader.u32()?;
        let cwd = reader.u32()?;
        let command_line = reader.u32()?;
        let command_line_count = reader.u32()?;
        let environment = reader.u32()?;
        let environment_count = reader.u32()?;
        let nt_environment = reader.u32()?;
        let nt_environment_count = reader.u32()?;
        let shell_options = reader.u32()?;
        let nt_path = reader.u32()?;
        let username = reader.u32()?;
        let flags = reader.u32()?;
        Ok(Self {
            default_uid,
            filename: reader.cstr_at(filename)?,
            current_directory: reader.cstr_at(cwd)?,
            command_line: reader.string_array_at(command_line, command_line_count)?,
            environment: reader.string_array_at(environment, environment_count)?,
            nt_environment: reader.string_array_at(nt_environment, nt_environment_count)?,
            shell_options,
            nt_path: reader.cstr_at(nt_path)?,
            username: reader.cstr_at(username)?,
            flags,
        })
    }
}

struct CommonSlots {
    filename: FieldSlot,
    cwd: FieldSlot,
    command_line: FieldSlot,
    environment: FieldSlot,
    nt_environment: FieldSlot,
    nt_path: FieldSlot,
    username: FieldSlot,
}

/// Launch a process inside a legacy in-kernel instance. Carries the
/// kernel-marshalled stdio and token identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateProcessLegacy {
    pub common: CreateProcessCommon,
    pub stdio_ids: [u32; 3],
    pub token_id: u32,
}

impl Message for CreateProcessLegacy {
    const TYPE: MessageType = MessageType::CreateProcess;
    const NAME: &'static str = "CreateProcess";

    fn write_body(&self, writer: &mut BodyWriter) {
        let slots = self.common.write(writer);
        for id in self.stdio_ids {
            writer.put_u32(id);
        }
        writer.put_u32(self.token_id);
        self.common.append_trailing(writer, slots);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let common = CreateProcessCommon::read(reader)?;
        let stdio_ids = [reader.u32()?, reader.u32()?, reader.u32()?];
        let token_id = reader.u32()?;
        Ok(Self {
            common,
            stdio_ids,
            token_id,
        })
    }
}

/// Launch a process inside a VM-hosted instance. The reply carries a single
/// port number to which the fd connections are made in fixed order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateProcessVm {
    pub common: CreateProcessCommon,
    pub columns: u32,
    pub rows: u32,
    pub std_console_flags: u32,
    pub elevated: bool,
    pub interop_enabled: bool,
    pub allow_oobe: bool,
}

impl Message for CreateProcessVm {
    const TYPE: MessageType = MessageType::CreateProcessUtilityVm;
    const NAME: &'static str = "CreateProcessUtilityVm";

    fn write_body(&self, writer: &mut BodyWriter) {
        let slots = self.common.write(writer);
        writer.put_u32(self.columns);
        writer.put_u32(self.rows);
        writer.put_u32(self.std_console_flags);
        writer.put_u32(self.elevated as u32);
        writer.put_u32(self.interop_enabled as u32);
        writer.put_u32(self.allow_oobe as u32);
        self.common.append_trailing(writer, slots);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let common = CreateProcessCommon::read(reader)?;
        let columns = reader.u32()?;
        let rows = reader.u32()?;
        let std_console_flags = reader.u32()?;
        let elevated = reader.u32()? != 0;
        let interop_enabled = reader.u32()? != 0;
        let allow_oobe = reader.u32()? != 0;
        Ok(Self {
            common,
            columns,
            rows,
            std_console_flags,
            elevated,
            interop_enabled,
            allow_oobe,
        })
    }
}

/// Updated `/etc/resolv.conf` contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInformation {
    pub resolv_conf: String,
}

impl Message for NetworkInformation {
    const TYPE: MessageType = MessageType::NetworkInformation;
    const NAME: &'static str = "NetworkInformation";

    fn write_body(&self, writer: &mut BodyWriter) {
        let slot = writer.reserve_u32();
        let offset = writer.append_cstr(&self.resolv_conf);
        writer.patch_u32(slot, offset);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let offset = reader.u32()?;
        Ok(Self {
            resolv_conf: reader.cstr_at(offset)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimezoneInformation {
    pub timezone: String,
}

impl Message for TimezoneInformation {
    const TYPE: MessageType = MessageType::TimezoneInformation;
    const NAME: &'static str = "TimezoneInformation";

    fn write_body(&self, writer: &mut BodyWriter) {
        let slot = writer.reserve_u32();
        let offset = writer.append_cstr(&self.timezone);
        writer.patch_u32(slot, offset);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let offset = reader.u32()?;
        Ok(Self {
            timezone: reader.cstr_at(offset)?,
        })
    }
}

/// Request graceful instance termination; the reply result is non-zero when
/// init refused because user processes are still running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminateInstance {
    pub force: bool,
}

impl Message for TerminateInstance {
    const TYPE: MessageType = MessageType::TerminateInstance;
    const NAME: &'static str = "TerminateInstance";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.force as u32);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            force: reader.u32()? != 0,
        })
    }
}

/// Request drive mounts under a fresh mount namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemountDrvfs {
    pub drive_bitmap: u32,
    pub unreadable_drive_bitmap: u32,
    pub default_uid: u32,
    pub admin: bool,
}

impl Message for RemountDrvfs {
    const TYPE: MessageType = MessageType::RemountDrvfs;
    const NAME: &'static str = "RemountDrvfs";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.drive_bitmap);
        writer.put_u32(self.unreadable_drive_bitmap);
        writer.put_u32(self.default_uid);
        writer.put_u32(self.admin as u32);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            drive_bitmap: reader.u32()?,
            unreadable_drive_bitmap: reader.u32()?,
            default_uid: reader.u32()?,
            admin: reader.u32()? != 0,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DnsProtocol {
    Tcp = 6,
    Udp = 17,
}

/// `{protocol, correlation id}` pair identifying a tunnelled DNS request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DnsClientId {
    pub protocol: DnsProtocol,
    pub id: u32,
}

/// A DNS request or response tunnelled between guest and host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsTunneling {
    pub client: DnsClientId,
    pub buffer: Vec<u8>,
}

impl Message for DnsTunneling {
    const TYPE: MessageType = MessageType::DnsTunneling;
    const NAME: &'static str = "DnsTunneling";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.client.protocol as u32);
        writer.put_u32(self.client.id);
        writer.append_bytes(&self.buffer);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let protocol = match reader.u32()? {
            6 => DnsProtocol::Tcp,
            17 => DnsProtocol::Udp,
            other => {
                return Err(malformed(
                    Self::NAME,
                    format!("unexpected protocol {other}"),
                ))
            }
        };
        let id = reader.u32()?;
        let buffer = reader.bytes_from(8)?.to_vec();
        Ok(Self {
            client: DnsClientId { protocol, id },
            buffer,
        })
    }
}

/// Header preceding a raw core dump relayed out of the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessCrash {
    pub timestamp: u64,
    pub pid: u32,
    pub signal: u32,
    pub process_name: String,
}

impl Message for ProcessCrash {
    const TYPE: MessageType = MessageType::ProcessCrash;
    const NAME: &'static str = "ProcessCrash";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u64(self.timestamp);
        writer.put_u32(self.pid);
        writer.put_u32(self.signal);
        writer.append_cstr(&self.process_name);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let timestamp = reader.u64()?;
        let pid = reader.u32()?;
        let signal = reader.u32()?;
        Ok(Self {
            timestamp,
            pid,
            signal,
            process_name: reader.cstr_at(16)?,
        })
    }
}

/// Generic 32-bit result reply. Zero is success; positive values carry a
/// payload (a port or pid); negative values are errno-style failures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultMessage {
    pub result: i32,
}

impl Message for ResultMessage {
    const TYPE: MessageType = MessageType::Result;
    const NAME: &'static str = "Result";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_i32(self.result);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            result: reader.i32()?,
        })
    }
}

/// Ask the guest supervisor to start an init for a distribution; the reply
/// carries the port its control channel listens on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchInit {
    pub distribution_id: Uuid,
    pub name: String,
}

impl Message for LaunchInit {
    const TYPE: MessageType = MessageType::LaunchInit;
    const NAME: &'static str = "LaunchInit";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_uuid(&self.distribution_id);
        let slot = writer.reserve_u32();
        let offset = writer.append_cstr(&self.name);
        writer.patch_u32(slot, offset);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let distribution_id = reader.uuid()?;
        let offset = reader.u32()?;
        Ok(Self {
            distribution_id,
            name: reader.cstr_at(offset)?,
        })
    }
}

/// Ask init for the device node of a freshly attached SCSI disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetDisk {
    pub lun: u32,
}

impl Message for GetDisk {
    const TYPE: MessageType = MessageType::GetDisk;
    const NAME: &'static str = "GetDisk";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_u32(self.lun);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self { lun: reader.u32()? })
    }
}

/// Reply to [`GetDisk`]: result code plus the guest device node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetDiskResponse {
    pub result: i32,
    pub device: String,
}

impl Message for GetDiskResponse {
    const TYPE: MessageType = MessageType::GetDisk;
    const NAME: &'static str = "GetDiskResponse";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_i32(self.result);
        let slot = writer.reserve_u32();
        let offset = writer.append_cstr(&self.device);
        writer.patch_u32(slot, offset);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        let result = reader.i32()?;
        let offset = reader.u32()?;
        Ok(Self {
            result,
            device: reader.cstr_at(offset)?,
        })
    }
}

/// Deliver a signal to a process inside the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    pub pid: i32,
    pub signal: i32,
}

impl Message for Signal {
    const TYPE: MessageType = MessageType::Signal;
    const NAME: &'static str = "Signal";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_i32(self.pid);
        writer.put_i32(self.signal);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            pid: reader.i32()?,
            signal: reader.i32()?,
        })
    }
}

/// First-run-experience outcome reported by the distribution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OobeResult {
    pub result: i32,
    pub default_uid: u32,
}

impl Message for OobeResult {
    const TYPE: MessageType = MessageType::OobeResult;
    const NAME: &'static str = "OobeResult";

    fn write_body(&self, writer: &mut BodyWriter) {
        writer.put_i32(self.result);
        writer.put_u32(self.default_uid);
    }

    fn read_body(reader: &mut BodyReader<'_>) -> LxResult<Self> {
        Ok(Self {
            result: reader.i32()?,
            default_uid: reader.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_includes_header() {
        let encoded = CreateSession { console_id: 7 }.encode();
        let header = MessageHeader::decode(encoded[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.message_type, MessageType::CreateSession as u32);
        assert_eq!(header.message_size as usize, encoded.len());
        assert_eq!(encoded.len(), HEADER_SIZE + 4);
    }

    #[test]
    fn create_process_offsets_resolve() {
        let message = CreateProcessVm {
            common: CreateProcessCommon {
                default_uid: 1000,
                filename: "/bin/echo".into(),
                current_directory: "/home/user".into(),
                command_line: vec!["echo".into(), "hi".into()],
                environment: vec!["PATH=/usr/bin".into(), "TERM=xterm".into()],
                nt_environment: vec!["SystemRoot=C:\\Windows".into()],
                shell_options: 3,
                nt_path: "C:\\Users\\user".into(),
                username: "user".into(),
                flags: 0x11,
            },
            columns: 120,
            rows: 40,
            std_console_flags: 0b101,
            elevated: false,
            interop_enabled: true,
            allow_oobe: false,
        };

        let encoded = message.encode();
        let decoded = CreateProcessVm::decode(&encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn absent_optional_strings_decode_as_none() {
        let response = ConfigurationInformationResponse {
            default_uid: 1000,
            init_pid: 2,
            plan9_port: 0,
            flavor: None,
            os_version: None,
        };
        let encoded = response.encode();
        let decoded =
            ConfigurationInformationResponse::decode(&encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded.flavor, None);
        assert_eq!(decoded.os_version, None);
    }

    #[test]
    fn dns_tunneling_preserves_payload_bytes() {
        let message = DnsTunneling {
            client: DnsClientId {
                protocol: DnsProtocol::Udp,
                id: 42,
            },
            buffer: vec![0x00, 0x05, 0xff, 0x01],
        };
        let encoded = message.encode();
        let decoded = DnsTunneling::decode(&encoded[HEADER_SIZE..]).unwrap();
        assert_eq!(decoded.buffer, message.buffer);
        assert_eq!(decoded.client, message.client);
    }

    #[test]
    fn truncated_body_is_rejected() {
        let encoded = Signal { pid: 1, signal: 9 }.encode();
        let err = Signal::decode(&encoded[HEADER_SIZE..HEADER_SIZE + 4]).unwrap_err();
        assert!(matches!(err, LxError::Protocol { .. }));
    }
}
