//! iptables emulation.
//!
//! Guest iptables requests arrive through the user-callback pump and are
//! translated into host NAT instances and firewall port rules. Rules carry a
//! unique name prefix so a startup scan can remove anything left behind by
//! an abnormal exit.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::Mutex;

use lxhost_shared::errors::{LxError, LxResult};

use crate::platform::{FirewallRegistry, FirewallRule, NatRegistry, UserCallbackSource};

use super::pump::UserCallbackPump;

/// Name prefix identifying host rules owned by this subsystem.
pub const RULE_NAME_PREFIX: &str = "WSL_";

/// Size of the buffer posted to the callback source.
pub const CALLBACK_BUFFER_SIZE: usize = 64;

const DATA_TYPE_MASQUERADE: u32 = 1;
const DATA_TYPE_PORT: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub prefix_length: u8,
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_length)
    }
}

/// A decoded iptables request off the callback pipe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpTablesRequest {
    Masquerade { prefix: Ipv4Cidr, enable: bool },
    FirewallPort { address: Ipv4Addr, port: u16, enable: bool },
}

impl IpTablesRequest {
    /// Wire layout: `[data-type u32][enable u32][family u32][address 4
    /// octets][prefix-length u32][port u32]`, integers native byte order,
    /// address in network octet order.
    pub fn decode(buffer: &[u8]) -> LxResult<Self> {
        if buffer.len() < 24 {
            return Err(LxError::InvalidArgument(
                "iptables request too short".into(),
            ));
        }
        let u32_at = |offset: usize| {
            u32::from_ne_bytes(buffer[offset..offset + 4].try_into().unwrap())
        };

        let data_type = u32_at(0);
        let enable = u32_at(4) != 0;
        let family = u32_at(8);
        let address = Ipv4Addr::new(buffer[12], buffer[13], buffer[14], buffer[15]);
        let prefix_length = u32_at(16);
        let port = u32_at(20);

        if family != libc::AF_INET as u32 {
            return Err(LxError::InvalidArgument(format!(
                "unsupported address family {family}"
            )));
        }

        match data_type {
            DATA_TYPE_MASQUERADE => {
                if port != 0 {
                    return Err(LxError::InvalidArgument(
                        "masquerade request with a port".into(),
                    ));
                }
                Ok(Self::Masquerade {
                    prefix: Ipv4Cidr {
                        address,
                        prefix_length: prefix_length.min(32) as u8,
                    },
                    enable,
                })
            }
            DATA_TYPE_PORT => Ok(Self::FirewallPort {
                address,
                port: port as u16,
                enable,
            }),
            other => Err(LxError::InvalidArgument(format!(
                "unknown iptables data type {other}"
            ))),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24);
        let (data_type, enable, address, prefix_length, port) = match self {
            Self::Masquerade { prefix, enable } => (
                DATA_TYPE_MASQUERADE,
                *enable,
                prefix.address,
                prefix.prefix_length as u32,
                0u32,
            ),
            Self::FirewallPort {
                address,
                port,
                enable,
            } => (DATA_TYPE_PORT, *enable, *address, 0, *port as u32),
        };
        out.extend_from_slice(&data_type.to_ne_bytes());
        out.extend_from_slice(&(enable as u32).to_ne_bytes());
        out.extend_from_slice(&(libc::AF_INET as u32).to_ne_bytes());
        out.extend_from_slice(&address.octets());
        out.extend_from_slice(&prefix_length.to_ne_bytes());
        out.extend_from_slice(&port.to_ne_bytes());
        out
    }
}

struct NatEntry {
    name: String,
    prefix: Ipv4Cidr,
}

struct PortEntry {
    name: String,
    address: Ipv4Addr,
    port: u16,
}

#[derive(Default)]
struct RuleState {
    translators: Vec<NatEntry>,
    firewall_ports: Vec<PortEntry>,
}

pub struct IpTablesEmulator {
    nat_registry: Arc<dyn NatRegistry>,
    firewall_registry: Arc<dyn FirewallRegistry>,
    state: Mutex<RuleState>,
    pump: Mutex<Option<UserCallbackPump>>,
}

impl IpTablesEmulator {
    pub fn new(
        nat_registry: Arc<dyn NatRegistry>,
        firewall_registry: Arc<dyn FirewallRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            nat_registry,
            firewall_registry,
            state: Mutex::new(RuleState::default()),
            pump: Mutex::new(None),
        })
    }

    /// Attach the emulator to an instance's callback pipe.
    pub fn enable(self: &Arc<Self>, source: Arc<dyn UserCallbackSource>) -> LxResult<()> {
        let emulator = self.clone();
        let pump = UserCallbackPump::start(source, CALLBACK_BUFFER_SIZE, move |buffer| {
            emulator.handle_request(buffer)
        })?;
        *self.pump.lock() = Some(pump);
        Ok(())
    }

    /// Handle one request; returns 0 on success or a negative errno.
    pub fn handle_request(&self, buffer: &[u8]) -> i32 {
        let request = match IpTablesRequest::decode(buffer) {
            Ok(request) => request,
            Err(err) => {
                tracing::error!(error = %err, "malformed iptables request");
                return -libc::EINVAL;
            }
        };

        match request {
            IpTablesRequest::Masquerade { prefix, enable } => {
                self.handle_masquerade(prefix, enable)
            }
            IpTablesRequest::FirewallPort {
                address,
                port,
                enable,
            } => self.handle_firewall_port(address, port, enable),
        }
    }

    /// The NAT address range is restricted to 172.17.0.0/16 by agreement
    /// with the host network service.
    fn is_allowed_masquerade_prefix(prefix: &Ipv4Cidr) -> bool {
        let octets = prefix.address.octets();
        octets[0] == 172 && octets[1] == 17 && prefix.prefix_length >= 16
    }

    fn handle_masquerade(&self, prefix: Ipv4Cidr, enable: bool) -> i32 {
        if !Self::is_allowed_masquerade_prefix(&prefix) {
            tracing::error!(%prefix, "address not supported for NAT");
            return -libc::EINVAL;
        }

        let mut state = self.state.lock();
        if enable {
            let name = format!("{RULE_NAME_PREFIX}{prefix}");
            match self.nat_registry.create(&name) {
                Ok(()) => {
                    state.translators.push(NatEntry { name, prefix });
                    0
                }
                Err(err) => {
                    tracing::error!(error = %err, %prefix, "failed to create NAT");
                    -libc::EINVAL
                }
            }
        } else {
            let Some(index) = state
                .translators
                .iter()
                .position(|entry| entry.prefix == prefix)
            else {
                return -libc::ENOENT;
            };
            let entry = state.translators.remove(index);
            match self.nat_registry.remove(&entry.name) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, %prefix, "failed to remove NAT");
                    -libc::EINVAL
                }
            }
        }
    }

    fn handle_firewall_port(&self, address: Ipv4Addr, port: u16, enable: bool) -> i32 {
        if port == 0 {
            tracing::error!("firewall port request without a port");
            return -libc::EINVAL;
        }

        let mut state = self.state.lock();
        if enable {
            let name = format!("{RULE_NAME_PREFIX}{address}");
            let rule = FirewallRule {
                name: name.clone(),
                address,
                port,
            };
            match self.firewall_registry.add_rule(&rule) {
                Ok(()) => {
                    state.firewall_ports.push(PortEntry {
                        name,
                        address,
                        port,
                    });
                    0
                }
                Err(err) => {
                    tracing::error!(error = %err, %address, port, "failed to add firewall rule");
                    -libc::EINVAL
                }
            }
        } else {
            let Some(index) = state
                .firewall_ports
                .iter()
                .position(|entry| entry.address == address && entry.port == port)
            else {
                return -libc::ENOENT;
            };
            let entry = state.firewall_ports.remove(index);
            match self.firewall_registry.remove_rule(&entry.name) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!(error = %err, %address, "failed to remove firewall rule");
                    -libc::EINVAL
                }
            }
        }
    }

    /// Remove any host rules carrying the unique prefix, left behind by an
    /// abnormal exit of a previous service process.
    pub fn cleanup_remnants(
        nat_registry: &Arc<dyn NatRegistry>,
        firewall_registry: &Arc<dyn FirewallRegistry>,
    ) {
        match nat_registry.list_names() {
            Ok(names) => {
                for name in names
                    .iter()
                    .filter(|name| name.starts_with(RULE_NAME_PREFIX))
                {
                    tracing::info!(%name, "removing leftover NAT");
                    if let Err(err) = nat_registry.remove(name) {
                        tracing::warn!(error = %err, %name, "failed to remove leftover NAT");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to enumerate NATs"),
        }

        match firewall_registry.list_rules() {
            Ok(rules) => {
                for rule in rules
                    .iter()
                    .filter(|rule| rule.name.starts_with(RULE_NAME_PREFIX))
                {
                    tracing::info!(name = %rule.name, "removing leftover firewall rule");
                    if let Err(err) = firewall_registry.remove_rule(&rule.name) {
                        tracing::warn!(error = %err, name = %rule.name, "failed to remove leftover rule");
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "failed to enumerate firewall rules"),
        }
    }

    pub fn stop(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.stop();
        }
        self.reverse_all();
    }

    /// Reverse any rules still standing, as on instance teardown.
    fn reverse_all(&self) {
        let mut state = self.state.lock();
        for entry in state.translators.drain(..) {
            if let Err(err) = self.nat_registry.remove(&entry.name) {
                tracing::warn!(error = %err, name = %entry.name, "failed to remove NAT on teardown");
            }
        }
        for entry in state.firewall_ports.drain(..) {
            if let Err(err) = self.firewall_registry.remove_rule(&entry.name) {
                tracing::warn!(error = %err, name = %entry.name, "failed to remove rule on teardown");
            }
        }
    }
}

impl Drop for IpTablesEmulator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::{MemoryFirewallRegistry, MemoryNatRegistry};

    fn emulator() -> (
        Arc<IpTablesEmulator>,
        Arc<MemoryNatRegistry>,
        Arc<MemoryFirewallRegistry>,
    ) {
        let nat = MemoryNatRegistry::new();
        let firewall = MemoryFirewallRegistry::new();
        let emulator = IpTablesEmulator::new(nat.clone(), firewall.clone());
        (emulator, nat, firewall)
    }

    fn masquerade(a: u8, b: u8, prefix_length: u8, enable: bool) -> Vec<u8> {
        IpTablesRequest::Masquerade {
            prefix: Ipv4Cidr {
                address: Ipv4Addr::new(a, b, 0, 0),
                prefix_length,
            },
            enable,
        }
        .encode()
    }

    #[test]
    fn masquerade_enable_and_disable() {
        let (emulator, nat, _) = emulator();

        assert_eq!(emulator.handle_request(&masquerade(172, 17, 16, true)), 0);
        let names = nat.list_names().unwrap();
        assert_eq!(names, vec!["WSL_172.17.0.0/16".to_string()]);

        assert_eq!(emulator.handle_request(&masquerade(172, 17, 16, false)), 0);
        assert!(nat.list_names().unwrap().is_empty());
    }

    #[test]
    fn masquerade_outside_allowed_range_is_rejected() {
        let (emulator, nat, _) = emulator();
        assert_eq!(
            emulator.handle_request(&masquerade(10, 0, 16, true)),
            -libc::EINVAL
        );
        assert_eq!(
            emulator.handle_request(&masquerade(172, 17, 8, true)),
            -libc::EINVAL
        );
        assert!(nat.list_names().unwrap().is_empty());
    }

    #[test]
    fn masquerade_with_port_is_rejected() {
        let (emulator, _, _) = emulator();
        let mut buffer = masquerade(172, 17, 16, true);
        // Poke a non-zero port into the request.
        buffer[20] = 53;
        assert_eq!(emulator.handle_request(&buffer), -libc::EINVAL);
    }

    #[test]
    fn disable_unknown_masquerade_reports_not_found() {
        let (emulator, _, _) = emulator();
        assert_eq!(
            emulator.handle_request(&masquerade(172, 17, 16, false)),
            -libc::ENOENT
        );
    }

    #[test]
    fn firewall_port_rules_round_trip() {
        let (emulator, _, firewall) = emulator();
        let request = IpTablesRequest::FirewallPort {
            address: Ipv4Addr::new(172, 17, 0, 2),
            port: 8080,
            enable: true,
        };
        assert_eq!(emulator.handle_request(&request.encode()), 0);
        let rules = firewall.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "WSL_172.17.0.2");
        assert_eq!(rules[0].port, 8080);

        let disable = IpTablesRequest::FirewallPort {
            address: Ipv4Addr::new(172, 17, 0, 2),
            port: 8080,
            enable: false,
        };
        assert_eq!(emulator.handle_request(&disable.encode()), 0);
        assert!(firewall.list_rules().unwrap().is_empty());
    }

    #[test]
    fn drop_reverses_outstanding_rules() {
        let (emulator, nat, firewall) = emulator();
        emulator.handle_request(&masquerade(172, 17, 16, true));
        emulator.handle_request(
            &IpTablesRequest::FirewallPort {
                address: Ipv4Addr::new(172, 17, 0, 9),
                port: 443,
                enable: true,
            }
            .encode(),
        );

        drop(emulator);
        assert!(nat.list_names().unwrap().is_empty());
        assert!(firewall.list_rules().unwrap().is_empty());
    }

    #[test]
    fn cleanup_removes_only_prefixed_remnants() {
        let nat = MemoryNatRegistry::new();
        let firewall = MemoryFirewallRegistry::new();
        nat.seed("WSL_172.17.0.0/16");
        nat.seed("UserNat");
        firewall.seed("WSL_172.17.0.5", Ipv4Addr::new(172, 17, 0, 5), 80);
        firewall.seed("CorpRule", Ipv4Addr::new(10, 0, 0, 1), 443);

        let nat_dyn: Arc<dyn NatRegistry> = nat.clone();
        let firewall_dyn: Arc<dyn FirewallRegistry> = firewall.clone();
        IpTablesEmulator::cleanup_remnants(&nat_dyn, &firewall_dyn);

        assert_eq!(nat.list_names().unwrap(), vec!["UserNat".to_string()]);
        let rules = firewall.list_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "CorpRule");
    }

    #[test]
    fn requests_flow_through_the_pump() {
        use crate::platform::memory::QueueUserCallbackSource;

        let (emulator, nat, _) = emulator();
        let source = QueueUserCallbackSource::new();
        emulator.enable(source.clone()).unwrap();

        let id = source.submit(masquerade(172, 17, 16, true));
        assert_eq!(source.wait_for_response(id), 0);
        assert_eq!(nat.list_names().unwrap().len(), 1);

        let bad = source.submit(masquerade(192, 168, 16, true));
        assert_eq!(source.wait_for_response(bad), -libc::EINVAL);
    }
}
