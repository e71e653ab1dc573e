//! Guest netfilter emulation: the kernel callback pump and the iptables
//! emulator it feeds.

mod pump;
mod rules;

pub use pump::UserCallbackPump;
pub use rules::{
    IpTablesEmulator, IpTablesRequest, Ipv4Cidr, CALLBACK_BUFFER_SIZE, RULE_NAME_PREFIX,
};
