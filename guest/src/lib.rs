//! Activities hosted by the in-guest init process.
//!
//! The only child activity implemented in Rust today is DNS tunneling: a
//! local DNS server that forwards every query to the host over a message
//! channel and routes the answers back to the originating client.

pub mod dns;
