//! Forward-proxy tunnel: a client accepts local SOCKS/HTTP CONNECT
//! requests and carries them through a stack of framing, crypto, protocol
//! and obfuscation stages to a server, which reverses the stack and dials
//! the real destination.

pub mod address;
pub mod balancer;
pub mod config;
pub mod connection;
pub mod context;
pub mod dns;
pub mod dns_resolver;
pub mod error;
pub mod handshake;
pub mod hub;
pub mod logging;
pub mod middleware;
pub mod pipe;
pub mod track;
pub mod transport;
pub mod tunnel_stats;

pub use config::{Config, Role};
pub use context::Context;
pub use error::{Error, Result};
pub use hub::Hub;
