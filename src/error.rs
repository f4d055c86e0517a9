use thiserror::Error;

use crate::address::AddrError;
use crate::config::ConfigError;
use crate::dns::DnsError;
use crate::handshake::HandshakeError;
use crate::middleware::StageError;
use crate::pipe::PipeError;

/// Crate-level error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    #[error("Dial to {target} failed: {reason}")]
    Dial { target: String, reason: String },

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Middleware error: {0}")]
    Middleware(#[from] StageError),

    #[error("Pipe error: {0}")]
    Pipe(#[from] PipeError),

    #[error("Address error: {0}")]
    Address(#[from] AddrError),

    #[error("Unexpected destination host={host:?} port={port}")]
    EmptyDestination { host: String, port: u16 },
}

pub type Result<T> = std::result::Result<T, Error>;
