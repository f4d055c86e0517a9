//! Transform stages.
//!
//! Every connection owns one instance of each of the four stage kinds. The
//! kinds are ordered: Frame sits closest to application bytes and Obfs
//! closest to the wire. Which algorithm fills each slot is chosen by name
//! from the configuration when the pipe is built.

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::address::TargetAddr;
use crate::config::{Config, Role};

pub mod crypto;
pub mod frame;
pub mod obfs;
pub mod protocol;

/// Stage slot. The derived ordering is the upward application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MiddlewareKind {
    Frame,
    Crypto,
    Protocol,
    Obfs,
}

impl MiddlewareKind {
    pub const ALL: [MiddlewareKind; 4] = [
        MiddlewareKind::Frame,
        MiddlewareKind::Crypto,
        MiddlewareKind::Protocol,
        MiddlewareKind::Obfs,
    ];
}

impl fmt::Display for MiddlewareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MiddlewareKind::Frame => "frame",
            MiddlewareKind::Crypto => "crypto",
            MiddlewareKind::Protocol => "protocol",
            MiddlewareKind::Obfs => "obfs",
        };
        f.write_str(name)
    }
}

/// Upward runs application bytes toward the wire, Downward runs wire bytes
/// back to application bytes. Both roles use the same meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upward,
    Downward,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upward => f.write_str("upward"),
            Direction::Downward => f.write_str("downward"),
        }
    }
}

/// Outcome of a single stage transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Hand this buffer to the next stage.
    Next(Bytes),
    /// Input was absorbed; nothing to pass on yet.
    Buffered,
    /// The real destination is known; the stage holds further input until
    /// [`Stage::resume`] is called.
    Connect(TargetAddr),
    /// Unrecoverable protocol failure.
    Fail(String),
}

/// Error raised inside a transform. Swallowed at the pipe boundary, unlike
/// [`Action::Fail`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("key derivation failed")]
    KeyDerivation,
}

/// Algorithm behind one stage slot.
pub trait Stage: Send {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError>;

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError>;

    /// Releases input held since the stage returned [`Action::Connect`].
    fn resume(&mut self) -> Option<Bytes> {
        None
    }
}

pub struct Middleware {
    kind: MiddlewareKind,
    name: String,
    stage: Box<dyn Stage>,
}

impl Middleware {
    pub fn new(kind: MiddlewareKind, name: impl Into<String>, stage: Box<dyn Stage>) -> Self {
        Self {
            kind,
            name: name.into(),
            stage,
        }
    }

    pub fn kind(&self) -> MiddlewareKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transform(&mut self, direction: Direction, buf: Bytes) -> Result<Action, StageError> {
        match direction {
            Direction::Upward => self.stage.forward(buf),
            Direction::Downward => self.stage.backward(buf),
        }
    }

    pub fn resume(&mut self) -> Option<Bytes> {
        self.stage.resume()
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

pub fn supported_names(kind: MiddlewareKind) -> &'static [&'static str] {
    match kind {
        MiddlewareKind::Frame => &["origin", "length"],
        MiddlewareKind::Crypto => &["none", "chacha20-poly1305"],
        MiddlewareKind::Protocol => &["basic"],
        MiddlewareKind::Obfs => &["none", "http"],
    }
}

pub fn is_supported(kind: MiddlewareKind, name: &str) -> bool {
    supported_names(kind).contains(&name)
}

/// Builds the configured stage for `kind`. `target` is only meaningful on
/// the client, where the protocol stage announces it to the server.
pub fn create_middleware(
    kind: MiddlewareKind,
    config: &Config,
    target: Option<&TargetAddr>,
) -> Result<Middleware, StageError> {
    let role = config.role();
    let (name, params) = match kind {
        MiddlewareKind::Frame => (&config.frame, &config.frame_params),
        MiddlewareKind::Crypto => (&config.crypto, &config.crypto_params),
        MiddlewareKind::Protocol => (&config.protocol, &config.protocol_params),
        MiddlewareKind::Obfs => (&config.obfs, &config.obfs_params),
    };

    let stage: Box<dyn Stage> = match (kind, name.as_str()) {
        (MiddlewareKind::Frame, "origin") => Box::new(frame::OriginFrame),
        (MiddlewareKind::Frame, "length") => Box::new(frame::LengthFrame::new()),
        (MiddlewareKind::Crypto, "none") => Box::new(crypto::NoneCrypto),
        (MiddlewareKind::Crypto, "chacha20-poly1305") => {
            Box::new(crypto::ChaChaCrypto::new(config.key.as_bytes()))
        }
        (MiddlewareKind::Protocol, "basic") => Box::new(protocol::BasicProtocol::new(
            role,
            config.key.as_bytes(),
            target.cloned(),
        )),
        (MiddlewareKind::Obfs, "none") => Box::new(obfs::NoneObfs),
        (MiddlewareKind::Obfs, "http") => Box::new(obfs::HttpObfs::new(role, params)),
        _ => {
            return Err(StageError::Encode(format!("unsupported {} '{}'", kind, name)));
        }
    };

    Ok(Middleware::new(kind, name.clone(), stage))
}

/// The four configured stages in upward order.
pub fn create_stack(config: &Config, target: Option<&TargetAddr>) -> Result<Vec<Middleware>, StageError> {
    if config.role() == Role::Client && target.is_none() {
        return Err(StageError::Encode("client pipe needs a target address".into()));
    }
    MiddlewareKind::ALL
        .iter()
        .map(|kind| create_middleware(*kind, config, target))
        .collect()
}
