//! Local handshake helper for the client role.
//!
//! Accepts SOCKS5, SOCKS4/4a and HTTP `CONNECT` on the same port; the first
//! byte picks the protocol. The helper only parses and builds replies, the
//! connection writes them.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::address::{AddrError, TargetAddr};

pub mod http_connect;
pub mod socks4;
pub mod socks5;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("no acceptable authentication method")]
    NoAcceptableAuth,
    #[error("unsupported command 0x{0:02x}")]
    UnsupportedCommand(u8),
    #[error("unsupported http method {0}")]
    UnsupportedMethod(String),
    #[error("bad address: {0}")]
    Address(#[from] AddrError),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("request too long")]
    TooLong,
    #[error("handshake already finished")]
    AlreadyDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Socks4,
    HttpConnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Need more bytes. `reply` must be written back to the local peer.
    Continue { reply: Option<Bytes> },
    /// The destination is known. `reply` is an intermediate reply still to
    /// write; `payload` is whatever followed the request.
    Done {
        target: TargetAddr,
        reply: Option<Bytes>,
        payload: Bytes,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Greeting,
    Request,
    Done,
}

#[derive(Debug)]
pub struct Handshake {
    protocol: Option<Protocol>,
    phase: Phase,
    udp_associate: bool,
    buf: BytesMut,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake {
    pub fn new() -> Self {
        Self {
            protocol: None,
            phase: Phase::Greeting,
            udp_associate: false,
            buf: BytesMut::new(),
        }
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// The SOCKS5 request was UDP ASSOCIATE: later local bytes are UDP
    /// request messages, see [`socks5::parse_udp_request`].
    pub fn is_udp_associate(&self) -> bool {
        self.udp_associate
    }

    pub fn feed(&mut self, data: &[u8]) -> Result<Step, HandshakeError> {
        if self.is_done() {
            return Err(HandshakeError::AlreadyDone);
        }
        self.buf.extend_from_slice(data);

        let protocol = match self.protocol {
            Some(protocol) => protocol,
            None => {
                let Some(&first) = self.buf.first() else {
                    return Ok(Step::Continue { reply: None });
                };
                let protocol = match first {
                    socks5::VERSION => Protocol::Socks5,
                    socks4::VERSION => Protocol::Socks4,
                    _ => Protocol::HttpConnect,
                };
                self.protocol = Some(protocol);
                if protocol != Protocol::Socks5 {
                    self.phase = Phase::Request;
                }
                protocol
            }
        };

        let mut reply = None;
        if self.phase == Phase::Greeting {
            match socks5::parse_greeting(&self.buf)? {
                None => return Ok(Step::Continue { reply: None }),
                Some(used) => {
                    self.buf.advance(used);
                    self.phase = Phase::Request;
                    reply = Some(socks5::method_reply(socks5::METHOD_NO_AUTH));
                }
            }
        }

        let parsed = match protocol {
            Protocol::Socks5 => socks5::parse_request(&self.buf)?.map(|(command, target, used)| {
                self.udp_associate = command == socks5::Command::UdpAssociate;
                (target, used)
            }),
            Protocol::Socks4 => socks4::parse_request(&self.buf)?,
            Protocol::HttpConnect => http_connect::parse_request(&self.buf)?,
        };
        match parsed {
            None => Ok(Step::Continue { reply }),
            Some((target, used)) => {
                self.buf.advance(used);
                self.phase = Phase::Done;
                Ok(Step::Done {
                    target,
                    reply,
                    payload: self.buf.split().freeze(),
                })
            }
        }
    }

    /// Reply telling the local peer the tunnel is ready.
    pub fn success_reply(&self) -> Option<Bytes> {
        match self.protocol? {
            Protocol::Socks5 => Some(socks5::reply(socks5::REPLY_SUCCEEDED)),
            Protocol::Socks4 => Some(socks4::reply(socks4::REPLY_GRANTED)),
            Protocol::HttpConnect => Some(http_connect::reply(http_connect::ESTABLISHED)),
        }
    }

    /// Reply for a destination that could not be reached.
    pub fn failure_reply(&self) -> Option<Bytes> {
        match self.protocol? {
            Protocol::Socks5 => Some(socks5::reply(socks5::REPLY_CONNECTION_REFUSED)),
            Protocol::Socks4 => Some(socks4::reply(socks4::REPLY_REJECTED)),
            Protocol::HttpConnect => Some(http_connect::reply(http_connect::BAD_GATEWAY)),
        }
    }

    /// Reply for a request the helper refused.
    pub fn reject_reply(&self, err: &HandshakeError) -> Option<Bytes> {
        match (self.protocol?, err) {
            (Protocol::Socks5, HandshakeError::UnsupportedVersion(_)) => None,
            (Protocol::Socks5, HandshakeError::NoAcceptableAuth) => {
                Some(socks5::method_reply(socks5::METHOD_NOT_ACCEPTABLE))
            }
            (Protocol::Socks5, HandshakeError::UnsupportedCommand(_)) => {
                Some(socks5::reply(socks5::REPLY_COMMAND_NOT_SUPPORTED))
            }
            (Protocol::Socks5, HandshakeError::Address(_)) => {
                Some(socks5::reply(socks5::REPLY_ADDRESS_NOT_SUPPORTED))
            }
            (Protocol::Socks5, _) => Some(socks5::reply(socks5::REPLY_GENERAL_FAILURE)),
            (Protocol::Socks4, _) => Some(socks4::reply(socks4::REPLY_REJECTED)),
            (Protocol::HttpConnect, HandshakeError::UnsupportedMethod(_)) => {
                Some(http_connect::reply(http_connect::METHOD_NOT_ALLOWED))
            }
            (Protocol::HttpConnect, _) => Some(http_connect::reply(http_connect::BAD_REQUEST)),
        }
    }
}
