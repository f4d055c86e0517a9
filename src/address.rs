//! Address types shared by the handshake helper, the protocol stage and the
//! balancer.
//!
//! The wire encoding is the SOCKS5 one: `ATYP | ADDR | PORT`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("unknown address type 0x{0:02x}")]
    UnknownType(u8),
    #[error("empty domain name")]
    EmptyDomain,
    #[error("domain name is not valid UTF-8")]
    InvalidDomain,
    #[error("domain name longer than 255 bytes")]
    DomainTooLong,
}

/// A `host:port` pair naming a remote server, redirect target or balancer
/// candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host:port`, `[v6]:port` or `v6:port`. Port must be non-zero.
    pub fn parse(s: &str) -> Option<Self> {
        let (host, port) = s.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Application-level destination requested by the local peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn domain(host: impl Into<String>, port: u16) -> Self {
        TargetAddr::Domain(host.into(), port)
    }

    /// IP literals become [`TargetAddr::Ip`], anything else a domain.
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }

    pub fn host(&self) -> String {
        match self {
            TargetAddr::Ip(addr) => addr.ip().to_string(),
            TargetAddr::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn to_endpoint(&self) -> Endpoint {
        Endpoint::new(self.host(), self.port())
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), AddrError> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                out.put_u8(ATYP_IPV4);
                out.put_slice(&addr.ip().octets());
                out.put_u16(addr.port());
            }
            TargetAddr::Ip(SocketAddr::V6(addr)) => {
                out.put_u8(ATYP_IPV6);
                out.put_slice(&addr.ip().octets());
                out.put_u16(addr.port());
            }
            TargetAddr::Domain(host, port) => {
                if host.is_empty() {
                    return Err(AddrError::EmptyDomain);
                }
                let len = u8::try_from(host.len()).map_err(|_| AddrError::DomainTooLong)?;
                out.put_u8(ATYP_DOMAIN);
                out.put_u8(len);
                out.put_slice(host.as_bytes());
                out.put_u16(*port);
            }
        }
        Ok(())
    }

    /// Decodes an address from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` is a valid but incomplete prefix.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, AddrError> {
        let Some(&atyp) = buf.first() else {
            return Ok(None);
        };
        match atyp {
            ATYP_IPV4 => {
                if buf.len() < 7 {
                    return Ok(None);
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), 7)))
            }
            ATYP_IPV6 => {
                if buf.len() < 19 {
                    return Ok(None);
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                let ip = Ipv6Addr::from(octets);
                Ok(Some((TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port)), 19)))
            }
            ATYP_DOMAIN => {
                let Some(&len) = buf.get(1) else {
                    return Ok(None);
                };
                let len = len as usize;
                if len == 0 {
                    return Err(AddrError::EmptyDomain);
                }
                let total = 2 + len + 2;
                if buf.len() < total {
                    return Ok(None);
                }
                let host = std::str::from_utf8(&buf[2..2 + len])
                    .map_err(|_| AddrError::InvalidDomain)?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Some((TargetAddr::Domain(host, port), total)))
            }
            other => Err(AddrError::UnknownType(other)),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(Endpoint::parse("abc.com:443"), Some(Endpoint::new("abc.com", 443)));
        assert_eq!(Endpoint::parse("[::1]:80"), Some(Endpoint::new("::1", 80)));
        assert_eq!(Endpoint::parse("test.com"), None);
        assert_eq!(Endpoint::parse(":80"), None);
        assert_eq!(Endpoint::parse("a.com:0"), None);
        assert_eq!(Endpoint::parse("a.com:http"), None);
        assert_eq!(Endpoint::new("::1", 80).to_string(), "[::1]:80");
    }

    #[test]
    fn test_decode_domain_reports_incomplete_prefix() {
        let mut buf = BytesMut::new();
        TargetAddr::domain("example.com", 80).encode(&mut buf).unwrap();
        buf.put_slice(b"payload");

        for cut in 0..(2 + 11 + 2) {
            assert_eq!(TargetAddr::decode(&buf[..cut]), Ok(None), "cut at {}", cut);
        }
        let (addr, used) = TargetAddr::decode(&buf).unwrap().unwrap();
        assert_eq!(addr, TargetAddr::domain("example.com", 80));
        assert_eq!(&buf[used..], b"payload");
    }

    #[test]
    fn test_decode_ipv4() {
        let (addr, used) = TargetAddr::decode(&[ATYP_IPV4, 127, 0, 0, 1, 0x1f, 0x90])
            .unwrap()
            .unwrap();
        assert_eq!(used, 7);
        assert_eq!(addr.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_decode_rejects_unknown_type_and_empty_domain() {
        assert_eq!(TargetAddr::decode(&[0x09, 1, 2]), Err(AddrError::UnknownType(0x09)));
        assert_eq!(TargetAddr::decode(&[ATYP_DOMAIN, 0, 0, 80]), Err(AddrError::EmptyDomain));
    }
}
