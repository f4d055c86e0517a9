//! SOCKS4 and SOCKS4a CONNECT requests.
//!
//! `VER(4) | CMD | PORT(2) | IP(4) | USERID | NUL [| DOMAIN | NUL]`; the
//! domain part is present (4a) when IP is `0.0.0.x` with `x != 0`.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;

use super::HandshakeError;
use crate::address::TargetAddr;

pub const VERSION: u8 = 0x04;
pub const CMD_CONNECT: u8 = 0x01;

pub const REPLY_GRANTED: u8 = 0x5a;
pub const REPLY_REJECTED: u8 = 0x5b;

const MIN_LEN: usize = 9;
const MAX_FIELD_LEN: usize = 255;

fn find_nul(buf: &[u8], from: usize) -> Result<Option<usize>, HandshakeError> {
    match buf[from..].iter().position(|b| *b == 0) {
        Some(pos) => Ok(Some(from + pos)),
        None if buf.len() - from > MAX_FIELD_LEN => {
            Err(HandshakeError::Malformed("unterminated socks4 field".into()))
        }
        None => Ok(None),
    }
}

pub fn parse_request(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>, HandshakeError> {
    if buf.len() < MIN_LEN {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(HandshakeError::UnsupportedVersion(buf[0]));
    }
    if buf[1] != CMD_CONNECT {
        return Err(HandshakeError::UnsupportedCommand(buf[1]));
    }

    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    let Some(user_end) = find_nul(buf, 8)? else {
        return Ok(None);
    };

    let octets = ip.octets();
    let is_socks4a = octets[..3] == [0, 0, 0] && octets[3] != 0;
    if !is_socks4a {
        return Ok(Some((TargetAddr::Ip(SocketAddr::from((ip, port))), user_end + 1)));
    }

    let domain_start = user_end + 1;
    if domain_start >= buf.len() {
        return Ok(None);
    }
    let Some(domain_end) = find_nul(buf, domain_start)? else {
        return Ok(None);
    };
    if domain_end == domain_start {
        return Err(HandshakeError::Malformed("empty socks4a domain".into()));
    }
    let domain = std::str::from_utf8(&buf[domain_start..domain_end])
        .map_err(|_| HandshakeError::Malformed("socks4a domain is not UTF-8".into()))?;
    Ok(Some((TargetAddr::domain(domain, port), domain_end + 1)))
}

pub fn reply(code: u8) -> Bytes {
    Bytes::copy_from_slice(&[0x00, code, 0, 0, 0, 0, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_request(result: Result<Option<(TargetAddr, usize)>, HandshakeError>) -> bool {
        matches!(result, Ok(Some(_)))
    }

    #[test]
    fn test_short_buffer_is_not_a_request() {
        assert_eq!(parse_request(&[]), Ok(None));
        assert_eq!(parse_request(&[VERSION, CMD_CONNECT, 0, 80]), Ok(None));
    }

    #[test]
    fn test_wrong_version_rejected() {
        assert_eq!(
            parse_request(&[0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(HandshakeError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn test_invalid_command_rejected() {
        assert_eq!(
            parse_request(&[VERSION, 0x03, 0, 0, 0, 0, 0, 0, 0]),
            Err(HandshakeError::UnsupportedCommand(0x03))
        );
    }

    #[test]
    fn test_missing_user_id_terminator() {
        assert!(!is_request(parse_request(&[VERSION, CMD_CONNECT, 0, 0, 0, 0, 0, 0, 1])));
    }

    #[test]
    fn test_socks4a_without_domain() {
        assert!(!is_request(parse_request(&[VERSION, CMD_CONNECT, 0, 0, 0, 0, 0, 0x01, 0])));
    }

    #[test]
    fn test_socks4a_request() {
        let mut req = vec![VERSION, CMD_CONNECT, 0x01, 0xbb, 0, 0, 0, 0x01, 0x00];
        req.extend_from_slice(b"example.com\0");
        assert_eq!(
            parse_request(&req),
            Ok(Some((TargetAddr::domain("example.com", 443), req.len())))
        );
    }

    #[test]
    fn test_socks4_request() {
        let (target, used) = parse_request(&[VERSION, CMD_CONNECT, 0, 0, 0, 0, 0, 0, 0])
            .unwrap()
            .unwrap();
        assert_eq!(used, 9);
        assert_eq!(target.to_string(), "0.0.0.0:0");
    }
}
