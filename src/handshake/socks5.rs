use bytes::Bytes;

use super::HandshakeError;
use crate::address::TargetAddr;

pub const VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NOT_ACCEPTABLE: u8 = 0xff;
pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// `VER | NMETHODS | METHODS...`. Returns the bytes consumed once the whole
/// greeting is present.
pub fn parse_greeting(buf: &[u8]) -> Result<Option<usize>, HandshakeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(HandshakeError::UnsupportedVersion(buf[0]));
    }
    let total = 2 + buf[1] as usize;
    if buf.len() < total {
        return Ok(None);
    }
    if !buf[2..total].contains(&METHOD_NO_AUTH) {
        return Err(HandshakeError::NoAcceptableAuth);
    }
    Ok(Some(total))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    /// Datagrams travel over the same local stream, each wrapped in a UDP
    /// request header.
    UdpAssociate,
}

/// `VER | CMD | RSV | ATYP | ADDR | PORT`. CONNECT and UDP ASSOCIATE are
/// accepted.
pub fn parse_request(buf: &[u8]) -> Result<Option<(Command, TargetAddr, usize)>, HandshakeError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    if buf[0] != VERSION {
        return Err(HandshakeError::UnsupportedVersion(buf[0]));
    }
    let command = match buf[1] {
        CMD_CONNECT => Command::Connect,
        CMD_UDP_ASSOCIATE => Command::UdpAssociate,
        other => return Err(HandshakeError::UnsupportedCommand(other)),
    };
    Ok(TargetAddr::decode(&buf[3..])?.map(|(target, used)| (command, target, 3 + used)))
}

/// `RSV(2) | FRAG | ATYP | DST.ADDR | DST.PORT | DATA`. Returns the
/// destination and DATA, or `None` for anything else, fragments included.
pub fn parse_udp_request(buf: &Bytes) -> Option<(TargetAddr, Bytes)> {
    if buf.len() < 4 || buf[..3] != [0x00, 0x00, 0x00] {
        return None;
    }
    match TargetAddr::decode(&buf[3..]) {
        Ok(Some((target, used))) => Some((target, buf.slice(3 + used..))),
        _ => None,
    }
}

pub fn method_reply(method: u8) -> Bytes {
    Bytes::copy_from_slice(&[VERSION, method])
}

/// Reply with an all-zero IPv4 bound address.
pub fn reply(code: u8) -> Bytes {
    Bytes::copy_from_slice(&[VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_requires_no_auth_method() {
        assert_eq!(parse_greeting(&[0x05]), Ok(None));
        assert_eq!(parse_greeting(&[0x05, 0x02, 0x00]), Ok(None));
        assert_eq!(parse_greeting(&[0x05, 0x01, 0x00]), Ok(Some(3)));
        assert_eq!(parse_greeting(&[0x05, 0x01, 0x02]), Err(HandshakeError::NoAcceptableAuth));
        assert_eq!(parse_greeting(&[0x04, 0x01]), Err(HandshakeError::UnsupportedVersion(4)));
    }

    #[test]
    fn test_connect_request_with_domain() {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&[0x00, 0x50]);

        assert_eq!(parse_request(&req[..8]), Ok(None));
        assert_eq!(
            parse_request(&req),
            Ok(Some((Command::Connect, TargetAddr::domain("example.com", 80), req.len())))
        );
    }

    #[test]
    fn test_udp_associate_accepted_bind_rejected() {
        let req = [0x05, 0x03, 0x00, 0x01, 8, 8, 8, 8, 0x00, 0x35];
        assert_eq!(
            parse_request(&req),
            Ok(Some((
                Command::UdpAssociate,
                TargetAddr::from_host_port("8.8.8.8", 53),
                req.len()
            )))
        );
        assert_eq!(
            parse_request(&[0x05, 0x02, 0x00, 0x01]),
            Err(HandshakeError::UnsupportedCommand(0x02))
        );
    }

    #[test]
    fn test_udp_request_strips_header() {
        let mut packet = vec![0x00, 0x00, 0x00, 0x01, 8, 8, 4, 4, 0x00, 0x35];
        packet.extend_from_slice(b"query");
        assert_eq!(
            parse_udp_request(&Bytes::from(packet)),
            Some((TargetAddr::from_host_port("8.8.4.4", 53), Bytes::from_static(b"query")))
        );

        let fragment = Bytes::from_static(&[0x00, 0x00, 0x01, 0x01, 8, 8, 4, 4, 0x00, 0x35, b'x']);
        assert_eq!(parse_udp_request(&fragment), None);
        assert_eq!(parse_udp_request(&Bytes::from_static(b"GET / HTTP/1.1")), None);
        assert_eq!(parse_udp_request(&Bytes::from_static(&[0x00, 0x00, 0x00, 0x01, 8])), None);
    }
}
