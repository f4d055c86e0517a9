use bytes::Bytes;

use super::HandshakeError;
use crate::address::{Endpoint, TargetAddr};

const HEAD_END: &[u8] = b"\r\n\r\n";
const MAX_HEAD_LEN: usize = 8192;
const DEFAULT_PORT: u16 = 443;

pub const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
pub const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";
pub const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Parses a `CONNECT host:port HTTP/1.x` head. The head is consumed up to
/// and including the blank line; bytes after it are tunnel payload.
pub fn parse_request(buf: &[u8]) -> Result<Option<(TargetAddr, usize)>, HandshakeError> {
    let Some(end) = buf.windows(HEAD_END.len()).position(|w| w == HEAD_END) else {
        if buf.len() > MAX_HEAD_LEN {
            return Err(HandshakeError::TooLong);
        }
        return Ok(None);
    };

    let head = String::from_utf8_lossy(&buf[..end]);
    let first_line = head.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(HandshakeError::Malformed(format!("bad request line {:?}", first_line)));
    }
    if parts[0] != "CONNECT" {
        return Err(HandshakeError::UnsupportedMethod(parts[0].to_string()));
    }

    let authority = parts[1];
    let endpoint = if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        Endpoint::parse(authority)
    } else {
        let host = authority.trim_start_matches('[').trim_end_matches(']');
        Some(Endpoint::new(host, DEFAULT_PORT))
    }
    .filter(|ep| !ep.host.is_empty())
    .ok_or_else(|| HandshakeError::Malformed(format!("bad CONNECT target {:?}", authority)))?;

    Ok(Some((
        TargetAddr::from_host_port(&endpoint.host, endpoint.port),
        end + HEAD_END.len(),
    )))
}

pub fn reply(status: &'static [u8]) -> Bytes {
    Bytes::from_static(status)
}
