use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use rand::{Rng, RngCore};

use super::{Action, Stage, StageError};
use crate::config::Role;

const MAX_HEAD_LEN: usize = 4096;
const HEAD_END: &[u8] = b"\r\n\r\n";
const DEFAULT_HOST: &str = "www.example.com";

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0",
];

pub struct NoneObfs;

impl Stage for NoneObfs {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }
}

/// Disguises the start of each direction as a websocket upgrade exchange.
/// Only the first buffer of each direction carries a fake head.
pub struct HttpObfs {
    role: Role,
    host: String,
    head_sent: bool,
    head_received: bool,
    failed: bool,
    inbound: BytesMut,
}

impl HttpObfs {
    /// `params` is the Host header to present; empty picks a default.
    pub fn new(role: Role, params: &str) -> Self {
        let host = if params.trim().is_empty() {
            DEFAULT_HOST.to_string()
        } else {
            params.trim().to_string()
        };
        Self {
            role,
            host,
            head_sent: false,
            head_received: false,
            failed: false,
            inbound: BytesMut::new(),
        }
    }

    fn random_token(len: usize) -> String {
        let mut raw = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut raw);
        general_purpose::STANDARD.encode(raw)
    }

    fn request_head(&self) -> String {
        let mut rng = rand::thread_rng();
        let path: String = (0..rng.gen_range(6..16))
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        let agent = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())];
        format!(
            "GET /{} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nAccept: */*\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
            path,
            self.host,
            agent,
            Self::random_token(16)
        )
    }

    fn response_head(&self) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\nServer: nginx\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
            Self::random_token(20)
        )
    }

    fn fail(&mut self, reason: &str) -> Action {
        self.failed = true;
        self.inbound = BytesMut::new();
        Action::Fail(reason.into())
    }

    fn expected_prefix(&self) -> &'static [u8] {
        match self.role {
            Role::Server => b"GET ",
            Role::Client => b"HTTP/1.1 ",
        }
    }
}

impl Stage for HttpObfs {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        if self.head_sent {
            return Ok(Action::Next(buf));
        }
        let head = match self.role {
            Role::Client => self.request_head(),
            Role::Server => self.response_head(),
        };
        let mut out = BytesMut::with_capacity(head.len() + buf.len());
        out.put_slice(head.as_bytes());
        out.put_slice(&buf);
        self.head_sent = true;
        Ok(Action::Next(out.freeze()))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        if self.head_received {
            return Ok(Action::Next(buf));
        }
        if self.failed {
            return Ok(Action::Buffered);
        }
        self.inbound.extend_from_slice(&buf);

        let prefix = self.expected_prefix();
        let seen = self.inbound.len().min(prefix.len());
        if self.inbound[..seen] != prefix[..seen] {
            return Ok(self.fail("unexpected http head"));
        }

        match self.inbound.windows(HEAD_END.len()).position(|w| w == HEAD_END) {
            Some(pos) => {
                let rest = self.inbound.split_off(pos + HEAD_END.len()).freeze();
                self.inbound.clear();
                self.head_received = true;
                if rest.is_empty() {
                    Ok(Action::Buffered)
                } else {
                    Ok(Action::Next(rest))
                }
            }
            None if self.inbound.len() > MAX_HEAD_LEN => Ok(self.fail("http head too long")),
            None => Ok(Action::Buffered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_head_stripped_by_server() {
        let mut client = HttpObfs::new(Role::Client, "cdn.example.org");
        let mut server = HttpObfs::new(Role::Server, "");

        let Action::Next(wire) = client.forward(Bytes::from_static(b"payload")).unwrap() else {
            panic!("expected output");
        };
        assert!(wire.starts_with(b"GET /"));
        assert!(std::str::from_utf8(&wire[..wire.len() - 7])
            .unwrap()
            .contains("Host: cdn.example.org\r\n"));

        let split = wire.len() / 2;
        assert_eq!(server.backward(wire.slice(..split)).unwrap(), Action::Buffered);
        assert_eq!(
            server.backward(wire.slice(split..)).unwrap(),
            Action::Next(Bytes::from_static(b"payload"))
        );
        assert_eq!(
            server.backward(Bytes::from_static(b"GET raw")).unwrap(),
            Action::Next(Bytes::from_static(b"GET raw"))
        );
    }

    #[test]
    fn test_response_head_only_once() {
        let mut server = HttpObfs::new(Role::Server, "");
        let Action::Next(first) = server.forward(Bytes::from_static(b"a")).unwrap() else {
            panic!("expected output");
        };
        assert!(first.starts_with(b"HTTP/1.1 101"));
        assert_eq!(
            server.forward(Bytes::from_static(b"b")).unwrap(),
            Action::Next(Bytes::from_static(b"b"))
        );
    }

    #[test]
    fn test_non_http_input_fails() {
        let mut server = HttpObfs::new(Role::Server, "");
        assert!(matches!(
            server.backward(Bytes::from_static(&[0x16, 0x03, 0x01])).unwrap(),
            Action::Fail(_)
        ));
    }

    #[test]
    fn test_nothing_is_kept_after_failure() {
        let mut server = HttpObfs::new(Role::Server, "");
        assert!(matches!(
            server.backward(Bytes::from_static(b"SSH-2.0-OpenSSH\r\n")).unwrap(),
            Action::Fail(_)
        ));
        for _ in 0..100 {
            assert_eq!(
                server.backward(Bytes::from(vec![b'x'; 8192])).unwrap(),
                Action::Buffered
            );
        }
        assert!(server.inbound.is_empty());
    }

    #[test]
    fn test_oversized_head_fails() {
        let mut client = HttpObfs::new(Role::Client, "");
        let mut head = b"HTTP/1.1 200 OK\r\n".to_vec();
        head.resize(MAX_HEAD_LEN + 1, b'x');
        assert!(matches!(
            client.backward(Bytes::from(head)).unwrap(),
            Action::Fail(_)
        ));
    }
}
