//! `basic` protocol stage.
//!
//! The client prefixes its first upward buffer with
//! `tag(8) | ATYP | ADDR | PORT`, where `tag` is the head of SHA-256 over the
//! shared key. The server collects that header, checks the tag and asks the
//! connection to dial the decoded address.

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use super::{Action, Stage, StageError};
use crate::address::TargetAddr;
use crate::config::Role;

const TAG_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitHeader,
    Connecting,
    Established,
    /// The header was rejected; everything after it is discarded.
    Failed,
}

pub struct BasicProtocol {
    role: Role,
    tag: [u8; TAG_LEN],
    target: Option<TargetAddr>,
    header_sent: bool,
    phase: Phase,
    inbound: BytesMut,
}

impl BasicProtocol {
    pub fn new(role: Role, key: &[u8], target: Option<TargetAddr>) -> Self {
        let digest = Sha256::digest(key);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        let phase = match role {
            Role::Client => Phase::Established,
            Role::Server => Phase::AwaitHeader,
        };
        Self {
            role,
            tag,
            target,
            header_sent: false,
            phase,
            inbound: BytesMut::new(),
        }
    }

    fn fail(&mut self, reason: String) -> Action {
        self.phase = Phase::Failed;
        self.inbound = BytesMut::new();
        Action::Fail(reason)
    }

    fn read_header(&mut self) -> Action {
        let seen = self.inbound.len().min(TAG_LEN);
        if self.inbound[..seen] != self.tag[..seen] {
            return self.fail("unrecognised header".into());
        }
        if self.inbound.len() < TAG_LEN {
            return Action::Buffered;
        }

        match TargetAddr::decode(&self.inbound[TAG_LEN..]) {
            Ok(None) => Action::Buffered,
            Ok(Some((target, used))) => {
                self.inbound = self.inbound.split_off(TAG_LEN + used);
                self.phase = Phase::Connecting;
                Action::Connect(target)
            }
            Err(e) => self.fail(format!("bad destination: {}", e)),
        }
    }
}

impl Stage for BasicProtocol {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        if self.role == Role::Server || self.header_sent {
            return Ok(Action::Next(buf));
        }
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| StageError::Encode("no destination to announce".into()))?;

        let mut out = BytesMut::with_capacity(TAG_LEN + 1 + 256 + 2 + buf.len());
        out.put_slice(&self.tag);
        target
            .encode(&mut out)
            .map_err(|e| StageError::Encode(e.to_string()))?;
        out.put_slice(&buf);
        self.header_sent = true;
        Ok(Action::Next(out.freeze()))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        match self.phase {
            Phase::Established => Ok(Action::Next(buf)),
            Phase::Failed => Ok(Action::Buffered),
            Phase::Connecting => {
                self.inbound.extend_from_slice(&buf);
                Ok(Action::Buffered)
            }
            Phase::AwaitHeader => {
                self.inbound.extend_from_slice(&buf);
                Ok(self.read_header())
            }
        }
    }

    fn resume(&mut self) -> Option<Bytes> {
        if self.phase != Phase::Connecting {
            return None;
        }
        self.phase = Phase::Established;
        let held = self.inbound.split().freeze();
        (!held.is_empty()).then_some(held)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BasicProtocol {
        BasicProtocol::new(Role::Client, b"key", Some(TargetAddr::domain("example.com", 80)))
    }

    #[test]
    fn test_header_only_on_first_buffer() {
        let mut stage = client();
        let Action::Next(first) = stage.forward(Bytes::from_static(b"GET /")).unwrap() else {
            panic!("expected output");
        };
        assert_eq!(first.len(), TAG_LEN + 2 + 11 + 2 + 5);
        assert_eq!(
            stage.forward(Bytes::from_static(b"more")).unwrap(),
            Action::Next(Bytes::from_static(b"more"))
        );
    }

    #[test]
    fn test_server_decodes_destination_and_holds_until_resume() {
        let mut c = client();
        let mut s = BasicProtocol::new(Role::Server, b"key", None);
        let Action::Next(wire) = c.forward(Bytes::from_static(b"hello")).unwrap() else {
            panic!("expected output");
        };

        assert_eq!(s.backward(wire.slice(..5)).unwrap(), Action::Buffered);
        assert_eq!(
            s.backward(wire.slice(5..)).unwrap(),
            Action::Connect(TargetAddr::domain("example.com", 80))
        );
        assert_eq!(s.backward(Bytes::from_static(b" world")).unwrap(), Action::Buffered);

        assert_eq!(s.resume(), Some(Bytes::from_static(b"hello world")));
        assert_eq!(s.resume(), None);
        assert_eq!(
            s.backward(Bytes::from_static(b"!")).unwrap(),
            Action::Next(Bytes::from_static(b"!"))
        );
    }

    #[test]
    fn test_server_fails_on_foreign_bytes() {
        let mut s = BasicProtocol::new(Role::Server, b"key", None);
        let action = s.backward(Bytes::from_static(b"GET / HTTP/1.1\r\n")).unwrap();
        assert!(matches!(action, Action::Fail(_)));
    }

    #[test]
    fn test_failure_is_raised_once_and_later_input_discarded() {
        let mut s = BasicProtocol::new(Role::Server, b"key", None);
        assert!(matches!(
            s.backward(Bytes::from_static(b"\x16\x03\x01")).unwrap(),
            Action::Fail(_)
        ));

        let junk = Bytes::from(vec![0xab; 16 * 1024]);
        for _ in 0..1000 {
            assert_eq!(s.backward(junk.clone()).unwrap(), Action::Buffered);
        }
        assert!(s.inbound.is_empty());
        assert_eq!(s.resume(), None);
    }

    #[test]
    fn test_server_fails_on_wrong_key() {
        let mut c = BasicProtocol::new(Role::Client, b"one", Some(TargetAddr::domain("a.b", 1)));
        let mut s = BasicProtocol::new(Role::Server, b"two", None);
        let Action::Next(wire) = c.forward(Bytes::new()).unwrap() else {
            panic!("expected output");
        };
        assert!(matches!(s.backward(wire).unwrap(), Action::Fail(_)));
    }
}
