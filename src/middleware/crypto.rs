//! Crypto stages.
//!
//! `chacha20-poly1305` seals the stream as records. Each side of a
//! connection picks a random salt for what it sends; the subkey is derived
//! from the shared key with HKDF-SHA256 and the salt travels once, ahead of
//! the first record:
//!
//! ```text
//! [salt(32)] { seal(len(2, BE)) | seal(payload) }*
//! ```
//!
//! Nonces are a little-endian counter incremented after every seal/open.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use super::{Action, Stage, StageError};

const SALT_LEN: usize = 32;
const TAG_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const LEN_BLOCK: usize = 2 + TAG_LEN;
const MAX_RECORD_PAYLOAD: usize = 0x3FFF;
const SUBKEY_INFO: &[u8] = b"layered-tunnel-subkey";

/// Identity transform.
pub struct NoneCrypto;

impl Stage for NoneCrypto {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }
}

struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    fn derive(ikm: &[u8], salt: &[u8]) -> Result<Self, StageError> {
        let mut okm = [0u8; 32];
        Hkdf::<Sha256>::new(Some(salt), ikm)
            .expand(SUBKEY_INFO, &mut okm)
            .map_err(|_| StageError::KeyDerivation)?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&okm)),
            counter: 0,
        })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, StageError> {
        let nonce = self.next_nonce();
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| StageError::Encode("seal failed".into()))
    }

    fn open(&mut self, sealed: &[u8]) -> Option<Vec<u8>> {
        let nonce = self.next_nonce();
        self.cipher.decrypt(Nonce::from_slice(&nonce), sealed).ok()
    }
}

pub struct ChaChaCrypto {
    key: Vec<u8>,
    sealer: Option<CipherState>,
    opener: Option<CipherState>,
    inbound: BytesMut,
    /// Payload length of a record whose length block is already opened.
    pending_len: Option<usize>,
    failed: bool,
}

impl ChaChaCrypto {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: key.to_vec(),
            sealer: None,
            opener: None,
            inbound: BytesMut::new(),
            pending_len: None,
            failed: false,
        }
    }

    fn fail(&mut self, reason: String) -> Action {
        self.failed = true;
        self.inbound = BytesMut::new();
        Action::Fail(reason)
    }
}

impl ChaChaCrypto {
    /// Opens every complete record in `inbound`.
    fn open_records(&mut self) -> Result<BytesMut, String> {
        let mut out = BytesMut::new();
        let Some(opener) = self.opener.as_mut() else {
            return Ok(out);
        };
        loop {
            let len = match self.pending_len {
                Some(len) => len,
                None => {
                    if self.inbound.len() < LEN_BLOCK {
                        break;
                    }
                    let block = opener
                        .open(&self.inbound[..LEN_BLOCK])
                        .ok_or("length block authentication failed")?;
                    self.inbound.advance(LEN_BLOCK);
                    let len = u16::from_be_bytes([block[0], block[1]]) as usize;
                    if len > MAX_RECORD_PAYLOAD {
                        return Err(format!("record length {} out of range", len));
                    }
                    self.pending_len = Some(len);
                    len
                }
            };

            if self.inbound.len() < len + TAG_LEN {
                break;
            }
            let sealed = self.inbound.split_to(len + TAG_LEN);
            let payload = opener.open(&sealed).ok_or("payload authentication failed")?;
            self.pending_len = None;
            out.put_slice(&payload);
        }
        Ok(out)
    }
}

impl Stage for ChaChaCrypto {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        let records = buf.len() / MAX_RECORD_PAYLOAD + 1;
        let mut out = BytesMut::with_capacity(SALT_LEN + buf.len() + records * (LEN_BLOCK + TAG_LEN));

        if self.sealer.is_none() {
            let mut salt = [0u8; SALT_LEN];
            rand::thread_rng().fill_bytes(&mut salt);
            out.put_slice(&salt);
            self.sealer = Some(CipherState::derive(&self.key, &salt)?);
        }
        let Some(sealer) = self.sealer.as_mut() else {
            return Err(StageError::KeyDerivation);
        };

        for chunk in buf.chunks(MAX_RECORD_PAYLOAD) {
            out.put_slice(&sealer.seal(&(chunk.len() as u16).to_be_bytes())?);
            out.put_slice(&sealer.seal(chunk)?);
        }
        Ok(Action::Next(out.freeze()))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        if self.failed {
            return Ok(Action::Buffered);
        }
        self.inbound.extend_from_slice(&buf);

        if self.opener.is_none() {
            if self.inbound.len() < SALT_LEN {
                return Ok(Action::Buffered);
            }
            let salt = self.inbound.split_to(SALT_LEN);
            self.opener = Some(CipherState::derive(&self.key, &salt)?);
        }
        match self.open_records() {
            Ok(out) if out.is_empty() => Ok(Action::Buffered),
            Ok(out) => Ok(Action::Next(out.freeze())),
            Err(reason) => Ok(self.fail(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal_all(stage: &mut ChaChaCrypto, data: &'static [u8]) -> Bytes {
        match stage.forward(Bytes::from_static(data)).unwrap() {
            Action::Next(out) => out,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_records_open_across_arbitrary_chunking() {
        let mut client = ChaChaCrypto::new(b"secret");
        let mut server = ChaChaCrypto::new(b"secret");

        let mut wire = BytesMut::new();
        wire.extend_from_slice(&seal_all(&mut client, b"first"));
        wire.extend_from_slice(&seal_all(&mut client, b"second"));
        assert_eq!(wire.len(), SALT_LEN + 2 * LEN_BLOCK + 5 + 6 + 2 * TAG_LEN);

        let mut plain = Vec::new();
        for chunk in wire.chunks(7) {
            match server.backward(Bytes::copy_from_slice(chunk)).unwrap() {
                Action::Next(out) => plain.extend_from_slice(&out),
                Action::Buffered => {}
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(plain, b"firstsecond");
    }

    #[test]
    fn test_wrong_key_raises_failure() {
        let mut client = ChaChaCrypto::new(b"secret");
        let mut server = ChaChaCrypto::new(b"other");

        let wire = seal_all(&mut client, b"payload");
        assert!(matches!(server.backward(wire).unwrap(), Action::Fail(_)));

        let more = seal_all(&mut client, b"more payload");
        assert_eq!(server.backward(more).unwrap(), Action::Buffered);
        assert!(server.inbound.is_empty());
    }

    #[test]
    fn test_salt_sent_once() {
        let mut client = ChaChaCrypto::new(b"secret");
        let first = seal_all(&mut client, b"abc");
        let second = seal_all(&mut client, b"abc");
        assert_eq!(first.len(), second.len() + SALT_LEN);
    }
}
