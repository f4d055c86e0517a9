use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Action, Stage, StageError};

const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Pass-through framing.
pub struct OriginFrame;

impl Stage for OriginFrame {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        Ok(Action::Next(buf))
    }
}

/// `len(2, BE) | payload` frames. Partial frames are held until complete.
pub struct LengthFrame {
    inbound: BytesMut,
}

impl LengthFrame {
    pub fn new() -> Self {
        Self {
            inbound: BytesMut::new(),
        }
    }
}

impl Default for LengthFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for LengthFrame {
    fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        let mut out = BytesMut::with_capacity(buf.len() + 2 * (buf.len() / MAX_FRAME_PAYLOAD + 1));
        for chunk in buf.chunks(MAX_FRAME_PAYLOAD) {
            out.put_u16(chunk.len() as u16);
            out.put_slice(chunk);
        }
        Ok(Action::Next(out.freeze()))
    }

    fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
        self.inbound.extend_from_slice(&buf);

        let mut out = BytesMut::new();
        while self.inbound.len() >= 2 {
            let len = u16::from_be_bytes([self.inbound[0], self.inbound[1]]) as usize;
            if self.inbound.len() < 2 + len {
                break;
            }
            self.inbound.advance(2);
            out.extend_from_slice(&self.inbound.split_to(len));
        }

        if out.is_empty() {
            Ok(Action::Buffered)
        } else {
            Ok(Action::Next(out.freeze()))
        }
    }
}
