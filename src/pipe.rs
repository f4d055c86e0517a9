//! Ordered, bidirectional chain of middlewares for one connection.
//!
//! The upward list runs Frame → Crypto → Protocol → Obfs; the downward list
//! is the same set of stages in reverse. A feed either delivers one buffer
//! for the direction's sink, stops silently while a stage buffers, or stops
//! with a [`Signal`] for the owning connection.

use bytes::Bytes;
use thiserror::Error;
use tracing::warn;

use crate::address::TargetAddr;
use crate::middleware::{Action, Direction, Middleware, MiddlewareKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipeError {
    #[error("stage {kind} is out of order")]
    OutOfOrder { kind: MiddlewareKind },
    #[error("stage {kind} appears more than once")]
    Duplicate { kind: MiddlewareKind },
}

/// Control signal raised by a stage instead of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// The server learned the real destination. Call [`Pipe::resume`] once
    /// the connection to it is ready.
    ConnectToDestination { target: TargetAddr },
    /// A stage refused its input. `original` is the buffer as it was fed to
    /// the pipe, before any stage touched it.
    Failed { reason: String, original: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Delivered(Bytes),
    Buffered,
    Signal(Signal),
    /// A stage errored; the buffer was discarded and the pipe stays usable.
    Dropped,
}

pub struct Pipe {
    /// Stages in upward order.
    stages: Vec<Middleware>,
    /// Position (within the direction's order) of a stage waiting on
    /// [`Pipe::resume`].
    awaiting: Option<(Direction, usize)>,
}

impl Pipe {
    /// Builds a pipe from stages given in upward order.
    pub fn new(upward: Vec<Middleware>) -> Result<Self, PipeError> {
        let mut pipe = Self {
            stages: Vec::new(),
            awaiting: None,
        };
        pipe.set_middlewares(Direction::Upward, upward)?;
        Ok(pipe)
    }

    /// Installs `stages` in the order they run for `direction`; the other
    /// direction gets the reverse. Kinds must be unique and follow the
    /// Frame → Obfs ordering for the upward direction.
    pub fn set_middlewares(
        &mut self,
        direction: Direction,
        mut stages: Vec<Middleware>,
    ) -> Result<(), PipeError> {
        if direction == Direction::Downward {
            stages.reverse();
        }
        for pair in stages.windows(2) {
            let (a, b) = (pair[0].kind(), pair[1].kind());
            if a == b {
                return Err(PipeError::Duplicate { kind: b });
            }
            if a > b {
                return Err(PipeError::OutOfOrder { kind: b });
            }
        }
        self.stages = stages;
        self.awaiting = None;
        Ok(())
    }

    pub fn kinds(&self, direction: Direction) -> Vec<MiddlewareKind> {
        (0..self.stages.len())
            .map(|pos| self.stages[self.index_at(direction, pos)].kind())
            .collect()
    }

    pub fn feed(&mut self, direction: Direction, buf: Bytes) -> Flow {
        self.run_from(direction, 0, buf.clone(), buf)
    }

    /// Completes a pending [`Signal::ConnectToDestination`]: input held by the
    /// signalling stage continues through the stages after it. Returns `None`
    /// when nothing is pending, so the completion fires at most once.
    pub fn resume(&mut self) -> Option<Flow> {
        let (direction, pos) = self.awaiting.take()?;
        let idx = self.index_at(direction, pos);
        let flow = match self.stages[idx].resume() {
            Some(held) => self.run_from(direction, pos + 1, held.clone(), held),
            None => Flow::Buffered,
        };
        Some(flow)
    }

    pub fn is_awaiting_connect(&self) -> bool {
        self.awaiting.is_some()
    }

    fn index_at(&self, direction: Direction, pos: usize) -> usize {
        match direction {
            Direction::Upward => pos,
            Direction::Downward => self.stages.len() - 1 - pos,
        }
    }

    fn run_from(&mut self, direction: Direction, start: usize, mut buf: Bytes, original: Bytes) -> Flow {
        for pos in start..self.stages.len() {
            let idx = self.index_at(direction, pos);
            let stage = &mut self.stages[idx];
            let len = buf.len();
            match stage.transform(direction, buf) {
                Ok(Action::Next(next)) => buf = next,
                Ok(Action::Buffered) => return Flow::Buffered,
                Ok(Action::Connect(target)) => {
                    self.awaiting = Some((direction, pos));
                    return Flow::Signal(Signal::ConnectToDestination { target });
                }
                Ok(Action::Fail(reason)) => {
                    return Flow::Signal(Signal::Failed {
                        reason: format!("{} '{}': {}", stage.kind(), stage.name(), reason),
                        original,
                    });
                }
                Err(e) => {
                    warn!(
                        "[pipe] {} {} '{}' dropped {} bytes: {}",
                        direction,
                        stage.kind(),
                        stage.name(),
                        len,
                        e
                    );
                    return Flow::Dropped;
                }
            }
        }
        Flow::Delivered(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{Stage, StageError};

    /// Appends its tag on the way up, strips it on the way down.
    struct Tagger(u8);

    impl Stage for Tagger {
        fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            let mut out = buf.to_vec();
            out.push(self.0);
            Ok(Action::Next(out.into()))
        }

        fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            match buf.last() {
                Some(&t) if t == self.0 => Ok(Action::Next(buf.slice(..buf.len() - 1))),
                _ => Ok(Action::Fail(format!("missing tag {}", self.0))),
            }
        }
    }

    struct Pass;

    impl Stage for Pass {
        fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            Ok(Action::Next(buf))
        }

        fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            Ok(Action::Next(buf))
        }
    }

    struct Hold;

    impl Stage for Hold {
        fn forward(&mut self, _buf: Bytes) -> Result<Action, StageError> {
            Ok(Action::Buffered)
        }

        fn backward(&mut self, _buf: Bytes) -> Result<Action, StageError> {
            Ok(Action::Buffered)
        }
    }

    struct Broken;

    impl Stage for Broken {
        fn forward(&mut self, _buf: Bytes) -> Result<Action, StageError> {
            Err(StageError::Malformed("boom".into()))
        }

        fn backward(&mut self, _buf: Bytes) -> Result<Action, StageError> {
            Err(StageError::Malformed("boom".into()))
        }
    }

    /// Emits `Connect` for its first downward buffer and holds the rest.
    struct Gate {
        connected: bool,
        held: Vec<u8>,
    }

    impl Stage for Gate {
        fn forward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            Ok(Action::Next(buf))
        }

        fn backward(&mut self, buf: Bytes) -> Result<Action, StageError> {
            if self.connected {
                return Ok(Action::Next(buf));
            }
            self.held.extend_from_slice(&buf);
            Ok(Action::Connect(TargetAddr::domain("example.com", 80)))
        }

        fn resume(&mut self) -> Option<Bytes> {
            self.connected = true;
            Some(std::mem::take(&mut self.held).into())
        }
    }

    fn mw(kind: MiddlewareKind, stage: impl Stage + 'static) -> Middleware {
        Middleware::new(kind, "test", Box::new(stage))
    }

    fn tagged_pipe() -> Pipe {
        Pipe::new(vec![
            mw(MiddlewareKind::Frame, Tagger(1)),
            mw(MiddlewareKind::Crypto, Tagger(2)),
            mw(MiddlewareKind::Protocol, Tagger(3)),
            mw(MiddlewareKind::Obfs, Tagger(4)),
        ])
        .unwrap()
    }

    #[test]
    fn test_upward_applies_stages_in_order() {
        let mut pipe = tagged_pipe();
        assert_eq!(
            pipe.feed(Direction::Upward, Bytes::from_static(b"x")),
            Flow::Delivered(Bytes::from_static(&[b'x', 1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_downward_is_mirror_of_upward() {
        let mut pipe = tagged_pipe();
        assert_eq!(
            pipe.kinds(Direction::Downward),
            vec![
                MiddlewareKind::Obfs,
                MiddlewareKind::Protocol,
                MiddlewareKind::Crypto,
                MiddlewareKind::Frame
            ]
        );
        assert_eq!(
            pipe.feed(Direction::Downward, Bytes::from_static(&[b'x', 1, 2, 3, 4])),
            Flow::Delivered(Bytes::from_static(b"x"))
        );
    }

    #[test]
    fn test_only_tagging_stage_marks_buffer() {
        let mut pipe = Pipe::new(vec![
            mw(MiddlewareKind::Frame, Pass),
            mw(MiddlewareKind::Crypto, Pass),
            mw(MiddlewareKind::Protocol, Tagger(9)),
            mw(MiddlewareKind::Obfs, Pass),
        ])
        .unwrap();
        assert_eq!(
            pipe.feed(Direction::Upward, Bytes::from_static(b"ab")),
            Flow::Delivered(Bytes::from_static(&[b'a', b'b', 9]))
        );
    }

    #[test]
    fn test_buffering_stage_short_circuits() {
        let mut pipe = Pipe::new(vec![
            mw(MiddlewareKind::Frame, Pass),
            mw(MiddlewareKind::Crypto, Hold),
            mw(MiddlewareKind::Obfs, Broken),
        ])
        .unwrap();
        // Broken is never reached, so neither a signal nor a drop happens.
        assert_eq!(pipe.feed(Direction::Upward, Bytes::from_static(b"ab")), Flow::Buffered);
    }

    #[test]
    fn test_stage_error_is_swallowed() {
        let mut pipe = Pipe::new(vec![
            mw(MiddlewareKind::Frame, Pass),
            mw(MiddlewareKind::Obfs, Broken),
        ])
        .unwrap();
        assert_eq!(pipe.feed(Direction::Upward, Bytes::from_static(b"a")), Flow::Dropped);
        assert_eq!(pipe.feed(Direction::Upward, Bytes::from_static(b"b")), Flow::Dropped);
    }

    #[test]
    fn test_failure_carries_original_buffer() {
        let mut pipe = tagged_pipe();
        let flow = pipe.feed(Direction::Downward, Bytes::from_static(b"junk"));
        match flow {
            Flow::Signal(Signal::Failed { original, reason }) => {
                assert_eq!(original, Bytes::from_static(b"junk"));
                assert!(reason.starts_with("obfs"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resume_continues_after_signalling_stage_once() {
        let mut pipe = Pipe::new(vec![
            mw(MiddlewareKind::Frame, Tagger(1)),
            mw(MiddlewareKind::Protocol, Gate { connected: false, held: Vec::new() }),
            mw(MiddlewareKind::Obfs, Tagger(4)),
        ])
        .unwrap();

        assert_eq!(pipe.resume(), None);
        let flow = pipe.feed(Direction::Downward, Bytes::from_static(&[b'h', 1, 4]));
        assert_eq!(
            flow,
            Flow::Signal(Signal::ConnectToDestination {
                target: TargetAddr::domain("example.com", 80)
            })
        );
        assert!(pipe.is_awaiting_connect());

        assert_eq!(pipe.resume(), Some(Flow::Delivered(Bytes::from_static(b"h"))));
        assert_eq!(pipe.resume(), None);
        assert_eq!(
            pipe.feed(Direction::Downward, Bytes::from_static(&[b'i', 1, 4])),
            Flow::Delivered(Bytes::from_static(b"i"))
        );
    }

    #[test]
    fn test_rejects_misordered_or_duplicate_stages() {
        let err = Pipe::new(vec![
            mw(MiddlewareKind::Obfs, Pass),
            mw(MiddlewareKind::Frame, Pass),
        ])
        .err();
        assert_eq!(err, Some(PipeError::OutOfOrder { kind: MiddlewareKind::Frame }));

        let err = Pipe::new(vec![
            mw(MiddlewareKind::Crypto, Pass),
            mw(MiddlewareKind::Crypto, Pass),
        ])
        .err();
        assert_eq!(err, Some(PipeError::Duplicate { kind: MiddlewareKind::Crypto }));
    }

    #[test]
    fn test_downward_install_is_reversed() {
        let mut pipe = tagged_pipe();
        pipe.set_middlewares(
            Direction::Downward,
            vec![
                mw(MiddlewareKind::Obfs, Pass),
                mw(MiddlewareKind::Frame, Pass),
            ],
        )
        .unwrap();
        assert_eq!(
            pipe.kinds(Direction::Upward),
            vec![MiddlewareKind::Frame, MiddlewareKind::Obfs]
        );
    }
}
