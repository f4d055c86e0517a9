//! Per-connection accounting log, flushed to the log when the connection
//! closes.

use std::collections::VecDeque;
use std::fmt;

pub const TRACK_CHAR_UPLOAD: char = 'u';
pub const TRACK_CHAR_DOWNLOAD: char = 'd';
pub const TRACK_MAX_SIZE: usize = 40;

const ELISION: &str = " ... ";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Endpoint(String),
    Marker(char),
    Bytes(usize),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Endpoint(s) => f.write_str(s),
            Token::Marker(c) => write!(f, "{}", c),
            Token::Bytes(n) => write!(f, "{}", n),
        }
    }
}

/// Keeps the first and last `TRACK_MAX_SIZE / 2` tokens; everything in
/// between is only counted.
#[derive(Debug, Default)]
pub struct Track {
    head: Vec<Token>,
    tail: VecDeque<Token>,
    total: usize,
    samples: usize,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&mut self, endpoint: impl fmt::Display) {
        self.push(Token::Endpoint(endpoint.to_string()));
    }

    pub fn upload(&mut self, bytes: usize) {
        self.push(Token::Marker(TRACK_CHAR_UPLOAD));
        self.push(Token::Bytes(bytes));
    }

    pub fn download(&mut self, bytes: usize) {
        self.push(Token::Marker(TRACK_CHAR_DOWNLOAD));
        self.push(Token::Bytes(bytes));
    }

    /// Number of traffic samples recorded, including elided ones.
    pub fn samples(&self) -> usize {
        self.samples
    }

    fn push(&mut self, token: Token) {
        if matches!(token, Token::Bytes(_)) {
            self.samples += 1;
        }
        self.total += 1;

        let per_size = TRACK_MAX_SIZE / 2;
        if self.head.len() < per_size {
            self.head.push(token);
            return;
        }
        if self.tail.len() == per_size {
            self.tail.pop_front();
        }
        self.tail.push_back(token);
    }

    fn is_elided(&self) -> bool {
        self.total > TRACK_MAX_SIZE
    }
}

impl fmt::Display for Track {
    /// Space separated tokens; runs of the same direction marker collapse
    /// to one.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elision = self.is_elided().then_some(None);
        let tokens = self
            .head
            .iter()
            .map(Some)
            .chain(elision)
            .chain(self.tail.iter().map(Some));

        let mut last_marker = None;
        let mut first = true;
        for token in tokens {
            if let Some(Token::Marker(c)) = token {
                if last_marker == Some(*c) {
                    continue;
                }
                last_marker = Some(*c);
            }
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match token {
                Some(token) => write!(f, "{}", token)?,
                None => f.write_str(ELISION)?,
            }
        }
        Ok(())
    }
}
