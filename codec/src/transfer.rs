//! Chunked transfer decoding.
//!
//! Chunk sizes are hex, optionally followed by extensions, framed by CRLF.
//! A zero-length chunk terminates the stream; trailing headers after it
//! are discarded.

use crate::Decoder;
use httparse::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting a chunk-size line (possibly partially buffered).
    Size,
    /// Reading chunk payload.
    Data { remaining: u64 },
    /// Consuming the CRLF that closes a chunk's payload.
    DataEnd { skip: u8 },
    /// After the zero-length chunk: discarding trailers until a bare CRLF.
    Trailer,
    /// Terminal: framing complete, or the framing was invalid.
    Done,
}

/// Push decoder for `Transfer-Encoding: chunked`.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    buf: Vec<u8>,
    broken: bool,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    /// Creates a decoder at the start of the chunk stream.
    pub fn new() -> Self {
        Self {
            state: State::Size,
            buf: Vec::new(),
            broken: false,
        }
    }

    fn step(&mut self, out: &mut Vec<u8>) -> bool {
        match self.state {
            State::Size => match httparse::parse_chunk_size(&self.buf) {
                Ok(Status::Complete((used, size))) => {
                    self.buf.drain(..used);
                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::Data { remaining: size }
                    };
                    true
                }
                Ok(Status::Partial) => false,
                Err(_) => {
                    log::warn!("invalid chunk size, dropping remainder of stream");
                    self.broken = true;
                    self.state = State::Done;
                    false
                }
            },
            State::Data { remaining } => {
                if self.buf.is_empty() {
                    return false;
                }
                let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                out.extend_from_slice(&self.buf[..take]);
                self.buf.drain(..take);
                let left = remaining - take as u64;
                self.state = if left == 0 {
                    State::DataEnd { skip: 2 }
                } else {
                    State::Data { remaining: left }
                };
                true
            }
            State::DataEnd { skip } => {
                let take = self.buf.len().min(skip as usize);
                self.buf.drain(..take);
                let left = skip - take as u8;
                self.state = if left == 0 {
                    State::Size
                } else {
                    State::DataEnd { skip: left }
                };
                take > 0
            }
            State::Trailer => {
                // Discard trailer lines; a bare CRLF (or LF) ends the stream.
                match memchr_newline(&self.buf) {
                    Some(eol) => {
                        let line_empty = self.buf[..eol].iter().all(|&b| b == b'\r');
                        self.buf.drain(..=eol);
                        if line_empty {
                            self.state = State::Done;
                        }
                        true
                    }
                    None => false,
                }
            }
            State::Done => {
                // Bytes past the final chunk belong to nobody; drop them.
                self.buf.clear();
                false
            }
        }
    }
}

fn memchr_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}

impl Decoder for ChunkedDecoder {
    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        if self.broken {
            return Vec::new();
        }
        self.buf.extend_from_slice(input);
        let mut out = Vec::with_capacity(input.len());
        while self.step(&mut out) {}
        out
    }

    fn finish(&mut self) -> Vec<u8> {
        if !self.broken && self.state != State::Done {
            log::warn!("chunked stream ended inside framing (state {:?})", self.state);
        }
        self.buf.clear();
        Vec::new()
    }

    fn exhausted(&self) -> bool {
        self.broken || self.state == State::Done
    }
}
