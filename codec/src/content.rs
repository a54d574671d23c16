//! Gzip content decoding, as a streaming inflater.

use crate::Decoder;
use flate2::{Decompress, FlushDecompress, Status};

/// Push decoder for `Content-Encoding: gzip`.
///
/// Uses the full 32 KiB inflate window. A clean stream end is terminal;
/// an invalid block puts the decoder into the quiet exhausted state
/// without discarding bytes already produced.
pub struct GzipDecoder {
    inflate: Decompress,
    finished: bool,
    broken: bool,
}

impl std::fmt::Debug for GzipDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipDecoder")
            .field("total_in", &self.inflate.total_in())
            .field("total_out", &self.inflate.total_out())
            .field("finished", &self.finished)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Default for GzipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl GzipDecoder {
    /// Creates a decoder expecting a gzip header.
    pub fn new() -> Self {
        Self {
            inflate: Decompress::new_gzip(15),
            finished: false,
            broken: false,
        }
    }

    fn inflate_all(&mut self, mut input: &[u8], flush: FlushDecompress) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = match self.inflate.decompress(input, &mut chunk, flush) {
                Ok(status) => status,
                Err(err) => {
                    log::warn!("gzip stream error: {err}");
                    self.broken = true;
                    return out;
                }
            };
            let consumed = (self.inflate.total_in() - before_in) as usize;
            let produced = (self.inflate.total_out() - before_out) as usize;
            input = &input[consumed..];
            out.extend_from_slice(&chunk[..produced]);
            match status {
                Status::StreamEnd => {
                    self.finished = true;
                    return out;
                }
                Status::Ok | Status::BufError => {
                    if input.is_empty() && produced < chunk.len() {
                        return out;
                    }
                    if consumed == 0 && produced == 0 {
                        return out;
                    }
                }
            }
        }
    }
}

impl Decoder for GzipDecoder {
    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        if self.finished || self.broken {
            return Vec::new();
        }
        self.inflate_all(input, FlushDecompress::None)
    }

    fn finish(&mut self) -> Vec<u8> {
        if self.finished || self.broken {
            return Vec::new();
        }
        let out = self.inflate_all(&[], FlushDecompress::Finish);
        if !self.finished {
            log::warn!("gzip stream ended prematurely");
        }
        out
    }

    fn exhausted(&self) -> bool {
        self.finished || self.broken
    }
}
