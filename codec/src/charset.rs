//! Charset translation to UTF-8.

use crate::Decoder;
use encoding_rs::Encoding;

/// Push decoder translating a named charset to UTF-8.
///
/// Undecodable input becomes U+FFFD. The decoder never becomes exhausted:
/// with replacement, every byte sequence decodes to *something*.
pub struct CharsetDecoder {
    decoder: encoding_rs::Decoder,
    encoding: &'static Encoding,
}

impl std::fmt::Debug for CharsetDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CharsetDecoder")
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

impl CharsetDecoder {
    /// Creates a decoder for `encoding`.
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            decoder: encoding.new_decoder(),
            encoding,
        }
    }

    /// The source encoding's canonical name.
    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    fn decode(&mut self, input: &[u8], last: bool) -> Vec<u8> {
        let mut dst = String::with_capacity(
            self.decoder
                .max_utf8_buffer_length(input.len())
                .unwrap_or(input.len() * 3),
        );
        let (_result, _read, _replaced) = self.decoder.decode_to_string(input, &mut dst, last);
        dst.into_bytes()
    }
}

impl Decoder for CharsetDecoder {
    fn process(&mut self, input: &[u8]) -> Vec<u8> {
        self.decode(input, false)
    }

    fn finish(&mut self) -> Vec<u8> {
        self.decode(&[], true)
    }

    fn exhausted(&self) -> bool {
        false
    }
}
