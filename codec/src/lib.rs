/*!
Stream decoders for the fetch pipeline.

Response bodies pass through up to three decoding stages before they reach
the cache buffer: a *transfer* decoder (chunked framing), a *content*
decoder (gzip), and a *charset* decoder (anything-to-UTF-8). Each stage is
a push transducer: the cache feeds it bytes as they arrive and appends
whatever comes out.

A decoder that hits an unrecoverable state goes quiet: it produces no
bytes on further input and marks itself exhausted. The transfer is not
aborted; bytes already decoded are kept.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod charset;
mod content;
mod transfer;

pub use charset::CharsetDecoder;
pub use content::GzipDecoder;
pub use transfer::ChunkedDecoder;

/// A streaming byte transducer.
pub trait Decoder {
    /// Feeds `input` through the decoder, returning the decoded bytes that
    /// became available.
    fn process(&mut self, input: &[u8]) -> Vec<u8>;

    /// Flushes any bytes the decoder was still holding. Called once, when
    /// the transfer completes.
    fn finish(&mut self) -> Vec<u8>;

    /// Whether the decoder has reached an unrecoverable state (or its
    /// natural end) and will produce no further output.
    fn exhausted(&self) -> bool;
}

/// Builds a transfer decoder for a `Transfer-Encoding` header value.
///
/// `chunked` gets a [`ChunkedDecoder`]; identity (or an absent header)
/// needs no decoder at all. Unknown encodings are treated as identity with
/// a warning, so the raw bytes still reach the caller.
pub fn transfer_decoder(encoding: Option<&str>) -> Option<Box<dyn Decoder>> {
    match encoding.map(str::trim) {
        Some(enc) if enc.eq_ignore_ascii_case("chunked") => {
            Some(Box::new(ChunkedDecoder::new()))
        }
        Some(enc) if enc.eq_ignore_ascii_case("identity") => None,
        Some(enc) => {
            log::warn!("unknown Transfer-Encoding {enc:?}, passing through");
            None
        }
        None => None,
    }
}

/// Builds a content decoder for a `Content-Encoding` header value.
pub fn content_decoder(encoding: Option<&str>) -> Option<Box<dyn Decoder>> {
    match encoding.map(str::trim) {
        Some(enc) if enc.eq_ignore_ascii_case("gzip") || enc.eq_ignore_ascii_case("x-gzip") => {
            Some(Box::new(GzipDecoder::new()))
        }
        Some(enc) if enc.eq_ignore_ascii_case("identity") => None,
        Some(enc) => {
            log::warn!("unknown Content-Encoding {enc:?}, passing through");
            None
        }
        None => None,
    }
}

/// Builds a charset decoder for a declared charset label.
///
/// UTF-8 and plain ASCII need no translation; unknown labels fall back to
/// pass-through with a warning.
pub fn charset_decoder(charset: &str) -> Option<Box<dyn Decoder>> {
    let label = charset.trim().trim_matches('"');
    if label.eq_ignore_ascii_case("utf-8")
        || label.eq_ignore_ascii_case("utf8")
        || label.eq_ignore_ascii_case("us-ascii")
    {
        return None;
    }
    match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) if encoding == encoding_rs::UTF_8 => None,
        Some(encoding) => Some(Box::new(CharsetDecoder::new(encoding))),
        None => {
            log::warn!("unknown charset {label:?}, passing through");
            None
        }
    }
}
