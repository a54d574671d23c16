//! Response head accumulation and field access.
//!
//! The head is collected byte-by-byte as it arrives from the transport,
//! with carriage returns and NUL bytes stripped and folded continuation
//! lines joined, so that every field occupies exactly one line by the
//! time anyone looks at it.

use crate::Status;
use smallvec::SmallVec;

/// An accumulating HTTP response head.
#[derive(Debug, Default, Clone)]
pub struct ResponseHead {
    raw: Vec<u8>,
    complete: bool,
}

impl ResponseHead {
    /// Creates an empty head.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the head.
    ///
    /// Returns `Some(consumed)` once the head completes (the terminating
    /// blank line included in the count); `None` while more bytes are
    /// needed, in which case the whole buffer was consumed.
    pub fn push(&mut self, buf: &[u8]) -> Option<usize> {
        debug_assert!(!self.complete);
        let mut newlines = usize::from(self.raw.last() == Some(&b'\n'));
        for (i, &byte) in buf.iter().enumerate() {
            match byte {
                b'\r' | 0 => continue,
                b' ' | b'\t' if newlines == 1 => {
                    // Folded continuation line: join onto the previous one.
                    self.raw.pop();
                    newlines = 0;
                    self.raw.push(byte);
                }
                b'\n' => {
                    newlines += 1;
                    self.raw.push(byte);
                    if newlines == 2 {
                        self.complete = true;
                        return Some(i + 1);
                    }
                }
                _ => {
                    newlines = 0;
                    self.raw.push(byte);
                }
            }
        }
        None
    }

    /// Whether the terminating blank line has been seen.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Discards everything accumulated so far. Used when a `100 Continue`
    /// turns out to be merely informational.
    pub fn reset(&mut self) {
        self.raw.clear();
        self.complete = false;
    }

    /// The accumulated head, CR-stripped and unfolded.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The status line, without its newline.
    pub fn status_line(&self) -> Option<&str> {
        let eol = self.raw.iter().position(|&b| b == b'\n')?;
        std::str::from_utf8(&self.raw[..eol]).ok()
    }

    /// The response status, parsed from the status line.
    pub fn status(&self) -> Option<Status> {
        let line = self.status_line()?;
        let mut parts = line.split_ascii_whitespace();
        let version = parts.next()?;
        if !version.starts_with("HTTP/") {
            return None;
        }
        let code: u16 = parts.next()?.parse().ok()?;
        Some(Status::from(code))
    }

    fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.raw.split(|&b| b == b'\n').skip(1)
    }

    /// The value of the first field named `name` (ASCII case-insensitive),
    /// with surrounding blanks trimmed.
    pub fn field(&self, name: &str) -> Option<String> {
        self.field_values(name).into_iter().next()
    }

    /// All values of the fields named `name`, in order of appearance.
    pub fn fields(&self, name: &str) -> Vec<String> {
        self.field_values(name).into_vec()
    }

    fn field_values(&self, name: &str) -> SmallVec<[String; 2]> {
        let mut values = SmallVec::new();
        for line in self.lines() {
            let Some(colon) = memchr::memchr(b':', line) else {
                continue;
            };
            let (field_name, rest) = line.split_at(colon);
            if !field_name.eq_ignore_ascii_case(name.as_bytes()) {
                continue;
            }
            let value = String::from_utf8_lossy(&rest[1..]);
            values.push(value.trim_matches([' ', '\t']).to_string());
        }
        values
    }
}
