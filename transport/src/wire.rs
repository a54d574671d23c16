//! The tagged wire format spoken with the helper daemon.
//!
//! Commands look like `<cmd='open_url' url='http://…' '>`: an opening
//! `<`, `key='value'` attributes with embedded quotes doubled (`''`),
//! and a closing `'>` preceded by whitespace. After a `start_send_page`
//! tag the stream switches to raw page bytes until close.

use crate::{Error, Result};

/// One parsed tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    attrs: Vec<(String, String)>,
}

impl Tag {
    /// The value of `name`, unescaped.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The command name (the `cmd` attribute).
    pub fn cmd(&self) -> Option<&str> {
        self.get("cmd")
    }
}

/// Escapes a value for embedding between single quotes.
fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

fn unescape(value: &str) -> String {
    value.replace("''", "'")
}

/// Builds a tag from attribute pairs. The first pair is conventionally
/// `("cmd", …)`.
pub fn build_tag(attrs: &[(&str, &str)]) -> String {
    let mut out = String::from("<");
    for (key, value) in attrs {
        out.push_str(key);
        out.push_str("='");
        out.push_str(&escape(value));
        out.push_str("' ");
    }
    out.push_str("'>");
    out
}

fn parse_tag(text: &str) -> Result<Tag> {
    // Strip "<" and the trailing "'>".
    let body = text
        .strip_prefix('<')
        .and_then(|t| t.strip_suffix("'>"))
        .ok_or_else(|| Error::HelperProtocol(format!("not a tag: {text:?}")))?;
    let mut attrs = Vec::new();
    let bytes = body.as_bytes();
    let mut pos = 0;
    while pos < bytes.len() {
        while pos < bytes.len() && (bytes[pos] as char).is_ascii_whitespace() {
            pos += 1;
        }
        if pos >= bytes.len() {
            break;
        }
        let eq = body[pos..]
            .find("='")
            .ok_or_else(|| Error::HelperProtocol(format!("missing value in {text:?}")))?;
        let key = body[pos..pos + eq].trim().to_string();
        let value_start = pos + eq + 2;
        // The value runs to the next single quote that is not doubled.
        let mut cursor = value_start;
        loop {
            match memchr::memchr(b'\'', &bytes[cursor..]) {
                Some(offset) => {
                    let quote = cursor + offset;
                    if bytes.get(quote + 1) == Some(&b'\'') {
                        cursor = quote + 2;
                        continue;
                    }
                    attrs.push((key, unescape(&body[value_start..quote])));
                    pos = quote + 1;
                    break;
                }
                None => {
                    return Err(Error::HelperProtocol(format!(
                        "unterminated value in {text:?}"
                    )));
                }
            }
        }
    }
    Ok(Tag { attrs })
}

/// Output of the streaming tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A complete tag arrived.
    Tag(Tag),
    /// Raw page bytes (only after a `start_send_page` tag).
    PageBytes(Vec<u8>),
}

/// Streaming tokenizer for the helper's response channel.
///
/// Feeds of arbitrary granularity come in; complete tags (and, once the
/// page transfer starts, raw byte chunks) come out.
#[derive(Debug, Default)]
pub struct Tokenizer {
    buf: Vec<u8>,
    raw_mode: bool,
}

impl Tokenizer {
    /// Creates a tokenizer in tag mode.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stream has switched to raw page bytes.
    pub fn in_page(&self) -> bool {
        self.raw_mode
    }

    /// Consumes `input`, returning every event it completes.
    pub fn push(&mut self, input: &[u8]) -> Result<Vec<WireEvent>> {
        let mut events = Vec::new();
        if self.raw_mode {
            if !input.is_empty() {
                events.push(WireEvent::PageBytes(input.to_vec()));
            }
            return Ok(events);
        }
        self.buf.extend_from_slice(input);
        loop {
            // A tag ends at a "'>" whose quote closes a value, i.e. the
            // character before it is whitespace (values escape quotes, so
            // "'>" cannot occur inside one).
            let Some(end) = find_tag_end(&self.buf) else {
                break;
            };
            let text = String::from_utf8_lossy(&self.buf[..end]).into_owned();
            let tag = parse_tag(&text)?;
            let switch = tag.cmd() == Some("start_send_page");
            events.push(WireEvent::Tag(tag));
            self.buf.drain(..end);
            if switch {
                self.raw_mode = true;
                if !self.buf.is_empty() {
                    let rest = std::mem::take(&mut self.buf);
                    events.push(WireEvent::PageBytes(rest));
                }
                break;
            }
        }
        Ok(events)
    }
}

fn find_tag_end(buf: &[u8]) -> Option<usize> {
    let mut search_from = 0;
    loop {
        let offset = memchr::memmem::find(&buf[search_from..], b"'>")?;
        let pos = search_from + offset;
        if pos > 0 && (buf[pos - 1] as char).is_ascii_whitespace() {
            return Some(pos + 2);
        }
        search_from = pos + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_and_parse_roundtrip() {
        let text = build_tag(&[("cmd", "open_url"), ("url", "http://a.test/")]);
        assert_eq!(text, "<cmd='open_url' url='http://a.test/' '>");
        let tag = parse_tag(&text).unwrap();
        assert_eq!(tag.cmd(), Some("open_url"));
        assert_eq!(tag.get("url"), Some("http://a.test/"));
    }

    #[test]
    fn quotes_in_values_are_doubled() {
        let text = build_tag(&[("cmd", "chat"), ("msg", "it's here")]);
        assert_eq!(text, "<cmd='chat' msg='it''s here' '>");
        let tag = parse_tag(&text).unwrap();
        assert_eq!(tag.get("msg"), Some("it's here"));
    }

    #[test]
    fn tokenizer_handles_split_tags() {
        let mut tokenizer = Tokenizer::new();
        let wire = b"<cmd='send_status_message' msg='connecting' '>";
        for split in 1..wire.len() - 1 {
            let mut tokenizer = Tokenizer::new();
            assert_eq!(tokenizer.push(&wire[..split]).unwrap(), vec![]);
            let events = tokenizer.push(&wire[split..]).unwrap();
            assert_eq!(events.len(), 1, "split {split}");
        }
        let events = tokenizer.push(wire).unwrap();
        match &events[0] {
            WireEvent::Tag(tag) => assert_eq!(tag.get("msg"), Some("connecting")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_send_page_switches_to_raw() {
        let mut tokenizer = Tokenizer::new();
        let events = tokenizer
            .push(b"<cmd='start_send_page' url='http://a.test/' '><html>page")
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], WireEvent::Tag(t) if t.cmd() == Some("start_send_page")));
        assert_eq!(
            events[1],
            WireEvent::PageBytes(b"<html>page".to_vec())
        );
        assert!(tokenizer.in_page());
        let more = tokenizer.push(b" continues").unwrap();
        assert_eq!(more, vec![WireEvent::PageBytes(b" continues".to_vec())]);
    }

    #[test]
    fn value_containing_angle_quote_sequence_is_not_a_closer() {
        // The escaped quote keeps "'>" inside the value from terminating
        // the tag.
        let text = build_tag(&[("cmd", "dialog"), ("msg", "a'>b")]);
        let mut tokenizer = Tokenizer::new();
        let events = tokenizer.push(text.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            WireEvent::Tag(tag) => assert_eq!(tag.get("msg"), Some("a'>b")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_an_error() {
        let mut tokenizer = Tokenizer::new();
        assert!(tokenizer.push(b"nonsense '>").is_err());
    }
}
