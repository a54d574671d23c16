//! The cache entry: one URL's worth of fetch state.

use crate::client::SharedBuf;
use crate::sniff;
use larkspur_codec::{charset_decoder, Decoder};
use larkspur_http::{ResponseHead, Url};
use std::cell::RefCell;
use std::rc::Rc;

bitflags::bitflags! {
    /// Entry state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u32 {
        /// No body bytes have arrived yet.
        const IS_EMPTY = 1 << 0;
        /// The response head is complete and parsed.
        const GOT_HEADER = 1 << 1;
        /// A usable `Content-Length` was declared.
        const GOT_LENGTH = 1 << 2;
        /// The content type is settled (header checked against data).
        const GOT_CONTENT_TYPE = 1 << 3;
        /// The whole body has arrived.
        const GOT_DATA = 1 << 4;
        /// A redirect is active.
        const REDIRECT = 1 << 5;
        /// `301`: the redirect replaces the source permanently.
        const FORCE_REDIRECT = 1 << 6;
        /// `302`: the redirect is temporary.
        const TEMP_REDIRECT = 1 << 7;
        /// A redirect loop was detected; no further fetches.
        const REDIRECT_LOOP = 1 << 8;
        /// `404`.
        const NOT_FOUND = 1 << 9;
        /// Declared size exceeds the huge-file threshold.
        const HUGE_FILE = 1 << 10;
        /// Delivery is paused.
        const STOPPED = 1 << 11;
        /// The "waiting for reply" message has been cleared once.
        const MSG_ERASED = 1 << 12;
        /// A pre-injected internal page; never evicted.
        const INTERNAL_URL = 1 << 13;
    }
}

/// Where a content type came from, for provenance tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeSource {
    /// The HTTP `Content-Type` header.
    Http,
    /// An HTML `META HTTP-EQUIV` declaration.
    Meta,
}

/// One URL's fetch state, owned by the cache.
pub struct CacheEntry {
    pub(crate) url: Url,
    pub(crate) type_detected: Option<String>,
    pub(crate) type_header: Option<String>,
    pub(crate) type_meta: Option<String>,
    pub(crate) type_normalized: Option<String>,
    pub(crate) head: ResponseHead,
    pub(crate) location: Option<Url>,
    pub(crate) auth: Vec<String>,
    pub(crate) data: SharedBuf,
    pub(crate) utf8_data: Option<SharedBuf>,
    pub(crate) data_refcount: i32,
    pub(crate) transfer_decoder: Option<Box<dyn Decoder>>,
    pub(crate) content_decoder: Option<Box<dyn Decoder>>,
    pub(crate) charset_decoder: Option<Box<dyn Decoder>>,
    pub(crate) expected_size: u64,
    pub(crate) transfer_size: u64,
    pub(crate) flags: EntryFlags,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("url", &self.url.as_str())
            .field("flags", &self.flags)
            .field("type", &self.current_content_type())
            .field("data_len", &self.data.borrow().len())
            .field("transfer_size", &self.transfer_size)
            .finish()
    }
}

impl CacheEntry {
    pub(crate) fn new(url: Url) -> Self {
        Self {
            url,
            type_detected: None,
            type_header: None,
            type_meta: None,
            type_normalized: None,
            head: ResponseHead::new(),
            location: None,
            auth: Vec::new(),
            data: Rc::new(RefCell::new(Vec::new())),
            utf8_data: None,
            data_refcount: 0,
            transfer_decoder: None,
            content_decoder: None,
            charset_decoder: None,
            expected_size: 0,
            transfer_size: 0,
            flags: EntryFlags::IS_EMPTY,
        }
    }

    /// The entry URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Current flags.
    pub fn flags(&self) -> EntryFlags {
        self.flags
    }

    /// The redirect target, when one is active.
    pub fn location(&self) -> Option<&Url> {
        self.location.as_ref()
    }

    /// The content type currently in effect, by provenance priority:
    /// normalized, then META, then header, then detected.
    pub fn current_content_type(&self) -> Option<&str> {
        self.type_normalized
            .as_deref()
            .or(self.type_meta.as_deref())
            .or(self.type_header.as_deref())
            .or(self.type_detected.as_deref())
    }

    /// The buffer clients should read: transcoded when present, raw
    /// otherwise.
    pub(crate) fn client_data(&self) -> SharedBuf {
        self.utf8_data
            .clone()
            .unwrap_or_else(|| Rc::clone(&self.data))
    }

    /// References the data buffer. The first reference under an active
    /// charset decoder materializes `utf8_data` from everything decoded
    /// so far.
    pub(crate) fn ref_data(&mut self) {
        self.data_refcount += 1;
        if let Some(decoder) = self.charset_decoder.as_mut() {
            if self.utf8_data.is_none() || self.data_refcount == 1 {
                let transcoded = decoder.process(&self.data.borrow());
                self.utf8_data = Some(Rc::new(RefCell::new(transcoded)));
            }
        }
    }

    /// Drops one data reference; at zero the transcoded buffer goes away.
    pub(crate) fn unref_data(&mut self) {
        self.data_refcount -= 1;
        if self.data_refcount < 0 {
            log::error!("cache: negative data refcount for {}", self.url);
            self.data_refcount = 0;
        }
        if self.charset_decoder.is_some() && self.data_refcount == 0 {
            self.utf8_data = None;
        }
    }

    /// Applies a content type declared by `source`.
    ///
    /// META beats the header, but only the first declaration from each
    /// source sticks. A META declaration carrying only a charset composes
    /// with the detected type; declaring a charset while one is active
    /// reinitializes the charset decoder and invalidates the transcoded
    /// buffer. Returns the type now in effect.
    pub(crate) fn set_content_type(&mut self, ctype: &str, source: TypeSource) -> Option<String> {
        let current = self.current_content_type().map(str::to_string);
        if self.type_meta.is_some() || (source == TypeSource::Http && self.type_header.is_some()) {
            return current;
        }
        match source {
            TypeSource::Http => self.type_header = Some(ctype.to_string()),
            TypeSource::Meta => self.type_meta = Some(ctype.to_string()),
        }
        // Differ when either the media type or the charset changes.
        let differs = match &current {
            Some(current) => {
                let (cur_essence, _, cur_charset) = sniff::parse_type(current);
                let (new_essence, _, new_charset) = sniff::parse_type(ctype);
                cur_essence != new_essence
                    || !cur_charset
                        .unwrap_or_default()
                        .eq_ignore_ascii_case(&new_charset.unwrap_or_default())
            }
            None => true,
        };
        if differs {
            let (essence, _, charset) = sniff::parse_type(ctype);
            if source == TypeSource::Meta && charset.is_some() && essence.is_empty() {
                // META gave only a charset; keep the detected type with it.
                if let Some(detected) = &self.type_detected {
                    self.type_normalized = Some(format!("{detected}; {}", ctype.trim()));
                }
            } else if source == TypeSource::Meta && essence == "text/xhtml" {
                // Some generators write "text/xhtml" in META; fall back to
                // what the data says.
                self.type_normalized = self.type_detected.clone();
            }
            if let Some(charset) = charset {
                self.charset_decoder = charset_decoder(&charset);
                self.utf8_data = None;
                if self.charset_decoder.is_some() && self.data_refcount > 0 {
                    // Re-materialize for existing references.
                    let decoder = self.charset_decoder.as_mut().unwrap();
                    let transcoded = decoder.process(&self.data.borrow());
                    self.utf8_data = Some(Rc::new(RefCell::new(transcoded)));
                }
            }
        }
        self.current_content_type().map(str::to_string)
    }
}
