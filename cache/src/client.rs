//! Cache consumers: the per-request context and the client queue entry.

use larkspur_http::Url;
use std::path::PathBuf;
use std::rc::Rc;

bitflags::bitflags! {
    /// What kind of consumer a request serves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WebFlags: u8 {
        /// The top-level resource of a page load.
        const ROOT_URL = 1 << 0;
        /// An embedded image.
        const IMAGE = 1 << 1;
        /// A stylesheet.
        const STYLESHEET = 1 << 2;
        /// A save-to-disk request; bytes go to a file, not a viewer.
        const DOWNLOAD = 1 << 3;
    }
}

/// Identifies a browser window to the delegate. The cache never looks
/// inside.
pub type WindowId = u32;

/// Consumer context passed with each cache open.
#[derive(Debug, Clone)]
pub struct Web {
    /// The requested URL.
    pub url: Url,
    /// The page that caused this request; `None` when user-initiated.
    pub requester: Option<Url>,
    /// The requesting browser window.
    pub window: WindowId,
    /// Consumer kind.
    pub flags: WebFlags,
    /// Destination filename for downloads.
    pub filename: Option<PathBuf>,
    /// Bytes already written to disk for downloads.
    pub saved_bytes: u64,
}

impl Web {
    /// A consumer context for `url` in `window`.
    pub fn new(url: Url, requester: Option<Url>, window: WindowId) -> Self {
        Self {
            url,
            requester,
            window,
            flags: WebFlags::empty(),
            filename: None,
            saved_bytes: 0,
        }
    }

    /// Builder-style flag addition.
    #[must_use]
    pub fn with_flags(mut self, flags: WebFlags) -> Self {
        self.flags |= flags;
        self
    }
}

/// Identifies a cache client. Keys are unique for the lifetime of the
/// process (the counter wraps after four billion requests).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientKey(pub u32);

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A byte buffer shared between the cache and its clients.
pub type SharedBuf = Rc<std::cell::RefCell<Vec<u8>>>;

/// What a client callback is being told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOp {
    /// New bytes are available; the update carries the whole buffer so far.
    Send,
    /// The transfer is complete; this is the last call.
    Close,
    /// The transfer failed; this is the last call.
    Abort,
}

/// Snapshot handed to a client callback.
#[derive(Clone)]
pub struct ClientUpdate {
    /// The operation.
    pub op: ClientOp,
    /// The receiving client.
    pub key: ClientKey,
    /// The entry URL.
    pub url: Url,
    /// The live data buffer (transcoded when a charset decoder is active).
    pub buf: SharedBuf,
    /// Valid length of `buf` at delivery time.
    pub len: usize,
}

impl std::fmt::Debug for ClientUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientUpdate")
            .field("op", &self.op)
            .field("key", &self.key)
            .field("url", &self.url.as_str())
            .field("len", &self.len)
            .finish()
    }
}

/// A client's data callback.
pub type ClientCallback = Rc<dyn Fn(&ClientUpdate)>;

/// One queued consumer of a cache entry.
pub struct CacheClient {
    pub(crate) key: ClientKey,
    pub(crate) url: Url,
    pub(crate) callback: Option<ClientCallback>,
    pub(crate) web: Web,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient")
            .field("key", &self.key)
            .field("url", &self.url.as_str())
            .field("has_callback", &self.callback.is_some())
            .field("web_flags", &self.web.flags)
            .finish()
    }
}

impl CacheClient {
    /// The client's key.
    pub fn key(&self) -> ClientKey {
        self.key
    }

    /// The consumer context.
    pub fn web(&self) -> &Web {
        &self.web
    }
}
