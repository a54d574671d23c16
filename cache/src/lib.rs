/*!
The shared content cache: a URL-keyed store of in-flight and completed
fetches, multiplexing any number of consumers per URL.

The cache receives raw transport bytes, accumulates and parses the
response head, pushes the body through the decoder pipeline, and drives
incremental delivery to every queued client. Redirects, authentication
challenges, MIME detection and the cookie/domain policies are all decided
here; everything that needs a browser window (messages, prompts,
navigation) goes through the [`CacheDelegate`].

Clients are called in enqueue order; bytes are delivered in arrival
order; the head is parsed exactly once per entry; every client sees the
content type no earlier than the head-complete moment.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]

mod client;
mod entry;
pub mod sniff;

pub use client::{
    CacheClient, ClientCallback, ClientKey, ClientOp, ClientUpdate, SharedBuf, Web, WebFlags,
    WindowId,
};
pub use entry::{CacheEntry, EntryFlags, TypeSource};

use larkspur_codec::{content_decoder, transfer_decoder};
use larkspur_http::{Status, Url, UrlFlags};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Default declared-size threshold above which a fetch is "huge" and root
/// clients are offered a download instead (15 MiB).
pub const HUGE_FILE_THRESHOLD: u64 = 15 * 1024 * 1024;

/// Cap on upfront buffer reservation, whatever the declared size says.
const MAX_INIT_BUF: usize = 1024 * 1024;

/// Bodies smaller than this still follow a redirect that is neither 301
/// nor 302 flagged.
const SMALL_REDIRECT_BODY: usize = 1024;

/// The browser-side surface the cache calls out to.
///
/// Implementations route to the window (messages, prompts), the
/// navigation layer (redirects), and the broker (connection abort).
/// Methods other than [`CacheDelegate::dispatch_by_type`] have no-op
/// defaults so tests can implement only what they observe.
pub trait CacheDelegate {
    /// Shows `msg` in the window's status area. An empty string clears it.
    fn status_msg(&self, _window: WindowId, _msg: &str) {}

    /// A root client's entry wants to navigate to `to`.
    fn redirect(&self, _window: WindowId, _to: Url, _from: &Url) {}

    /// The window's recursive-redirect depth.
    fn redirect_level(&self, _window: WindowId) -> u32 {
        0
    }

    /// Updates the window's recursive-redirect depth.
    fn set_redirect_level(&self, _window: WindowId, _level: u32) {}

    /// Picks a content viewer for `ctype`, or `None` when the type is not
    /// viewable.
    fn dispatch_by_type(&self, ctype: &str, web: &Web) -> Option<ClientCallback>;

    /// Offers first-party `Set-Cookie` lines to the cookie subsystem.
    fn set_cookies(&self, _lines: &[String], _url: &Url, _server_date: Option<&str>) {}

    /// Whether the domain policy allows navigating from `from` to `to`.
    fn domain_permit(&self, _from: &Url, _to: &Url) -> bool {
        true
    }

    /// Aborts any in-flight transport for `url`, both directions.
    fn conn_abort_by_url(&self, _url: &Url) {}

    /// Cancels the window's expected URL if it equals `url`.
    fn cancel_expect_if_eq(&self, _window: WindowId, _url: &Url) {}

    /// A root client finished without rendering; the window may retire it.
    fn close_window_client(&self, _window: WindowId, _key: ClientKey) {}

    /// Removes a client from the window's active set.
    fn remove_window_client(&self, _window: WindowId, _key: ClientKey) {}

    /// Offers to save `url` to disk.
    fn offer_save_link(&self, _window: WindowId, _url: &Url) {}

    /// Asks for credentials; on success the caller reloads the page.
    fn prompt_auth(&self, _window: WindowId, _challenges: Vec<String>, _url: Url) {}

    /// Arranges for [`Cache::process_delayed`] to run on the next event
    /// loop turn.
    fn schedule_delayed_dispatch(&self) {}

    /// Progress report for a root transfer.
    fn page_progress(&self, _window: WindowId, _bytes: usize, _done: bool) {}
}

/// A transport-side event for one URL.
#[derive(Debug)]
pub enum StreamOp<'a> {
    /// Raw bytes arrived.
    Data(&'a [u8]),
    /// The transport finished normally.
    Close,
    /// The transport failed; clients observe `Abort`.
    Abort,
}

struct State {
    entries: BTreeMap<Url, CacheEntry>,
    clients: Vec<CacheClient>,
    next_client_key: u32,
    delayed: Vec<Url>,
    delayed_scheduled: bool,
    busy: bool,
    huge_threshold: u64,
}

/// Handle to the cache. Clones share the same store.
#[derive(Clone)]
pub struct Cache {
    state: Rc<RefCell<State>>,
    delegate: Rc<dyn CacheDelegate>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Cache")
            .field("entries", &st.entries.len())
            .field("clients", &st.clients.len())
            .field("delayed", &st.delayed.len())
            .finish()
    }
}

impl Cache {
    /// Creates a cache with the default huge-file threshold.
    pub fn new(delegate: Rc<dyn CacheDelegate>) -> Self {
        Self::with_huge_threshold(delegate, HUGE_FILE_THRESHOLD)
    }

    /// Creates a cache with a custom huge-file threshold.
    pub fn with_huge_threshold(delegate: Rc<dyn CacheDelegate>, huge_threshold: u64) -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                entries: BTreeMap::new(),
                clients: Vec::new(),
                next_client_key: 0,
                delayed: Vec::new(),
                delayed_scheduled: false,
                busy: false,
                huge_threshold,
            })),
            delegate,
        }
    }

    /// Opens `web.url` for a new client.
    ///
    /// An end-to-end reload evicts any existing entry first. On a cache
    /// hit the already-available bytes are delivered on the next loop
    /// turn; on a miss an empty entry is created and the caller arranges
    /// the transport fetch. Returns the client's key.
    pub fn open(&self, web: Web, callback: Option<ClientCallback>) -> ClientKey {
        let url = web.url.clone();
        if url.flags().contains(UrlFlags::E2E_RELOAD) {
            self.remove_by_url(&url);
        }
        let (key, hit, schedule) = {
            let mut st = self.state.borrow_mut();
            let hit = st.entries.contains_key(&url);
            if !hit {
                st.entries.insert(url.clone(), CacheEntry::new(url.clone()));
            }
            st.next_client_key = st.next_client_key.checked_add(1).unwrap_or(1);
            let key = ClientKey(st.next_client_key);
            st.clients.push(CacheClient {
                key,
                url: url.clone(),
                callback,
                web,
            });
            let mut schedule = false;
            if hit {
                if !st.delayed.contains(&url) {
                    st.delayed.push(url.clone());
                }
                if !st.delayed_scheduled {
                    st.delayed_scheduled = true;
                    schedule = true;
                }
            }
            (key, hit, schedule)
        };
        log::debug!(
            "cache: open {} for client {key} ({})",
            url,
            if hit { "hit" } else { "miss" }
        );
        if schedule {
            self.delegate.schedule_delayed_dispatch();
        }
        key
    }

    /// Runs the deferred dispatches queued by cache hits. Called from the
    /// event loop turn the delegate scheduled.
    pub fn process_delayed(&self) {
        loop {
            let url = {
                let st = self.state.borrow();
                st.delayed.first().cloned()
            };
            let Some(url) = url else { break };
            {
                let mut st = self.state.borrow_mut();
                if let Some(entry) = st.entries.get_mut(&url) {
                    entry.ref_data();
                }
            }
            let alive = self.process_queue(&url);
            let mut st = self.state.borrow_mut();
            if alive {
                if let Some(entry) = st.entries.get_mut(&url) {
                    entry.unref_data();
                }
            }
            st.delayed.retain(|u| u != &url);
        }
        self.state.borrow_mut().delayed_scheduled = false;
    }

    /// Whether deferred dispatches are pending.
    pub fn has_delayed(&self) -> bool {
        !self.state.borrow().delayed.is_empty()
    }

    /// Feeds a transport event for `url` into the cache.
    pub fn process_stream(&self, url: &Url, op: StreamOp<'_>) {
        match op {
            StreamOp::Data(buf) => self.stream_data(url, buf),
            StreamOp::Close => self.stream_close(url),
            StreamOp::Abort => self.stream_abort(url),
        }
    }

    fn stream_data(&self, url: &Url, buf: &[u8]) {
        let mut offset = 0;
        // The head may complete, turn out to be informational, reset, and
        // complete again, all within one buffer.
        loop {
            let mut st = self.state.borrow_mut();
            let Some(entry) = st.entries.get_mut(url) else {
                return;
            };
            if entry.flags.contains(EntryFlags::GOT_HEADER) {
                break;
            }
            match entry.head.push(&buf[offset..]) {
                Some(consumed) => {
                    offset += consumed;
                    entry.flags |= EntryFlags::GOT_HEADER;
                    drop(st);
                    self.apply_header(url);
                }
                None => return,
            }
        }

        {
            let mut st = self.state.borrow_mut();
            let Some(entry) = st.entries.get_mut(url) else {
                return;
            };
            let chunk = &buf[offset..];
            entry.transfer_size += chunk.len() as u64;
            let mut bytes = chunk.to_vec();
            if let Some(decoder) = entry.transfer_decoder.as_mut() {
                bytes = decoder.process(&bytes);
            }
            if let Some(decoder) = entry.content_decoder.as_mut() {
                bytes = decoder.process(&bytes);
            }
            entry.data.borrow_mut().extend_from_slice(&bytes);
            if entry.utf8_data.is_some() {
                if let Some(decoder) = entry.charset_decoder.as_mut() {
                    let transcoded = decoder.process(&bytes);
                    entry
                        .utf8_data
                        .as_ref()
                        .unwrap()
                        .borrow_mut()
                        .extend_from_slice(&transcoded);
                }
            }
            if !entry.data.borrow().is_empty() {
                entry.flags -= EntryFlags::IS_EMPTY;
            }
        }
        self.process_queue(url);
    }

    fn stream_close(&self, url: &Url) {
        {
            let mut st = self.state.borrow_mut();
            let Some(entry) = st.entries.get_mut(url) else {
                return;
            };
            if (entry.expected_size > 0 || entry.transfer_size > 0) && entry.type_header.is_none()
            {
                log::warn!("cache: message with a body lacked Content-Type ({url})");
            }
            if entry.flags.contains(EntryFlags::GOT_LENGTH)
                && entry.expected_size != entry.transfer_size
            {
                log::warn!(
                    "cache: Content-Length does not match body at {url}: expected {}, got {}",
                    entry.expected_size,
                    entry.transfer_size
                );
            }
            if entry.transfer_size == 0 && !entry.flags.contains(EntryFlags::REDIRECT) {
                if let Some(status_line) = entry.head.status_line() {
                    log::warn!("cache: body was empty, server sent: {status_line}");
                }
            }
            entry.flags |= EntryFlags::GOT_DATA;
            entry.flags -= EntryFlags::STOPPED;

            // Flush decoder tails before dropping them; the charset
            // decoder stays for repush.
            let mut tail = Vec::new();
            if let Some(mut decoder) = entry.transfer_decoder.take() {
                tail.extend(decoder.finish());
            }
            if let Some(mut decoder) = entry.content_decoder.take() {
                let mut decoded = decoder.process(&tail);
                decoded.extend(decoder.finish());
                tail = decoded;
            }
            if !tail.is_empty() {
                entry.data.borrow_mut().extend_from_slice(&tail);
                if entry.utf8_data.is_some() {
                    if let Some(decoder) = entry.charset_decoder.as_mut() {
                        let transcoded = decoder.process(&tail);
                        entry
                            .utf8_data
                            .as_ref()
                            .unwrap()
                            .borrow_mut()
                            .extend_from_slice(&transcoded);
                    }
                }
                entry.flags -= EntryFlags::IS_EMPTY;
            }
            entry.data.borrow_mut().shrink_to_fit();
        }
        let alive = self.process_queue(url);
        if alive {
            let mut st = self.state.borrow_mut();
            if let Some(entry) = st.entries.get_mut(url) {
                if entry.flags.contains(EntryFlags::GOT_HEADER) {
                    // Release the reference taken when the head was parsed.
                    entry.unref_data();
                }
            }
        }
    }

    fn stream_abort(&self, url: &Url) {
        let victims: Vec<(ClientKey, Option<ClientCallback>, SharedBuf)> = {
            let mut st = self.state.borrow_mut();
            if !st.entries.contains_key(url) {
                return;
            }
            let mut victims = Vec::new();
            let mut kept = Vec::new();
            for client in st.clients.drain(..) {
                if client.url == *url {
                    victims.push((client.key, client.callback.clone()));
                } else {
                    kept.push(client);
                }
            }
            st.clients = kept;
            let buf = st
                .entries
                .get(url)
                .map(|e| e.client_data())
                .unwrap_or_default();
            victims
                .into_iter()
                .map(|(k, cb)| (k, cb, Rc::clone(&buf)))
                .collect()
        };
        for (key, callback, buf) in victims {
            if let Some(callback) = callback {
                let len = buf.borrow().len();
                callback(&ClientUpdate {
                    op: ClientOp::Abort,
                    key,
                    url: url.clone(),
                    buf,
                    len,
                });
            }
        }
        self.remove_by_url(url);
    }

    /// Applies the just-completed response head to the entry.
    fn apply_header(&self, url: &Url) {
        struct HeadInfo {
            status: Option<Status>,
            location: Option<String>,
            auth: Vec<String>,
            warnings: Vec<String>,
            transfer_encoding: Option<String>,
            content_length: Option<String>,
            content_encoding: Option<String>,
            content_type: Option<String>,
            cookies: Vec<String>,
            date: Option<String>,
            first_party: bool,
            entry_url: Url,
        }

        let info = {
            let st = self.state.borrow();
            let Some(entry) = st.entries.get(url) else {
                return;
            };
            let first_party = st
                .clients
                .iter()
                .filter(|c| c.url == entry.url)
                .any(|c| match &c.web.requester {
                    None => true,
                    Some(requester) => entry.url.same_organization(requester),
                });
            HeadInfo {
                status: entry.head.status(),
                location: entry.head.field("location"),
                auth: entry.head.fields("www-authenticate"),
                warnings: entry.head.fields("warning"),
                transfer_encoding: entry.head.field("transfer-encoding"),
                content_length: entry.head.field("content-length"),
                content_encoding: entry.head.field("content-encoding"),
                content_type: entry.head.field("content-type"),
                cookies: entry.head.fields("set-cookie"),
                date: entry.head.field("date"),
                first_party,
                entry_url: entry.url.clone(),
            }
        };

        if info.status == Some(Status::Continue) {
            log::debug!("cache: 100 Continue for {url}, waiting for the real head");
            let mut st = self.state.borrow_mut();
            if let Some(entry) = st.entries.get_mut(url) {
                entry.head.reset();
                entry.flags -= EntryFlags::GOT_HEADER;
            }
            return;
        }

        for warning in &info.warnings {
            log::warn!("cache: server warning for {url}: {warning}");
        }

        // Resolve the redirect target and consult the domain policy
        // before touching the entry again.
        let mut redirect: Option<(Url, bool)> = None;
        if info.status.is_some_and(Status::is_redirection) {
            if let Some(location) = &info.location {
                match Url::parse(location, Some(&info.entry_url)) {
                    Ok(target) => {
                        let helper_escalation = target.scheme() == "dpi"
                            && info.entry_url.scheme() != "dpi";
                        let permitted = !helper_escalation
                            && self.delegate.domain_permit(&info.entry_url, &target);
                        if !permitted {
                            log::warn!(
                                "cache: redirection not followed from {} to {}",
                                info.entry_url,
                                target
                            );
                        }
                        redirect = Some((target, permitted));
                    }
                    Err(err) => log::warn!("cache: unparseable Location for {url}: {err}"),
                }
            }
        }

        if !info.cookies.is_empty() {
            if info.first_party {
                self.delegate
                    .set_cookies(&info.cookies, &info.entry_url, info.date.as_deref());
            } else {
                log::debug!("cache: third-party cookies from {url} not considered");
            }
        }

        let mut st = self.state.borrow_mut();
        let huge_threshold = st.huge_threshold;
        let Some(entry) = st.entries.get_mut(url) else {
            return;
        };

        match info.status {
            Some(status) if status.is_redirection() => {
                if let Some((target, permitted)) = redirect {
                    entry.location = Some(target);
                    if permitted {
                        entry.flags |= EntryFlags::REDIRECT;
                        if status == Status::MovedPermanently {
                            entry.flags |= EntryFlags::FORCE_REDIRECT;
                        } else if status == Status::Found {
                            entry.flags |= EntryFlags::TEMP_REDIRECT;
                        }
                    }
                }
            }
            Some(Status::Unauthorized) => entry.auth = info.auth,
            Some(Status::NotFound) => entry.flags |= EntryFlags::NOT_FOUND,
            _ => {}
        }

        entry.transfer_decoder = transfer_decoder(info.transfer_encoding.as_deref());
        if let Some(length) = &info.content_length {
            let non_identity = info
                .transfer_encoding
                .as_deref()
                .is_some_and(|te| !te.eq_ignore_ascii_case("identity"));
            if non_identity {
                log::warn!(
                    "cache: Content-Length and non-identity Transfer-Encoding both present"
                );
            } else if let Ok(expected) = length.trim().parse::<u64>() {
                entry.flags |= EntryFlags::GOT_LENGTH;
                entry.expected_size = expected;
            }
        }
        entry.content_decoder = content_decoder(info.content_encoding.as_deref());

        if entry.expected_size > 0 {
            if entry.expected_size > huge_threshold {
                entry.flags |= EntryFlags::HUGE_FILE;
            }
            let reserve = (entry.expected_size as usize).min(MAX_INIT_BUF);
            entry.data.borrow_mut().reserve(reserve);
        }

        if let Some(ctype) = &info.content_type {
            // Not trusted yet: checked against real data when the type
            // settles in process_queue.
            entry.set_content_type(ctype, TypeSource::Http);
        }
        // The entry holds its own data reference for the transfer.
        entry.ref_data();
    }

    fn null_client(&self, web: &Web) -> ClientCallback {
        let delegate = Rc::clone(&self.delegate);
        let window = web.window;
        let root = web.flags.contains(WebFlags::ROOT_URL);
        Rc::new(move |update| {
            if update.op == ClientOp::Close && root {
                delegate.close_window_client(window, update.key);
            }
        })
    }

    fn dequeue_client(&self, key: ClientKey) {
        self.state.borrow_mut().clients.retain(|c| c.key != key);
    }

    /// Delivers available data to every client of `url`.
    ///
    /// Returns whether the entry still exists afterwards.
    fn process_queue(&self, url: &Url) -> bool {
        // Settle the content type first; nothing is delivered before it
        // is known.
        let type_mismatch = {
            let mut st = self.state.borrow_mut();
            let Some(entry) = st.entries.get_mut(url) else {
                return false;
            };
            if !entry.flags.contains(EntryFlags::GOT_HEADER) {
                return true;
            }
            if entry.flags.contains(EntryFlags::GOT_CONTENT_TYPE) {
                false
            } else {
                let (detected, certain) = {
                    let data = entry.data.borrow();
                    sniff::from_data(&data)
                };
                if !certain && !entry.flags.contains(EntryFlags::GOT_DATA) {
                    return true; // wait for more data
                }
                let mismatch =
                    !sniff::declared_type_matches(entry.type_header.as_deref(), detected);
                if mismatch {
                    log::warn!(
                        "cache: Content-Type {:?} does not match the real data at {url}",
                        entry.type_header
                    );
                }
                entry.type_detected = Some(detected.to_string());
                entry.flags |= EntryFlags::GOT_CONTENT_TYPE;
                mismatch
            }
        };

        {
            let mut st = self.state.borrow_mut();
            if st.busy {
                log::error!("cache: process_queue re-entered for {url}");
            }
            st.busy = true;
        }

        let client_keys: Vec<ClientKey> = {
            let st = self.state.borrow();
            st.clients
                .iter()
                .filter(|c| c.url == *url)
                .map(|c| c.key)
                .collect()
        };

        let mut abort_entry = false;
        let mut offer_download = false;
        let mut last_window = None;

        for key in client_keys {
            let snapshot = {
                let st = self.state.borrow();
                let entry = st.entries.get(url);
                let client = st.clients.iter().find(|c| c.key == key);
                match (entry, client) {
                    (Some(entry), Some(client)) => Some((
                        client.web.clone(),
                        client.callback.is_some(),
                        entry.flags,
                        entry.location.is_some(),
                        entry.expected_size,
                    )),
                    _ => None,
                }
            };
            let Some((web, mut has_callback, eflags, has_location, expected_size)) = snapshot
            else {
                continue;
            };
            let root = web.flags.contains(WebFlags::ROOT_URL);
            let window = web.window;
            last_window = Some(window);

            if root {
                if !eflags.contains(EntryFlags::MSG_ERASED) {
                    self.delegate.status_msg(window, "");
                    let mut st = self.state.borrow_mut();
                    if let Some(entry) = st.entries.get_mut(url) {
                        entry.flags |= EntryFlags::MSG_ERASED;
                    }
                }
                if type_mismatch {
                    let declared = {
                        let st = self.state.borrow();
                        st.entries
                            .get(url)
                            .and_then(|e| e.type_header.clone())
                            .unwrap_or_default()
                    };
                    self.delegate.status_msg(
                        window,
                        &format!(
                            "HTTP warning: Content-Type '{declared}' does not match the real data"
                        ),
                    );
                    offer_download = true;
                }
                if eflags.contains(EntryFlags::REDIRECT) {
                    if !has_callback {
                        let null = self.null_client(&web);
                        let mut st = self.state.borrow_mut();
                        if let Some(client) = st.clients.iter_mut().find(|c| c.key == key) {
                            client.callback = Some(null);
                        }
                        has_callback = true;
                        drop(st);
                        let level = self.delegate.redirect_level(window);
                        self.delegate.set_redirect_level(window, level + 1);
                    }
                } else {
                    self.delegate.set_redirect_level(window, 0);
                }
                if eflags.contains(EntryFlags::HUGE_FILE) {
                    self.delegate.status_msg(
                        window,
                        &format!("Huge file! ({} MB)", expected_size / (1024 * 1024)),
                    );
                    abort_entry = true;
                    offer_download = true;
                }
            } else if eflags.intersects(EntryFlags::REDIRECT | EntryFlags::NOT_FOUND)
                && !has_callback
            {
                // Non-root URLs ignore redirections and 404 answers.
                let null = self.null_client(&web);
                let mut st = self.state.borrow_mut();
                if let Some(client) = st.clients.iter_mut().find(|c| c.key == key) {
                    client.callback = Some(null);
                }
                has_callback = true;
            }

            if !has_callback {
                // Start from the silent sink; a viewer may replace it.
                {
                    let null = self.null_client(&web);
                    let mut st = self.state.borrow_mut();
                    if let Some(client) = st.clients.iter_mut().find(|c| c.key == key) {
                        client.callback = Some(null);
                    }
                }
                let suppressed = has_location && !eflags.contains(EntryFlags::REDIRECT);
                if !suppressed {
                    let mut client_abort = false;
                    if type_mismatch {
                        client_abort = true;
                    } else {
                        let ctype = {
                            let st = self.state.borrow();
                            st.entries
                                .get(url)
                                .and_then(|e| e.current_content_type().map(str::to_string))
                                .unwrap_or_else(|| "application/octet-stream".to_string())
                        };
                        match self.delegate.dispatch_by_type(&ctype, &web) {
                            Some(callback) => {
                                let mut st = self.state.borrow_mut();
                                if let Some(client) =
                                    st.clients.iter_mut().find(|c| c.key == key)
                                {
                                    client.callback = Some(callback);
                                }
                            }
                            None => {
                                if root {
                                    log::warn!("cache: Content-Type {ctype:?} not viewable");
                                    client_abort = true;
                                    offer_download = true;
                                }
                                // Non-root: keep the silent sink; aborting
                                // would reopen connections for the same
                                // resource elsewhere.
                            }
                        }
                    }
                    if client_abort {
                        abort_entry = true;
                        if root {
                            self.delegate.cancel_expect_if_eq(window, url);
                        }
                        self.delegate.remove_window_client(window, key);
                        self.dequeue_client(key);
                        continue;
                    }
                }
            }

            // Deliver what we have.
            let delivery = {
                let st = self.state.borrow();
                let entry = st.entries.get(url);
                let client = st.clients.iter().find(|c| c.key == key);
                match (entry, client) {
                    (Some(entry), Some(client)) => client.callback.clone().map(|cb| {
                        let buf = if web.flags.contains(WebFlags::DOWNLOAD) {
                            // Downloads get the original bytes, never the
                            // transcoded buffer.
                            Rc::clone(&entry.data)
                        } else {
                            entry.client_data()
                        };
                        let len = buf.borrow().len();
                        (cb, buf, len, entry.flags, entry.data.borrow().len())
                    }),
                    _ => None,
                }
            };
            let Some((callback, buf, len, eflags, raw_len)) = delivery else {
                continue;
            };
            if len > 0 {
                callback(&ClientUpdate {
                    op: ClientOp::Send,
                    key,
                    url: url.clone(),
                    buf: Rc::clone(&buf),
                    len,
                });
                if root {
                    self.delegate.page_progress(window, raw_len, false);
                }
            }

            if eflags.contains(EntryFlags::GOT_DATA) {
                let blocked_redirection = root
                    && !eflags.contains(EntryFlags::REDIRECT)
                    && self
                        .state
                        .borrow()
                        .entries
                        .get(url)
                        .is_some_and(|e| e.location.is_some());
                if blocked_redirection {
                    self.deliver_blocked_redirection_page(url, key, &web);
                }
                // The blocked-redirection page may have swapped the
                // callback; the close must reach the current one.
                let close_callback = {
                    let st = self.state.borrow();
                    st.clients
                        .iter()
                        .find(|c| c.key == key)
                        .and_then(|c| c.callback.clone())
                        .unwrap_or(callback)
                };
                close_callback(&ClientUpdate {
                    op: ClientOp::Close,
                    key,
                    url: url.clone(),
                    buf,
                    len,
                });
                if root {
                    self.delegate.page_progress(window, 0, true);
                }
                self.dequeue_client(key);
                // One redirect action per entry per root client, at
                // dequeue time.
                if eflags.contains(EntryFlags::REDIRECT) {
                    self.redirect_action(url, &web);
                }
            }
        }

        self.state.borrow_mut().busy = false;

        if abort_entry {
            let url = url.clone();
            self.delegate.conn_abort_by_url(&url);
            self.remove_by_url(&url);
            if offer_download && download_enabled(&url) {
                if let Some(window) = last_window {
                    self.delegate.offer_save_link(window, &url);
                }
            }
            return false;
        }

        let auth = {
            let mut st = self.state.borrow_mut();
            st.entries.get_mut(url).and_then(|entry| {
                if !entry.auth.is_empty() && entry.flags.contains(EntryFlags::GOT_DATA) {
                    Some(std::mem::take(&mut entry.auth))
                } else {
                    None
                }
            })
        };
        if let Some(challenges) = auth {
            if let Some(window) = last_window {
                self.delegate.prompt_auth(window, challenges, url.clone());
            }
        }
        true
    }

    /// Tells a root client why its page is not being followed elsewhere.
    fn deliver_blocked_redirection_page(&self, url: &Url, key: ClientKey, web: &Web) {
        let location = {
            let st = self.state.borrow();
            st.entries.get(url).and_then(|e| e.location.clone())
        };
        let Some(location) = location else { return };
        let Some(callback) = self.delegate.dispatch_by_type("text/html", web) else {
            return;
        };
        let page = format!(
            "<!doctype html><html><body>Larkspur blocked a redirection attempt \
             from <a href=\"{url}\">{url}</a> to <a href=\"{location}\">{location}</a> \
             based on your domain settings.</body></html>"
        );
        let buf: SharedBuf = Rc::new(RefCell::new(page.into_bytes()));
        let len = buf.borrow().len();
        {
            let mut st = self.state.borrow_mut();
            if let Some(client) = st.clients.iter_mut().find(|c| c.key == key) {
                client.callback = Some(Rc::clone(&callback));
            }
        }
        callback(&ClientUpdate {
            op: ClientOp::Send,
            key,
            url: url.clone(),
            buf,
            len,
        });
    }

    /// The redirect handler, run once per entry per root client.
    fn redirect_action(&self, url: &Url, web: &Web) {
        let info = {
            let st = self.state.borrow();
            st.entries
                .get(url)
                .map(|e| (e.flags, e.location.clone(), e.url.clone(), e.data.borrow().len()))
        };
        let Some((flags, location, entry_url, data_len)) = info else {
            return;
        };
        let window = web.window;

        if entry_url.flags().contains(UrlFlags::SPAM_SAFE) {
            self.delegate
                .status_msg(window, "WARNING: local URL with redirection. Aborting.");
            return;
        }

        let mut flags = flags;
        if self.delegate.redirect_level(window) >= 5 {
            let mut st = self.state.borrow_mut();
            if let Some(entry) = st.entries.get_mut(url) {
                entry.flags |= EntryFlags::REDIRECT_LOOP;
                flags = entry.flags;
            }
        }
        if flags.contains(EntryFlags::REDIRECT_LOOP) {
            self.delegate
                .status_msg(window, &format!("ERROR: redirect loop for: {entry_url}"));
            self.delegate.set_redirect_level(window, 0);
            return;
        }

        let followable = flags.contains(EntryFlags::REDIRECT)
            && location.is_some()
            && (flags.intersects(EntryFlags::FORCE_REDIRECT | EntryFlags::TEMP_REDIRECT)
                || data_len < SMALL_REDIRECT_BODY);
        if !followable {
            return;
        }
        if web.flags.contains(WebFlags::ROOT_URL) {
            let mut target = location.unwrap();
            if flags.contains(EntryFlags::TEMP_REDIRECT) {
                // A temporary redirect must not be satisfied from cache
                // next time around.
                target.add_flags(UrlFlags::E2E_RELOAD);
            }
            self.delegate.redirect(window, target, &entry_url);
        } else if data_len == 0 {
            log::debug!("cache: sub-entity redirection without content at {url}");
        } else {
            log::debug!("cache: sub-entity redirection with content at {url}");
        }
    }

    /// Pre-fills a complete entry, for `about:` pages. Never evicted.
    pub fn inject(&self, url: &Url, body: &[u8]) {
        let mut st = self.state.borrow_mut();
        let entry = st
            .entries
            .entry(url.clone())
            .or_insert_with(|| CacheEntry::new(url.clone()));
        entry.flags |= EntryFlags::GOT_DATA
            | EntryFlags::GOT_HEADER
            | EntryFlags::GOT_LENGTH
            | EntryFlags::GOT_CONTENT_TYPE
            | EntryFlags::INTERNAL_URL;
        if !body.is_empty() {
            entry.flags -= EntryFlags::IS_EMPTY;
        }
        entry.type_detected = Some(
            sniff::from_data(body).0.to_string(),
        );
        let mut data = entry.data.borrow_mut();
        data.clear();
        data.extend_from_slice(body);
        drop(data);
        entry.expected_size = body.len() as u64;
        entry.transfer_size = body.len() as u64;
    }

    /// Removes the entry for `url` and dequeues all its clients.
    /// Internal entries stay.
    pub fn remove_by_url(&self, url: &Url) {
        let mut st = self.state.borrow_mut();
        match st.entries.get(url) {
            None => return,
            Some(entry) if entry.flags.contains(EntryFlags::INTERNAL_URL) => return,
            Some(_) => {}
        }
        st.clients.retain(|c| c.url != *url);
        st.delayed.retain(|u| u != url);
        st.entries.remove(url);
    }

    /// Entry flags for `url`, if cached.
    pub fn get_flags(&self, url: &Url) -> Option<EntryFlags> {
        self.state.borrow().entries.get(url).map(|e| e.flags)
    }

    /// Entry flags for `url`, following redirections.
    pub fn get_flags_following_redirects(&self, url: &Url) -> Option<EntryFlags> {
        let final_url = self.resolve_redirects(url)?;
        self.get_flags(&final_url)
    }

    /// The content type in effect for `url`, following redirections.
    pub fn get_content_type(&self, url: &Url) -> Option<String> {
        let final_url = self.resolve_redirects(url)?;
        self.state
            .borrow()
            .entries
            .get(&final_url)
            .and_then(|e| e.current_content_type().map(str::to_string))
    }

    /// Follows the redirect chain from `url`, at most three hops, and
    /// stopping at a flagged loop.
    fn resolve_redirects(&self, url: &Url) -> Option<Url> {
        let st = self.state.borrow();
        let mut current = url.clone();
        for hop in 0.. {
            let entry = st.entries.get(&current)?;
            if entry.flags.contains(EntryFlags::REDIRECT_LOOP) || hop == 3 {
                log::warn!("cache: redirect loop resolving {url}");
                return Some(current);
            }
            match (&entry.location, entry.flags.contains(EntryFlags::REDIRECT)) {
                (Some(location), true) => current = location.clone(),
                _ => return Some(current),
            }
        }
        unreachable!()
    }

    /// Takes a reference on the entry's data and returns the live buffer
    /// and its current length. Release with [`Cache::unref_buf`].
    pub fn get_buf(&self, url: &Url) -> Option<(SharedBuf, usize)> {
        let final_url = self.resolve_redirects(url)?;
        let mut st = self.state.borrow_mut();
        let entry = st.entries.get_mut(&final_url)?;
        entry.ref_data();
        let buf = entry.client_data();
        let len = buf.borrow().len();
        Some((buf, len))
    }

    /// Releases a reference taken by [`Cache::get_buf`].
    pub fn unref_buf(&self, url: &Url) {
        let Some(final_url) = self.resolve_redirects(url) else {
            return;
        };
        let mut st = self.state.borrow_mut();
        if let Some(entry) = st.entries.get_mut(&final_url) {
            entry.unref_data();
        }
    }

    /// Declares a content type for `url` from the given source. Returns
    /// the type now in effect.
    pub fn set_content_type(&self, url: &Url, ctype: &str, source: TypeSource) -> Option<String> {
        let mut st = self.state.borrow_mut();
        let entry = st.entries.get_mut(url)?;
        entry.set_content_type(ctype, source)
    }

    /// The client with `key`, when it is the *only* client of its entry.
    /// Used to decide whether stopping it should abort the transport.
    pub fn client_if_unique(&self, key: ClientKey) -> Option<Url> {
        let st = self.state.borrow();
        let client = st.clients.iter().find(|c| c.key == key)?;
        let siblings = st.clients.iter().filter(|c| c.url == client.url).count();
        (siblings == 1).then(|| client.url.clone())
    }

    /// Dequeues one client without any further callback.
    pub fn stop_client(&self, key: ClientKey) {
        let mut st = self.state.borrow_mut();
        let Some(pos) = st.clients.iter().position(|c| c.key == key) else {
            log::debug!("cache: stop_client on nonexistent client {key}");
            return;
        };
        let url = st.clients[pos].url.clone();
        st.clients.remove(pos);
        st.delayed.retain(|u| u != &url);
    }

    /// Number of queued clients, across all entries.
    pub fn client_count(&self) -> usize {
        self.state.borrow().clients.len()
    }

    /// Number of cache entries.
    pub fn entry_count(&self) -> usize {
        self.state.borrow().entries.len()
    }
}

/// Whether `url`'s scheme supports saving to a file.
pub fn download_enabled(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https" | "ftp")
}
