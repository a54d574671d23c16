/*!
The broker: single entry point for everything that wants a URL.

For each request the broker decides whether the cache alone can serve
it, whether to open a native HTTP connection, or whether to hand the
scheme to the helper daemon; it tracks live connections by URL so a
fetch can be aborted in both directions, and it serializes connection
startup beyond a configurable ceiling.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

use larkspur_cache::{Cache, ClientCallback, ClientKey, EntryFlags, StreamOp, Web, WebFlags,
    WindowId};
use larkspur_chain::{ChainEvent, ChainLink, ChainOp, Key, Registry};
use larkspur_http::Url;
use larkspur_io::EventLoop;
use larkspur_transport::{helper_server_for, FetchMsg, HelperBackend, HelperEvent, HttpBackend};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::rc::Rc;

/// Default ceiling on simultaneously active connections.
pub const DEFAULT_MAX_CONNS: usize = 6;

/// Window-facing surface of the broker.
pub trait BrokerDelegate {
    /// Shows `msg` in the window's status area.
    fn status_msg(&self, _window: WindowId, _msg: &str) {}

    /// A helper daemon side-channel message arrived.
    fn helper_event(&self, _window: WindowId, _event: HelperEvent) {}

    /// Saves an already-cached URL straight to a file.
    fn save_from_cache(&self, _url: &Url, _filename: Option<&Path>) {}
}

struct Conn {
    url: Url,
    link: ChainLink<FetchMsg>,
}

struct Pending {
    url: Url,
    requester: Option<Url>,
    window: WindowId,
}

struct State {
    conns: Registry<Conn>,
    pending: VecDeque<Pending>,
    max_conns: usize,
}

/// The dispatch broker. Clones share connection state.
#[derive(Clone)]
pub struct Broker {
    el: EventLoop,
    cache: Cache,
    http: HttpBackend,
    helper: HelperBackend,
    delegate: Rc<dyn BrokerDelegate>,
    state: Rc<RefCell<State>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Broker")
            .field("active_conns", &st.conns.len())
            .field("pending", &st.pending.len())
            .finish()
    }
}

impl Broker {
    /// Creates a broker over the given backends.
    pub fn new(
        el: EventLoop,
        cache: Cache,
        http: HttpBackend,
        helper: HelperBackend,
        delegate: Rc<dyn BrokerDelegate>,
    ) -> Self {
        Self {
            el,
            cache,
            http,
            helper,
            delegate,
            state: Rc::new(RefCell::new(State {
                conns: Registry::new(),
                pending: VecDeque::new(),
                max_conns: DEFAULT_MAX_CONNS,
            })),
        }
    }

    /// Adjusts the simultaneous-connection ceiling.
    pub fn set_max_conns(&self, max_conns: usize) {
        self.state.borrow_mut().max_conns = max_conns.max(1);
    }

    /// Number of live transport connections.
    pub fn active_conns(&self) -> usize {
        self.state.borrow().conns.len()
    }

    /// Opens `web.url` on behalf of a consumer.
    ///
    /// Returns the cache client key, or `None` when the request was
    /// refused or fully handed off (downloads).
    pub fn open_url(&self, web: Web, callback: Option<ClientCallback>) -> Option<ClientKey> {
        let url = web.url.clone();

        if web.flags.contains(WebFlags::DOWNLOAD) {
            return self.open_download(web);
        }

        let helper_server = helper_server_for(&url);
        if let Some(server) = helper_server {
            if !self.helper_request_allowed(&web) {
                log::warn!("broker: refusing helper request for {url} from untrusted page");
                return None;
            }
            let key = self.cache.open(web.clone(), callback);
            if self.needs_fetch(&url) {
                self.start_helper_fetch(&url, web.window, &server);
            }
            return Some(key);
        }

        match url.scheme() {
            "http" => {
                let key = self.cache.open(web.clone(), callback);
                if self.needs_fetch(&url) {
                    self.start_or_queue_http(&url, web.requester.clone(), web.window);
                }
                Some(key)
            }
            "about" => {
                // Served from pre-injected cache entries.
                Some(self.cache.open(web, callback))
            }
            other => {
                log::warn!("broker: unsupported scheme {other:?} for {url}");
                self.delegate
                    .status_msg(web.window, &format!("Cannot handle {other}: URLs"));
                None
            }
        }
    }

    fn open_download(&self, web: Web) -> Option<ClientKey> {
        let url = &web.url;
        let flags = self.cache.get_flags_following_redirects(url);
        if flags.is_some_and(|f| f.contains(EntryFlags::GOT_DATA)) {
            self.delegate.save_from_cache(url, web.filename.as_deref());
            return None;
        }
        if larkspur_cache::download_enabled(url) {
            let helper = self.helper.clone();
            let url = url.clone();
            let destination = web
                .filename
                .unwrap_or_else(|| std::path::PathBuf::from(url.path()));
            self.el
                .spawn(async move {
                    if let Err(err) = helper.download(&url, &destination).await {
                        log::warn!("broker: download of {url} failed: {err}");
                    }
                })
                .detach();
        } else {
            log::warn!("broker: scheme of {url} is not downloadable");
        }
        None
    }

    /// Helper commands are a privilege: only the user, or pages that a
    /// helper served, may issue them. A crafted remote link must not.
    fn helper_request_allowed(&self, web: &Web) -> bool {
        match &web.requester {
            None => true,
            Some(requester) => helper_server_for(requester).is_some(),
        }
    }

    /// Whether the cache entry still needs transport bytes and no
    /// connection is already running for this URL.
    fn needs_fetch(&self, url: &Url) -> bool {
        let has_header = self
            .cache
            .get_flags(url)
            .is_some_and(|f| f.contains(EntryFlags::GOT_HEADER));
        if has_header {
            return false;
        }
        let st = self.state.borrow();
        !st.conns.iter().any(|(_, conn)| conn.url == *url)
            && !st.pending.iter().any(|p| p.url == *url)
    }

    fn sink_into_cache(&self, url: &Url, window: WindowId) -> Rc<dyn Fn(ChainEvent<FetchMsg>)> {
        let broker = self.clone();
        let url = url.clone();
        Rc::new(move |event: ChainEvent<FetchMsg>| {
            match event.op {
                ChainOp::Start => {
                    if let Some(FetchMsg::Status(msg)) = &event.data {
                        broker.delegate.status_msg(window, msg);
                    }
                }
                ChainOp::Send => match &event.data {
                    Some(FetchMsg::Bytes(bytes)) => {
                        broker.cache.process_stream(&url, StreamOp::Data(bytes));
                    }
                    Some(FetchMsg::Status(msg)) => broker.delegate.status_msg(window, msg),
                    None => {}
                },
                ChainOp::End => {
                    broker.cache.process_stream(&url, StreamOp::Close);
                    broker.retire_conn(&url);
                }
                ChainOp::Abort => {
                    if let Some(FetchMsg::Status(msg)) = &event.data {
                        broker.delegate.status_msg(window, msg);
                    }
                    broker.cache.process_stream(&url, StreamOp::Abort);
                    broker.retire_conn(&url);
                }
                ChainOp::Stop => {}
            }
        })
    }

    fn start_or_queue_http(&self, url: &Url, requester: Option<Url>, window: WindowId) {
        {
            let mut st = self.state.borrow_mut();
            if st.conns.len() >= st.max_conns {
                log::debug!("broker: queueing connection for {url}");
                st.pending.push_back(Pending {
                    url: url.clone(),
                    requester,
                    window,
                });
                return;
            }
        }
        self.start_http_fetch(url, requester.as_ref(), window);
    }

    fn start_http_fetch(&self, url: &Url, requester: Option<&Url>, window: WindowId) {
        let sink = self.sink_into_cache(url, window);
        let link = self.http.start(url, requester, sink);
        self.track_conn(url, link);
    }

    fn start_helper_fetch(&self, url: &Url, window: WindowId, server: &str) {
        log::debug!("broker: dispatching {url} to helper server {server:?}");
        let sink = self.sink_into_cache(url, window);
        let delegate = Rc::clone(&self.delegate);
        let events = Rc::new(move |event: HelperEvent| {
            delegate.helper_event(window, event);
        });
        let link = self.helper.start(url, events, sink);
        self.track_conn(url, link);
    }

    fn track_conn(&self, url: &Url, link: ChainLink<FetchMsg>) -> Key {
        self.state.borrow_mut().conns.insert(Conn {
            url: url.clone(),
            link,
        })
    }

    /// Drops the connection record for `url` and resumes a queued one.
    fn retire_conn(&self, url: &Url) {
        let next = {
            let mut st = self.state.borrow_mut();
            let keys: Vec<Key> = st
                .conns
                .iter()
                .filter(|(_, conn)| conn.url == *url)
                .map(|(key, _)| key)
                .collect();
            for key in keys {
                st.conns.remove(key);
            }
            if st.conns.len() < st.max_conns {
                st.pending.pop_front()
            } else {
                None
            }
        };
        if let Some(pending) = next {
            self.start_http_fetch(&pending.url, pending.requester.as_ref(), pending.window);
        }
    }

    /// Aborts the transport side of any in-flight fetch of `url`.
    /// The cache and its clients are left alone.
    pub fn abort_conns(&self, url: &Url) {
        let links: Vec<ChainLink<FetchMsg>> = {
            let mut st = self.state.borrow_mut();
            let keys: Vec<Key> = st
                .conns
                .iter()
                .filter(|(_, conn)| conn.url == *url)
                .map(|(key, _)| key)
                .collect();
            keys.iter()
                .filter_map(|key| st.conns.remove(*key))
                .map(|conn| conn.link)
                .collect()
        };
        for link in links {
            link.send_backward(ChainOp::Abort, None);
        }
    }

    /// Aborts `url` outright: transport backward, clients forward.
    pub fn abort_url(&self, url: &Url) {
        self.abort_conns(url);
        self.cache.process_stream(url, StreamOp::Abort);
    }

    /// Stops one cache client; when it was the last client of its entry
    /// the backing transport is aborted too.
    pub fn stop_client(&self, key: ClientKey) {
        if let Some(url) = self.cache.client_if_unique(key) {
            self.abort_conns(&url);
        }
        self.cache.stop_client(key);
    }

    /// The cache this broker feeds.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }
}
