//! End-to-end cache behavior against a recording delegate.

use larkspur_cache::{
    Cache, CacheDelegate, ClientCallback, ClientKey, ClientOp, ClientUpdate, StreamOp, TypeSource,
    Web, WebFlags, WindowId,
};
use larkspur_http::{Url, UrlFlags};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Records every delegate interaction and plays the part of the viewer
/// dispatcher: every client gets a callback that logs its deliveries.
#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<String>>,
    deliveries: RefCell<HashMap<u32, Vec<String>>>,
    redirect_levels: RefCell<HashMap<WindowId, u32>>,
    viewable: RefCell<bool>,
    self_weak: RefCell<Weak<Recorder>>,
}

impl Recorder {
    fn new() -> Rc<Self> {
        let rc = Rc::new(Self {
            viewable: RefCell::new(true),
            ..Self::default()
        });
        *rc.self_weak.borrow_mut() = Rc::downgrade(&rc);
        rc
    }

    fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    fn deliveries_for(&self, key: ClientKey) -> Vec<String> {
        self.deliveries
            .borrow()
            .get(&key.0)
            .cloned()
            .unwrap_or_default()
    }
}

impl CacheDelegate for Recorder {
    fn status_msg(&self, _window: WindowId, msg: &str) {
        if !msg.is_empty() {
            self.push(format!("msg:{msg}"));
        }
    }

    fn redirect(&self, _window: WindowId, to: Url, from: &Url) {
        let e2e = to.flags().contains(UrlFlags::E2E_RELOAD);
        self.push(format!("redirect:{from}->{to} e2e={e2e}"));
    }

    fn redirect_level(&self, window: WindowId) -> u32 {
        *self.redirect_levels.borrow().get(&window).unwrap_or(&0)
    }

    fn set_redirect_level(&self, window: WindowId, level: u32) {
        self.redirect_levels.borrow_mut().insert(window, level);
    }

    fn dispatch_by_type(&self, ctype: &str, web: &Web) -> Option<ClientCallback> {
        if !*self.viewable.borrow() {
            return None;
        }
        self.push(format!("dispatch:{ctype}"));
        let recorder = self.self_weak.borrow().upgrade().expect("recorder alive");
        let _ = web;
        Some(Rc::new(move |update: &ClientUpdate| {
            let text = match update.op {
                ClientOp::Send => {
                    let buf = update.buf.borrow();
                    format!("send:{}", String::from_utf8_lossy(&buf[..update.len]))
                }
                ClientOp::Close => "close".to_string(),
                ClientOp::Abort => "abort".to_string(),
            };
            recorder
                .deliveries
                .borrow_mut()
                .entry(update.key.0)
                .or_default()
                .push(text);
        }))
    }

    fn set_cookies(&self, lines: &[String], url: &Url, _server_date: Option<&str>) {
        self.push(format!("cookies:{}:{}", url.host().unwrap_or(""), lines.join("|")));
    }

    fn conn_abort_by_url(&self, url: &Url) {
        self.push(format!("conn_abort:{url}"));
    }

    fn offer_save_link(&self, _window: WindowId, url: &Url) {
        self.push(format!("save_link:{url}"));
    }

    fn prompt_auth(&self, _window: WindowId, challenges: Vec<String>, url: Url) {
        self.push(format!("auth:{url}:{}", challenges.join("|")));
    }

    fn schedule_delayed_dispatch(&self) {
        self.push("schedule_delayed".to_string());
    }
}

fn url(s: &str) -> Url {
    Url::parse(s, None).unwrap()
}

fn root_web(u: &Url) -> Web {
    Web::new(u.clone(), None, 1).with_flags(WebFlags::ROOT_URL)
}

fn cache_with(recorder: &Rc<Recorder>) -> Cache {
    Cache::new(Rc::clone(recorder) as Rc<dyn CacheDelegate>)
}

#[test]
fn plain_get_delivers_one_send_then_close() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://example.test/a");
    let key = cache.open(root_web(&u), None);

    cache.process_stream(
        &u,
        StreamOp::Data(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 11\r\n\r\n<html>hello",
        ),
    );
    // "<html" is an HTML marker, so the type settles before close.
    cache.process_stream(&u, StreamOp::Close);

    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.get_content_type(&u).unwrap(), "text/html");
    let deliveries = recorder.deliveries_for(key);
    assert_eq!(deliveries.last().unwrap(), "close");
    assert!(deliveries.iter().any(|d| d.starts_with("send:")));
    assert_eq!(cache.client_count(), 0);
}

#[test]
fn scenario_plain_get_sizes() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://example.test/a");
    let _key = cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello"),
    );
    cache.process_stream(&u, StreamOp::Close);
    // transfer_size counts body bytes as they arrived.
    let flags = cache.get_flags(&u).unwrap();
    assert!(flags.contains(larkspur_cache::EntryFlags::GOT_DATA));
    assert!(flags.contains(larkspur_cache::EntryFlags::GOT_LENGTH));
}

#[test]
fn concurrent_opens_share_one_entry() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://example.test/shared");
    let k1 = cache.open(root_web(&u), None);
    let k2 = cache.open(Web::new(u.clone(), None, 1), None);
    assert_ne!(k1, k2);
    // Still a single entry: the transport would be started at most once.
    assert_eq!(cache.entry_count(), 1);
    assert_eq!(cache.client_count(), 2);
}

#[test]
fn cache_hit_schedules_delayed_dispatch() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://example.test/page");
    let _k1 = cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>cached"),
    );
    cache.process_stream(&u, StreamOp::Close);

    // A later open of the same URL is served from the entry.
    let k2 = cache.open(root_web(&u), None);
    assert!(recorder.events().contains(&"schedule_delayed".to_string()));
    assert!(cache.has_delayed());
    cache.process_delayed();
    let deliveries = recorder.deliveries_for(k2);
    assert_eq!(deliveries, vec!["send:<html>cached".to_string(), "close".to_string()]);
    assert!(!cache.has_delayed());
}

#[test]
fn e2e_reload_evicts_existing_entry() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let plain = url("http://example.test/page");
    cache.open(root_web(&plain), None);
    cache.process_stream(&plain, StreamOp::Data(b"HTTP/1.1 200 OK\r\n\r\n<html>old"));
    cache.process_stream(&plain, StreamOp::Close);
    assert_eq!(cache.entry_count(), 1);

    let reload = plain.clone().with_flags(UrlFlags::E2E_RELOAD);
    cache.open(Web::new(reload.clone(), None, 1).with_flags(WebFlags::ROOT_URL), None);
    let flags = cache.get_flags(&plain).unwrap();
    assert!(!flags.contains(larkspur_cache::EntryFlags::GOT_DATA));
}

#[test]
fn chunked_body_decodes_without_length_warning() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://example.test/chunked");
    let key = cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n",
        ),
    );
    cache.process_stream(&u, StreamOp::Data(b"5\r\nhello\r\n0\r\n\r\n"));
    cache.process_stream(&u, StreamOp::Close);

    let flags = cache.get_flags(&u).unwrap();
    assert!(flags.contains(larkspur_cache::EntryFlags::GOT_DATA));
    let deliveries = recorder.deliveries_for(key);
    assert_eq!(
        deliveries,
        vec!["send:hello".to_string(), "close".to_string()]
    );
}

#[test]
fn temp_redirect_flags_and_navigation() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://a.test/");
    let _key = cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 302 Found\r\nLocation: http://b.test/\r\n\r\n"),
    );
    cache.process_stream(&u, StreamOp::Close);

    let flags = cache.get_flags(&u).unwrap();
    assert!(flags.contains(larkspur_cache::EntryFlags::REDIRECT));
    assert!(flags.contains(larkspur_cache::EntryFlags::TEMP_REDIRECT));
    // The navigation request carries the cache-bypass flag for a 302.
    assert!(recorder
        .events()
        .contains(&"redirect:http://a.test/->http://b.test/ e2e=true".to_string()));
}

#[test]
fn redirect_loop_detection_stops_navigation() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    recorder.redirect_levels.borrow_mut().insert(1, 5);

    let u = url("http://loop.test/");
    cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 302 Found\r\nLocation: http://loop.test/\r\n\r\n"),
    );
    cache.process_stream(&u, StreamOp::Close);

    let flags = cache.get_flags(&u).unwrap();
    assert!(flags.contains(larkspur_cache::EntryFlags::REDIRECT_LOOP));
    assert!(recorder
        .events()
        .iter()
        .any(|e| e.starts_with("msg:ERROR: redirect loop")));
    assert!(!recorder.events().iter().any(|e| e.starts_with("redirect:")));
}

#[test]
fn first_party_cookies_are_offered_third_party_are_not() {
    // Third party: requester from another organization.
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://a.test/p");
    let requester = url("http://b.test/q");
    cache.open(
        Web::new(u.clone(), Some(requester), 1).with_flags(WebFlags::IMAGE),
        None,
    );
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nSet-Cookie: id=42\r\nContent-Type: text/plain\r\n\r\nx"),
    );
    cache.process_stream(&u, StreamOp::Close);
    assert!(!recorder.events().iter().any(|e| e.starts_with("cookies:")));

    // First party: same organization.
    let recorder2 = Recorder::new();
    let cache2 = cache_with(&recorder2);
    let u2 = url("http://a.test/p");
    let requester2 = url("http://www.a.test/q");
    cache2.open(Web::new(u2.clone(), Some(requester2), 1), None);
    cache2.process_stream(
        &u2,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nSet-Cookie: id=42\r\nContent-Type: text/plain\r\n\r\nx"),
    );
    cache2.process_stream(&u2, StreamOp::Close);
    assert!(recorder2
        .events()
        .contains(&"cookies:a.test:id=42".to_string()));
}

#[test]
fn unauthorized_prompts_after_body() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://secure.test/");
    cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"lab\"\r\nContent-Type: text/html\r\n\r\n<html>denied",
        ),
    );
    cache.process_stream(&u, StreamOp::Close);
    assert!(recorder
        .events()
        .contains(&"auth:http://secure.test/:Basic realm=\"lab\"".to_string()));
}

#[test]
fn huge_file_aborts_root_and_offers_download() {
    let recorder = Recorder::new();
    let cache = Cache::with_huge_threshold(Rc::clone(&recorder) as Rc<dyn CacheDelegate>, 1024);
    let u = url("http://big.test/file");
    cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 1000000\r\n\r\nsome text to get the type settled and then some, padding up to enough bytes for certainty... some text to get the type settled and then some, padding up to enough bytes for certainty... some text to get the type settled and then some, padding up to enough bytes"),
    );
    let events = recorder.events();
    assert!(events.iter().any(|e| e.starts_with("msg:Huge file!")));
    assert!(events.contains(&"conn_abort:http://big.test/file".to_string()));
    assert!(events.contains(&"save_link:http://big.test/file".to_string()));
    assert_eq!(cache.entry_count(), 0);
}

#[test]
fn transport_abort_reaches_clients_and_removes_entry() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://gone.test/");
    let key = cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>par"),
    );
    cache.process_stream(&u, StreamOp::Abort);
    let deliveries = recorder.deliveries_for(key);
    assert_eq!(deliveries.last().unwrap(), "abort");
    assert_eq!(cache.entry_count(), 0);
    assert_eq!(cache.client_count(), 0);
}

#[test]
fn meta_charset_reinitializes_decoder_and_utf8_buffer() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://latin.test/");
    cache.open(root_web(&u), None);
    cache.process_stream(
        &u,
        StreamOp::Data(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n<html>caf\xe9"),
    );
    cache.process_stream(&u, StreamOp::Close);

    // META declares latin-1 after the fact (repush path).
    let now = cache
        .set_content_type(&u, "text/html; charset=ISO-8859-1", TypeSource::Meta)
        .unwrap();
    assert_eq!(now, "text/html; charset=ISO-8859-1");

    let (buf, len) = cache.get_buf(&u).unwrap();
    let text = String::from_utf8_lossy(&buf.borrow()[..len]).to_string();
    assert_eq!(text, "<html>café");
    cache.unref_buf(&u);

    // With the reference released the transcoded buffer is gone; the raw
    // bytes are untouched.
    let (raw, raw_len) = cache.get_buf(&u).unwrap();
    assert_eq!(raw_len, "<html>café".len());
    let _ = raw;
    cache.unref_buf(&u);
}

#[test]
fn meta_does_not_override_existing_meta() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://meta.test/");
    cache.open(root_web(&u), None);
    cache.process_stream(&u, StreamOp::Data(b"HTTP/1.1 200 OK\r\n\r\n<html>x"));
    cache.process_stream(&u, StreamOp::Close);

    cache.set_content_type(&u, "text/html; charset=ISO-8859-1", TypeSource::Meta);
    let after = cache
        .set_content_type(&u, "text/html; charset=KOI8-R", TypeSource::Meta)
        .unwrap();
    assert_eq!(after, "text/html; charset=ISO-8859-1");
}

#[test]
fn injected_pages_are_internal_and_not_evicted() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("about:splash");
    cache.inject(&u, b"<html>welcome</html>");
    assert!(cache
        .get_flags(&u)
        .unwrap()
        .contains(larkspur_cache::EntryFlags::INTERNAL_URL));
    cache.remove_by_url(&u);
    assert_eq!(cache.entry_count(), 1);

    let key = cache.open(root_web(&u), None);
    cache.process_delayed();
    let deliveries = recorder.deliveries_for(key);
    assert_eq!(
        deliveries,
        vec!["send:<html>welcome</html>".to_string(), "close".to_string()]
    );
}

#[test]
fn non_viewable_root_type_offers_download() {
    let recorder = Recorder::new();
    *recorder.viewable.borrow_mut() = false;
    let cache = cache_with(&recorder);
    let u = url("http://blob.test/x.bin");
    cache.open(root_web(&u), None);
    let mut body = b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\r\n".to_vec();
    body.extend(std::iter::repeat(0u8).take(300));
    cache.process_stream(&u, StreamOp::Data(&body));
    let events = recorder.events();
    assert!(events.contains(&"conn_abort:http://blob.test/x.bin".to_string()));
    assert!(events.contains(&"save_link:http://blob.test/x.bin".to_string()));
}

#[test]
fn stop_client_leaves_siblings_alone() {
    let recorder = Recorder::new();
    let cache = cache_with(&recorder);
    let u = url("http://multi.test/");
    let k1 = cache.open(root_web(&u), None);
    let k2 = cache.open(Web::new(u.clone(), None, 1), None);
    assert_eq!(cache.client_if_unique(k1), None);
    cache.stop_client(k1);
    assert_eq!(cache.client_count(), 1);
    assert_eq!(cache.client_if_unique(k2).unwrap(), u);
}
