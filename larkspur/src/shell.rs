//! The shell: glue between the cache, the broker, the navigators and
//! the (external) windowing toolkit.
//!
//! Every "globals" concern the subsystems need — windows, cookies,
//! viewers, the event loop — lives here, threaded through the delegate
//! traits, so the subsystem crates stay acyclic and ambient-state free.

use crate::viewers::ViewerRegistry;
use crate::window::WindowState;
use larkspur_broker::{Broker, BrokerDelegate};
use larkspur_cache::{
    Cache, CacheDelegate, ClientCallback, ClientKey, ClientOp, Web, WebFlags, WindowId,
};
use larkspur_cookies::{CookieJar, CookiePolicy};
use larkspur_http::Url;
use larkspur_io::EventLoop;
use larkspur_nav::{NavDelegate, Navigator};
use larkspur_transport::{CredentialSource, HelperEvent};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// The windowing toolkit's side of the conversation. Everything modal
/// or visual ends up here; defaults log and decline.
pub trait UiShell {
    /// Shows `msg` in the window's status area.
    fn status_msg(&self, _window: WindowId, msg: &str) {
        if !msg.is_empty() {
            log::info!("status: {msg}");
        }
    }

    /// Asks whether a POST may be resubmitted. Modal.
    fn confirm_repost(&self, _window: WindowId) -> bool {
        false
    }

    /// Asks for credentials for `url`. On success the shell expects the
    /// UI to trigger a reload.
    fn prompt_auth(&self, _window: WindowId, _challenges: &[String], url: &Url) {
        log::info!("authentication required for {url}");
    }

    /// Offers to save `url` to disk.
    fn offer_save_link(&self, _window: WindowId, url: &Url) {
        log::info!("download offered for {url}");
    }

    /// Current scroll position.
    fn get_scroll(&self, _window: WindowId) -> (i32, i32) {
        (0, 0)
    }

    /// Scrolls to a position.
    fn set_scroll(&self, _window: WindowId, _x: i32, _y: i32) {}

    /// Scrolls to a named fragment.
    fn scroll_to_fragment(&self, _window: WindowId, _fragment: &str) {}

    /// Transfer progress for the window's root resource.
    fn page_progress(&self, _window: WindowId, _bytes: usize, _done: bool) {}

    /// A helper daemon asked for a dialog.
    fn helper_dialog(&self, _window: WindowId, title: &str, msg: &str) {
        log::info!("helper dialog: {title}: {msg}");
    }
}

/// A UI that only logs. Useful headless and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessUi;

impl UiShell for HeadlessUi {}

pub(crate) struct WindowRec {
    pub(crate) state: WindowState,
    pub(crate) nav: RefCell<Option<Navigator>>,
}

/// The delegate hub. One per [`crate::Browser`]. Built with
/// [`Rc::new_cyclic`] so delegate methods can hand clones of the owning
/// `Rc` to the callbacks they create.
pub(crate) struct Shell {
    pub(crate) weak_self: Weak<Shell>,
    pub(crate) el: EventLoop,
    pub(crate) ui: Rc<dyn UiShell>,
    pub(crate) viewers: Rc<ViewerRegistry>,
    pub(crate) cookie_policy: CookiePolicy,
    pub(crate) cookie_jar: RefCell<CookieJar>,
    pub(crate) cache: RefCell<Option<Cache>>,
    pub(crate) broker: RefCell<Option<Broker>>,
    pub(crate) windows: RefCell<HashMap<WindowId, Rc<WindowRec>>>,
}

impl Shell {
    fn cache(&self) -> Cache {
        self.cache.borrow().clone().expect("cache wired")
    }

    fn broker(&self) -> Broker {
        self.broker.borrow().clone().expect("broker wired")
    }

    pub(crate) fn window(&self, id: WindowId) -> Option<Rc<WindowRec>> {
        self.windows.borrow().get(&id).cloned()
    }

    fn with_nav(&self, id: WindowId, f: impl FnOnce(&Navigator)) {
        if let Some(rec) = self.window(id) {
            if let Some(nav) = rec.nav.borrow().as_ref() {
                f(nav);
            }
        }
    }
}

impl CacheDelegate for Shell {
    fn status_msg(&self, window: WindowId, msg: &str) {
        self.ui.status_msg(window, msg);
    }

    fn redirect(&self, window: WindowId, to: Url, from: &Url) {
        self.with_nav(window, |nav| nav.push(&to, Some(from)));
    }

    fn redirect_level(&self, window: WindowId) -> u32 {
        self.window(window).map_or(0, |rec| rec.state.redirect_level())
    }

    fn set_redirect_level(&self, window: WindowId, level: u32) {
        if let Some(rec) = self.window(window) {
            rec.state.set_redirect_level(level);
        }
    }

    fn dispatch_by_type(&self, ctype: &str, web: &Web) -> Option<ClientCallback> {
        let viewer = self.viewers.dispatch(ctype, web)?;
        if !web.flags.contains(WebFlags::ROOT_URL) {
            return Some(viewer);
        }
        // The first root delivery commits the expected URL; the last one
        // retires the client from its window.
        let shell = self.weak_self.upgrade().expect("shell alive");
        let window = web.window;
        let committed = Cell::new(false);
        Some(Rc::new(move |update| {
            if update.op == ClientOp::Send && !committed.get() {
                committed.set(true);
                shell.with_nav(window, |nav| nav.expect_done());
            }
            viewer(update);
            if matches!(update.op, ClientOp::Close | ClientOp::Abort) {
                if let Some(rec) = shell.window(window) {
                    rec.state.remove_client(update.key);
                }
            }
        }))
    }

    fn set_cookies(&self, lines: &[String], url: &Url, server_date: Option<&str>) {
        self.cookie_jar
            .borrow_mut()
            .set_from_response(lines, url, server_date, &self.cookie_policy);
    }

    fn conn_abort_by_url(&self, url: &Url) {
        self.broker().abort_conns(url);
    }

    fn cancel_expect_if_eq(&self, window: WindowId, url: &Url) {
        self.with_nav(window, |nav| nav.cancel_expect_if_eq(url));
    }

    fn close_window_client(&self, window: WindowId, key: ClientKey) {
        if let Some(rec) = self.window(window) {
            rec.state.remove_client(key);
        }
    }

    fn remove_window_client(&self, window: WindowId, key: ClientKey) {
        if let Some(rec) = self.window(window) {
            rec.state.remove_client(key);
        }
    }

    fn offer_save_link(&self, window: WindowId, url: &Url) {
        self.ui.offer_save_link(window, url);
    }

    fn prompt_auth(&self, window: WindowId, challenges: Vec<String>, url: Url) {
        self.ui.prompt_auth(window, &challenges, &url);
    }

    fn schedule_delayed_dispatch(&self) {
        let cache = self.cache();
        self.el.defer(move || cache.process_delayed());
    }

    fn page_progress(&self, window: WindowId, bytes: usize, done: bool) {
        self.ui.page_progress(window, bytes, done);
    }
}

impl BrokerDelegate for Shell {
    fn status_msg(&self, window: WindowId, msg: &str) {
        self.ui.status_msg(window, msg);
    }

    fn helper_event(&self, window: WindowId, event: HelperEvent) {
        match event {
            HelperEvent::Status(msg) => self.ui.status_msg(window, &msg),
            HelperEvent::Chat(msg) => log::debug!("helper chat: {msg}"),
            HelperEvent::Dialog { title, msg } => self.ui.helper_dialog(window, &title, &msg),
            HelperEvent::ReloadRequest(url) => match Url::parse(&url, None) {
                Ok(url) => self.with_nav(window, |nav| nav.push(&url, None)),
                Err(err) => log::warn!("helper reload request with bad URL: {err}"),
            },
            HelperEvent::PageStart => {}
        }
    }

    fn save_from_cache(&self, url: &Url, filename: Option<&std::path::Path>) {
        let cache = self.cache();
        let Some((buf, len)) = cache.get_buf(url) else {
            return;
        };
        let destination = filename
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from(url.path().trim_start_matches('/')));
        let result = std::fs::write(&destination, &buf.borrow()[..len]);
        cache.unref_buf(url);
        match result {
            Ok(()) => log::info!("saved {url} to {}", destination.display()),
            Err(err) => log::warn!("saving {url} failed: {err}"),
        }
    }
}

impl NavDelegate for Shell {
    fn open_url(&self, url: &Url, requester: Option<&Url>, window: WindowId) {
        let web = Web::new(url.clone(), requester.cloned(), window)
            .with_flags(WebFlags::ROOT_URL);
        if let Some(key) = self.broker().open_url(web, None) {
            if let Some(rec) = self.window(window) {
                rec.state.add_client(key, true);
            }
        }
    }

    fn stop_window_clients(&self, window: WindowId) {
        let Some(rec) = self.window(window) else { return };
        let broker = self.broker();
        for key in rec.state.take_clients() {
            broker.stop_client(key);
        }
    }

    fn get_scroll(&self, window: WindowId) -> (i32, i32) {
        self.ui.get_scroll(window)
    }

    fn set_scroll(&self, window: WindowId, x: i32, y: i32) {
        self.ui.set_scroll(window, x, y);
    }

    fn scroll_to_fragment(&self, window: WindowId, fragment: &str) {
        self.ui.scroll_to_fragment(window, fragment);
    }

    fn confirm_repost(&self, window: WindowId) -> bool {
        self.ui.confirm_repost(window)
    }

    fn defer(&self, f: Box<dyn FnOnce()>) {
        self.el.defer(f);
    }

    fn status_msg(&self, window: WindowId, msg: &str) {
        self.ui.status_msg(window, msg);
    }
}

impl CredentialSource for Shell {
    fn cookies_for(&self, url: &Url) -> Option<String> {
        self.cookie_jar.borrow_mut().cookie_line(url)
    }
}
