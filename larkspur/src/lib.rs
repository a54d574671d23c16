/*!
The larkspur browser runtime core, assembled.

[`Browser`] owns the event loop, the resolver, the cookie state, the
cache, the broker and the global history, and wires them together
through the delegate traits the subsystem crates expose. The windowing
toolkit talks to it through [`UiShell`] (inbound UI services) and the
[`ViewerRegistry`] (content renderers); everything else is internal
plumbing.

Startup order is fixed: preferences, DNS, HTTP, viewers, cache,
cookies. There is no hot-reload path.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod prefs;
mod shell;
mod viewers;
mod window;

pub use prefs::{ensure_state_dir, read_state_file, Prefs, COOKIE_POLICY_FILE, HELPER_KEYS_FILE};
pub use shell::{HeadlessUi, UiShell};
pub use viewers::ViewerRegistry;
pub use window::WindowState;

pub use larkspur_cache as cache_api;
pub use larkspur_flow as flow;
pub use larkspur_http as http_api;
pub use larkspur_nav as nav_api;

use larkspur_broker::Broker;
use larkspur_cache::{Cache, WindowId};
use larkspur_cookies::{CookieJar, CookiePolicy};
use larkspur_http::Url;
use larkspur_io::{EventLoop, Resolver};
use larkspur_nav::{History, Navigator};
use larkspur_transport::{HelperBackend, HttpBackend, HttpConfig};
use shell::{Shell, WindowRec};
use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

/// The built-in start page, injected into the cache at startup.
const SPLASH_URL: &str = "about:splash";
const SPLASH_PAGE: &str = "<!doctype html><html><head><title>Larkspur</title></head>\
<body><h1>Larkspur</h1><p>A lightweight browser core.</p></body></html>";

/// The assembled browser context.
pub struct Browser {
    el: EventLoop,
    resolver: Resolver,
    prefs: Prefs,
    shell: Rc<Shell>,
    cache: Cache,
    broker: Broker,
    history: Rc<RefCell<History>>,
    next_window: Cell<WindowId>,
}

impl std::fmt::Debug for Browser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Browser")
            .field("windows", &self.shell.windows.borrow().len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Browser {
    /// Builds a browser core: state directory, resolver, backends,
    /// cache, cookie subsystem, in that order.
    pub fn new(
        prefs: Prefs,
        ui: Rc<dyn UiShell>,
        viewers: Rc<ViewerRegistry>,
    ) -> io::Result<Browser> {
        ensure_state_dir(&prefs.state_dir)?;
        let cookie_policy = CookiePolicy::parse(&read_state_file(
            &prefs.cookie_policy_path(),
            larkspur_cookies::DEFAULT_POLICY_FILE,
        )?);
        if cookie_policy.enables_cookies() {
            log::info!("cookies enabled by {}", prefs.cookie_policy_path().display());
        }

        let el = EventLoop::new();
        let resolver = Resolver::new(prefs.dns_workers);

        let shell = Rc::new_cyclic(|weak_self| Shell {
            weak_self: weak_self.clone(),
            el: el.clone(),
            ui,
            viewers,
            cookie_policy,
            cookie_jar: RefCell::new(CookieJar::new()),
            cache: RefCell::new(None),
            broker: RefCell::new(None),
            windows: RefCell::new(Default::default()),
        });

        let http = HttpBackend::new(
            el.clone(),
            resolver.clone(),
            HttpConfig {
                referer: prefs.http_referer,
                language: prefs.http_language.clone(),
                user_agent: prefs.http_user_agent.clone(),
                proxy: prefs.http_proxy.clone(),
                proxy_auth_base64: prefs.http_proxy_auth_base64.clone(),
                no_proxy: prefs.no_proxy.clone(),
            },
            shell.clone(),
        );
        let helper = HelperBackend::new(el.clone(), prefs.helper_keys_path());
        let cache = Cache::with_huge_threshold(shell.clone(), prefs.huge_file_threshold);
        let broker = Broker::new(
            el.clone(),
            cache.clone(),
            http,
            helper,
            shell.clone(),
        );
        broker.set_max_conns(prefs.max_conns);
        *shell.cache.borrow_mut() = Some(cache.clone());
        *shell.broker.borrow_mut() = Some(broker.clone());

        let splash = Url::parse(SPLASH_URL, None)
            .expect("splash URL parses");
        cache.inject(&splash, SPLASH_PAGE.as_bytes());

        Ok(Browser {
            el,
            resolver,
            prefs,
            shell,
            cache,
            broker,
            history: Rc::new(RefCell::new(History::new())),
            next_window: Cell::new(0),
        })
    }

    /// Opens a new browser window and returns its id.
    pub fn new_window(&self) -> WindowId {
        let id = self.next_window.get() + 1;
        self.next_window.set(id);
        let rec = Rc::new(WindowRec {
            state: WindowState::new(),
            nav: RefCell::new(None),
        });
        self.shell.windows.borrow_mut().insert(id, Rc::clone(&rec));
        let nav = Navigator::new(id, Rc::clone(&self.history), self.shell.clone());
        *rec.nav.borrow_mut() = Some(nav);
        id
    }

    /// The window's navigator.
    pub fn navigator(&self, window: WindowId) -> Option<Navigator> {
        self.shell
            .window(window)
            .and_then(|rec| rec.nav.borrow().clone())
    }

    /// Navigates `window` to `url` as a user-initiated load.
    pub fn open(&self, window: WindowId, url: &Url) {
        if let Some(nav) = self.navigator(window) {
            nav.push(url, None);
        }
    }

    /// The core event loop.
    pub fn event_loop(&self) -> &EventLoop {
        &self.el
    }

    /// The DNS resolver (exposed for host priming and diagnostics).
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// The content cache.
    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    /// The dispatch broker.
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    /// The global history list.
    pub fn history(&self) -> Rc<RefCell<History>> {
        Rc::clone(&self.history)
    }

    /// The loaded preferences.
    pub fn prefs(&self) -> &Prefs {
        &self.prefs
    }
}
