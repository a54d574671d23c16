/*!
Navigation: the per-window back/forward stack and its commit protocol.

A page load happens in two phases. `push` records the *expected URL* and
asks the browser to open it as a root client; only when the first root
callback fires does the browser call `expect_done`, committing the URL
into history and the window's stack. Pushes for an already-expected URL
coalesce (double clicks), reloads and repushes deliberately skip the
stack surgery, and a zero-delay META refresh replaces the current entry
instead of growing the stack.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod history;

pub use history::History;

use larkspur_http::{Url, UrlFlags};
use std::cell::RefCell;
use std::rc::Rc;

/// Identifies a browser window to the delegate.
pub type WindowId = u32;

/// Browser-side surface the navigator drives.
pub trait NavDelegate {
    /// Opens `url` as the window's root resource. The navigator has
    /// already stopped the window's clients.
    fn open_url(&self, url: &Url, requester: Option<&Url>, window: WindowId);

    /// Stops the window's active root and image clients before a load.
    fn stop_window_clients(&self, _window: WindowId) {}

    /// Current scroll position of the window.
    fn get_scroll(&self, _window: WindowId) -> (i32, i32) {
        (0, 0)
    }

    /// Scrolls the window to a position.
    fn set_scroll(&self, _window: WindowId, _x: i32, _y: i32) {}

    /// Scrolls the window to a named fragment.
    fn scroll_to_fragment(&self, _window: WindowId, _fragment: &str) {}

    /// Asks whether a POST may be resubmitted. Modal.
    fn confirm_repost(&self, _window: WindowId) -> bool {
        false
    }

    /// Opens `url` in a fresh window.
    fn open_in_new_window(&self, _url: &Url) {}

    /// Runs `f` on the next event loop turn. Repush and redirect-0 are
    /// deferred so the current call flow finishes in a known state.
    fn defer(&self, f: Box<dyn FnOnce()>);

    /// Shows `msg` in the window's status area.
    fn status_msg(&self, _window: WindowId, _msg: &str) {}
}

#[derive(Debug, Clone, Copy)]
struct StackItem {
    history_idx: usize,
    scroll: (i32, i32),
}

struct NavState {
    window: WindowId,
    items: Vec<StackItem>,
    /// Index of the current entry; -1 when the stack is empty.
    cursor: isize,
    expected: Option<Url>,
    meta_refresh_url: Option<Url>,
    meta_refresh_status: u8,
}

/// Per-window navigator. Clones share the window's state.
#[derive(Clone)]
pub struct Navigator {
    state: Rc<RefCell<NavState>>,
    history: Rc<RefCell<History>>,
    delegate: Rc<dyn NavDelegate>,
}

impl std::fmt::Debug for Navigator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.borrow();
        f.debug_struct("Navigator")
            .field("window", &st.window)
            .field("stack_len", &st.items.len())
            .field("cursor", &st.cursor)
            .field("expecting", &st.expected.as_ref().map(|u| u.as_str()))
            .finish()
    }
}

impl Navigator {
    /// Creates the navigator for `window`.
    pub fn new(
        window: WindowId,
        history: Rc<RefCell<History>>,
        delegate: Rc<dyn NavDelegate>,
    ) -> Self {
        Self {
            state: Rc::new(RefCell::new(NavState {
                window,
                items: Vec::new(),
                cursor: -1,
                expected: None,
                meta_refresh_url: None,
                meta_refresh_status: 0,
            })),
            history,
            delegate,
        }
    }

    /// Current stack cursor; -1 when empty.
    pub fn cursor(&self) -> isize {
        self.state.borrow().cursor
    }

    /// Number of stack entries.
    pub fn len(&self) -> usize {
        self.state.borrow().items.len()
    }

    /// Whether the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.state.borrow().items.is_empty()
    }

    /// History index of the `i`-th stack entry.
    pub fn history_idx(&self, i: usize) -> Option<usize> {
        self.state.borrow().items.get(i).map(|item| item.history_idx)
    }

    /// The URL at the stack cursor.
    pub fn current_url(&self) -> Option<Url> {
        let st = self.state.borrow();
        let idx = usize::try_from(st.cursor).ok()?;
        let history_idx = st.items.get(idx)?.history_idx;
        self.history.borrow().url(history_idx).cloned()
    }

    /// The URL requested but not yet committed, if any.
    pub fn expected_url(&self) -> Option<Url> {
        self.state.borrow().expected.clone()
    }

    /// Whether a page load is pending commit.
    pub fn expecting(&self) -> bool {
        self.state.borrow().expected.is_some()
    }

    fn saved_scroll(&self) -> (i32, i32) {
        let st = self.state.borrow();
        usize::try_from(st.cursor)
            .ok()
            .and_then(|idx| st.items.get(idx))
            .map(|item| item.scroll)
            .unwrap_or((0, 0))
    }

    fn save_scroll_at(&self, idx: isize, scroll: (i32, i32)) {
        let mut st = self.state.borrow_mut();
        if let Ok(idx) = usize::try_from(idx) {
            if let Some(item) = st.items.get_mut(idx) {
                item.scroll = scroll;
            }
        }
    }

    /// Records the window's current scroll position on the current entry.
    pub fn save_scroll(&self, x: i32, y: i32) {
        let cursor = self.state.borrow().cursor;
        self.save_scroll_at(cursor, (x, y));
    }

    /// Removes equal adjacent entries at the top of the stack (a
    /// redirect commits the same URL twice).
    fn stack_clean(&self) {
        let mut st = self.state.borrow_mut();
        let n = st.items.len();
        if n >= 2 && st.items[n - 2].history_idx == st.items[n - 1].history_idx {
            st.items.pop();
            if st.cursor >= st.items.len() as isize {
                st.cursor = st.items.len() as isize - 1;
            }
        }
    }

    /// The common open path: save scroll, move the cursor, and load when
    /// the target differs from the current page (or a reload forces it).
    fn open_url(&self, url: &Url, requester: Option<&Url>, offset: isize) {
        let force_reload = url
            .flags()
            .intersects(UrlFlags::E2E_RELOAD | UrlFlags::RELOAD_FROM_CACHE);
        let ignore_scroll = url.flags().contains(UrlFlags::IGNORE_SCROLL);

        let (window, cursor, old_url) = {
            let st = self.state.borrow();
            let old = usize::try_from(st.cursor)
                .ok()
                .and_then(|idx| st.items.get(idx))
                .and_then(|item| self.history.borrow().url(item.history_idx).cloned());
            (st.window, st.cursor, old)
        };

        if old_url.is_some() && !ignore_scroll {
            let scroll = self.delegate.get_scroll(window);
            self.save_scroll_at(cursor, scroll);
        }

        if offset != 0 {
            let mut st = self.state.borrow_mut();
            let next = st.cursor + offset;
            if next >= 0 && next < st.items.len() as isize {
                st.cursor = next;
            }
        }

        let must_load = force_reload
            || match &old_url {
                None => true,
                Some(old) => !old.eq_with_fragment(url),
            };
        if must_load {
            self.delegate.stop_window_clients(window);
            log::debug!("nav: loading {url}");
            self.delegate.open_url(url, requester, window);
        }
    }

    /// Makes `url` the page being browsed to.
    pub fn push(&self, url: &Url, requester: Option<&Url>) {
        {
            let st = self.state.borrow();
            if let Some(expected) = &st.expected {
                if expected.eq_with_fragment(url) {
                    // Most probably a double click.
                    return;
                }
            }
        }
        self.cancel_expect();
        self.state.borrow_mut().expected = Some(url.clone());
        self.open_url(url, requester, 0);
    }

    /// Commits the expected URL: the root client's first data arrived.
    ///
    /// Repushes pass through here twice (once for the original load, once
    /// after the charset switch), which is why transient flags are
    /// stripped before the URL enters history.
    pub fn expect_done(&self) {
        let mut goto_old_scroll = true;
        let mut fragment = String::new();
        let window = self.state.borrow().window;

        if self.expecting() {
            let mut url = self.state.borrow().expected.clone().unwrap();
            let reload = url.flags().contains(UrlFlags::RELOAD_PAGE);
            let repush = url.flags().contains(UrlFlags::RELOAD_FROM_CACHE);
            let e2e_query = url.flags().contains(UrlFlags::E2E_RELOAD);
            fragment = url.fragment().to_string();

            url.remove_flags(
                UrlFlags::E2E_RELOAD
                    | UrlFlags::RELOAD_PAGE
                    | UrlFlags::RELOAD_FROM_CACHE
                    | UrlFlags::IGNORE_SCROLL,
            );
            let url_idx = self.history.borrow_mut().add(url);

            if repush {
                log::debug!("nav: repush commit");
            } else if reload {
                log::debug!("nav: reload commit");
            } else {
                let mut st = self.state.borrow_mut();
                let keep = (st.cursor + 1).max(0) as usize;
                st.items.truncate(keep);
                st.items.push(StackItem {
                    history_idx: url_idx,
                    scroll: (0, 0),
                });
                st.cursor += 1;
            }

            if !fragment.is_empty() {
                goto_old_scroll = false;
                if repush {
                    if self.saved_scroll() != (0, 0) {
                        goto_old_scroll = true;
                    }
                } else if e2e_query {
                    // Reset the saved scroll so a later repush lands on
                    // the fragment.
                    let cursor = self.state.borrow().cursor;
                    self.save_scroll_at(cursor, (0, 0));
                }
            }
            self.cancel_expect();
        }

        if goto_old_scroll {
            let (x, y) = self.saved_scroll();
            self.delegate.set_scroll(window, x, y);
        } else if !fragment.is_empty() {
            self.delegate.scroll_to_fragment(window, &fragment);
        } else {
            self.delegate.set_scroll(window, 0, 0);
        }
        self.stack_clean();
    }

    /// Drops the expected URL; the data stream (if any) is the caller's
    /// to abort.
    pub fn cancel_expect(&self) {
        let mut st = self.state.borrow_mut();
        st.expected = None;
        if st.meta_refresh_status > 0 {
            st.meta_refresh_status -= 1;
        }
    }

    /// Cancels the expectation if it names `url`.
    pub fn cancel_expect_if_eq(&self, url: &Url) {
        let matches = self
            .state
            .borrow()
            .expected
            .as_ref()
            .is_some_and(|e| e.eq_with_fragment(url));
        if matches {
            self.cancel_expect();
        }
    }

    /// Goes back one page.
    pub fn back(&self) {
        self.cancel_expect();
        let target = {
            let st = self.state.borrow();
            usize::try_from(st.cursor - 1)
                .ok()
                .and_then(|idx| st.items.get(idx))
                .and_then(|item| self.history.borrow().url(item.history_idx).cloned())
        };
        if let Some(url) = target {
            self.delegate.status_msg(self.state.borrow().window, "");
            self.open_url(&url, None, -1);
        }
    }

    /// Goes forward one page.
    pub fn forward(&self) {
        self.cancel_expect();
        let target = {
            let st = self.state.borrow();
            let next = st.cursor + 1;
            usize::try_from(next)
                .ok()
                .filter(|idx| *idx < st.items.len())
                .and_then(|idx| st.items.get(idx))
                .and_then(|item| self.history.borrow().url(item.history_idx).cloned())
        };
        if let Some(url) = target {
            self.delegate.status_msg(self.state.borrow().window, "");
            self.open_url(&url, None, 1);
        }
    }

    /// Jumps by `offset` entries; positive is forward. With `new_window`
    /// the target opens elsewhere and this stack is untouched.
    pub fn jump(&self, offset: isize, new_window: bool) {
        let target = {
            let st = self.state.borrow();
            usize::try_from(st.cursor + offset)
                .ok()
                .filter(|idx| *idx < st.items.len())
                .and_then(|idx| st.items.get(idx))
                .and_then(|item| self.history.borrow().url(item.history_idx).cloned())
        };
        let Some(url) = target else { return };
        if new_window {
            self.delegate.open_in_new_window(&url);
        } else {
            self.cancel_expect();
            self.open_url(&url, None, offset);
        }
    }

    /// End-to-end reload of the current page. POST pages ask first.
    pub fn reload(&self) {
        self.cancel_expect();
        let Some(mut url) = self.current_url() else {
            return;
        };
        let window = self.state.borrow().window;
        if url.flags().contains(UrlFlags::POST) && !self.delegate.confirm_repost(window) {
            return;
        }
        url.add_flags(UrlFlags::E2E_RELOAD | UrlFlags::RELOAD_PAGE);
        self.state.borrow_mut().expected = Some(url.clone());
        self.open_url(&url, None, 0);
    }

    /// Reload from cache, without a network round trip. Used to switch
    /// charsets after a META discovery; deferred one loop turn so the
    /// parser's call flow unwinds first.
    pub fn repush(&self) {
        let nav = self.clone();
        self.delegate.defer(Box::new(move || {
            nav.cancel_expect();
            let Some(mut url) = nav.current_url() else {
                return;
            };
            url.add_flags(UrlFlags::RELOAD_FROM_CACHE);
            nav.state.borrow_mut().expected = Some(url.clone());
            nav.open_url(&url, None, 0);
        }));
    }

    /// Handles a zero-delay META refresh: the new URL replaces the
    /// current history entry instead of stacking on top of it.
    pub fn redirection0(&self, new_url: &Url) {
        let mut url = new_url.clone();
        url.add_flags(UrlFlags::E2E_RELOAD | UrlFlags::IGNORE_SCROLL);
        {
            let mut st = self.state.borrow_mut();
            st.meta_refresh_url = Some(url);
            st.meta_refresh_status = 2;
        }
        let nav = self.clone();
        self.delegate.defer(Box::new(move || {
            let (url, fire) = {
                let mut st = nav.state.borrow_mut();
                let fire = st.meta_refresh_status == 2;
                st.meta_refresh_status = 0;
                (st.meta_refresh_url.take(), fire)
            };
            let Some(url) = url else { return };
            if fire {
                let referer = nav.current_url();
                {
                    let mut st = nav.state.borrow_mut();
                    if st.cursor > 0 {
                        st.cursor -= 1;
                    }
                }
                nav.push(&url, referer.as_ref());
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        opened: RefCell<Vec<String>>,
        scrolls: RefCell<Vec<(i32, i32)>>,
        fragments: RefCell<Vec<String>>,
        live_scroll: RefCell<(i32, i32)>,
        deferred: RefCell<Vec<Box<dyn FnOnce()>>>,
        repost_ok: RefCell<bool>,
        new_windows: RefCell<Vec<String>>,
    }

    impl Recorder {
        fn run_deferred(&self) {
            let jobs: Vec<_> = self.deferred.borrow_mut().drain(..).collect();
            for job in jobs {
                job();
            }
        }
    }

    impl NavDelegate for Rc<Recorder> {
        fn open_url(&self, url: &Url, _requester: Option<&Url>, _window: WindowId) {
            self.opened.borrow_mut().push(url.as_str().to_string());
        }

        fn get_scroll(&self, _window: WindowId) -> (i32, i32) {
            *self.live_scroll.borrow()
        }

        fn set_scroll(&self, _window: WindowId, x: i32, y: i32) {
            self.scrolls.borrow_mut().push((x, y));
        }

        fn scroll_to_fragment(&self, _window: WindowId, fragment: &str) {
            self.fragments.borrow_mut().push(fragment.to_string());
        }

        fn confirm_repost(&self, _window: WindowId) -> bool {
            *self.repost_ok.borrow()
        }

        fn open_in_new_window(&self, url: &Url) {
            self.new_windows.borrow_mut().push(url.as_str().to_string());
        }

        fn defer(&self, f: Box<dyn FnOnce()>) {
            self.deferred.borrow_mut().push(f);
        }
    }

    fn rig() -> (Navigator, Rc<Recorder>, Rc<RefCell<History>>) {
        let recorder = Rc::new(Recorder::default());
        let history = Rc::new(RefCell::new(History::new()));
        let nav = Navigator::new(
            1,
            Rc::clone(&history),
            Rc::new(Rc::clone(&recorder)),
        );
        (nav, recorder, history)
    }

    fn url(s: &str) -> Url {
        Url::parse(s, None).unwrap()
    }

    fn visit(nav: &Navigator, s: &str) {
        nav.push(&url(s), None);
        nav.expect_done();
    }

    #[test]
    fn double_push_commits_once() {
        let (nav, recorder, _) = rig();
        let u = url("http://a.test/");
        nav.push(&u, None);
        nav.push(&u, None);
        assert_eq!(recorder.opened.borrow().len(), 1);
        nav.expect_done();
        nav.expect_done();
        assert_eq!(nav.len(), 1);
        assert_eq!(nav.cursor(), 0);
    }

    #[test]
    fn back_and_forward_move_the_cursor() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://a.test/");
        visit(&nav, "http://b.test/");
        visit(&nav, "http://c.test/");
        assert_eq!((nav.len(), nav.cursor()), (3, 2));

        nav.back();
        assert_eq!(nav.cursor(), 1);
        assert_eq!(nav.current_url().unwrap().as_str(), "http://b.test/");
        nav.back();
        assert_eq!(nav.cursor(), 0);
        nav.back(); // already at the bottom
        assert_eq!(nav.cursor(), 0);
        nav.forward();
        assert_eq!(nav.cursor(), 1);
        // Three visits, two effective backs, one forward.
        assert_eq!(recorder.opened.borrow().len(), 6);
    }

    #[test]
    fn push_after_back_truncates_forward_history() {
        let (nav, _, _) = rig();
        visit(&nav, "http://a.test/");
        visit(&nav, "http://b.test/");
        nav.back();
        visit(&nav, "http://c.test/");
        assert_eq!(nav.len(), 2);
        assert_eq!(nav.current_url().unwrap().as_str(), "http://c.test/");
        nav.forward(); // nothing ahead
        assert_eq!(nav.cursor(), 1);
    }

    #[test]
    fn adjacent_duplicates_collapse() {
        let (nav, _, _) = rig();
        visit(&nav, "http://a.test/");
        // A server redirect commits the same URL again.
        visit(&nav, "http://a.test/");
        assert_eq!(nav.len(), 1);
        assert_eq!(nav.cursor(), 0);
    }

    #[test]
    fn reload_requires_confirmation_for_post() {
        let (nav, recorder, _) = rig();
        let mut u = url("http://form.test/submit");
        u.add_flags(UrlFlags::POST);
        nav.push(&u, None);
        nav.expect_done();
        assert_eq!(recorder.opened.borrow().len(), 1);

        // Declined: nothing happens.
        nav.reload();
        assert_eq!(recorder.opened.borrow().len(), 1);

        *recorder.repost_ok.borrow_mut() = true;
        nav.reload();
        assert_eq!(recorder.opened.borrow().len(), 2);
        // A reload commit does not grow the stack.
        nav.expect_done();
        assert_eq!(nav.len(), 1);
    }

    #[test]
    fn repush_is_deferred_and_keeps_stack_flat() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://charset.test/");
        nav.repush();
        assert_eq!(recorder.opened.borrow().len(), 1);
        recorder.run_deferred();
        assert_eq!(recorder.opened.borrow().len(), 2);
        nav.expect_done();
        assert_eq!(nav.len(), 1);
        // The committed history entry carries no transient flags.
        let committed = nav.current_url().unwrap();
        assert!(committed.flags().is_empty());
    }

    #[test]
    fn redirection0_replaces_the_current_entry() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://a.test/");
        visit(&nav, "http://b.test/");
        assert_eq!((nav.len(), nav.cursor()), (2, 1));

        nav.redirection0(&url("http://b2.test/"));
        recorder.run_deferred();
        nav.expect_done();
        assert_eq!((nav.len(), nav.cursor()), (2, 1));
        assert_eq!(nav.current_url().unwrap().as_str(), "http://b2.test/");
        // Going back still lands on the first page.
        nav.back();
        assert_eq!(nav.current_url().unwrap().as_str(), "http://a.test/");
    }

    #[test]
    fn scroll_position_saved_and_restored() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://a.test/");
        *recorder.live_scroll.borrow_mut() = (0, 500);
        visit(&nav, "http://b.test/");
        // Going back restores a.test's saved position.
        *recorder.live_scroll.borrow_mut() = (0, 10);
        nav.back();
        nav.expect_done();
        assert_eq!(*recorder.scrolls.borrow().last().unwrap(), (0, 500));
    }

    #[test]
    fn fragment_commit_scrolls_to_fragment_and_e2e_resets_saved_scroll() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://a.test/page");

        // A fresh fragment navigation scrolls to the fragment.
        nav.push(&url("http://a.test/page#section"), None);
        nav.expect_done();
        assert_eq!(recorder.fragments.borrow().last().unwrap(), "section");

        // An end-to-end query with a fragment resets the saved scroll, so
        // the repush that follows also lands on the fragment.
        *recorder.live_scroll.borrow_mut() = (0, 300);
        let mut reload = url("http://a.test/page#section");
        reload.add_flags(UrlFlags::E2E_RELOAD);
        nav.push(&reload, None);
        nav.expect_done();
        nav.repush();
        recorder.run_deferred();
        nav.expect_done();
        let fragments = recorder.fragments.borrow();
        assert!(fragments.len() >= 2);
        assert_eq!(fragments.last().unwrap(), "section");
    }

    #[test]
    fn jump_to_new_window_leaves_stack_alone() {
        let (nav, recorder, _) = rig();
        visit(&nav, "http://a.test/");
        visit(&nav, "http://b.test/");
        nav.jump(-1, true);
        assert_eq!(nav.cursor(), 1);
        assert_eq!(
            recorder.new_windows.borrow().as_slice(),
            &["http://a.test/".to_string()]
        );
    }
}
