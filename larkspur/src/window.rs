//! Per-window bookkeeping: which cache clients belong to the window,
//! and the redirect depth of the load in progress.

use larkspur_cache::ClientKey;
use std::cell::{Cell, RefCell};

/// A window's client set and redirect depth.
#[derive(Debug, Default)]
pub struct WindowState {
    root_clients: RefCell<Vec<ClientKey>>,
    sub_clients: RefCell<Vec<ClientKey>>,
    redirect_level: Cell<u32>,
}

impl WindowState {
    /// Creates an empty window record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client; root clients are the page itself, the rest
    /// are images and stylesheets.
    pub fn add_client(&self, key: ClientKey, root: bool) {
        if root {
            self.root_clients.borrow_mut().push(key);
        } else {
            self.sub_clients.borrow_mut().push(key);
        }
    }

    /// Forgets a client (it finished or was stopped).
    pub fn remove_client(&self, key: ClientKey) {
        self.root_clients.borrow_mut().retain(|k| *k != key);
        self.sub_clients.borrow_mut().retain(|k| *k != key);
    }

    /// Takes every registered client, root and sub alike.
    pub fn take_clients(&self) -> Vec<ClientKey> {
        let mut all = self.root_clients.borrow_mut().drain(..).collect::<Vec<_>>();
        all.extend(self.sub_clients.borrow_mut().drain(..));
        all
    }

    /// Whether any root client is still active.
    pub fn has_root_clients(&self) -> bool {
        !self.root_clients.borrow().is_empty()
    }

    /// The window's recursive-redirect depth.
    pub fn redirect_level(&self) -> u32 {
        self.redirect_level.get()
    }

    /// Updates the recursive-redirect depth.
    pub fn set_redirect_level(&self, level: u32) {
        self.redirect_level.set(level);
    }
}
