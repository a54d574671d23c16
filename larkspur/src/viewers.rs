//! The content-type viewer registry.
//!
//! Maps MIME types to the callbacks that consume a cache entry's bytes.
//! Exact (`image/png`) entries win over major (`text`) entries. The
//! embedding shell registers its HTML renderer, plain-text view and
//! image decoders here; the registry itself ships empty.

use larkspur_cache::{ClientCallback, Web};
use std::cell::RefCell;

type Viewer = Box<dyn Fn(&Web) -> ClientCallback>;

/// Registered viewers, minor (exact) and major (type family).
#[derive(Default)]
pub struct ViewerRegistry {
    minor: RefCell<Vec<(String, Viewer)>>,
    major: RefCell<Vec<(String, Viewer)>>,
}

impl std::fmt::Debug for ViewerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerRegistry")
            .field("minor", &self.minor.borrow().len())
            .field("major", &self.major.borrow().len())
            .finish()
    }
}

impl ViewerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a viewer for an exact type like `image/png`.
    pub fn register_minor(
        &self,
        ctype: &str,
        viewer: impl Fn(&Web) -> ClientCallback + 'static,
    ) {
        self.minor
            .borrow_mut()
            .push((ctype.to_ascii_lowercase(), Box::new(viewer)));
    }

    /// Registers a viewer for a whole major type like `text`.
    pub fn register_major(
        &self,
        major: &str,
        viewer: impl Fn(&Web) -> ClientCallback + 'static,
    ) {
        self.major
            .borrow_mut()
            .push((major.to_ascii_lowercase(), Box::new(viewer)));
    }

    /// Resolves a viewer for `ctype` (parameters ignored), minor
    /// entries first.
    pub fn dispatch(&self, ctype: &str, web: &Web) -> Option<ClientCallback> {
        let essence = ctype
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let major = essence.split('/').next().unwrap_or("").to_string();

        if let Some((_, viewer)) = self
            .minor
            .borrow()
            .iter()
            .find(|(name, _)| *name == essence)
        {
            return Some(viewer(web));
        }
        if let Some((_, viewer)) = self.major.borrow().iter().find(|(name, _)| *name == major) {
            return Some(viewer(web));
        }
        None
    }
}
