//! The process-wide list of visited URLs.
//!
//! Navigation stacks store indices into this list, so one page visited
//! from two windows is a single history item.

use larkspur_http::Url;

#[derive(Debug, Clone)]
struct Item {
    url: Url,
    title: Option<String>,
}

/// Visited-URL registry.
#[derive(Debug, Default)]
pub struct History {
    items: Vec<Item>,
}

impl History {
    /// Creates an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `url`, returning its index. A URL already present (same
    /// fragment included) keeps its existing index.
    pub fn add(&mut self, url: Url) -> usize {
        if let Some(idx) = self
            .items
            .iter()
            .position(|item| item.url.eq_with_fragment(&url))
        {
            return idx;
        }
        self.items.push(Item { url, title: None });
        self.items.len() - 1
    }

    /// The URL at `idx`.
    pub fn url(&self, idx: usize) -> Option<&Url> {
        self.items.get(idx).map(|item| &item.url)
    }

    /// Records the page title once it is known.
    pub fn set_title(&mut self, idx: usize, title: &str) {
        if let Some(item) = self.items.get_mut(idx) {
            item.title = Some(title.to_string());
        }
    }

    /// The title recorded for `idx`.
    pub fn title(&self, idx: usize) -> Option<&str> {
        self.items.get(idx).and_then(|item| item.title.as_deref())
    }

    /// Number of recorded URLs.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing was visited yet.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
