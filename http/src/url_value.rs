//! The URL value that travels through the fetch pipeline.
//!
//! A thin wrapper over [`url::Url`] carrying the browser's per-request flag
//! bits and, for POST requests, the submission payload. Equality and
//! ordering ignore the fragment (and the flags), because the cache and the
//! history must treat `page#a` and `page#b` as the same resource; use
//! [`Url::eq_with_fragment`] when the distinction matters.

use crate::{Error, Result};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

bitflags::bitflags! {
    /// Per-request flag bits riding on a [`Url`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UrlFlags: u16 {
        /// Bypass the cache: fetch end-to-end.
        const E2E_RELOAD = 1 << 0;
        /// Re-deliver from the cache without a network round trip.
        const RELOAD_FROM_CACHE = 1 << 1;
        /// A user-initiated page reload is in progress.
        const RELOAD_PAGE = 1 << 2;
        /// Submit with POST; the payload rides on the URL value.
        const POST = 1 << 3;
        /// Submit with GET.
        const GET = 1 << 4;
        /// Do not restore the saved scroll position on commit.
        const IGNORE_SCROLL = 1 << 5;
        /// POST payload is `multipart/form-data`.
        const MULTIPART_ENC = 1 << 6;
        /// A local/trusted URL that must not redirect.
        const SPAM_SAFE = 1 << 7;
    }
}

/// An address value: scheme, authority, path, query, fragment, flags.
#[derive(Debug, Clone)]
pub struct Url {
    inner: url::Url,
    flags: UrlFlags,
    data: Vec<u8>,
}

impl Url {
    /// Parses `input`, resolving it against `base` when it is relative.
    pub fn parse(input: &str, base: Option<&Url>) -> Result<Url> {
        let inner = match url::Url::parse(input) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => match base {
                Some(base) => base.inner.join(input)?,
                None => return Err(Error::UrlParse(url::ParseError::RelativeUrlWithoutBase)),
            },
            Err(other) => return Err(Error::UrlParse(other)),
        };
        Ok(Url {
            inner,
            flags: UrlFlags::empty(),
            data: Vec::new(),
        })
    }

    /// The scheme, lowercase.
    pub fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    /// The host, if the URL has one.
    pub fn host(&self) -> Option<&str> {
        self.inner.host_str()
    }

    /// The host, or an error naming the URL.
    pub fn host_or_err(&self) -> Result<&str> {
        self.host()
            .ok_or_else(|| Error::HostMissing(self.inner.to_string()))
    }

    /// The explicit port, if any.
    pub fn port(&self) -> Option<u16> {
        self.inner.port()
    }

    /// The port, falling back to the scheme default.
    pub fn port_or_default(&self) -> Option<u16> {
        self.inner.port_or_known_default()
    }

    /// `host[:port]`, with the port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let host = self.inner.host_str().unwrap_or("");
        match self.inner.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// The path; `/` when empty.
    pub fn path(&self) -> &str {
        let path = self.inner.path();
        if path.is_empty() { "/" } else { path }
    }

    /// The query string, without the `?`.
    pub fn query(&self) -> Option<&str> {
        self.inner.query()
    }

    /// The fragment, without the `#`; empty when absent.
    pub fn fragment(&self) -> &str {
        self.inner.fragment().unwrap_or("")
    }

    /// The full serialization, including any fragment.
    pub fn as_str(&self) -> &str {
        self.inner.as_str()
    }

    /// The flag bits.
    pub fn flags(&self) -> UrlFlags {
        self.flags
    }

    /// Replaces the flag bits.
    pub fn set_flags(&mut self, flags: UrlFlags) {
        self.flags = flags;
    }

    /// Builder-style flag addition.
    #[must_use]
    pub fn with_flags(mut self, flags: UrlFlags) -> Url {
        self.flags |= flags;
        self
    }

    /// Adds flag bits.
    pub fn add_flags(&mut self, flags: UrlFlags) {
        self.flags |= flags;
    }

    /// Removes flag bits.
    pub fn remove_flags(&mut self, flags: UrlFlags) {
        self.flags -= flags;
    }

    /// The POST payload, when [`UrlFlags::POST`] is set.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Attaches a POST payload.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.data = data;
    }

    /// Serialization without the fragment; the identity used for
    /// equality, ordering and hashing.
    fn without_fragment(&self) -> &str {
        let s = self.inner.as_str();
        match s.find('#') {
            Some(pos) => &s[..pos],
            None => s,
        }
    }

    /// Full equality: like `==`, but the fragments must match too.
    pub fn eq_with_fragment(&self, other: &Url) -> bool {
        self == other && self.fragment() == other.fragment()
    }

    /// The organization a host belongs to: its last two labels, or three
    /// when the second-level label is a short generic (`co.uk`, `com.mx`).
    fn organization(host: &str) -> String {
        const SHORT_GENERICS: &[&str] = &["co", "com", "net", "org", "edu", "gov", "mil"];
        let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
        if labels.len() <= 2 {
            return host.to_ascii_lowercase();
        }
        let sld = labels[labels.len() - 2].to_ascii_lowercase();
        let take = if sld.len() <= 2 || SHORT_GENERICS.contains(&sld.as_str()) {
            3.min(labels.len())
        } else {
            2
        };
        labels[labels.len() - take..].join(".").to_ascii_lowercase()
    }

    /// Whether two URLs belong to the same organization: the first-party
    /// test used by the cookie and redirect policies.
    pub fn same_organization(&self, other: &Url) -> bool {
        match (self.host(), other.host()) {
            (Some(a), Some(b)) => Url::organization(a) == Url::organization(b),
            _ => false,
        }
    }
}

impl Display for Url {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl PartialEq for Url {
    fn eq(&self, other: &Self) -> bool {
        self.without_fragment() == other.without_fragment()
    }
}

impl Eq for Url {}

impl PartialOrd for Url {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Url {
    fn cmp(&self, other: &Self) -> Ordering {
        self.without_fragment().cmp(other.without_fragment())
    }
}

impl Hash for Url {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.without_fragment().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equality_ignores_fragment_and_flags() {
        let a = Url::parse("http://example.test/page#top", None).unwrap();
        let b = Url::parse("http://example.test/page#bottom", None)
            .unwrap()
            .with_flags(UrlFlags::E2E_RELOAD);
        assert_eq!(a, b);
        assert!(!a.eq_with_fragment(&b));
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn relative_resolution_against_base() {
        let base = Url::parse("http://a.test/dir/page", None).unwrap();
        let url = Url::parse("../other?q=1", Some(&base)).unwrap();
        assert_eq!(url.as_str(), "http://a.test/other?q=1");
        assert!(Url::parse("no-base", None).is_err());
    }

    #[test]
    fn authority_omits_default_port() {
        let plain = Url::parse("http://h.test/x", None).unwrap();
        assert_eq!(plain.authority(), "h.test");
        let with_port = Url::parse("http://h.test:8080/x", None).unwrap();
        assert_eq!(with_port.authority(), "h.test:8080");
        assert_eq!(plain.port_or_default(), Some(80));
    }

    #[test]
    fn organization_grouping() {
        let a = Url::parse("http://www.example.test/", None).unwrap();
        let b = Url::parse("http://images.example.test/", None).unwrap();
        let c = Url::parse("http://other.test/", None).unwrap();
        assert!(a.same_organization(&b));
        assert!(!a.same_organization(&c));

        let uk1 = Url::parse("http://www.example.co.uk/", None).unwrap();
        let uk2 = Url::parse("http://mail.example.co.uk/", None).unwrap();
        let uk3 = Url::parse("http://evil.co.uk/", None).unwrap();
        assert!(uk1.same_organization(&uk2));
        assert!(!uk1.same_organization(&uk3));
    }

    #[test]
    fn non_special_schemes_parse() {
        let about = Url::parse("about:splash", None).unwrap();
        assert_eq!(about.scheme(), "about");
        assert_eq!(about.host(), None);
        assert!(about.host_or_err().is_err());
    }
}
