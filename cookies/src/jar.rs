//! The in-memory cookie jar.

use crate::{CookieAction, CookiePolicy};
use cookie::{Cookie, Expiration};
use time::{Duration, OffsetDateTime};
use larkspur_http::Url;
use std::time::SystemTime;

#[derive(Debug, Clone)]
struct Stored {
    name: String,
    value: String,
    domain: String,
    host_only: bool,
    path: String,
    expires: Option<OffsetDateTime>,
    secure: bool,
}

impl Stored {
    fn expired(&self, now: OffsetDateTime) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn domain_matches(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        if self.host_only {
            host == self.domain
        } else {
            host == self.domain || host.ends_with(&format!(".{}", self.domain))
        }
    }

    fn path_matches(&self, path: &str) -> bool {
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/')
                    || path.as_bytes().get(self.path.len()) == Some(&b'/')))
    }
}

/// Session-lifetime cookie storage.
#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Vec<Stored>,
}

fn default_path(url: &Url) -> String {
    let path = url.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(pos) => path[..pos].to_string(),
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::from(SystemTime::now())
}

impl CookieJar {
    /// Creates an empty jar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live cookies.
    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    /// Whether the jar is empty.
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Offers `Set-Cookie` lines from a response at `url` to the jar.
    ///
    /// `server_date` (the response `Date` header) compensates for clock
    /// skew when the server gave an absolute expiry. The policy decides
    /// per host whether cookies stick and whether expiry is honored.
    pub fn set_from_response(
        &mut self,
        lines: &[String],
        url: &Url,
        server_date: Option<&str>,
        policy: &CookiePolicy,
    ) {
        let Some(host) = url.host() else { return };
        let action = policy.action_for(host);
        if action == CookieAction::Deny {
            log::trace!("cookies: denied for {host}");
            return;
        }
        let skew = server_date
            .and_then(|date| httpdate::parse_http_date(date).ok())
            .map(|server| now() - OffsetDateTime::from(server))
            .unwrap_or(Duration::ZERO);

        for line in lines {
            match Cookie::parse(line.as_str()) {
                Ok(cookie) => self.store(cookie, url, host, action, skew),
                Err(err) => log::trace!("cookies: parse error: {err}"),
            }
        }
    }

    fn store(
        &mut self,
        cookie: Cookie<'_>,
        url: &Url,
        host: &str,
        action: CookieAction,
        skew: Duration,
    ) {
        let host = host.to_ascii_lowercase();
        let (domain, host_only) = match cookie.domain() {
            Some(domain) => {
                let domain = domain.trim_start_matches('.').to_ascii_lowercase();
                // A cookie may only widen to a suffix of the host it came from.
                if host != domain && !host.ends_with(&format!(".{domain}")) {
                    log::trace!("cookies: domain {domain:?} does not cover {host:?}");
                    return;
                }
                (domain, false)
            }
            None => (host.clone(), true),
        };

        let expires = if action == CookieAction::AcceptSession {
            None
        } else if let Some(max_age) = cookie.max_age() {
            Some(now() + max_age)
        } else {
            match cookie.expires() {
                Some(Expiration::DateTime(at)) => Some(at + skew),
                _ => None,
            }
        };

        let stored = Stored {
            name: cookie.name().to_string(),
            value: cookie.value().to_string(),
            domain,
            host_only,
            path: cookie
                .path()
                .map(str::to_string)
                .unwrap_or_else(|| default_path(url)),
            expires,
            secure: cookie.secure().unwrap_or(false),
        };

        self.cookies.retain(|existing| {
            !(existing.name == stored.name
                && existing.domain == stored.domain
                && existing.path == stored.path)
        });
        if !stored.expired(now()) {
            log::trace!("cookies: stored {} for {}", stored.name, stored.domain);
            self.cookies.push(stored);
        }
    }

    /// Assembles the `Cookie:` line for a request to `url`, or `None`
    /// when nothing matches. Longer paths come first.
    pub fn cookie_line(&mut self, url: &Url) -> Option<String> {
        let host = url.host()?.to_string();
        let path = url.path().to_string();
        let secure_transport = url.scheme() == "https";
        let at = now();
        self.cookies.retain(|c| !c.expired(at));

        let mut matches: Vec<&Stored> = self
            .cookies
            .iter()
            .filter(|c| c.domain_matches(&host))
            .filter(|c| c.path_matches(&path))
            .filter(|c| !c.secure || secure_transport)
            .collect();
        if matches.is_empty() {
            return None;
        }
        matches.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matches
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
