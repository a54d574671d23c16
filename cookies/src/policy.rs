//! The cookie control file.
//!
//! Each non-empty, non-comment line is `<domain> <action>`, where domain
//! is a hostname, a `.`-prefixed suffix, or `DEFAULT`, and action is one
//! of `ACCEPT`, `ACCEPT_SESSION`, `DENY`. The longest matching suffix
//! wins; `DEFAULT` is the fallback.

/// What to do with cookies from a matched host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieAction {
    /// Accept, including the expiry the server asked for.
    Accept,
    /// Accept for this session only: the expiry is discarded.
    AcceptSession,
    /// Refuse.
    Deny,
}

impl CookieAction {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("ACCEPT") {
            Some(CookieAction::Accept)
        } else if s.eq_ignore_ascii_case("ACCEPT_SESSION") {
            Some(CookieAction::AcceptSession)
        } else if s.eq_ignore_ascii_case("DENY") {
            Some(CookieAction::Deny)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    domain: String,
    action: CookieAction,
}

/// Parsed cookie control rules.
#[derive(Debug, Clone)]
pub struct CookiePolicy {
    rules: Vec<Rule>,
    default: CookieAction,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: CookieAction::Deny,
        }
    }
}

impl CookiePolicy {
    /// Parses the control file text. Malformed lines are skipped with a
    /// warning rather than failing the whole file.
    pub fn parse(text: &str) -> Self {
        let mut policy = CookiePolicy::default();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_ascii_whitespace();
            let (Some(domain), Some(action)) = (parts.next(), parts.next()) else {
                log::warn!("cookie policy: malformed rule {line:?}");
                continue;
            };
            let Some(action) = CookieAction::parse(action) else {
                log::warn!("cookie policy: unknown action in {line:?}");
                continue;
            };
            if domain.eq_ignore_ascii_case("DEFAULT") {
                policy.default = action;
            } else {
                policy.rules.push(Rule {
                    domain: domain.to_ascii_lowercase(),
                    action,
                });
            }
        }
        policy
    }

    /// Whether any rule (or the default) allows cookies at all. When
    /// everything is DENY the whole subsystem can stay disabled.
    pub fn enables_cookies(&self) -> bool {
        self.default != CookieAction::Deny
            || self.rules.iter().any(|r| r.action != CookieAction::Deny)
    }

    /// The action for `host`: longest matching rule wins.
    pub fn action_for(&self, host: &str) -> CookieAction {
        let host = host.to_ascii_lowercase();
        let mut best: Option<&Rule> = None;
        for rule in &self.rules {
            let matched = if let Some(suffix) = rule.domain.strip_prefix('.') {
                host == suffix || host.ends_with(&rule.domain)
            } else {
                host == rule.domain
            };
            if matched && best.is_none_or(|b| rule.domain.len() > b.domain.len()) {
                best = Some(rule);
            }
        }
        best.map(|r| r.action).unwrap_or(self.default)
    }
}
