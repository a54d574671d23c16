//! User preferences and the per-user state directory.
//!
//! Preferences load once at startup from the environment plus compiled
//! defaults; there is no hot-reload path. The state directory holds the
//! two files the core reads: the cookie policy and the helper daemon
//! keys. Both are created with safe defaults and tight permissions when
//! absent.

use larkspur_http::{RefererPolicy, Url};
use std::io;
use std::path::{Path, PathBuf};

/// Name of the cookie policy file in the state directory.
pub const COOKIE_POLICY_FILE: &str = "cookiesrc";
/// Name of the helper daemon key file in the state directory.
pub const HELPER_KEYS_FILE: &str = "helper_keys";

/// Browser-wide settings.
#[derive(Debug, Clone)]
pub struct Prefs {
    /// Proxy from `http_proxy`, when set.
    pub http_proxy: Option<Url>,
    /// Pre-encoded proxy credentials.
    pub http_proxy_auth_base64: Option<String>,
    /// Authority substrings that bypass the proxy.
    pub no_proxy: Vec<String>,
    /// Referer disclosure policy.
    pub http_referer: RefererPolicy,
    /// `Accept-Language` value.
    pub http_language: Option<String>,
    /// `User-Agent` value.
    pub http_user_agent: String,
    /// Declared size above which a fetch becomes a download offer.
    pub huge_file_threshold: u64,
    /// DNS worker threads.
    pub dns_workers: usize,
    /// Simultaneous connection ceiling.
    pub max_conns: usize,
    /// Per-user state directory.
    pub state_dir: PathBuf,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            http_proxy: None,
            http_proxy_auth_base64: None,
            no_proxy: Vec::new(),
            http_referer: RefererPolicy::Host,
            http_language: None,
            http_user_agent: concat!("Larkspur/", env!("CARGO_PKG_VERSION")).to_string(),
            huge_file_threshold: larkspur_cache::HUGE_FILE_THRESHOLD,
            dns_workers: 4,
            max_conns: larkspur_broker::DEFAULT_MAX_CONNS,
            state_dir: PathBuf::from(".larkspur"),
        }
    }
}

impl Prefs {
    /// Loads preferences from the environment (`http_proxy`, `HOME`).
    pub fn from_env() -> Self {
        let mut prefs = Prefs::default();
        if let Ok(proxy) = std::env::var("http_proxy") {
            if !proxy.is_empty() {
                match Url::parse(&proxy, None) {
                    Ok(url) => prefs.http_proxy = Some(url),
                    Err(err) => log::warn!("prefs: unusable http_proxy: {err}"),
                }
            }
        }
        if let Ok(home) = std::env::var("HOME") {
            prefs.state_dir = PathBuf::from(home).join(".larkspur");
        }
        prefs
    }

    /// Path of the cookie policy file.
    pub fn cookie_policy_path(&self) -> PathBuf {
        self.state_dir.join(COOKIE_POLICY_FILE)
    }

    /// Path of the helper daemon key file.
    pub fn helper_keys_path(&self) -> PathBuf {
        self.state_dir.join(HELPER_KEYS_FILE)
    }
}

/// Creates the state directory (mode 0700) when absent.
pub fn ensure_state_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir)
}

/// Reads a state file, creating it (mode 0600) with `default_contents`
/// when absent.
pub fn read_state_file(path: &Path, default_contents: &str) -> io::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            use std::io::Write;
            options.open(path)?.write_all(default_contents.as_bytes())?;
            Ok(default_contents.to_string())
        }
        Err(err) => Err(err),
    }
}
