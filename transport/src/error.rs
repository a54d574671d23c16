use thiserror::Error;

/// Transport-level failures.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// [`std::io::Error`]
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The URL vocabulary rejected something.
    #[error(transparent)]
    Http(#[from] larkspur_http::Error),

    /// Hostname resolution failed.
    #[error(transparent)]
    Resolve(#[from] larkspur_io::ResolveError),

    /// Every resolved address refused the connection.
    #[error("cannot connect to {host}: {last_error}")]
    ConnectFailed {
        /// The host we tried to reach.
        host: String,
        /// The error from the last address tried.
        last_error: String,
    },

    /// The helper daemon is not reachable.
    #[error("helper daemon not running: {0}")]
    HelperDown(String),

    /// The helper key file is missing or malformed.
    #[error("helper key file unusable: {0}")]
    HelperKeys(String),

    /// The helper sent something the tokenizer cannot frame.
    #[error("malformed helper message: {0}")]
    HelperProtocol(String),

    /// No helper server handles this URL's scheme.
    #[error("no helper server for scheme {0:?}")]
    NoHelperServer(String),
}

/// This crate's result type.
pub type Result<T> = std::result::Result<T, Error>;
