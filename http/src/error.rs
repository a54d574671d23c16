use thiserror::Error;

/// Concrete errors of the HTTP vocabulary crate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// [`std::io::Error`]
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The URL could not be parsed.
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    /// The URL has no host, but the operation needs one.
    #[error("URL {0} has no host")]
    HostMissing(String),

    /// The status line of a response head could not be parsed.
    #[error("invalid status line")]
    InvalidStatusLine,
}

/// This crate's result type.
pub type Result<T> = std::result::Result<T, Error>;
