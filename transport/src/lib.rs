/*!
Transport backends: the pieces that turn a URL into a byte stream.

Two backends exist. The native HTTP backend speaks HTTP/1.1 over TCP;
everything else (and HTTPS, which the core deliberately does not
terminate itself) goes to an out-of-process helper daemon over the
tagged wire format in [`wire`].

Both backends produce into a chain: response bytes travel forward as
[`FetchMsg::Bytes`], completion as `End`/`Abort`; an `Abort` sent
backward by the consumer cancels the transfer and closes the socket.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod error;
mod helper;
mod http;
pub mod wire;

pub use error::{Error, Result};
pub use helper::{helper_server_for, HelperBackend, HelperEvent, HelperKeys};
pub use http::{CredentialSource, HttpBackend, HttpConfig, NoCredentials};

/// Messages travelling through a fetch chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMsg {
    /// A chunk of response bytes.
    Bytes(Vec<u8>),
    /// A human-readable status line for the location bar.
    Status(String),
}
