/*!
Test support for the larkspur workspace: a `block_on` for driving
futures without a runtime, and a scripted in-memory transport that
stands in for a network socket.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod transport;

pub use futures_lite::future::block_on;
pub use transport::{TestTransport, TransportControl};
