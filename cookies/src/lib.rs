/*!
Cookie handling for the browser core: the per-user control file deciding
which hosts may set cookies at all, and an in-memory jar for the ones that
may.

Persistence is out of scope here; the jar lives and dies with the process.
The *first-party* test (whether a response may offer cookies in the first
place) happens in the cache, before the jar is ever consulted.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod jar;
mod policy;

pub use jar::CookieJar;
pub use policy::{CookieAction, CookiePolicy};

/// Contents written to a fresh cookie control file.
pub const DEFAULT_POLICY_FILE: &str = "DEFAULT DENY\n";
