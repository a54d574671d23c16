/*!
HTTP vocabulary for the browser core: the flagged URL value that travels
through the whole pipeline, response-head accumulation and field access,
status codes, and outgoing request assembly.

Header *parsing* here is deliberately forgiving in the ways real servers
require (folded continuation lines, stray carriage returns, status lines
from another era); request *assembly* is strict and canonical.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod error;
mod head;
mod request;
mod status;
mod url_value;

pub use error::{Error, Result};
pub use head::ResponseHead;
pub use request::{build_request, ProxyConfig, RefererPolicy, RequestParams};
pub use status::Status;
pub use url_value::{Url, UrlFlags};
