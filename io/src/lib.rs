/*!
The single-threaded heart of the browser core: a local task executor with
deferred-call support, a watcher that turns descriptor readiness into
chain messages, and an asynchronous DNS resolver backed by a small pool
of blocking workers.

Everything here runs on one thread. Background work (DNS lookups, helper
processes) re-enters only through channels and sockets, so from the
core's point of view it is all just descriptors becoming ready.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod event_loop;
mod resolver;
mod watcher;

pub use async_executor::Task;
pub use event_loop::EventLoop;
pub use resolver::{ResolveError, Resolver};
pub use watcher::{IoEvent, IoWatcher, WriteHandle};
