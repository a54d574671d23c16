//! Asynchronous hostname resolution.
//!
//! Lookups run on a small pool of blocking worker threads; the core only
//! ever awaits a channel. Each hostname is resolved at most once at a
//! time: concurrent requests for the same name coalesce onto the single
//! in-flight query, and completed lookups populate a per-host cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::rc::Rc;
use std::thread;
use thiserror::Error;

/// Why a lookup failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResolveError {
    /// The resolver library failed or the name does not exist.
    #[error("cannot resolve {host}: {reason}")]
    Failed {
        /// The hostname.
        host: String,
        /// The underlying error text.
        reason: String,
    },
    /// The resolver is shutting down.
    #[error("resolver shut down")]
    Shutdown,
}

type LookupResult = Result<Rc<Vec<IpAddr>>, ResolveError>;
type WireResult = Result<Vec<IpAddr>, ResolveError>;

struct Job {
    host: String,
    reply: async_channel::Sender<WireResult>,
}

struct State {
    cache: HashMap<String, Rc<Vec<IpAddr>>>,
    // Waiters for hostnames with a query in flight.
    pending: HashMap<String, Vec<async_channel::Sender<LookupResult>>>,
}

/// Handle to the resolver. Clones share the cache and the worker pool.
#[derive(Clone)]
pub struct Resolver {
    state: Rc<RefCell<State>>,
    jobs: async_channel::Sender<Job>,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Resolver")
            .field("cached_hosts", &state.cache.len())
            .field("pending_hosts", &state.pending.len())
            .finish()
    }
}

fn blocking_lookup(host: &str) -> WireResult {
    // Port is irrelevant; only the addresses are kept.
    match (host, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let mut ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
            ips.dedup();
            if ips.is_empty() {
                Err(ResolveError::Failed {
                    host: host.to_string(),
                    reason: "no addresses".to_string(),
                })
            } else {
                Ok(ips)
            }
        }
        Err(err) => Err(ResolveError::Failed {
            host: host.to_string(),
            reason: err.to_string(),
        }),
    }
}

impl Resolver {
    /// Starts a resolver with `workers` background threads. Requests
    /// beyond the pool wait in FIFO order.
    pub fn new(workers: usize) -> Self {
        let (jobs, job_rx) = async_channel::unbounded::<Job>();
        for n in 0..workers.max(1) {
            let rx = job_rx.clone();
            thread::Builder::new()
                .name(format!("dns-{n}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv_blocking() {
                        let result = blocking_lookup(&job.host);
                        // A dropped reply just means nobody cares anymore.
                        let _ = job.reply.send_blocking(result);
                    }
                })
                .expect("spawning resolver worker");
        }
        Self {
            state: Rc::new(RefCell::new(State {
                cache: HashMap::new(),
                pending: HashMap::new(),
            })),
            jobs,
        }
    }

    /// Inserts addresses for `host` without a lookup. Test support, and
    /// the hook for a hosts-file layer.
    pub fn prime(&self, host: &str, addrs: Vec<IpAddr>) {
        self.state
            .borrow_mut()
            .cache
            .insert(host.to_string(), Rc::new(addrs));
    }

    /// Resolves `host`, returning immediately on a cache hit.
    pub async fn resolve(&self, host: &str) -> LookupResult {
        if let Some(hit) = self.state.borrow().cache.get(host) {
            return Ok(Rc::clone(hit));
        }

        // Coalesce onto an in-flight query when there is one.
        let waiter = {
            let mut state = self.state.borrow_mut();
            if let Some(waiters) = state.pending.get_mut(host) {
                let (tx, rx) = async_channel::bounded(1);
                waiters.push(tx);
                Some(rx)
            } else {
                state.pending.insert(host.to_string(), Vec::new());
                None
            }
        };
        if let Some(rx) = waiter {
            return rx.recv().await.map_err(|_| ResolveError::Shutdown)?;
        }

        // We own the query for this host.
        let (reply_tx, reply_rx) = async_channel::bounded(1);
        let job = Job {
            host: host.to_string(),
            reply: reply_tx,
        };
        if self.jobs.send(job).await.is_err() {
            self.state.borrow_mut().pending.remove(host);
            return Err(ResolveError::Shutdown);
        }
        let result: LookupResult = match reply_rx.recv().await {
            Ok(Ok(ips)) => {
                let ips = Rc::new(ips);
                self.state
                    .borrow_mut()
                    .cache
                    .insert(host.to_string(), Rc::clone(&ips));
                Ok(ips)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ResolveError::Shutdown),
        };

        let waiters = self
            .state
            .borrow_mut()
            .pending
            .remove(host)
            .unwrap_or_default();
        log::debug!(
            "resolved {host}: {} ({} waiting)",
            match &result {
                Ok(ips) => format!("{} addresses", ips.len()),
                Err(err) => err.to_string(),
            },
            waiters.len()
        );
        for waiter in waiters {
            let _ = waiter.try_send(result.clone());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventLoop;
    use std::net::Ipv4Addr;

    #[test]
    fn cache_hit_returns_primed_addresses() {
        let el = EventLoop::new();
        let resolver = Resolver::new(1);
        let localhost: IpAddr = Ipv4Addr::LOCALHOST.into();
        resolver.prime("prime.test", vec![localhost]);
        let got = el.block_on(resolver.resolve("prime.test")).unwrap();
        assert_eq!(*got, vec![localhost]);
    }

    #[test]
    fn concurrent_requests_coalesce_to_one_result() {
        let el = EventLoop::new();
        let resolver = Resolver::new(2);
        let localhost: IpAddr = Ipv4Addr::LOCALHOST.into();
        resolver.prime("multi.test", vec![localhost]);

        let r1 = resolver.clone();
        let r2 = resolver.clone();
        let a = el.spawn(async move { r1.resolve("multi.test").await });
        let b = el.spawn(async move { r2.resolve("multi.test").await });
        let (ra, rb) = el.block_on(async { (a.await, b.await) });
        assert_eq!(*ra.unwrap(), *rb.unwrap());
    }

    #[test]
    fn failure_reaches_all_waiters() {
        let el = EventLoop::new();
        let resolver = Resolver::new(1);
        // Guaranteed-invalid name per RFC 6761.
        let result = el.block_on(resolver.resolve("no-such-host.invalid"));
        assert!(result.is_err());
        // A failed lookup is not cached; the next attempt retries.
        assert!(resolver.state.borrow().cache.is_empty());
        assert!(resolver.state.borrow().pending.is_empty());
    }
}
