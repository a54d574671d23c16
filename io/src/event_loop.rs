//! The core event loop.
//!
//! A thin wrapper around a [`LocalExecutor`]: single-threaded, so tasks
//! may hold `Rc` state across await points. Deferred calls run on the
//! *next* loop turn, which is how re-entrancy is broken throughout the
//! core (the cache's delayed dispatch, the deferred repush, the resize
//! idle all ride on this).

use async_executor::{LocalExecutor, Task};
use async_io::Timer;
use futures_lite::future;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

/// The single-threaded executor driving the core.
#[derive(Clone)]
pub struct EventLoop {
    ex: Rc<LocalExecutor<'static>>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop").finish_non_exhaustive()
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    /// Creates an idle loop.
    pub fn new() -> Self {
        Self {
            ex: Rc::new(LocalExecutor::new()),
        }
    }

    /// Spawns a task. The returned [`Task`] cancels on drop; call
    /// [`Task::detach`] to let it run to completion unsupervised.
    pub fn spawn<T: 'static>(&self, fut: impl Future<Output = T> + 'static) -> Task<T> {
        self.ex.spawn(fut)
    }

    /// Schedules `f` to run on the next loop turn.
    pub fn defer(&self, f: impl FnOnce() + 'static) {
        self.ex
            .spawn(async move {
                future::yield_now().await;
                f();
            })
            .detach();
    }

    /// Schedules `f` to run after `delay`.
    pub fn defer_after(&self, delay: Duration, f: impl FnOnce() + 'static) {
        self.ex
            .spawn(async move {
                Timer::after(delay).await;
                f();
            })
            .detach();
    }

    /// Drives the loop until `fut` completes.
    pub fn block_on<T>(&self, fut: impl Future<Output = T>) -> T {
        future::block_on(self.ex.run(fut))
    }

    /// Drives the loop until no spawned task can make further progress
    /// without external input. Test support.
    pub fn run_until_stalled(&self) {
        while self.ex.try_tick() {}
    }
}
