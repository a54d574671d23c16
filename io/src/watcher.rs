//! The descriptor watcher.
//!
//! A registered stream becomes a task on the core executor that awaits
//! readiness and performs one best-effort burst at a time. The registry
//! gives each registration a key; removing the key cancels the task,
//! which also drops (and thereby closes) its half of the stream.

use crate::EventLoop;
use async_executor::Task;
use futures_lite::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use larkspur_chain::{Key, Registry};
use std::cell::RefCell;
use std::rc::Rc;

const READ_CHUNK: usize = 16 * 1024;

/// What a read burst produced.
#[derive(Debug)]
pub enum IoEvent {
    /// Bytes arrived.
    Data(Vec<u8>),
    /// Orderly end of stream.
    End,
    /// Read or write error; the stream is dead.
    Abort(std::io::Error),
}

/// Registry of live descriptor tasks.
#[derive(Debug, Default)]
pub struct IoWatcher {
    tasks: Rc<RefCell<Registry<Option<Task<()>>>>>,
}

impl IoWatcher {
    /// Creates an empty watcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `stream` for reading. `sink` observes every burst; after
    /// [`IoEvent::End`] or [`IoEvent::Abort`] no further calls happen and
    /// the registration retires itself.
    pub fn watch_read<S>(
        &self,
        el: &EventLoop,
        mut stream: S,
        mut sink: impl FnMut(IoEvent) + 'static,
    ) -> Key
    where
        S: AsyncRead + Unpin + 'static,
    {
        let tasks = Rc::clone(&self.tasks);
        // Reserve the slot first so the task can retire itself by key.
        let key = tasks.borrow_mut().insert(None);
        let task = el.spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => {
                        sink(IoEvent::End);
                        break;
                    }
                    Ok(n) => sink(IoEvent::Data(buf[..n].to_vec())),
                    Err(err) => {
                        sink(IoEvent::Abort(err));
                        break;
                    }
                }
            }
            tasks.borrow_mut().remove(key);
        });
        if let Some(slot) = self.tasks.borrow_mut().lookup_mut(key) {
            *slot = Some(task);
        }
        key
    }

    /// Registers `stream` for writing and returns a handle for queueing
    /// bytes. The pending buffer drains on writability; closing the handle
    /// ends the task once the buffer is empty.
    pub fn watch_write<S>(
        &self,
        el: &EventLoop,
        mut stream: S,
        mut on_error: impl FnMut(std::io::Error) + 'static,
    ) -> (Key, WriteHandle)
    where
        S: AsyncWrite + Unpin + 'static,
    {
        let (tx, rx) = async_channel::unbounded::<Vec<u8>>();
        let tasks = Rc::clone(&self.tasks);
        let key = tasks.borrow_mut().insert(None);
        let task = el.spawn(async move {
            while let Ok(pending) = rx.recv().await {
                if let Err(err) = stream.write_all(&pending).await {
                    on_error(err);
                    break;
                }
            }
            let _ = stream.flush().await;
            tasks.borrow_mut().remove(key);
        });
        if let Some(slot) = self.tasks.borrow_mut().lookup_mut(key) {
            *slot = Some(task);
        }
        (key, WriteHandle { tx })
    }

    /// Cancels a registration. The task is dropped, closing its stream.
    pub fn remove(&self, key: Key) {
        self.tasks.borrow_mut().remove(key);
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Whether no registrations are live.
    pub fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }
}

/// Queues bytes for a write registration.
#[derive(Debug, Clone)]
pub struct WriteHandle {
    tx: async_channel::Sender<Vec<u8>>,
}

impl WriteHandle {
    /// Appends bytes to the pending buffer.
    pub fn send(&self, bytes: Vec<u8>) {
        // Receiver gone means the stream already died; the error callback
        // has run.
        let _ = self.tx.try_send(bytes);
    }

    /// Signals that no more bytes will be queued.
    pub fn close(&self) {
        self.tx.close();
    }
}
