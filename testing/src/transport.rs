//! A scripted in-memory duplex transport.
//!
//! The test holds a [`TransportControl`] and scripts the "network" side:
//! feeding read chunks, ending or failing the stream, and inspecting what
//! the code under test wrote. Each fed chunk is delivered as its own read,
//! so arrival granularity is under test control.

use futures_lite::io::{AsyncRead, AsyncWrite};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

#[derive(Debug, Default)]
struct Shared {
    incoming: VecDeque<Vec<u8>>,
    read_closed: bool,
    read_error: Option<io::Error>,
    written: Vec<u8>,
    write_closed: bool,
    waker: Option<Waker>,
}

impl Shared {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

/// The transport half handed to the code under test.
#[derive(Debug)]
pub struct TestTransport {
    shared: Rc<RefCell<Shared>>,
}

/// The scripting half kept by the test.
#[derive(Debug, Clone)]
pub struct TransportControl {
    shared: Rc<RefCell<Shared>>,
}

impl TestTransport {
    /// Creates a connected transport/control pair.
    pub fn new() -> (TestTransport, TransportControl) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (
            TestTransport {
                shared: Rc::clone(&shared),
            },
            TransportControl { shared },
        )
    }
}

impl TransportControl {
    /// Queues `bytes` to arrive as one read.
    pub fn feed(&self, bytes: &[u8]) {
        let mut shared = self.shared.borrow_mut();
        shared.incoming.push_back(bytes.to_vec());
        shared.wake();
    }

    /// Ends the read side: after queued chunks drain, reads return EOF.
    pub fn close_read(&self) {
        let mut shared = self.shared.borrow_mut();
        shared.read_closed = true;
        shared.wake();
    }

    /// Fails the next read with `error`.
    pub fn fail_read(&self, error: io::Error) {
        let mut shared = self.shared.borrow_mut();
        shared.read_error = Some(error);
        shared.wake();
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.shared.borrow().written.clone()
    }

    /// Takes and clears the written bytes.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.borrow_mut().written)
    }

    /// Whether the code under test closed its write side.
    pub fn is_write_closed(&self) -> bool {
        self.shared.borrow().write_closed
    }
}

impl AsyncRead for TestTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.shared.borrow_mut();
        if let Some(mut chunk) = shared.incoming.pop_front() {
            if chunk.len() > buf.len() {
                let rest = chunk.split_off(buf.len());
                shared.incoming.push_front(rest);
            }
            buf[..chunk.len()].copy_from_slice(&chunk);
            return Poll::Ready(Ok(chunk.len()));
        }
        if let Some(error) = shared.read_error.take() {
            return Poll::Ready(Err(error));
        }
        if shared.read_closed {
            return Poll::Ready(Ok(0));
        }
        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for TestTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut shared = self.shared.borrow_mut();
        if shared.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        shared.written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shared.borrow_mut().write_closed = true;
        Poll::Ready(Ok(()))
    }
}
