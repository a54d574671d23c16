/*!
The concomitant control chain: a typed, bidirectional message graph that
connects the stages of a fetch pipeline.

A [`ChainLink`] joins a producer to a consumer. Data flows in the *forward*
direction; control and status flow *backward*. Each direction carries a
callback, a branch tag (a small integer that lets one module multiplex
several incoming chains), and a handle to the peer link. A link stays
operative until a terminal operation ([`ChainOp::End`] or
[`ChainOp::Abort`]) runs through it; after that, further sends are
silently dropped, which makes terminal operations idempotent.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;

mod registry;
pub use registry::{Key, Registry};

bitflags::bitflags! {
    /// Lifecycle flags of a chain link. Terminal flags are monotonic.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChainFlags: u8 {
        /// The consumer asked the producer to pause.
        const STOPPED = 1 << 0;
        /// The producer signalled normal completion.
        const ENDED = 1 << 1;
        /// The producer or consumer signalled error or cancellation.
        const ABORTED = 1 << 2;
    }
}

impl ChainFlags {
    fn terminal() -> Self {
        ChainFlags::ENDED | ChainFlags::ABORTED
    }
}

/// Operations a chain can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOp {
    /// Establish the stream; carries initial parameters.
    Start,
    /// Deliver a chunk of data.
    Send,
    /// Ask the producer to pause.
    Stop,
    /// Normal completion.
    End,
    /// Error or cancellation.
    Abort,
}

/// Direction of a message relative to the data flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Producer to consumer.
    Forward,
    /// Consumer to producer.
    Backward,
}

/// A data chunk passed along a chain, with an operation-specific code.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DataBuf {
    /// The payload bytes.
    pub buf: Vec<u8>,
    /// Free-form code, interpreted per stage.
    pub code: i32,
}

impl DataBuf {
    /// Wraps `buf` with a code of zero.
    pub fn new(buf: Vec<u8>) -> Self {
        Self { buf, code: 0 }
    }
}

/// An event delivered to a chain callback.
pub struct ChainEvent<M> {
    /// The operation.
    pub op: ChainOp,
    /// Branch tag registered for this direction at link time.
    pub branch: u8,
    /// The direction the message travelled.
    pub dir: Direction,
    /// The receiving side's own link, for continuing the chain.
    pub link: ChainLink<M>,
    /// Payload, when the operation carries one.
    pub data: Option<M>,
}

type ChainFn<M> = Rc<dyn Fn(ChainEvent<M>)>;

struct Edge<M> {
    callback: ChainFn<M>,
    peer: ChainLink<M>,
    branch: u8,
}

impl<M> Clone for Edge<M> {
    fn clone(&self) -> Self {
        Self {
            callback: Rc::clone(&self.callback),
            peer: self.peer.clone(),
            branch: self.branch,
        }
    }
}

struct Shared<M> {
    local_key: Cell<u32>,
    flags: Cell<ChainFlags>,
    fwd: RefCell<Option<Edge<M>>>,
    bck: RefCell<Option<Edge<M>>>,
}

/// One node of a chain.
///
/// Links are cheap handles; cloning shares the underlying node.
pub struct ChainLink<M>(Rc<Shared<M>>);

impl<M> Clone for ChainLink<M> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<M> Debug for ChainLink<M> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLink")
            .field("local_key", &self.0.local_key.get())
            .field("flags", &self.0.flags.get())
            .field("fwd", &self.0.fwd.borrow().is_some())
            .field("bck", &self.0.bck.borrow().is_some())
            .finish()
    }
}

impl<M> Default for ChainLink<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ChainLink<M> {
    /// Creates an unconnected link.
    pub fn new() -> Self {
        Self(Rc::new(Shared {
            local_key: Cell::new(0),
            flags: Cell::new(ChainFlags::empty()),
            fwd: RefCell::new(None),
            bck: RefCell::new(None),
        }))
    }

    /// Creates a new link from the module owning `self` to a peer module.
    ///
    /// The link from `self` to the peer has direction `dir` (the main data
    /// flow names the forward direction). `own_func` receives messages
    /// arriving at `self`'s module; `peer_func` receives messages arriving
    /// at the peer. `to_peer_branch` tags messages arriving at the peer,
    /// `to_own_branch` tags messages arriving back here. Returns the peer's
    /// link.
    pub fn link_new(
        &self,
        dir: Direction,
        own_func: ChainFn<M>,
        peer_func: ChainFn<M>,
        to_peer_branch: u8,
        to_own_branch: u8,
    ) -> ChainLink<M> {
        let new_link = ChainLink::new();
        match dir {
            Direction::Backward => {
                *new_link.0.fwd.borrow_mut() = Some(Edge {
                    callback: own_func,
                    peer: self.clone(),
                    branch: to_own_branch,
                });
                *self.0.bck.borrow_mut() = Some(Edge {
                    callback: peer_func,
                    peer: new_link.clone(),
                    branch: to_peer_branch,
                });
            }
            Direction::Forward => {
                *new_link.0.bck.borrow_mut() = Some(Edge {
                    callback: own_func,
                    peer: self.clone(),
                    branch: to_own_branch,
                });
                *self.0.fwd.borrow_mut() = Some(Edge {
                    callback: peer_func,
                    peer: new_link.clone(),
                    branch: to_peer_branch,
                });
            }
        }
        new_link
    }

    /// Clears one side of this link. The peer keeps its own edges.
    pub fn unlink(&self, dir: Direction) {
        match dir {
            Direction::Forward => *self.0.fwd.borrow_mut() = None,
            Direction::Backward => *self.0.bck.borrow_mut() = None,
        }
    }

    /// An opaque key for the module owning this link.
    pub fn local_key(&self) -> u32 {
        self.0.local_key.get()
    }

    /// Sets the opaque key for the module owning this link.
    pub fn set_local_key(&self, key: u32) {
        self.0.local_key.set(key);
    }

    /// Current lifecycle flags.
    pub fn flags(&self) -> ChainFlags {
        self.0.flags.get()
    }

    /// Whether the chain is still operative. Logs a warning when it is not,
    /// so that stray calls on finished chains are visible.
    pub fn check(&self, caller: &str) -> bool {
        let flags = self.0.flags.get();
        if flags.intersects(ChainFlags::terminal()) {
            log::warn!("{caller}: call on already finished chain, flags={flags:?}");
            false
        } else {
            true
        }
    }

    fn send(&self, dir: Direction, op: ChainOp, data: Option<M>) -> bool {
        if self.0.flags.get().intersects(ChainFlags::terminal()) {
            return false;
        }
        let cell = match dir {
            Direction::Forward => &self.0.fwd,
            Direction::Backward => &self.0.bck,
        };
        let Some(edge) = cell.borrow().clone() else {
            return false;
        };
        // Flag the link before invoking the callback, so a re-entrant call
        // observes completion.
        match op {
            ChainOp::End => self.0.flags.set(self.0.flags.get() | ChainFlags::ENDED),
            ChainOp::Abort => self.0.flags.set(self.0.flags.get() | ChainFlags::ABORTED),
            ChainOp::Stop => self.0.flags.set(self.0.flags.get() | ChainFlags::STOPPED),
            _ => {}
        }
        (edge.callback)(ChainEvent {
            op,
            branch: edge.branch,
            dir,
            link: edge.peer,
            data,
        });
        true
    }

    /// Issues the forward callback. Returns whether the callback ran.
    pub fn send_forward(&self, op: ChainOp, data: Option<M>) -> bool {
        self.send(Direction::Forward, op, data)
    }

    /// Issues the backward callback. Returns whether the callback ran.
    pub fn send_backward(&self, op: ChainOp, data: Option<M>) -> bool {
        self.send(Direction::Backward, op, data)
    }

    /// Issues the backward callback and then the forward one, preserving
    /// the producer-cleans-up-after-consumer order for `Abort` and `Stop`.
    pub fn send_backward_forward(&self, op: ChainOp, data: Option<M>) -> bool
    where
        M: Clone,
    {
        if !self.send(Direction::Backward, op, data.clone()) {
            return false;
        }
        // Clear the just-set terminal flag so the forward side still fires.
        match op {
            ChainOp::End => self.0.flags.set(self.0.flags.get() - ChainFlags::ENDED),
            ChainOp::Abort => self.0.flags.set(self.0.flags.get() - ChainFlags::ABORTED),
            _ => {}
        }
        self.send(Direction::Forward, op, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_callback(
        log: Rc<RefCell<Vec<(ChainOp, Direction, u8)>>>,
    ) -> ChainFn<DataBuf> {
        Rc::new(move |ev: ChainEvent<DataBuf>| {
            log.borrow_mut().push((ev.op, ev.dir, ev.branch));
        })
    }

    #[test]
    fn terminal_ops_are_idempotent() {
        for op in [ChainOp::End, ChainOp::Abort] {
            let log = Rc::new(RefCell::new(Vec::new()));
            let a = ChainLink::<DataBuf>::new();
            let _b = a.link_new(
                Direction::Forward,
                counting_callback(Rc::clone(&log)),
                counting_callback(Rc::clone(&log)),
                1,
                1,
            );
            assert!(a.send_forward(op, None));
            assert!(!a.send_forward(op, None));
            assert_eq!(log.borrow().len(), 1);
        }
    }

    #[test]
    fn send_after_end_is_dropped() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = ChainLink::<DataBuf>::new();
        let _b = a.link_new(
            Direction::Forward,
            counting_callback(Rc::clone(&log)),
            counting_callback(Rc::clone(&log)),
            1,
            1,
        );
        assert!(a.send_forward(ChainOp::Send, Some(DataBuf::new(b"x".to_vec()))));
        assert!(a.send_forward(ChainOp::End, None));
        assert!(!a.send_forward(ChainOp::Send, Some(DataBuf::new(b"y".to_vec()))));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn backward_fires_before_forward() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let a = ChainLink::<DataBuf>::new();
        let o1 = Rc::clone(&order);
        let o2 = Rc::clone(&order);
        let _b = a.link_new(
            Direction::Forward,
            Rc::new(move |ev| o1.borrow_mut().push(ev.dir)),
            Rc::new(move |ev| o2.borrow_mut().push(ev.dir)),
            1,
            2,
        );
        assert!(a.send_backward_forward(ChainOp::Abort, None));
        assert_eq!(
            &*order.borrow(),
            &[Direction::Backward, Direction::Forward]
        );
        // The link is terminal afterwards.
        assert!(!a.send_forward(ChainOp::Send, None));
    }

    #[test]
    fn unlink_clears_one_side() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = ChainLink::<DataBuf>::new();
        let _b = a.link_new(
            Direction::Forward,
            counting_callback(Rc::clone(&log)),
            counting_callback(Rc::clone(&log)),
            1,
            1,
        );
        a.unlink(Direction::Forward);
        assert!(!a.send_forward(ChainOp::Send, None));
        assert!(a.send_backward(ChainOp::Stop, None));
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn event_carries_branch_tag() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let a = ChainLink::<DataBuf>::new();
        let _b = a.link_new(
            Direction::Forward,
            counting_callback(Rc::clone(&log)),
            counting_callback(Rc::clone(&log)),
            7,
            3,
        );
        a.send_forward(ChainOp::Start, None);
        a.send_backward(ChainOp::Stop, None);
        assert_eq!(
            &*log.borrow(),
            &[
                (ChainOp::Start, Direction::Forward, 7),
                (ChainOp::Stop, Direction::Backward, 3),
            ]
        );
    }
}
