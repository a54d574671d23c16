//! The widget tree and the queued resize protocol.
//!
//! Widgets live in an arena; children refer to each other by [`NodeId`]
//! and look nodes up on use, so there are no back pointers to keep
//! consistent. `queue_resize` walks from the invalidated widget up to
//! the first ancestor that is already queued; the idle phase drains the
//! queue leaves-first and then re-requests and re-allocates from the
//! root in one sweep.

use crate::widget::{Allocation, Extremes, Requisition, WidgetFlags, WidgetRef};
use std::cell::RefCell;

/// Index of a widget in the layout arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Clone)]
struct Node {
    widget: WidgetRef,
    parent: Option<NodeId>,
    depth: usize,
}

/// The widget tree and resize queue.
pub struct Layout {
    nodes: RefCell<Vec<Node>>,
    root: RefCell<Option<NodeId>>,
    queue: RefCell<Vec<NodeId>>,
    viewport_width: RefCell<i32>,
}

impl std::fmt::Debug for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layout")
            .field("nodes", &self.nodes.borrow().len())
            .field("queued", &self.queue.borrow().len())
            .finish()
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self::new(800)
    }
}

impl Layout {
    /// Creates a layout for a viewport of the given width.
    pub fn new(viewport_width: i32) -> Self {
        Self {
            nodes: RefCell::new(Vec::new()),
            root: RefCell::new(None),
            queue: RefCell::new(Vec::new()),
            viewport_width: RefCell::new(viewport_width),
        }
    }

    /// The current viewport width.
    pub fn viewport_width(&self) -> i32 {
        *self.viewport_width.borrow()
    }

    /// Changes the viewport width and invalidates the root.
    pub fn set_viewport_width(&self, width: i32) {
        *self.viewport_width.borrow_mut() = width;
        if let Some(root) = *self.root.borrow() {
            self.queue_resize(root, false);
        }
    }

    /// Adds a widget under `parent` (`None` for the root).
    pub fn add_widget(&self, parent: Option<NodeId>, widget: WidgetRef) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let depth = parent.map_or(0, |p| nodes[p.0].depth + 1);
        nodes.push(Node {
            widget,
            parent,
            depth,
        });
        let id = NodeId(nodes.len() - 1);
        drop(nodes);
        if parent.is_none() {
            *self.root.borrow_mut() = Some(id);
        }
        // New widgets start fully invalid.
        self.with_flags(id, |flags| {
            *flags |= WidgetFlags::NEEDS_RESIZE | WidgetFlags::EXTREMES_CHANGED;
        });
        id
    }

    /// The widget stored at `id`.
    pub fn widget(&self, id: NodeId) -> WidgetRef {
        self.nodes.borrow()[id.0].widget.clone()
    }

    /// The root node, once one was added.
    pub fn root(&self) -> Option<NodeId> {
        *self.root.borrow()
    }

    fn with_flags<R>(&self, id: NodeId, f: impl FnOnce(&mut WidgetFlags) -> R) -> R {
        let widget = self.widget(id);
        let mut widget = widget.borrow_mut();
        f(&mut widget.base_mut().flags)
    }

    fn flags(&self, id: NodeId) -> WidgetFlags {
        self.widget(id).borrow().base().flags
    }

    /// Marks `id` (and the ancestor chain) as needing resize. The walk
    /// stops at the first ancestor that is already queued, because
    /// everything above it is queued transitively.
    pub fn queue_resize(&self, id: NodeId, extremes_changed: bool) {
        let mut current = Some(id);
        while let Some(node) = current {
            let already_queued = self.flags(node).contains(WidgetFlags::RESIZE_QUEUED);
            self.with_flags(node, |flags| {
                *flags |= WidgetFlags::NEEDS_RESIZE | WidgetFlags::RESIZE_QUEUED;
                if extremes_changed {
                    *flags |= WidgetFlags::EXTREMES_CHANGED | WidgetFlags::EXTREMES_QUEUED;
                }
            });
            if already_queued {
                break;
            }
            self.queue.borrow_mut().push(node);
            current = self.nodes.borrow()[node.0].parent;
        }
    }

    /// Whether a resize idle is pending.
    pub fn resize_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    /// The idle phase: drains the queue leaves-first, then performs one
    /// request/allocate sweep from the root.
    pub fn resize_idle(&self) {
        let mut queued = std::mem::take(&mut *self.queue.borrow_mut());
        queued.sort_by_key(|id| std::cmp::Reverse(self.nodes.borrow()[id.0].depth));
        for id in queued {
            self.with_flags(id, |flags| {
                *flags -= WidgetFlags::RESIZE_QUEUED | WidgetFlags::EXTREMES_QUEUED;
            });
        }
        let Some(root) = *self.root.borrow() else {
            return;
        };
        let requisition = self.size_request(root);
        self.size_allocate(
            root,
            Allocation {
                x: 0,
                y: 0,
                width: self.viewport_width(),
                ascent: requisition.ascent,
                descent: requisition.descent,
            },
        );
    }

    /// Wrapper for the widget's size request: memoized on the reference
    /// key, invalidated by the resize flags.
    pub fn size_request(&self, id: NodeId) -> Requisition {
        let widget = self.widget(id);
        let mut widget = widget.borrow_mut();
        let key = widget.reference_key();
        let stale = widget.base().flags.contains(WidgetFlags::NEEDS_RESIZE)
            || widget
                .base()
                .requisition_cache
                .as_ref()
                .is_none_or(|(cached_key, _)| *cached_key != key);
        if stale {
            let requisition = widget.size_request_impl(self);
            let base = widget.base_mut();
            base.requisition_cache = Some((key, requisition));
            base.flags -= WidgetFlags::NEEDS_RESIZE;
            base.flags |= WidgetFlags::NEEDS_ALLOCATE;
        }
        widget.base().requisition_cache.as_ref().unwrap().1
    }

    /// Wrapper for the widget's extremes: memoized, invalidated by
    /// `EXTREMES_CHANGED`.
    pub fn get_extremes(&self, id: NodeId) -> Extremes {
        let widget = self.widget(id);
        let mut widget = widget.borrow_mut();
        let stale = widget.base().flags.contains(WidgetFlags::EXTREMES_CHANGED)
            || widget.base().extremes_cache.is_none();
        if stale {
            let extremes = widget.get_extremes_impl(self);
            let base = widget.base_mut();
            base.extremes_cache = Some(extremes);
            base.flags -= WidgetFlags::EXTREMES_CHANGED;
        }
        widget.base().extremes_cache.unwrap()
    }

    /// Wrapper for allocation: skipped when the rectangle is unchanged
    /// and nothing demanded a fresh pass.
    pub fn size_allocate(&self, id: NodeId, allocation: Allocation) {
        let widget = self.widget(id);
        let mut widget = widget.borrow_mut();
        let base = widget.base();
        let unchanged = base.allocation == Some(allocation)
            && base.flags.contains(WidgetFlags::WAS_ALLOCATED)
            && !base.flags.contains(WidgetFlags::NEEDS_ALLOCATE);
        if unchanged {
            return;
        }
        widget.size_allocate_impl(self, allocation);
        let base = widget.base_mut();
        base.allocation = Some(allocation);
        base.flags |= WidgetFlags::WAS_ALLOCATED;
        base.flags -= WidgetFlags::NEEDS_ALLOCATE;
    }
}
