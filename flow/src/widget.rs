//! The widget capability set and its sizing vocabulary.

use std::cell::RefCell;
use std::rc::Rc;

bitflags::bitflags! {
    /// Invalidation and lifecycle bits of a widget.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WidgetFlags: u8 {
        /// The size request is stale.
        const NEEDS_RESIZE = 1 << 0;
        /// The intrinsic extremes are stale.
        const EXTREMES_CHANGED = 1 << 1;
        /// The widget must be re-allocated even at the same rectangle.
        const NEEDS_ALLOCATE = 1 << 2;
        /// Queued in the layout's resize list.
        const RESIZE_QUEUED = 1 << 3;
        /// Queued with stale extremes.
        const EXTREMES_QUEUED = 1 << 4;
        /// The widget has been allocated at least once.
        const WAS_ALLOCATED = 1 << 5;
    }
}

/// A widget's desired size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requisition {
    /// Width.
    pub width: i32,
    /// Ascent above the baseline.
    pub ascent: i32,
    /// Descent below the baseline.
    pub descent: i32,
}

impl Requisition {
    /// Total height.
    pub fn height(&self) -> i32 {
        self.ascent + self.descent
    }
}

/// Intrinsic minimum and maximum content widths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extremes {
    /// Narrowest the content can get.
    pub min_width: i32,
    /// Width at which the content stops benefiting.
    pub max_width: i32,
    /// Minimum before percentage adjustments.
    pub min_width_intrinsic: i32,
    /// Maximum before percentage adjustments.
    pub max_width_intrinsic: i32,
    /// Width used to resolve percentage children.
    pub adjustment_width: i32,
}

/// A final rectangle assigned by the container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub width: i32,
    /// Ascent of the baseline within the rectangle.
    pub ascent: i32,
    /// Descent below the baseline.
    pub descent: i32,
}

impl Allocation {
    /// Total height.
    pub fn height(&self) -> i32 {
        self.ascent + self.descent
    }
}

/// Where widgets draw. The toolkit binding implements this over its
/// drawing surface; tests collect operations.
pub trait Painter {
    /// Draws `text` with its baseline at (`x`, `y`).
    fn draw_text(&mut self, x: i32, y: i32, text: &str);

    /// Draws an image buffer's current contents.
    fn draw_image(&mut self, _x: i32, _y: i32, _width: i32, _height: i32) {}
}

/// Common widget state, embedded in every implementation.
#[derive(Debug, Default)]
pub struct WidgetBase {
    /// Invalidation flags; the layout maintains these.
    pub flags: WidgetFlags,
    /// The current allocation, once assigned.
    pub allocation: Option<Allocation>,
    /// Memoized size request, keyed on the reference positions it was
    /// computed against.
    pub requisition_cache: Option<(Vec<i32>, Requisition)>,
    /// Memoized extremes.
    pub extremes_cache: Option<Extremes>,
}

/// The widget capability set.
///
/// Concrete widgets (textblock, image) implement these; containers call
/// them only through [`crate::Layout`], which maintains the invalidation
/// flags and the memoization around them.
pub trait Widget {
    /// Shared state access.
    fn base(&self) -> &WidgetBase;

    /// Shared state access, mutable.
    fn base_mut(&mut self) -> &mut WidgetBase;

    /// Reference positions the size request depends on (container width,
    /// float positions). Equal keys may reuse the memoized requisition.
    fn reference_key(&self) -> Vec<i32> {
        Vec::new()
    }

    /// Computes the desired size.
    fn size_request_impl(&mut self, layout: &crate::Layout) -> Requisition;

    /// Computes intrinsic content width extremes.
    fn get_extremes_impl(&mut self, layout: &crate::Layout) -> Extremes;

    /// Accepts the final rectangle.
    fn size_allocate_impl(&mut self, layout: &crate::Layout, allocation: Allocation);

    /// Draws into `painter`.
    fn draw(&self, layout: &crate::Layout, painter: &mut dyn Painter);

    /// Pointer button event at widget coordinates. Returns whether it
    /// was consumed.
    fn button_event(&mut self, _x: i32, _y: i32, _pressed: bool) -> bool {
        false
    }

    /// Pointer motion event at widget coordinates.
    fn motion_event(&mut self, _x: i32, _y: i32) {}
}

/// Shared handle to a widget.
pub type WidgetRef = Rc<RefCell<dyn Widget>>;
