//! Out-of-flow management: floats and the reference areas they carve
//! out of their container.

use crate::layout::NodeId;

/// Which side a float clings to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatSide {
    /// Left edge of the container.
    Left,
    /// Right edge of the container.
    Right,
}

#[derive(Debug, Clone, Copy)]
struct Float {
    widget: Option<NodeId>,
    side: FloatSide,
    y: i32,
    width: i32,
    height: i32,
}

/// Per-container float bookkeeping.
///
/// Textblocks ask it how wide a line at a given vertical position may
/// be, and where a generated block starts; adding or resizing a float
/// reports the vertical position from which lines must rewrap.
#[derive(Debug, Default)]
pub struct FloatManager {
    floats: Vec<Float>,
    container_width: i32,
}

impl FloatManager {
    /// Creates a manager for a container of the given width.
    pub fn new(container_width: i32) -> Self {
        Self {
            floats: Vec::new(),
            container_width,
        }
    }

    /// The container width floats are placed against.
    pub fn container_width(&self) -> i32 {
        self.container_width
    }

    /// Updates the container width (on re-allocation).
    pub fn set_container_width(&mut self, width: i32) {
        self.container_width = width;
    }

    /// Places a float of the given size at vertical position `y`.
    /// Returns the index of the new float.
    pub fn add_float(
        &mut self,
        widget: Option<NodeId>,
        side: FloatSide,
        y: i32,
        width: i32,
        height: i32,
    ) -> usize {
        self.floats.push(Float {
            widget,
            side,
            y,
            width,
            height,
        });
        self.floats.len() - 1
    }

    /// Moves or resizes a float; returns the vertical position from
    /// which affected lines must rewrap.
    pub fn update_float(&mut self, index: usize, y: i32, width: i32, height: i32) -> i32 {
        let float = &mut self.floats[index];
        let rewrap_from = float.y.min(y);
        float.y = y;
        float.width = width;
        float.height = height;
        rewrap_from
    }

    /// The widget a float places, when it has one.
    pub fn float_widget(&self, index: usize) -> Option<NodeId> {
        self.floats.get(index).and_then(|f| f.widget)
    }

    fn covers(float: &Float, y: i32) -> bool {
        y >= float.y && y < float.y + float.height
    }

    /// Width reserved by left floats at vertical position `y`.
    pub fn left_border(&self, y: i32) -> i32 {
        self.floats
            .iter()
            .filter(|f| f.side == FloatSide::Left && Self::covers(f, y))
            .map(|f| f.width)
            .max()
            .unwrap_or(0)
    }

    /// Width reserved by right floats at vertical position `y`.
    pub fn right_border(&self, y: i32) -> i32 {
        self.floats
            .iter()
            .filter(|f| f.side == FloatSide::Right && Self::covers(f, y))
            .map(|f| f.width)
            .max()
            .unwrap_or(0)
    }

    /// Usable line width at vertical position `y`.
    pub fn available_width(&self, y: i32) -> i32 {
        (self.container_width - self.left_border(y) - self.right_border(y)).max(0)
    }

    /// Width available to a block generated at `y` (its reference area).
    pub fn generator_width(&self, y: i32) -> i32 {
        self.available_width(y)
    }

    /// Left x position of a block generated at `y`.
    pub fn generator_x(&self, y: i32) -> i32 {
        self.left_border(y)
    }

    /// Vertical position at which a float of `width` can first be placed
    /// at or below `y`: the first position where it fits beside the
    /// existing floats.
    pub fn generator_y(&self, y: i32, width: i32) -> i32 {
        let mut candidate = y;
        // Step past float edges until the width fits; bounded by the
        // number of floats.
        for _ in 0..=self.floats.len() {
            if self.available_width(candidate) >= width {
                return candidate;
            }
            let next_edge = self
                .floats
                .iter()
                .filter(|f| Self::covers(f, candidate))
                .map(|f| f.y + f.height)
                .min();
            match next_edge {
                Some(edge) if edge > candidate => candidate = edge,
                _ => break,
            }
        }
        candidate
    }

    /// Number of floats placed.
    pub fn len(&self) -> usize {
        self.floats.len()
    }

    /// Whether no floats are placed.
    pub fn is_empty(&self) -> bool {
        self.floats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn borders_follow_float_extents() {
        let mut mgr = FloatManager::new(200);
        mgr.add_float(None, FloatSide::Left, 0, 50, 100);
        mgr.add_float(None, FloatSide::Right, 40, 30, 20);

        assert_eq!(mgr.available_width(10), 150);
        assert_eq!(mgr.available_width(50), 120);
        assert_eq!(mgr.available_width(99), 150);
        assert_eq!(mgr.available_width(100), 200);
        assert_eq!(mgr.generator_x(10), 50);
        assert_eq!(mgr.generator_width(10), 150);
    }

    #[test]
    fn overlapping_same_side_floats_take_the_widest() {
        let mut mgr = FloatManager::new(200);
        mgr.add_float(None, FloatSide::Left, 0, 50, 50);
        mgr.add_float(None, FloatSide::Left, 20, 80, 50);
        assert_eq!(mgr.left_border(30), 80);
        assert_eq!(mgr.left_border(10), 50);
    }

    #[test]
    fn generator_y_skips_past_crowded_bands() {
        let mut mgr = FloatManager::new(100);
        mgr.add_float(None, FloatSide::Left, 0, 60, 40);
        mgr.add_float(None, FloatSide::Right, 0, 30, 60);
        // A 50-wide block cannot sit beside 60+30 of floats; the first
        // fit is below the left float at y=40 (only 30 reserved there).
        assert_eq!(mgr.generator_y(0, 50), 40);
        // After both floats end everything fits.
        assert_eq!(mgr.generator_y(0, 90), 60);
    }

    #[test]
    fn update_reports_rewrap_position() {
        let mut mgr = FloatManager::new(200);
        let idx = mgr.add_float(None, FloatSide::Left, 30, 50, 50);
        let rewrap = mgr.update_float(idx, 10, 50, 70);
        assert_eq!(rewrap, 10);
        assert_eq!(mgr.available_width(15), 150);
    }
}
