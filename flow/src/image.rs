//! The inline image widget.

use crate::imgbuf::Imgbuf;
use crate::layout::Layout;
use crate::widget::{Allocation, Extremes, Painter, Requisition, Widget, WidgetBase};

/// An image in the flow: a buffer once decoding delivered one, alt text
/// until then.
pub struct Image {
    base: WidgetBase,
    buf: Option<Imgbuf>,
    alt: String,
    /// Size declared by markup, used before (and instead of) the buffer.
    declared: Option<(i32, i32)>,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("has_buf", &self.buf.is_some())
            .field("alt", &self.alt)
            .field("declared", &self.declared)
            .finish()
    }
}

impl Image {
    /// Creates an image widget showing `alt` until pixels arrive.
    pub fn new(alt: &str) -> Self {
        Self {
            base: WidgetBase::default(),
            buf: None,
            alt: alt.to_string(),
            declared: None,
        }
    }

    /// Sets the width/height the markup declared.
    pub fn set_declared_size(&mut self, width: i32, height: i32) {
        self.declared = Some((width, height));
    }

    /// Attaches the decoded (or decoding) buffer. The previous buffer,
    /// if any, loses this widget's reference.
    pub fn set_buffer(&mut self, buf: Imgbuf) {
        if let Some(old) = self.buf.take() {
            old.unref();
        }
        self.buf = Some(buf);
    }

    /// The current buffer.
    pub fn buffer(&self) -> Option<&Imgbuf> {
        self.buf.as_ref()
    }

    fn natural_size(&self) -> (i32, i32) {
        if let Some((w, h)) = self.declared {
            return (w, h);
        }
        if let Some(buf) = &self.buf {
            return (buf.width() as i32, buf.height() as i32);
        }
        // Room for the alt text placeholder.
        (8 * self.alt.chars().count().max(2) as i32, 16)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            buf.unref();
        }
    }
}

impl Widget for Image {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    fn size_request_impl(&mut self, _layout: &Layout) -> Requisition {
        let (width, height) = self.natural_size();
        Requisition {
            width,
            ascent: height,
            descent: 0,
        }
    }

    fn get_extremes_impl(&mut self, _layout: &Layout) -> Extremes {
        let (width, _) = self.natural_size();
        Extremes {
            min_width: width,
            max_width: width,
            min_width_intrinsic: width,
            max_width_intrinsic: width,
            adjustment_width: width,
        }
    }

    fn size_allocate_impl(&mut self, _layout: &Layout, _allocation: Allocation) {}

    fn draw(&self, _layout: &Layout, painter: &mut dyn Painter) {
        let Some(allocation) = self.base.allocation else {
            return;
        };
        match &self.buf {
            Some(_) => painter.draw_image(
                allocation.x,
                allocation.y,
                allocation.width,
                allocation.height(),
            ),
            None => painter.draw_text(
                allocation.x,
                allocation.y + allocation.ascent,
                &self.alt,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_declaration_then_buffer() {
        let mut image = Image::new("logo");
        assert_eq!(image.natural_size(), (32, 16));
        let buf = Imgbuf::new_root(40, 30, 1.0);
        image.set_buffer(buf.get_scaled(40, 30));
        assert_eq!(image.natural_size(), (40, 30));
        image.set_declared_size(20, 10);
        assert_eq!(image.natural_size(), (20, 10));
        buf.unref();
    }

    #[test]
    fn replacing_the_buffer_releases_the_old_reference() {
        let mut image = Image::new("");
        let first = Imgbuf::new_root(8, 8, 1.0);
        let handle = first.get_scaled(4, 4);
        image.set_buffer(handle);
        let second = Imgbuf::new_root(8, 8, 1.0);
        image.set_buffer(second.get_scaled(8, 8));
        // The first tree's child lost its only reference.
        first.unref();
        assert!(!first.is_live());
    }
}
