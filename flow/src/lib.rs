/*!
The rendering engine's text-flow core.

A [`Textblock`] turns a stream of text runs, embedded widgets and breaks
into words, scores candidate line breaks by badness and penalty, and
keeps running paragraph extremes so containers can size it. Around it:
the widget sizing protocol ([`Layout`], [`Widget`]) with its queued
invalidation flags, the out-of-flow float manager, and the scaled image
buffer tree.

Font metrics come from outside through the [`Font`] trait; the toolkit
binding supplies a real implementation, tests use fixed-advance fonts.
*/
#![forbid(unsafe_code)]
#![deny(nonstandard_style, unused_qualifications)]
#![warn(missing_docs)]

mod badness;
mod image;
mod imgbuf;
mod layout;
mod oof;
mod style;
mod textblock;
mod widget;
mod word;

pub use badness::{BadnessAndPenalty, Penalty, PENALTIES, PENALTY_EM_DASH_LEFT,
    PENALTY_EM_DASH_RIGHT, PENALTY_HYPHEN};
pub use image::Image;
pub use imgbuf::{BitSet, Imgbuf};
pub use layout::{Layout, NodeId};
pub use oof::{FloatManager, FloatSide};
pub use style::{Font, FontRef, TextStyle};
pub use textblock::{Line, Paragraph, Textblock, HYPHEN_DRAW_CHAR};
pub use widget::{Allocation, Extremes, Painter, Requisition, Widget, WidgetBase, WidgetFlags,
    WidgetRef};
pub use word::{Word, WordContent, WordFlags, WordSize};
