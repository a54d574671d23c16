//! The smallest text-flow unit.

use crate::badness::BadnessAndPenalty;
use crate::style::TextStyle;

bitflags::bitflags! {
    /// Word attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WordFlags: u16 {
        /// First part of a source text run.
        const WORD_START = 1 << 0;
        /// Last part of a source text run.
        const WORD_END = 1 << 1;
        /// A hyphenation pass may divide this word further.
        const CAN_BE_HYPHENATED = 1 << 2;
        /// Breaking after this word draws the hyphen glyph (the dividing
        /// character was removed from the text).
        const DIV_CHAR_AT_EOL = 1 << 3;
        /// The dividing character stayed in the text (hyphen-minus,
        /// em dash).
        const PERM_DIV_CHAR = 1 << 4;
        /// For minimum-width purposes this word glues to the next.
        const UNBREAKABLE_FOR_MIN_WIDTH = 1 << 5;
        /// Part of a run that should be drawn as one text where possible.
        const DRAW_AS_ONE_TEXT = 1 << 6;
        /// Sits at the top-left corner of its line.
        const TOPLEFT_OF_LINE = 1 << 7;
    }
}

/// Measured size of a word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WordSize {
    /// Advance width.
    pub width: i32,
    /// Ascent above the baseline.
    pub ascent: i32,
    /// Descent below the baseline.
    pub descent: i32,
}

/// What a word is.
pub enum WordContent {
    /// A run of glyphs.
    Text(String),
    /// An embedded widget, referenced by its layout node.
    Widget(crate::layout::NodeId),
    /// A forced break, with extra vertical space.
    Break {
        /// Vertical space below the broken line.
        space: i32,
        /// Whether this break also ends the paragraph.
        paragraph: bool,
    },
}

impl std::fmt::Debug for WordContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WordContent::Text(text) => write!(f, "Text({text:?})"),
            WordContent::Widget(id) => write!(f, "Widget({id:?})"),
            WordContent::Break { space, paragraph } => {
                write!(f, "Break({space}, paragraph: {paragraph})")
            }
        }
    }
}

/// One word: a glyph run, an embedded widget, or a break.
pub struct Word {
    /// Content.
    pub content: WordContent,
    /// Measured size.
    pub size: WordSize,
    /// Space after this word as the style asked for it.
    pub orig_space: i32,
    /// Space after this word as justification adjusted it.
    pub eff_space: i32,
    /// Extra width when a line ends here and draws a hyphen.
    pub hyphen_width: i32,
    /// Break scoring for the position after this word.
    pub bad_pen: BadnessAndPenalty,
    /// Attribute bits.
    pub flags: WordFlags,
    /// Style (font) of this word.
    pub style: TextStyle,
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Word")
            .field("content", &self.content)
            .field("size", &self.size)
            .field("orig_space", &self.orig_space)
            .field("hyphen_width", &self.hyphen_width)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Word {
    /// Creates a word with prohibited break and no spacing.
    pub fn new(content: WordContent, size: WordSize, style: TextStyle) -> Self {
        Self {
            content,
            size,
            orig_space: 0,
            eff_space: 0,
            hyphen_width: 0,
            bad_pen: BadnessAndPenalty::default(),
            flags: WordFlags::empty(),
            style,
        }
    }

    /// The text, when this word is a glyph run.
    pub fn text(&self) -> Option<&str> {
        match &self.content {
            WordContent::Text(text) => Some(text),
            _ => None,
        }
    }
}
