//! The textblock: words in, lines out.
//!
//! Content arrives incrementally (`add_text`, `add_widget`, `add_break`,
//! `add_space`, `add_break_option`); each addition may close one or more
//! lines. Breaking decisions weigh the badness of the candidate line
//! against the penalty of the break point; a forced break bypasses
//! scoring, and ties go to the later candidate (the longer line).

use crate::badness::{PENALTIES, PENALTY_EM_DASH_LEFT, PENALTY_EM_DASH_RIGHT, PENALTY_HYPHEN};
use crate::layout::{Layout, NodeId};
use crate::oof::{FloatManager, FloatSide};
use crate::style::TextStyle;
use crate::widget::{
    Allocation, Extremes, Painter, Requisition, Widget, WidgetBase,
};
use crate::word::{Word, WordContent, WordFlags, WordSize};
use std::cell::RefCell;
use std::rc::Rc;

/// The character drawn for a hyphen at end of line. Soft hyphens are
/// not rendered by every platform and U+2010 is missing from many
/// fonts, so a plain hyphen-minus it is.
pub const HYPHEN_DRAW_CHAR: &str = "-";

struct DivChar {
    s: &'static str,
    removed_at_eol: bool,
    unbreakable_for_min_width: bool,
    can_be_hyphenated: bool,
    penalty_left: Option<usize>,
    penalty_right: Option<usize>,
}

/// The dividing characters, scanned at UTF-8 boundaries.
const DIV_CHARS: [DivChar; 4] = [
    // Soft hyphen (U+00AD): removed at EOL, draws the hyphen glyph.
    DivChar {
        s: "\u{00ad}",
        removed_at_eol: true,
        unbreakable_for_min_width: false,
        can_be_hyphenated: true,
        penalty_left: Some(PENALTY_HYPHEN),
        penalty_right: None,
    },
    // Simple hyphen-minus: same penalties as soft hyphens.
    DivChar {
        s: "-",
        removed_at_eol: false,
        unbreakable_for_min_width: true,
        can_be_hyphenated: true,
        penalty_left: None,
        penalty_right: Some(PENALTY_HYPHEN),
    },
    // Unconditional hyphen (U+2010): exactly like hyphen-minus.
    DivChar {
        s: "\u{2010}",
        removed_at_eol: false,
        unbreakable_for_min_width: true,
        can_be_hyphenated: true,
        penalty_left: None,
        penalty_right: Some(PENALTY_HYPHEN),
    },
    // Em dash (U+2014): breaks on both sides, the left one disfavored.
    DivChar {
        s: "\u{2014}",
        removed_at_eol: false,
        unbreakable_for_min_width: true,
        can_be_hyphenated: false,
        penalty_left: Some(PENALTY_EM_DASH_LEFT),
        penalty_right: Some(PENALTY_EM_DASH_RIGHT),
    },
];

/// A closed line of words.
#[derive(Debug, Clone, Copy)]
pub struct Line {
    /// First word index.
    pub first_word: usize,
    /// Last word index (inclusive).
    pub last_word: usize,
    /// Top coordinate within the textblock.
    pub top: i32,
    /// Ascent including borders.
    pub border_ascent: i32,
    /// Descent including borders.
    pub border_descent: i32,
    /// Ascent including margins.
    pub margin_ascent: i32,
    /// Descent including margins.
    pub margin_descent: i32,
    /// Extra vertical space below (from a break).
    pub break_space: i32,
    /// Left offset of the text (float borders).
    pub text_offset: i32,
    /// Width the line actually uses, hyphen included.
    pub max_line_width: i32,
}

impl Line {
    /// Total height of the line box.
    pub fn height(&self) -> i32 {
        self.border_ascent + self.border_descent
    }
}

/// A paragraph's word range and running width extremes.
///
/// The running maxima include every earlier paragraph, so the last row
/// answers for the whole textblock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Paragraph {
    /// First word index.
    pub first_word: usize,
    /// Last word index (inclusive).
    pub last_word: usize,
    /// Widest unbreakable unit in this paragraph.
    pub par_min: i32,
    /// Unbroken width of this paragraph.
    pub par_max: i32,
    /// Running maximum of `par_min`, this and all earlier paragraphs.
    pub max_par_min: i32,
    /// Running maximum of `par_max`.
    pub max_par_max: i32,
    /// Intrinsic counterpart of `max_par_min`.
    pub max_par_min_intrinsic: i32,
    /// Intrinsic counterpart of `max_par_max`.
    pub max_par_max_intrinsic: i32,
    /// Width used to resolve percentage children.
    pub adjustment_width: i32,
}

/// A flowing block of text, inline widgets and breaks.
pub struct Textblock {
    base: WidgetBase,
    words: Vec<Word>,
    lines: Vec<Line>,
    paragraphs: Vec<Paragraph>,
    anchors: Vec<(String, usize)>,
    avail_width: i32,
    oof: Option<Rc<RefCell<FloatManager>>>,
    oof_refs: Vec<usize>,
    /// First line whose geometry changed since the last allocation.
    wrap_ref_line: Option<usize>,
}

impl std::fmt::Debug for Textblock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Textblock")
            .field("words", &self.words.len())
            .field("lines", &self.lines.len())
            .field("paragraphs", &self.paragraphs.len())
            .field("avail_width", &self.avail_width)
            .finish()
    }
}

impl Textblock {
    /// Creates an empty textblock wrapping at `avail_width`.
    pub fn new(avail_width: i32) -> Self {
        Self {
            base: WidgetBase::default(),
            words: Vec::new(),
            lines: Vec::new(),
            paragraphs: Vec::new(),
            anchors: Vec::new(),
            avail_width,
            oof: None,
            oof_refs: Vec::new(),
            wrap_ref_line: None,
        }
    }

    /// Attaches the container's float manager.
    pub fn set_float_manager(&mut self, manager: Rc<RefCell<FloatManager>>) {
        self.oof = Some(manager);
    }

    /// The words so far.
    pub fn words(&self) -> &[Word] {
        &self.words
    }

    /// The closed lines so far.
    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    /// The paragraph rows so far.
    pub fn paragraphs(&self) -> &[Paragraph] {
        &self.paragraphs
    }

    /// First line whose geometry changed since the damage was last
    /// taken; drawing needs to repaint from here down only.
    pub fn take_damage(&mut self) -> Option<usize> {
        self.wrap_ref_line.take()
    }

    fn damage_from(&mut self, line: usize) {
        self.wrap_ref_line = Some(self.wrap_ref_line.map_or(line, |l| l.min(line)));
    }

    fn current_line_start(&self) -> usize {
        self.lines.last().map_or(0, |line| line.last_word + 1)
    }

    /// Vertical position where the next line will start.
    fn current_top(&self) -> i32 {
        self.lines
            .last()
            .map_or(0, |line| line.top + line.height() + line.break_space)
    }

    fn line_avail_width(&self) -> i32 {
        match &self.oof {
            Some(mgr) => mgr.borrow().available_width(self.current_top()),
            None => self.avail_width,
        }
    }

    fn text_offset_at(&self, y: i32) -> i32 {
        match &self.oof {
            Some(mgr) => mgr.borrow().left_border(y),
            None => 0,
        }
    }

    /// Width of the candidate line `start..=end`, including the hyphen
    /// that would be drawn if the line breaks at `end`.
    fn line_width(&self, start: usize, end: usize, with_hyphen: bool) -> i32 {
        let mut width = 0;
        for idx in start..=end {
            width += self.words[idx].size.width;
            if idx < end {
                width += self.words[idx].orig_space;
            }
        }
        if with_hyphen {
            width += self.words[end].hyphen_width;
        }
        width
    }

    /// Accumulated inter-word space inside `start..end` (exclusive of
    /// the space after the final word).
    fn line_space(&self, start: usize, end: usize) -> i32 {
        (start..end).map(|idx| self.words[idx].orig_space).sum()
    }

    /// Penalty column for the current line: 1 when the previous line
    /// ended in a hyphen or dash.
    fn penalty_column(&self) -> usize {
        match self.lines.last() {
            Some(line) => {
                let word = &self.words[line.last_word];
                usize::from(
                    word.flags
                        .intersects(WordFlags::DIV_CHAR_AT_EOL | WordFlags::PERM_DIV_CHAR),
                )
            }
            None => 0,
        }
    }

    /// Closes the line `start..=end`.
    fn add_line(&mut self, start: usize, end: usize) {
        let top = self.current_top();
        let mut ascent = 0;
        let mut descent = 0;
        for idx in start..=end {
            ascent = ascent.max(self.words[idx].size.ascent);
            descent = descent.max(self.words[idx].size.descent);
        }
        let break_space = match self.words[end].content {
            WordContent::Break { space, .. } => space,
            _ => 0,
        };
        let draws_hyphen = self.words[end].flags.contains(WordFlags::DIV_CHAR_AT_EOL);
        let line = Line {
            first_word: start,
            last_word: end,
            top,
            border_ascent: ascent,
            border_descent: descent,
            margin_ascent: ascent,
            margin_descent: descent,
            break_space,
            text_offset: self.text_offset_at(top),
            max_line_width: self.line_width(start, end, draws_hyphen),
        };
        self.lines.push(line);
        self.damage_from(self.lines.len() - 1);
    }

    /// Considers closing lines after the word at `idx` arrived.
    fn wrap(&mut self, idx: usize) {
        loop {
            let start = self.current_line_start();
            if start > idx {
                return;
            }
            if self.words[idx].bad_pen.must_break() {
                self.add_line(start, idx);
                continue;
            }
            let avail = self.line_avail_width();
            if self.line_width(start, idx, true) <= avail {
                return;
            }

            // Overfull: score every break candidate on the line; ties
            // prefer the later (longer) one.
            let column = self.penalty_column();
            let mut best: Option<(usize, (u8, i64))> = None;
            for candidate in start..=idx {
                if !self.words[candidate].bad_pen.can_break() {
                    continue;
                }
                let width = self.line_width(start, candidate, true);
                let space = self.line_space(start, candidate);
                let mut bad_pen = self.words[candidate].bad_pen;
                bad_pen.calc_badness(width, avail, space);
                self.words[candidate].bad_pen = bad_pen;
                let score = bad_pen.score(column);
                if best.is_none_or(|(_, best_score)| score <= best_score) {
                    best = Some((candidate, score));
                }
            }
            match best {
                Some((candidate, _)) => {
                    self.add_line(start, candidate);
                    // Words after the chosen candidate open the next
                    // line; loop in case they overflow too.
                }
                // Nothing breakable yet; the line overflows until a
                // break option appears.
                None => return,
            }
        }
    }

    fn push_word(&mut self, word: Word) -> usize {
        self.words.push(word);
        let idx = self.words.len() - 1;
        self.wrap(idx);
        idx
    }

    /// Adds a run of text, splitting it at dividing characters.
    pub fn add_text(&mut self, text: &str, style: &TextStyle) {
        struct Part {
            text: String,
            flags: WordFlags,
            penalty: Option<usize>,
            hyphen_width: i32,
        }
        let mut parts: Vec<Part> = Vec::new();
        let mut current = String::new();
        let mut current_flags = WordFlags::empty();

        let close =
            |parts: &mut Vec<Part>, text: &mut String, flags: &mut WordFlags,
             penalty: Option<usize>, hyphen_width: i32| {
                if text.is_empty() {
                    return;
                }
                parts.push(Part {
                    text: std::mem::take(text),
                    flags: std::mem::take(flags),
                    penalty,
                    hyphen_width,
                });
            };

        let mut rest = text;
        'scan: while !rest.is_empty() {
            for div in &DIV_CHARS {
                if let Some(after) = rest.strip_prefix(div.s) {
                    if div.removed_at_eol {
                        // The character disappears; breaking here draws
                        // the hyphen glyph.
                        current_flags |= WordFlags::DIV_CHAR_AT_EOL;
                        if div.can_be_hyphenated {
                            current_flags |= WordFlags::CAN_BE_HYPHENATED;
                        }
                        close(
                            &mut parts,
                            &mut current,
                            &mut current_flags,
                            div.penalty_left,
                            style.font.text_width(HYPHEN_DRAW_CHAR),
                        );
                    } else {
                        if div.penalty_left.is_some() {
                            // A break is allowed before the character.
                            close(
                                &mut parts,
                                &mut current,
                                &mut current_flags,
                                div.penalty_left,
                                0,
                            );
                        }
                        current.push_str(div.s);
                        current_flags |= WordFlags::PERM_DIV_CHAR;
                        if div.unbreakable_for_min_width {
                            current_flags |= WordFlags::UNBREAKABLE_FOR_MIN_WIDTH;
                        }
                        if div.can_be_hyphenated {
                            current_flags |= WordFlags::CAN_BE_HYPHENATED;
                        }
                        if let Some(penalty) = div.penalty_right {
                            close(
                                &mut parts,
                                &mut current,
                                &mut current_flags,
                                Some(penalty),
                                0,
                            );
                        }
                    }
                    rest = after;
                    continue 'scan;
                }
            }
            let ch = rest.chars().next().unwrap();
            current.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        close(&mut parts, &mut current, &mut current_flags, None, 0);

        let multiple = parts.len() > 1;
        let count = parts.len();
        for (n, part) in parts.into_iter().enumerate() {
            let size = WordSize {
                width: style.font.text_width(&part.text),
                ascent: style.font.ascent(),
                descent: style.font.descent(),
            };
            let mut word = Word::new(WordContent::Text(part.text), size, style.clone());
            word.flags = part.flags;
            if n == 0 {
                word.flags |= WordFlags::WORD_START;
            }
            if n == count - 1 {
                word.flags |= WordFlags::WORD_END;
            }
            if multiple {
                word.flags |= WordFlags::DRAW_AS_ONE_TEXT;
            }
            word.hyphen_width = part.hyphen_width;
            if let Some(penalty) = part.penalty {
                word.bad_pen
                    .set_penalties(PENALTIES[penalty][0], PENALTIES[penalty][1]);
            }
            self.push_word(word);
        }
    }

    /// Allows a break after the last word, with the given penalty pair.
    pub fn add_break_option(&mut self, first: i32, after_hyphen: i32) {
        if let Some(word) = self.words.last_mut() {
            if !word.bad_pen.must_break() {
                word.bad_pen.set_penalties(first, after_hyphen);
            }
        }
    }

    /// Adds inter-word space after the last word. Spaces are the normal
    /// break points, so this also makes the position breakable.
    pub fn add_space(&mut self, style: &TextStyle) {
        let Some(word) = self.words.last_mut() else {
            return;
        };
        if word.orig_space == 0 {
            word.orig_space = style.font.space_width();
            word.eff_space = word.orig_space;
        }
        if !word.bad_pen.must_break() {
            word.bad_pen.set_penalties(0, 0);
        }
    }

    fn add_break_word(&mut self, space: i32, paragraph: bool, style: &TextStyle) {
        let mut word = Word::new(
            WordContent::Break { space, paragraph },
            WordSize::default(),
            style.clone(),
        );
        word.bad_pen.set_force();
        self.push_word(word);
    }

    /// Adds an explicit line break.
    pub fn add_break(&mut self, space: i32, style: &TextStyle) {
        self.add_break_word(space, false, style);
    }

    /// Ends the paragraph.
    pub fn add_parbreak(&mut self, space: i32, style: &TextStyle) {
        self.add_break_word(space, true, style);
    }

    /// Embeds an in-flow child widget, pre-sized by the caller.
    pub fn add_widget(&mut self, node: NodeId, size: WordSize, style: &TextStyle) {
        let word = Word::new(WordContent::Widget(node), size, style.clone());
        self.push_word(word);
    }

    /// Places a floating child: it leaves the flow and reserves space
    /// in the container's float manager instead. Lines at and below the
    /// float rewrap.
    pub fn add_float(&mut self, node: NodeId, side: FloatSide, size: WordSize) {
        let Some(mgr) = self.oof.clone() else {
            log::warn!("textblock: float without a float manager, dropping");
            return;
        };
        let y = self.current_top();
        let index = mgr.borrow_mut().add_float(
            Some(node),
            side,
            y,
            size.width,
            size.ascent + size.descent,
        );
        self.oof_refs.push(index);
        self.invalidate_from_y(y);
    }

    /// The float indices this textblock placed in the manager.
    pub fn float_refs(&self) -> &[usize] {
        &self.oof_refs
    }

    /// Registers a named anchor at the current end of text.
    pub fn add_anchor(&mut self, name: &str) {
        self.anchors.push((name.to_string(), self.words.len()));
    }

    /// The word index an anchor points at.
    pub fn anchor(&self, name: &str) -> Option<usize> {
        self.anchors
            .iter()
            .find(|(anchor, _)| anchor == name)
            .map(|(_, idx)| *idx)
    }

    /// Drops lines from the one containing vertical position `y` and
    /// rewraps their words (float placement changed the widths there).
    pub fn invalidate_from_y(&mut self, y: i32) {
        let keep = self
            .lines
            .iter()
            .take_while(|line| line.top + line.height() + line.break_space <= y)
            .count();
        if keep == self.lines.len() {
            return;
        }
        self.lines.truncate(keep);
        self.damage_from(keep);
        let start = self.current_line_start();
        for idx in start..self.words.len() {
            self.wrap(idx);
        }
    }

    /// Re-runs line breaking from scratch (the available width changed).
    pub fn rewrap_all(&mut self) {
        self.lines.clear();
        self.damage_from(0);
        for idx in 0..self.words.len() {
            self.wrap(idx);
        }
    }

    /// Changes the wrapping width.
    pub fn set_avail_width(&mut self, avail_width: i32) {
        if self.avail_width != avail_width {
            self.avail_width = avail_width;
            if let Some(mgr) = &self.oof {
                mgr.borrow_mut().set_container_width(avail_width);
            }
            self.rewrap_all();
        }
    }

    /// Total height of all lines.
    pub fn content_height(&self) -> i32 {
        self.lines
            .last()
            .map_or(0, |line| line.top + line.height() + line.break_space)
    }

    /// Rebuilds the paragraph rows from the words. Paragraph boundaries
    /// are paragraph breaks; the numeric columns accumulate as the data
    /// model asks: per-paragraph values plus running maxima.
    fn rebuild_paragraphs(&mut self) {
        self.paragraphs.clear();
        let mut paragraph = Paragraph::default();
        // The unbreakable unit feeding par_min, and the unbroken run
        // feeding par_max (a forced break closes both).
        let mut unit = 0i32;
        let mut run = 0i32;
        let mut open = false;

        for (idx, word) in self.words.iter().enumerate() {
            if !open {
                paragraph.first_word = idx;
                paragraph.par_min = 0;
                paragraph.par_max = 0;
                open = true;
            }
            paragraph.last_word = idx;
            match &word.content {
                WordContent::Break { paragraph: is_par, .. } => {
                    paragraph.par_min = paragraph.par_min.max(unit);
                    paragraph.par_max = paragraph.par_max.max(run);
                    unit = 0;
                    run = 0;
                    if *is_par {
                        Self::close_paragraph(&mut self.paragraphs, &mut paragraph);
                        open = false;
                    }
                }
                _ => {
                    unit += word.size.width;
                    let breakable = word.bad_pen.can_break()
                        && !word.flags.contains(WordFlags::UNBREAKABLE_FOR_MIN_WIDTH);
                    if breakable {
                        paragraph.par_min = paragraph.par_min.max(unit + word.hyphen_width);
                        unit = 0;
                    }
                    run += word.size.width + word.orig_space;
                }
            }
        }
        if open {
            paragraph.par_min = paragraph.par_min.max(unit);
            paragraph.par_max = paragraph.par_max.max(run);
            Self::close_paragraph(&mut self.paragraphs, &mut paragraph);
        }
    }

    fn close_paragraph(paragraphs: &mut Vec<Paragraph>, paragraph: &mut Paragraph) {
        let (prev_min, prev_max, prev_min_i, prev_max_i) = paragraphs
            .last()
            .map(|p| {
                (
                    p.max_par_min,
                    p.max_par_max,
                    p.max_par_min_intrinsic,
                    p.max_par_max_intrinsic,
                )
            })
            .unwrap_or_default();
        paragraph.max_par_min = prev_min.max(paragraph.par_min);
        paragraph.max_par_max = prev_max.max(paragraph.par_max);
        paragraph.max_par_min_intrinsic = prev_min_i.max(paragraph.par_min);
        paragraph.max_par_max_intrinsic = prev_max_i.max(paragraph.par_max);
        paragraph.adjustment_width = paragraph.max_par_min;
        paragraphs.push(*paragraph);
        *paragraph = Paragraph::default();
    }

    /// Draws every line from `from_line` down.
    pub fn draw_from(&self, layout: &Layout, painter: &mut dyn Painter, from_line: usize) {
        for line in self.lines.iter().skip(from_line) {
            let mut x = line.text_offset;
            let baseline = line.top + line.border_ascent;
            for idx in line.first_word..=line.last_word {
                let word = &self.words[idx];
                match &word.content {
                    WordContent::Text(text) => painter.draw_text(x, baseline, text),
                    WordContent::Widget(node) => {
                        layout.widget(*node).borrow().draw(layout, painter);
                    }
                    WordContent::Break { .. } => {}
                }
                x += word.size.width;
                if idx < line.last_word {
                    x += word.eff_space;
                }
            }
            if self.words[line.last_word]
                .flags
                .contains(WordFlags::DIV_CHAR_AT_EOL)
            {
                painter.draw_text(x, baseline, HYPHEN_DRAW_CHAR);
            }
        }
    }
}

impl Widget for Textblock {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    fn reference_key(&self) -> Vec<i32> {
        let mut key = vec![self.avail_width];
        if let Some(mgr) = &self.oof {
            let mgr = mgr.borrow();
            key.push(mgr.container_width());
            key.push(mgr.len() as i32);
        }
        key
    }

    fn size_request_impl(&mut self, _layout: &Layout) -> Requisition {
        // Close a trailing open line so the request covers everything.
        let start = self.current_line_start();
        if start < self.words.len() {
            self.add_line(start, self.words.len() - 1);
        }
        let width = self
            .lines
            .iter()
            .map(|line| line.text_offset + line.max_line_width)
            .max()
            .unwrap_or(0);
        let first_ascent = self.lines.first().map_or(0, |line| line.border_ascent);
        Requisition {
            width,
            ascent: first_ascent,
            descent: self.content_height() - first_ascent,
        }
    }

    fn get_extremes_impl(&mut self, _layout: &Layout) -> Extremes {
        self.rebuild_paragraphs();
        let last = self.paragraphs.last().copied().unwrap_or_default();
        Extremes {
            min_width: last.max_par_min,
            max_width: last.max_par_max,
            min_width_intrinsic: last.max_par_min_intrinsic,
            max_width_intrinsic: last.max_par_max_intrinsic,
            adjustment_width: last.adjustment_width,
        }
    }

    fn size_allocate_impl(&mut self, layout: &Layout, allocation: Allocation) {
        self.set_avail_width(allocation.width);
        // Allocate in-flow child widgets at their line positions.
        let placements: Vec<(NodeId, Allocation)> = self
            .lines
            .iter()
            .flat_map(|line| {
                let mut x = allocation.x + line.text_offset;
                let baseline = allocation.y + line.top + line.border_ascent;
                let mut out = Vec::new();
                for idx in line.first_word..=line.last_word {
                    let word = &self.words[idx];
                    if let WordContent::Widget(node) = &word.content {
                        out.push((
                            *node,
                            Allocation {
                                x,
                                y: baseline - word.size.ascent,
                                width: word.size.width,
                                ascent: word.size.ascent,
                                descent: word.size.descent,
                            },
                        ));
                    }
                    x += word.size.width;
                    if idx < line.last_word {
                        x += word.eff_space;
                    }
                }
                out
            })
            .collect();
        for (node, child_allocation) in placements {
            layout.size_allocate(node, child_allocation);
        }
    }

    fn draw(&self, layout: &Layout, painter: &mut dyn Painter) {
        self.draw_from(layout, painter, 0);
    }
}
