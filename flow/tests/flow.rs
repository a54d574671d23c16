//! Text-flow behavior with a fixed-advance font.

use larkspur_flow::{
    Allocation, Extremes, FloatManager, FloatSide, Font, Layout, Painter, Requisition, TextStyle,
    Textblock, Widget, WidgetBase, WordSize,
};
use pretty_assertions::assert_eq;
use std::cell::RefCell;
use std::rc::Rc;

/// Every character is 10 units wide; ascent 8, descent 2.
struct TestFont;

impl Font for TestFont {
    fn text_width(&self, text: &str) -> i32 {
        text.chars().count() as i32 * 10
    }

    fn ascent(&self) -> i32 {
        8
    }

    fn descent(&self) -> i32 {
        2
    }
}

fn style() -> TextStyle {
    TextStyle::new(Rc::new(TestFont))
}

#[derive(Default)]
struct CollectingPainter {
    ops: Vec<(i32, i32, String)>,
}

impl Painter for CollectingPainter {
    fn draw_text(&mut self, x: i32, y: i32, text: &str) {
        self.ops.push((x, y, text.to_string()));
    }
}

fn line_texts(block: &Textblock) -> Vec<Vec<String>> {
    block
        .lines()
        .iter()
        .map(|line| {
            (line.first_word..=line.last_word)
                .filter_map(|idx| block.words()[idx].text().map(str::to_string))
                .collect()
        })
        .collect()
}

fn add_sentence(block: &mut Textblock, sentence: &str, style: &TextStyle) {
    for word in sentence.split(' ') {
        block.add_text(word, style);
        block.add_space(style);
    }
}

#[test]
fn words_wrap_at_spaces() {
    let style = style();
    // 25 units: two 10-unit characters plus a space fit, three do not.
    let mut block = Textblock::new(250);
    add_sentence(&mut block, "one two three four five six", &style);
    // Each word is 30-50 units; lines close as the width fills up.
    for line in block.lines() {
        let width: i32 = (line.first_word..=line.last_word)
            .map(|idx| block.words()[idx].size.width)
            .sum();
        assert!(width <= 250);
    }
    // All words are accounted for, in order.
    let flattened: Vec<String> = line_texts(&block).concat();
    let mut expected: Vec<String> = "one two three four five six"
        .split(' ')
        .map(str::to_string)
        .collect();
    // The last line may still be open; collect what remains.
    let closed: usize = flattened.len();
    expected.truncate(closed);
    assert_eq!(flattened, expected);
}

#[test]
fn soft_hyphen_breaks_and_draws_hyphen() {
    let style = style();
    // "super" = 50 units; with the drawn hyphen 60. "supercali" = 90.
    let mut block = Textblock::new(60);
    block.add_text("super\u{ad}cali", &style);

    assert_eq!(line_texts(&block), vec![vec!["super".to_string()]]);
    let layout = Layout::new(60);
    let mut painter = CollectingPainter::default();
    block.draw(&layout, &mut painter);
    let drawn: Vec<&str> = painter.ops.iter().map(|(_, _, t)| t.as_str()).collect();
    // The hyphen glyph is drawn after "super"; "cali" is still on the
    // open line and gets drawn once the line closes.
    assert_eq!(drawn, vec!["super", "-"]);
    let hyphen_x = painter.ops[1].0;
    assert_eq!(hyphen_x, 50);
}

#[test]
fn hyphen_minus_breaks_without_extra_glyph() {
    let style = style();
    // "super-" = 60 units, fits exactly; "super-cali" = 100.
    let mut block = Textblock::new(60);
    block.add_text("super-cali", &style);

    assert_eq!(line_texts(&block), vec![vec!["super-".to_string()]]);
    let layout = Layout::new(60);
    let mut painter = CollectingPainter::default();
    block.draw(&layout, &mut painter);
    let drawn: Vec<&str> = painter.ops.iter().map(|(_, _, t)| t.as_str()).collect();
    assert_eq!(drawn, vec!["super-"]);
}

#[test]
fn em_dash_prefers_break_on_the_right() {
    let style = style();
    // "alpha" (50) + "—" (10) + "beta" (40). At width 60 both the break
    // left of the dash (line "alpha", 50) and right of it (line
    // "alpha—", 60) fit; the right break has the cheaper penalty.
    let mut block = Textblock::new(60);
    block.add_text("alpha\u{2014}beta", &style);
    let lines = line_texts(&block);
    assert_eq!(lines[0], vec!["alpha".to_string(), "\u{2014}".to_string()]);
}

#[test]
fn forced_break_bypasses_scoring() {
    let style = style();
    let mut block = Textblock::new(1000);
    block.add_text("first", &style);
    block.add_break(5, &style);
    block.add_text("second", &style);
    assert_eq!(block.lines().len(), 1);
    // The break word rides at the end of the first line.
    assert_eq!(block.lines()[0].break_space, 5);
}

#[test]
fn line_heights_stack_with_break_space() {
    let style = style();
    let mut block = Textblock::new(1000);
    block.add_text("a", &style);
    block.add_break(7, &style);
    block.add_text("b", &style);
    block.add_break(0, &style);
    let lines = block.lines();
    assert_eq!(lines[0].top, 0);
    // Line 0 is 10 high (8+2) plus 7 break space.
    assert_eq!(lines[1].top, 17);
}

#[test]
fn paragraph_extremes_track_min_and_max() {
    let style = style();
    let layout = Layout::new(1000);
    let mut block = Textblock::new(1000);
    add_sentence(&mut block, "hel lo", &style);
    block.add_parbreak(0, &style);
    add_sentence(&mut block, "a considerably longer paragraph", &style);

    let block = Rc::new(RefCell::new(block));
    let id = layout.add_widget(None, block.clone());
    let extremes = layout.get_extremes(id);
    // Widest single word: "considerably" = 120.
    assert_eq!(extremes.min_width, 120);
    // Widest unbroken paragraph: "a considerably longer paragraph"
    // (280 units of glyphs) plus four word spaces.
    assert_eq!(extremes.max_width, 280 + 40);
    assert_eq!(extremes.min_width_intrinsic, extremes.min_width);
    // The running maxima live on the last paragraph row.
    let block = block.borrow();
    let rows = block.paragraphs();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].max_par_min >= rows[0].max_par_min);
}

#[test]
fn unbreakable_min_width_glues_hyphenated_halves() {
    let style = style();
    let layout = Layout::new(1000);

    // Soft hyphen: the fragments count separately for min width.
    let soft = Rc::new(RefCell::new(Textblock::new(1000)));
    soft.borrow_mut().add_text("super\u{ad}cali", &style);
    let soft_id = layout.add_widget(None, soft);
    let soft_extremes = layout.get_extremes(soft_id);
    // "super" + drawn hyphen = 60.
    assert_eq!(soft_extremes.min_width, 60);

    // Hyphen-minus: glued for min-width purposes.
    let hard = Rc::new(RefCell::new(Textblock::new(1000)));
    hard.borrow_mut().add_text("super-cali", &style);
    let hard_id = layout.add_widget(None, hard);
    let hard_extremes = layout.get_extremes(hard_id);
    assert_eq!(hard_extremes.min_width, 100);
}

#[test]
fn floats_narrow_the_lines_beside_them() {
    let style = style();
    let manager = Rc::new(RefCell::new(FloatManager::new(100)));
    let mut block = Textblock::new(100);
    block.set_float_manager(Rc::clone(&manager));

    // A 40-wide float occupies the first 30 units of height.
    manager
        .borrow_mut()
        .add_float(None, FloatSide::Left, 0, 40, 30);

    add_sentence(&mut block, "aa bb cc dd ee ff", &style);
    // Lines beside the float wrap at 60; below it at 100.
    let lines = block.lines();
    assert!(!lines.is_empty());
    for line in lines {
        let available = if line.top < 30 { 60 } else { 100 };
        assert!(
            line.max_line_width <= available,
            "line at {} is {} wide",
            line.top,
            line.max_line_width
        );
        if line.top < 30 {
            assert_eq!(line.text_offset, 40);
        } else {
            assert_eq!(line.text_offset, 0);
        }
    }
}

#[test]
fn late_float_rewraps_affected_lines() {
    let style = style();
    let manager = Rc::new(RefCell::new(FloatManager::new(100)));
    let mut block = Textblock::new(100);
    block.set_float_manager(Rc::clone(&manager));
    add_sentence(&mut block, "aa bb cc dd", &style);
    let lines_before = block.lines().len();
    let _ = block.take_damage();

    // Drop a float over the whole text: everything rewraps narrower.
    manager
        .borrow_mut()
        .add_float(None, FloatSide::Left, 0, 70, 1000);
    block.invalidate_from_y(0);
    assert_eq!(block.take_damage(), Some(0));
    assert!(block.lines().len() >= lines_before);
    for line in block.lines() {
        assert!(line.max_line_width <= 30);
    }
}

/// A fixed-size inline widget for embedding tests.
struct Box_ {
    base: WidgetBase,
    size: Requisition,
    allocated: Rc<RefCell<Option<Allocation>>>,
}

impl Widget for Box_ {
    fn base(&self) -> &WidgetBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut WidgetBase {
        &mut self.base
    }

    fn size_request_impl(&mut self, _layout: &Layout) -> Requisition {
        self.size
    }

    fn get_extremes_impl(&mut self, _layout: &Layout) -> Extremes {
        Extremes {
            min_width: self.size.width,
            max_width: self.size.width,
            min_width_intrinsic: self.size.width,
            max_width_intrinsic: self.size.width,
            adjustment_width: self.size.width,
        }
    }

    fn size_allocate_impl(&mut self, _layout: &Layout, allocation: Allocation) {
        *self.allocated.borrow_mut() = Some(allocation);
    }

    fn draw(&self, _layout: &Layout, _painter: &mut dyn Painter) {}
}

#[test]
fn inline_widgets_flow_and_get_allocated() {
    let style = style();
    let layout = Layout::new(200);
    let allocated = Rc::new(RefCell::new(None));

    let root = Rc::new(RefCell::new(Textblock::new(200)));
    let root_id = layout.add_widget(None, root.clone());
    let child = Rc::new(RefCell::new(Box_ {
        base: WidgetBase::default(),
        size: Requisition {
            width: 30,
            ascent: 20,
            descent: 0,
        },
        allocated: Rc::clone(&allocated),
    }));
    let child_id = layout.add_widget(Some(root_id), child);

    {
        let mut block = root.borrow_mut();
        block.add_text("before", &style);
        block.add_space(&style);
        block.add_widget(
            child_id,
            WordSize {
                width: 30,
                ascent: 20,
                descent: 0,
            },
            &style,
        );
        block.add_space(&style);
        block.add_text("after", &style);
    }

    layout.queue_resize(root_id, true);
    layout.resize_idle();

    let child_alloc = allocated.borrow().expect("child was allocated");
    assert_eq!(child_alloc.width, 30);
    // "before " is 60 wide plus the space; the widget sits after it.
    assert_eq!(child_alloc.x, 70);
    // The line's ascent is the widget's 20; the child's top aligns with
    // the line top.
    assert_eq!(child_alloc.y, 0);
}
