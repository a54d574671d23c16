//! Scaled image buffers.
//!
//! A root buffer holds decoded pixels at original size; scaled children
//! derive their pixels by averaging source rectangles, optionally
//! through gamma correction. Rows arrive incrementally at the root and
//! fan out lazily to every live child; a per-buffer row bitset keeps
//! the work from repeating.
//!
//! Ownership is explicit: the root owns its children by value, a child
//! handle refers to its slot by index, and destruction follows two
//! rules. A root with no references is freed only once its last child
//! is gone; a child with no references is freed on its own.

use std::cell::RefCell;
use std::rc::Rc;

const BPP: usize = 3;

/// A growable bitset, one bit per row.
#[derive(Debug, Clone, Default)]
pub struct BitSet {
    bits: Vec<u64>,
}

impl BitSet {
    /// Creates a bitset with capacity for `n` bits, all clear.
    pub fn new(n: usize) -> Self {
        Self {
            bits: vec![0; n.div_ceil(64)],
        }
    }

    /// Whether bit `i` is set.
    pub fn get(&self, i: usize) -> bool {
        self.bits
            .get(i / 64)
            .is_some_and(|word| word & (1 << (i % 64)) != 0)
    }

    /// Sets bit `i`.
    pub fn set(&mut self, i: usize) {
        if i / 64 >= self.bits.len() {
            self.bits.resize(i / 64 + 1, 0);
        }
        self.bits[i / 64] |= 1 << (i % 64);
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }
}

fn gamma_map(gamma: f64) -> [u8; 256] {
    let mut map = [0u8; 256];
    for (i, slot) in map.iter_mut().enumerate() {
        *slot = (255.0 * (i as f64 / 255.0).powf(gamma)).round() as u8;
    }
    map
}

struct Scaled {
    width: usize,
    height: usize,
    data: Vec<u8>,
    copied_rows: BitSet,
    refcount: i32,
}

struct Store {
    width: usize,
    height: usize,
    gamma: f64,
    data: Vec<u8>,
    copied_rows: BitSet,
    root_refcount: i32,
    root_dead: bool,
    children: Vec<Option<Scaled>>,
    // Gamma tables for γ and 1/γ, built on first use.
    maps: Option<([u8; 256], [u8; 256])>,
}

impl Store {
    /// Returns (decode, encode): source pixels map through γ, the
    /// average maps back through 1/γ.
    fn maps(&mut self) -> ([u8; 256], [u8; 256]) {
        if self.maps.is_none() {
            self.maps = Some((gamma_map(self.gamma), gamma_map(1.0 / self.gamma)));
        }
        self.maps.unwrap()
    }

    fn live_children(&self) -> usize {
        self.children.iter().flatten().count()
    }

    /// Averages the source rectangle feeding each destination pixel of
    /// one child row, with gamma correction.
    fn scale_rows_into_child(&mut self, child_idx: usize, dest_row: usize) {
        let (decode, encode) = self.maps();
        let child = self.children[child_idx].as_ref().unwrap();
        let (cw, ch) = (child.width, child.height);
        let (rw, rh) = (self.width, self.height);

        let mut row_pixels = vec![0u8; cw * BPP];
        for x in 0..cw {
            let xo1 = x * rw / cw;
            let xo2 = ((x + 1) * rw / cw).max(xo1 + 1);
            let yo1 = dest_row * rh / ch;
            let yo2 = ((dest_row + 1) * rh / ch).max(yo1 + 1);
            let n = ((xo2 - xo1) * (yo2 - yo1)) as u32;
            let mut acc = [0u32; BPP];
            for yo in yo1..yo2 {
                for xo in xo1..xo2 {
                    let ps = (yo * rw + xo) * BPP;
                    for i in 0..BPP {
                        acc[i] += u32::from(decode[self.data[ps + i] as usize]);
                    }
                }
            }
            for i in 0..BPP {
                row_pixels[x * BPP + i] = encode[(acc[i] / n) as usize];
            }
        }

        let child = self.children[child_idx].as_mut().unwrap();
        let offset = dest_row * cw * BPP;
        child.data[offset..offset + cw * BPP].copy_from_slice(&row_pixels);
        child.copied_rows.set(dest_row);
    }

    /// A new root row arrived; updates one child lazily.
    fn scale_row(&mut self, child_idx: usize, row: usize) {
        let child = self.children[child_idx].as_ref().unwrap();
        let (ch, rh) = (child.height, self.height);
        let sr1 = row * ch / rh;
        let sr2 = (row + 1) * ch / rh;

        if child.copied_rows.get(sr1) {
            return;
        }
        if ch >= rh {
            // Scaling up: this source row covers dest rows sr1..sr2.
            for dest in sr1..sr2.max(sr1 + 1) {
                self.scale_rows_into_child(child_idx, dest);
            }
        } else {
            // Scaling down: dest row sr1 needs source rows row1..row2,
            // all of which must have arrived.
            let row1 = sr1 * rh / ch;
            let row2 = (sr1 + 1) * rh / ch;
            let all_arrived = (row1..row2.max(row1 + 1)).all(|r| self.copied_rows.get(r));
            if all_arrived {
                self.scale_rows_into_child(child_idx, sr1);
            }
        }
    }

    fn maybe_free_root(&mut self) {
        if self.root_refcount == 0 {
            self.root_dead = true;
            if self.live_children() == 0 {
                self.data = Vec::new();
            }
        }
    }
}

/// Which buffer in the tree a handle names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufId {
    Root,
    Scaled(usize),
}

/// Handle to one buffer in an image buffer tree.
///
/// Handles are reference counted explicitly ([`Imgbuf::ref_`] /
/// [`Imgbuf::unref`]), matching how rendering code passes them around.
pub struct Imgbuf {
    store: Rc<RefCell<Store>>,
    id: BufId,
}

impl std::fmt::Debug for Imgbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.borrow();
        f.debug_struct("Imgbuf")
            .field("id", &self.id)
            .field("root_size", &(store.width, store.height))
            .field("children", &store.live_children())
            .finish()
    }
}

impl Imgbuf {
    /// Creates a root buffer of `width`×`height` RGB pixels with the
    /// given gamma, holding one reference.
    pub fn new_root(width: usize, height: usize, gamma: f64) -> Self {
        Self {
            store: Rc::new(RefCell::new(Store {
                width,
                height,
                gamma: if gamma > 0.0 { gamma } else { 1.0 },
                data: vec![0; width * height * BPP],
                copied_rows: BitSet::new(height),
                root_refcount: 1,
                root_dead: false,
                children: Vec::new(),
                maps: None,
            })),
            id: BufId::Root,
        }
    }

    /// Buffer width.
    pub fn width(&self) -> usize {
        match self.id {
            BufId::Root => self.store.borrow().width,
            BufId::Scaled(idx) => self.store.borrow().children[idx].as_ref().unwrap().width,
        }
    }

    /// Buffer height.
    pub fn height(&self) -> usize {
        match self.id {
            BufId::Root => self.store.borrow().height,
            BufId::Scaled(idx) => self.store.borrow().children[idx].as_ref().unwrap().height,
        }
    }

    /// Whether this handle names the root buffer.
    pub fn is_root(&self) -> bool {
        self.id == BufId::Root
    }

    /// A buffer scaled to `width`×`height`, reusing an existing child
    /// of that size when there is one. The new child immediately scales
    /// every root row that has already arrived.
    pub fn get_scaled(&self, width: usize, height: usize) -> Imgbuf {
        let mut store = self.store.borrow_mut();
        if width == store.width && height == store.height {
            store.root_refcount += 1;
            return Imgbuf {
                store: Rc::clone(&self.store),
                id: BufId::Root,
            };
        }
        if let Some(idx) = store.children.iter().position(|child| {
            child
                .as_ref()
                .is_some_and(|c| c.width == width && c.height == height)
        }) {
            store.children[idx].as_mut().unwrap().refcount += 1;
            return Imgbuf {
                store: Rc::clone(&self.store),
                id: BufId::Scaled(idx),
            };
        }

        store.children.push(Some(Scaled {
            width,
            height,
            data: vec![0; width * height * BPP],
            copied_rows: BitSet::new(height),
            refcount: 1,
        }));
        let idx = store.children.len() - 1;
        for row in 0..store.height {
            if store.copied_rows.get(row) {
                store.scale_row(idx, row);
            }
        }
        Imgbuf {
            store: Rc::clone(&self.store),
            id: BufId::Scaled(idx),
        }
    }

    /// Delivers one decoded row to the root and fans it out to every
    /// live child.
    pub fn copy_row(&self, row: usize, data: &[u8]) {
        assert_eq!(self.id, BufId::Root, "rows arrive at the root");
        let mut store = self.store.borrow_mut();
        let width = store.width;
        let offset = row * width * BPP;
        store.data[offset..offset + width * BPP].copy_from_slice(&data[..width * BPP]);
        store.copied_rows.set(row);
        for idx in 0..store.children.len() {
            if store.children[idx].is_some() {
                store.scale_row(idx, row);
            }
        }
    }

    /// Whether row `row` of this buffer has been rendered.
    pub fn row_copied(&self, row: usize) -> bool {
        let store = self.store.borrow();
        match self.id {
            BufId::Root => store.copied_rows.get(row),
            BufId::Scaled(idx) => store.children[idx]
                .as_ref()
                .is_some_and(|c| c.copied_rows.get(row)),
        }
    }

    /// The RGB pixel at (`x`, `y`).
    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let store = self.store.borrow();
        let (data, width) = match self.id {
            BufId::Root => (&store.data, store.width),
            BufId::Scaled(idx) => {
                let child = store.children[idx].as_ref().unwrap();
                (&child.data, child.width)
            }
        };
        let offset = (y * width + x) * BPP;
        [data[offset], data[offset + 1], data[offset + 2]]
    }

    /// Takes another reference on this buffer.
    pub fn ref_(&self) {
        let mut store = self.store.borrow_mut();
        match self.id {
            BufId::Root => store.root_refcount += 1,
            BufId::Scaled(idx) => store.children[idx].as_mut().unwrap().refcount += 1,
        }
    }

    /// Releases one reference.
    ///
    /// A scaled buffer at zero is freed and detached; if it was the last
    /// child of a dead root, the root is freed with it. A root at zero
    /// with live children is only marked dead; the last child's
    /// destruction frees it.
    pub fn unref(&self) {
        let mut store = self.store.borrow_mut();
        match self.id {
            BufId::Root => {
                store.root_refcount -= 1;
                store.maybe_free_root();
            }
            BufId::Scaled(idx) => {
                let child = store.children[idx].as_mut().unwrap();
                child.refcount -= 1;
                if child.refcount == 0 {
                    store.children[idx] = None;
                    store.maybe_free_root();
                }
            }
        }
    }

    /// Whether the buffer this handle names still holds pixel data.
    pub fn is_live(&self) -> bool {
        let store = self.store.borrow();
        match self.id {
            BufId::Root => !store.root_dead,
            BufId::Scaled(idx) => store.children.get(idx).is_some_and(Option::is_some),
        }
    }
}
