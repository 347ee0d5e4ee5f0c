// Viewport geometry the coordinator reads to window and prioritize work.

use parking_lot::Mutex;

/// What the reconciliation engine needs to know about the on-screen layout:
/// the visible index range and enough per-cell geometry to score priorities.
pub trait LayoutProvider: Send + Sync {
    /// Tells the layout how many cells the collection currently has.
    fn register_cell_count(&self, count: usize);
    fn number_of_cols(&self) -> usize;
    /// First cell index intersecting the viewport, clamped at zero.
    fn first_visible_index(&self) -> usize;
    /// Last cell index intersecting the viewport, clamped to the collection.
    fn last_visible_index(&self) -> usize;
    /// Last intersecting index ignoring the collection bound; used when
    /// deciding whether pages past the known data should be fetched.
    fn last_visible_index_unclamped(&self) -> usize;
    fn container_top(&self) -> i64;
    fn container_bottom(&self) -> i64;
    fn cell_left(&self, index: usize) -> i64;
    fn cell_top(&self, index: usize) -> i64;
    fn cell_bottom(&self, index: usize) -> i64;
}

struct Geometry {
    cell_count: usize,
    cols: usize,
    cell_width: i64,
    cell_height: i64,
    spacing: i64,
    container_height: i64,
    scroll_offset: i64,
}

/// Minimal row/column grid: fixed cell size, fixed column count, vertical
/// scrolling. Enough geometry for windowing and priority scoring.
pub struct GridLayout {
    inner: Mutex<Geometry>,
}

impl GridLayout {
    pub fn new(cols: usize, cell_width: i64, cell_height: i64, container_height: i64) -> Self {
        Self {
            inner: Mutex::new(Geometry {
                cell_count: 0,
                cols: cols.max(1),
                cell_width,
                cell_height,
                spacing: 9,
                container_height,
                scroll_offset: 0,
            }),
        }
    }

    pub fn set_scroll_offset(&self, offset: i64) {
        self.inner.lock().scroll_offset = offset.max(0);
    }

    pub fn set_container_height(&self, height: i64) {
        self.inner.lock().container_height = height.max(0);
    }
}

impl Geometry {
    fn row_pitch(&self) -> i64 {
        self.cell_height + self.spacing
    }

    fn row_of(&self, index: usize) -> i64 {
        (index / self.cols) as i64
    }

    fn top_row(&self) -> i64 {
        (self.scroll_offset / self.row_pitch()).max(0)
    }

    fn bottom_row(&self) -> i64 {
        ((self.scroll_offset + self.container_height) / self.row_pitch()).max(0)
    }
}

impl LayoutProvider for GridLayout {
    fn register_cell_count(&self, count: usize) {
        self.inner.lock().cell_count = count;
    }

    fn number_of_cols(&self) -> usize {
        self.inner.lock().cols
    }

    fn first_visible_index(&self) -> usize {
        let geo = self.inner.lock();
        (geo.top_row() * geo.cols as i64).max(0) as usize
    }

    fn last_visible_index(&self) -> usize {
        let geo = self.inner.lock();
        let unclamped = (geo.bottom_row() + 1) * geo.cols as i64 - 1;
        if geo.cell_count == 0 {
            return 0;
        }
        (unclamped.max(0) as usize).min(geo.cell_count - 1)
    }

    fn last_visible_index_unclamped(&self) -> usize {
        let geo = self.inner.lock();
        let unclamped = (geo.bottom_row() + 1) * geo.cols as i64 - 1;
        unclamped.max(0) as usize
    }

    fn container_top(&self) -> i64 {
        self.inner.lock().scroll_offset
    }

    fn container_bottom(&self) -> i64 {
        let geo = self.inner.lock();
        geo.scroll_offset + geo.container_height
    }

    fn cell_left(&self, index: usize) -> i64 {
        let geo = self.inner.lock();
        ((index % geo.cols) as i64) * (geo.cell_width + geo.spacing)
    }

    fn cell_top(&self, index: usize) -> i64 {
        let geo = self.inner.lock();
        geo.row_of(index) * geo.row_pitch()
    }

    fn cell_bottom(&self, index: usize) -> i64 {
        let geo = self.inner.lock();
        geo.row_of(index) * geo.row_pitch() + geo.cell_height
    }
}
