//! Fixed-size pagination. The legacy table and timeline list clamp the
//! requested page into range; the JSON API instead lets an out-of-range
//! page come back empty.

/// Rows per page in the server-rendered order table.
pub const TABLE_PAGE_SIZE: usize = 10;
/// Rows per page in the server-rendered timeline list.
pub const TIMELINE_PAGE_SIZE: usize = 20;
/// JSON API page size when the client sends none.
pub const DEFAULT_PER_PAGE: u32 = 25;
pub const MAX_PER_PAGE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn label(&self) -> String {
        format!("Page {} / {} ({} rows)", self.page, self.total_pages, self.total)
    }

    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    pub fn has_next(&self) -> bool {
        self.page < self.total_pages
    }
}

/// Clamping pagination: an empty input still reports one page, and a page
/// number outside `1..=total_pages` snaps to the nearest bound.
pub fn paginate<T: Clone>(items: &[T], page_size: usize, requested_page: usize) -> Page<T> {
    let page_size = page_size.max(1);
    let total = items.len();
    let total_pages = total.div_ceil(page_size).max(1);
    let page = requested_page.clamp(1, total_pages);
    let start = (page - 1) * page_size;
    let items = items.iter().skip(start).take(page_size).cloned().collect();
    Page { items, page, total_pages, total }
}

pub fn clamp_per_page(requested: u32) -> u32 {
    requested.clamp(1, MAX_PER_PAGE)
}

/// JSON API slicing: the page floor is 1 but there is no ceiling, so a page
/// past the end yields an empty slice rather than snapping back.
pub fn slice_page<T: Clone>(items: &[T], page: u32, per_page: u32) -> Vec<T> {
    let page = page.max(1) as usize;
    let per_page = per_page.max(1) as usize;
    items.iter().skip((page - 1) * per_page).take(per_page).cloned().collect()
}
