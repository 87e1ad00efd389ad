//! Week-granularity timeline layout. Each order's transit window is mapped
//! onto the selected calendar year as left/width percentages, with the
//! current ISO week highlighted as a band.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use tracing::debug;

use crate::dates;
use crate::model::{Order, StatusBucket};
use crate::sort::Direction;

/// Narrow transit windows still get a visible sliver.
pub const MIN_BAR_WIDTH_PCT: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
pub struct TimelineBar {
    pub order_id: i64,
    /// `"SEA Widget (PO-0001)"` style row label.
    pub label: String,
    pub status: String,
    pub bucket: StatusBucket,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub left_pct: f64,
    pub width_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeekBand {
    pub week: u32,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub left_pct: f64,
    pub width_pct: f64,
}

fn year_bounds(year: i32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1)?;
    let end = NaiveDate::from_ymd_opt(year, 12, 31)?;
    Some((start, end))
}

/// Percent offsets of an already-clipped span within the year.
fn pct_span(bounds: (NaiveDate, NaiveDate), start: NaiveDate, end: NaiveDate) -> (f64, f64) {
    let total_days = (bounds.1 - bounds.0).num_days() as f64;
    let offset = (start - bounds.0).num_days() as f64;
    let duration = (end - start).num_days() as f64;
    (offset / total_days * 100.0, duration / total_days * 100.0)
}

/// Lay the orders out as bars over `year`.
///
/// A bar runs from the departure date to the arrival date (actual when
/// present, otherwise estimated) plus a seven day unloading allowance.
/// Orders with unusable dates or a mismatched delivery year are dropped,
/// surviving windows are clipped to the year, and every bar keeps
/// `left + width <= 100` even after the minimum width kicks in.
pub fn layout_timeline(orders: &[Order], year: i32) -> Vec<TimelineBar> {
    let Some(bounds) = year_bounds(year) else { return Vec::new() };
    let mut bars = Vec::new();

    for order in orders {
        let start = dates::parse_order_date(&order.etd);
        let arrival = if order.ata.trim().is_empty() { &order.eta } else { &order.ata };
        let end = dates::parse_order_date(arrival).and_then(|d| dates::add_days(d, 7));

        let (Some(start), Some(end)) = (start, end) else {
            debug!("timeline drop: order {} has no usable window", order.id);
            continue;
        };
        if order.effective_year() != Some(year) {
            continue;
        }
        if end < bounds.0 || start > bounds.1 {
            continue;
        }

        let clipped_start = start.max(bounds.0);
        let clipped_end = end.min(bounds.1);
        let (raw_left, raw_width) = pct_span(bounds, clipped_start, clipped_end);
        let width_pct = raw_width.max(MIN_BAR_WIDTH_PCT);
        let left_pct = raw_left.min(100.0 - width_pct).max(0.0);

        bars.push(TimelineBar {
            order_id: order.id,
            label: format!(
                "{} {} ({})",
                order.transport_marker(),
                order.product_name,
                order.order_number
            ),
            status: order.transit_status.clone(),
            bucket: order.status_bucket(),
            start: clipped_start,
            end: clipped_end,
            left_pct,
            width_pct,
        });
    }
    bars
}

/// The band covering today's ISO week, clipped to the displayed year.
/// `None` when that week does not touch the year at all.
pub fn week_band(today: NaiveDate, year: i32) -> Option<WeekBand> {
    let bounds = year_bounds(year)?;
    let week = dates::week_number(today);
    let start = dates::start_of_week(today.iso_week().year(), week)?;
    let end = dates::add_days(start, 6)?;
    if end < bounds.0 || start > bounds.1 {
        return None;
    }
    let clipped_start = start.max(bounds.0);
    let clipped_end = end.min(bounds.1);
    let (left_pct, width_pct) = pct_span(bounds, clipped_start, clipped_end);
    Some(WeekBand { week, start: clipped_start, end: clipped_end, left_pct, width_pct })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChartKey {
    Date,
    ProductName,
}

impl ChartKey {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "date" => Some(ChartKey::Date),
            "name" => Some(ChartKey::ProductName),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChartKey::Date => "date",
            ChartKey::ProductName => "name",
        }
    }
}

/// Bar ordering ahead of layout. The two keys keep independent direction
/// memory: selecting the active key again flips its direction, switching
/// keys resumes the other key's remembered direction. Both start ascending.
#[derive(Debug, Clone)]
pub struct ChartSort {
    active: ChartKey,
    directions: HashMap<ChartKey, Direction>,
}

impl Default for ChartSort {
    fn default() -> Self {
        let mut directions = HashMap::new();
        directions.insert(ChartKey::Date, Direction::Asc);
        directions.insert(ChartKey::ProductName, Direction::Asc);
        ChartSort { active: ChartKey::Date, directions }
    }
}

impl ChartSort {
    pub fn with_state(active: ChartKey, direction: Direction) -> Self {
        let mut sort = ChartSort::default();
        sort.active = active;
        sort.directions.insert(active, direction);
        sort
    }

    pub fn select(&mut self, key: ChartKey) {
        if self.active == key {
            let dir = self.directions.entry(key).or_insert(Direction::Asc);
            *dir = dir.flipped();
        } else {
            self.active = key;
        }
    }

    pub fn current(&self) -> (ChartKey, Direction) {
        let dir = self.directions.get(&self.active).copied().unwrap_or(Direction::Asc);
        (self.active, dir)
    }

    /// Stable pre-layout ordering of the rows feeding the chart,
    /// returned as a new vector.
    pub fn order_rows(&self, orders: &[Order]) -> Vec<Order> {
        let (key, direction) = self.current();
        let mut sorted = orders.to_vec();
        sorted.sort_by(|a, b| {
            let ord = match key {
                ChartKey::Date => {
                    dates::parse_or_epoch(&a.etd).cmp(&dates::parse_or_epoch(&b.etd))
                }
                ChartKey::ProductName => {
                    a.product_name.to_lowercase().cmp(&b.product_name.to_lowercase())
                }
            };
            match direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            }
        });
        sorted
    }
}
