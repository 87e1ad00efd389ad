//! Shared domain logic for the order transit dashboard: the order model,
//! date codec, filtering, sorting, timeline layout, pagination and the
//! canonical dashboard query state.

pub mod dates;
pub mod filter;
pub mod model;
pub mod paginate;
pub mod query;
pub mod roles;
pub mod sort;
pub mod timeline;

pub use filter::{default_statuses, filter_orders, FilterParams};
pub use model::{collect_years, Order, StatusBucket, StatusCounters, TransportKind};
pub use paginate::{paginate, Page, DEFAULT_PER_PAGE, MAX_PER_PAGE, TABLE_PAGE_SIZE, TIMELINE_PAGE_SIZE};
pub use query::QueryState;
pub use roles::{can_edit, can_view_all, User};
pub use sort::{sort_orders, Direction, SortChain, SortKey, SortSpec, SortState};
pub use timeline::{
    layout_timeline, week_band, ChartKey, ChartSort, TimelineBar, WeekBand, MIN_BAR_WIDTH_PCT,
};

pub const CRATE_NAME: &str = "otd-core";
