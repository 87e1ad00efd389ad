//! Dashboard row filtering: year scoping, status legend membership and a
//! free-text needle over order numbers and display dates.

use std::collections::BTreeSet;

use crate::dates;
use crate::model::Order;

/// Everything the filter depends on, passed explicitly.
#[derive(Debug, Clone)]
pub struct FilterParams<'a> {
    /// Free-text needle. Matching is case-insensitive.
    pub query: &'a str,
    /// Year scope. `None` skips the year check entirely.
    pub selected_year: Option<i32>,
    /// Statuses kept by the legend. Membership is exact and case-sensitive.
    pub visible_statuses: &'a BTreeSet<String>,
}

/// The three statuses the legend starts with.
pub fn default_statuses() -> BTreeSet<String> {
    ["in process", "en route", "arrived"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub fn filter_orders(orders: &[Order], params: &FilterParams<'_>) -> Vec<Order> {
    let needle = params.query.trim().to_lowercase();
    orders
        .iter()
        .filter(|order| keeps(order, params, &needle))
        .cloned()
        .collect()
}

fn keeps(order: &Order, params: &FilterParams<'_>, needle: &str) -> bool {
    if let Some(year) = params.selected_year {
        if !order.matches_year(year) {
            return false;
        }
    }
    if !params.visible_statuses.contains(&order.transit_status) {
        return false;
    }
    if needle.is_empty() {
        return true;
    }
    let number = order.order_number.to_lowercase();
    let date = dates::to_display(&order.order_date).to_lowercase();
    number.contains(needle) || date.contains(needle)
}
