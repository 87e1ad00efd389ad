//! Typed column sorting: a three-way comparator per column, the
//! per-column direction memory behind header clicks, and the multi-key
//! sort chain the JSON API accepts.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use crate::dates;
use crate::model::Order;

/// Every sortable column. Date columns compare chronologically, quantity
/// numerically, everything else as case-folded text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortKey {
    Id,
    OrderDate,
    OrderNumber,
    ProductName,
    Buyer,
    Responsible,
    Quantity,
    RequiredDelivery,
    TermsOfDelivery,
    PaymentDate,
    Etd,
    Eta,
    Ata,
    TransitStatus,
    Transport,
}

impl SortKey {
    pub fn parse(name: &str) -> Option<Self> {
        let key = match name {
            "id" => SortKey::Id,
            "order_date" => SortKey::OrderDate,
            "order_number" => SortKey::OrderNumber,
            "product_name" => SortKey::ProductName,
            "buyer" => SortKey::Buyer,
            "responsible" => SortKey::Responsible,
            "quantity" => SortKey::Quantity,
            "required_delivery" => SortKey::RequiredDelivery,
            "terms_of_delivery" => SortKey::TermsOfDelivery,
            "payment_date" => SortKey::PaymentDate,
            "etd" => SortKey::Etd,
            "eta" => SortKey::Eta,
            "ata" => SortKey::Ata,
            "transit_status" => SortKey::TransitStatus,
            "transport" => SortKey::Transport,
            _ => return None,
        };
        Some(key)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SortKey::Id => "id",
            SortKey::OrderDate => "order_date",
            SortKey::OrderNumber => "order_number",
            SortKey::ProductName => "product_name",
            SortKey::Buyer => "buyer",
            SortKey::Responsible => "responsible",
            SortKey::Quantity => "quantity",
            SortKey::RequiredDelivery => "required_delivery",
            SortKey::TermsOfDelivery => "terms_of_delivery",
            SortKey::PaymentDate => "payment_date",
            SortKey::Etd => "etd",
            SortKey::Eta => "eta",
            SortKey::Ata => "ata",
            SortKey::TransitStatus => "transit_status",
            SortKey::Transport => "transport",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "asc" => Some(Direction::Asc),
            "desc" => Some(Direction::Desc),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortSpec {
    pub key: SortKey,
    pub direction: Direction,
}

impl SortSpec {
    pub fn new(key: SortKey, direction: Direction) -> Self {
        SortSpec { key, direction }
    }
}

impl fmt::Display for SortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key.as_str(), self.direction.as_str())
    }
}

fn raw_field(order: &Order, key: SortKey) -> &str {
    match key {
        SortKey::OrderDate => &order.order_date,
        SortKey::OrderNumber => &order.order_number,
        SortKey::ProductName => &order.product_name,
        SortKey::Buyer => &order.buyer,
        SortKey::Responsible => &order.responsible,
        SortKey::RequiredDelivery => &order.required_delivery,
        SortKey::TermsOfDelivery => &order.terms_of_delivery,
        SortKey::PaymentDate => &order.payment_date,
        SortKey::Etd => &order.etd,
        SortKey::Eta => &order.eta,
        SortKey::Ata => &order.ata,
        SortKey::TransitStatus => &order.transit_status,
        SortKey::Transport => &order.transport,
        SortKey::Id | SortKey::Quantity => "",
    }
}

/// Ascending three-way comparison of two orders on one column. Missing
/// dates compare as the epoch sentinel, missing quantities as zero.
pub fn compare(a: &Order, b: &Order, key: SortKey) -> Ordering {
    match key {
        SortKey::Id => a.id.cmp(&b.id),
        SortKey::Quantity => {
            a.quantity.unwrap_or(0.0).total_cmp(&b.quantity.unwrap_or(0.0))
        }
        SortKey::OrderDate
        | SortKey::RequiredDelivery
        | SortKey::PaymentDate
        | SortKey::Etd
        | SortKey::Eta
        | SortKey::Ata => dates::parse_or_epoch(raw_field(a, key))
            .cmp(&dates::parse_or_epoch(raw_field(b, key))),
        _ => raw_field(a, key)
            .to_lowercase()
            .cmp(&raw_field(b, key).to_lowercase()),
    }
}

fn apply_spec(orders: &mut [Order], spec: SortSpec) {
    orders.sort_by(|a, b| {
        let ord = compare(a, b, spec.key);
        match spec.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    });
}

/// Stable sort by one column in the given direction, returning a new
/// vector. Rows that compare equal keep their input order; the input is
/// left untouched so the caller's master list survives re-sorts.
pub fn sort_orders(orders: &[Order], spec: SortSpec) -> Vec<Order> {
    let mut sorted = orders.to_vec();
    apply_spec(&mut sorted, spec);
    sorted
}

/// Per-column direction memory for header clicks. A column's memory is
/// seeded descending, and a click flips it before use, so the first click
/// on a fresh column sorts ascending. The primary date column starts out
/// applied descending without a click.
#[derive(Debug, Clone)]
pub struct SortState {
    directions: HashMap<SortKey, Direction>,
    last: SortSpec,
}

impl Default for SortState {
    fn default() -> Self {
        Self::new()
    }
}

impl SortState {
    pub fn new() -> Self {
        let mut directions = HashMap::new();
        directions.insert(SortKey::OrderDate, Direction::Desc);
        SortState { directions, last: SortSpec::new(SortKey::OrderDate, Direction::Desc) }
    }

    /// Header click: flip the column's remembered direction and use it.
    pub fn click(&mut self, key: SortKey) -> SortSpec {
        let dir = self.directions.entry(key).or_insert(Direction::Desc);
        *dir = dir.flipped();
        self.last = SortSpec::new(key, *dir);
        self.last
    }

    /// Forced re-sort on the primary date column, always descending.
    /// Used after reloads and legend toggles; leaves the memory alone.
    pub fn forced_primary(&mut self) -> SortSpec {
        self.last = SortSpec::new(SortKey::OrderDate, Direction::Desc);
        self.last
    }

    /// Year changes wipe the memory back to its initial state.
    pub fn reset(&mut self) {
        *self = SortState::new();
    }

    pub fn last(&self) -> SortSpec {
        self.last
    }
}

/// Columns the JSON API accepts in its `sort` parameter.
const CHAIN_KEYS: [SortKey; 9] = [
    SortKey::Eta,
    SortKey::Etd,
    SortKey::Ata,
    SortKey::OrderDate,
    SortKey::OrderNumber,
    SortKey::Buyer,
    SortKey::Responsible,
    SortKey::Transport,
    SortKey::TransitStatus,
];

/// Multi-key sort chain, e.g. `eta:desc,order_date:asc`. Parsing is
/// forgiving: unknown columns are dropped, a missing or unknown direction
/// means ascending, and an empty chain falls back to the default. The id
/// tiebreaker is always appended so pagination stays deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortChain(Vec<SortSpec>);

impl SortChain {
    pub fn parse(raw: &str) -> Self {
        let mut specs: Vec<SortSpec> = Vec::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, direction) = match part.split_once(':') {
                Some((name, dir)) => {
                    (name.trim(), Direction::parse(dir.trim()).unwrap_or(Direction::Asc))
                }
                None => (part, Direction::Asc),
            };
            let Some(key) = SortKey::parse(name) else { continue };
            if !CHAIN_KEYS.contains(&key) {
                continue;
            }
            specs.push(SortSpec::new(key, direction));
        }
        if specs.is_empty() {
            specs = vec![
                SortSpec::new(SortKey::Eta, Direction::Desc),
                SortSpec::new(SortKey::Etd, Direction::Desc),
                SortSpec::new(SortKey::OrderDate, Direction::Desc),
            ];
        }
        specs.push(SortSpec::new(SortKey::Id, Direction::Desc));
        SortChain(specs)
    }

    pub fn default_chain() -> Self {
        SortChain::parse("")
    }

    pub fn specs(&self) -> &[SortSpec] {
        &self.0
    }

    /// Apply the chain as reversed stable single-key passes over one
    /// copy, which yields the lexicographic multi-key order.
    pub fn apply(&self, orders: &[Order]) -> Vec<Order> {
        let mut sorted = orders.to_vec();
        for spec in self.0.iter().rev() {
            apply_spec(&mut sorted, *spec);
        }
        sorted
    }
}

impl fmt::Display for SortChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, spec) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_order(id: i64, eta: &str, buyer: &str, quantity: Option<f64>) -> Order {
        Order {
            id,
            eta: eta.to_string(),
            buyer: buyer.to_string(),
            quantity,
            ..Order::default()
        }
    }

    #[test]
    fn dates_sort_chronologically_not_lexically() {
        let orders = vec![
            mk_order(1, "2025-06-01", "", None),
            mk_order(2, "05.01.25", "", None),
        ];
        let sorted = sort_orders(&orders, SortSpec::new(SortKey::Eta, Direction::Asc));
        assert_eq!(sorted[0].id, 2);
    }

    #[test]
    fn missing_dates_sort_as_epoch() {
        let orders = vec![
            mk_order(1, "05.01.25", "", None),
            mk_order(2, "", "", None),
        ];
        let asc = sort_orders(&orders, SortSpec::new(SortKey::Eta, Direction::Asc));
        assert_eq!(asc[0].id, 2);
        let desc = sort_orders(&orders, SortSpec::new(SortKey::Eta, Direction::Desc));
        assert_eq!(desc[0].id, 1);
    }

    #[test]
    fn quantity_sorts_numerically_with_zero_fallback() {
        let orders = vec![
            mk_order(1, "", "", Some(10.0)),
            mk_order(2, "", "", None),
            mk_order(3, "", "", Some(2.0)),
        ];
        let sorted = sort_orders(&orders, SortSpec::new(SortKey::Quantity, Direction::Asc));
        let ids: Vec<i64> = sorted.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn strings_sort_case_insensitively() {
        let orders = vec![
            mk_order(1, "", "zenith", None),
            mk_order(2, "", "Apex", None),
        ];
        let sorted = sort_orders(&orders, SortSpec::new(SortKey::Buyer, Direction::Asc));
        assert_eq!(sorted[0].id, 2);
    }

    #[test]
    fn the_input_collection_is_never_reordered() {
        let orders = vec![
            mk_order(1, "2025-06-01", "", None),
            mk_order(2, "05.01.25", "", None),
        ];
        let _ = sort_orders(&orders, SortSpec::new(SortKey::Eta, Direction::Asc));
        let ids: Vec<i64> = orders.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn equal_keys_keep_input_order() {
        let orders = vec![
            mk_order(7, "05.01.25", "", None),
            mk_order(3, "05.01.25", "", None),
            mk_order(9, "05.01.25", "", None),
        ];
        let sorted = sort_orders(&orders, SortSpec::new(SortKey::Eta, Direction::Asc));
        let ids: Vec<i64> = sorted.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![7, 3, 9]);
    }

    #[test]
    fn sorting_twice_changes_nothing() {
        let orders = vec![
            mk_order(1, "2025-03-01", "b", None),
            mk_order(2, "2025-01-01", "a", None),
            mk_order(3, "", "c", None),
        ];
        let spec = SortSpec::new(SortKey::Eta, Direction::Desc);
        let once = sort_orders(&orders, spec);
        let twice = sort_orders(&once, spec);
        assert_eq!(twice, once);
    }

    #[test]
    fn first_click_on_fresh_column_is_ascending() {
        let mut state = SortState::new();
        let spec = state.click(SortKey::Buyer);
        assert_eq!(spec, SortSpec::new(SortKey::Buyer, Direction::Asc));
        let spec = state.click(SortKey::Buyer);
        assert_eq!(spec.direction, Direction::Desc);
    }

    #[test]
    fn primary_column_starts_descending_then_flips() {
        let mut state = SortState::new();
        assert_eq!(state.last(), SortSpec::new(SortKey::OrderDate, Direction::Desc));
        let spec = state.click(SortKey::OrderDate);
        assert_eq!(spec.direction, Direction::Asc);
    }

    #[test]
    fn forced_primary_leaves_toggle_memory_alone() {
        let mut state = SortState::new();
        state.click(SortKey::OrderDate);
        let forced = state.forced_primary();
        assert_eq!(forced, SortSpec::new(SortKey::OrderDate, Direction::Desc));
        // Memory still remembers the ascending click, so the next click flips to desc.
        let spec = state.click(SortKey::OrderDate);
        assert_eq!(spec.direction, Direction::Desc);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut state = SortState::new();
        state.click(SortKey::Buyer);
        state.click(SortKey::OrderDate);
        state.reset();
        assert_eq!(state.last(), SortSpec::new(SortKey::OrderDate, Direction::Desc));
        assert_eq!(state.click(SortKey::OrderDate).direction, Direction::Asc);
    }

    #[test]
    fn chain_parses_and_appends_id_tiebreaker() {
        let chain = SortChain::parse("eta:desc,order_date:asc");
        assert_eq!(chain.to_string(), "eta:desc,order_date:asc,id:desc");
    }

    #[test]
    fn chain_drops_unknown_columns_and_defaults_direction() {
        let chain = SortChain::parse("nonsense:asc,buyer,eta:sideways");
        assert_eq!(chain.to_string(), "buyer:asc,eta:asc,id:desc");
    }

    #[test]
    fn empty_chain_falls_back_to_default() {
        let chain = SortChain::parse("");
        assert_eq!(chain.to_string(), "eta:desc,etd:desc,order_date:desc,id:desc");
        assert_eq!(SortChain::default_chain(), chain);
    }

    #[test]
    fn chain_applies_lexicographically() {
        let mut a = mk_order(1, "2025-02-01", "", None);
        a.etd = "2025-01-01".to_string();
        let mut b = mk_order(2, "2025-02-01", "", None);
        b.etd = "2025-01-10".to_string();
        let mut c = mk_order(3, "2025-03-01", "", None);
        c.etd = "2024-12-01".to_string();

        let sorted = SortChain::parse("eta:desc,etd:asc").apply(&[a, b, c]);
        let ids: Vec<i64> = sorted.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn chain_id_tiebreaker_keeps_pagination_deterministic() {
        let orders = vec![
            mk_order(2, "2025-02-01", "", None),
            mk_order(5, "2025-02-01", "", None),
            mk_order(1, "2025-02-01", "", None),
        ];
        let sorted = SortChain::parse("eta:desc").apply(&orders);
        let ids: Vec<i64> = sorted.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![5, 2, 1]);
    }
}
