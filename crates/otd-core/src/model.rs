//! The purchase order record and the small classifiers the dashboard
//! derives from it: status buckets, transport markers, effective delivery
//! year and the KPI counters.

use chrono::Datelike;
use serde::{Deserialize, Deserializer, Serialize};

use crate::dates;

/// One purchase order as it travels over the wire. Date fields stay as the
/// raw strings they were entered with; the codec in [`crate::dates`] decides
/// what they mean.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub product_name: String,
    pub buyer: String,
    pub responsible: String,
    #[serde(deserialize_with = "lenient_quantity")]
    pub quantity: Option<f64>,
    pub required_delivery: String,
    pub terms_of_delivery: String,
    pub order_date: String,
    pub payment_date: String,
    pub etd: String,
    pub eta: String,
    pub ata: String,
    pub transit_status: String,
    pub transport: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_year: Option<i32>,
}

/// Quantities arrive as numbers, numeric strings (sometimes with a decimal
/// comma) or junk. Junk and non-finite values collapse to `None`.
fn lenient_quantity<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    let parsed = match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Num(n)) => Some(n),
        Some(Raw::Text(s)) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    };
    Ok(parsed.filter(|n| n.is_finite()))
}

impl Order {
    /// Delivery year used for year scoping: the explicit `delivery_year`
    /// when set, otherwise the year of a parseable `etd`, otherwise none.
    pub fn effective_year(&self) -> Option<i32> {
        if let Some(year) = self.delivery_year {
            return Some(year);
        }
        dates::parse_order_date(&self.etd).map(|d| d.year())
    }

    pub fn matches_year(&self, year: i32) -> bool {
        self.effective_year() == Some(year)
    }

    /// True when any of the four transit dates falls in `year`. This is the
    /// wider net the JSON API casts for its `filter[year]` parameter.
    pub fn touches_year(&self, year: i32) -> bool {
        [&self.order_date, &self.etd, &self.eta, &self.ata]
            .into_iter()
            .filter_map(|raw| dates::parse_order_date(raw))
            .any(|d| d.year() == year)
    }

    pub fn status_bucket(&self) -> StatusBucket {
        StatusBucket::classify(&self.transit_status)
    }

    pub fn transport_kind(&self) -> TransportKind {
        TransportKind::classify(&self.transport)
    }

    /// Short transport marker used in timeline labels.
    pub fn transport_marker(&self) -> String {
        match self.transport_kind() {
            TransportKind::Sea => "SEA".to_string(),
            TransportKind::Air => "AIR".to_string(),
            TransportKind::Truck => "TRK".to_string(),
            TransportKind::Other => {
                let raw = self.transport.trim();
                if raw.is_empty() {
                    "N/A".to_string()
                } else {
                    raw.to_string()
                }
            }
        }
    }

    /// Quantity for table cells: two decimals, or a dash when unknown.
    pub fn display_quantity(&self) -> String {
        match self.quantity {
            Some(q) => format!("{q:.2}"),
            None => "-".to_string(),
        }
    }
}

fn normalize_status(raw: &str) -> String {
    raw.to_lowercase().replace('_', " ").trim().to_string()
}

/// Coarse transit-status bucket. Classification is by substring containment
/// over a normalized form, so `"IN_PROCESS"` and `"in process (delayed)"`
/// land in the same bucket. Anything unrecognized is [`StatusBucket::Unknown`]
/// rather than an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusBucket {
    InProcess,
    EnRoute,
    Arrived,
    Unknown,
}

impl StatusBucket {
    pub fn classify(raw: &str) -> Self {
        let norm = normalize_status(raw);
        if norm.contains("arrived") {
            StatusBucket::Arrived
        } else if norm.contains("en route") {
            StatusBucket::EnRoute
        } else if norm.contains("in process") {
            StatusBucket::InProcess
        } else {
            StatusBucket::Unknown
        }
    }

    /// CSS hook for timeline bars and legend dots.
    pub fn css_class(self) -> &'static str {
        match self {
            StatusBucket::InProcess => "inprocess",
            StatusBucket::EnRoute => "enroute",
            StatusBucket::Arrived => "arrived",
            StatusBucket::Unknown => "unknown",
        }
    }
}

/// Transport mode, again by containment so free-form values like
/// `"Sea freight"` still classify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Sea,
    Air,
    Truck,
    Other,
}

impl TransportKind {
    pub fn classify(raw: &str) -> Self {
        let norm = raw.to_lowercase();
        if norm.contains("sea") {
            TransportKind::Sea
        } else if norm.contains("air") {
            TransportKind::Air
        } else if norm.contains("truck") {
            TransportKind::Truck
        } else {
            TransportKind::Other
        }
    }
}

/// KPI counters over the rows currently on screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounters {
    pub incoming: u64,
    pub stocked: u64,
    pub delivered: u64,
}

impl StatusCounters {
    /// Arrived rows count as stocked, delivered rows as completed, and
    /// everything else (including unknown statuses) as incoming.
    pub fn tally(orders: &[Order]) -> Self {
        let mut counters = StatusCounters::default();
        for order in orders {
            let norm = normalize_status(&order.transit_status);
            if norm.contains("arrived") {
                counters.stocked += 1;
            } else if norm.contains("delivered") {
                counters.delivered += 1;
            } else {
                counters.incoming += 1;
            }
        }
        counters
    }
}

/// Distinct years touched by any transit date across `orders`, newest first.
pub fn collect_years(orders: &[Order]) -> Vec<i32> {
    let mut years: Vec<i32> = orders
        .iter()
        .flat_map(|o| {
            [&o.order_date, &o.etd, &o.eta, &o.ata]
                .into_iter()
                .filter_map(|raw| dates::parse_order_date(raw))
                .map(|d| d.year())
        })
        .collect();
    years.sort_unstable();
    years.dedup();
    years.reverse();
    years
}
