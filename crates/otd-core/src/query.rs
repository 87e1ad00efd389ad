//! Canonical dashboard query state: page, page size, sort chain and the
//! filter fields, owned by one struct with a stable URL encoding. Both
//! clients read and write this shape so a pasted link restores the view.

use crate::paginate::DEFAULT_PER_PAGE;

pub const DEFAULT_SORT: &str = "eta:desc,etd:desc,order_date:desc,id:desc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryState {
    pub page: u32,
    pub per_page: u32,
    pub sort: String,
    pub q: String,
    pub transit_status: String,
    /// Kept as entered; [`QueryState::year`] parses it on demand.
    pub year: String,
    pub buyer: String,
    pub responsible: String,
    pub transport: String,
}

impl Default for QueryState {
    fn default() -> Self {
        QueryState {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
            sort: DEFAULT_SORT.to_string(),
            q: String::new(),
            transit_status: String::new(),
            year: String::new(),
            buyer: String::new(),
            responsible: String::new(),
            transport: String::new(),
        }
    }
}

fn parse_count(raw: &str, fallback: u32) -> u32 {
    raw.trim().parse::<u32>().ok().filter(|v| *v >= 1).unwrap_or(fallback)
}

impl QueryState {
    pub fn year(&self) -> Option<i32> {
        self.year.trim().parse().ok()
    }

    /// Serialize to the wire form. Empty values are skipped so URLs stay
    /// short; `page`, `per_page` and `sort` are always present.
    pub fn to_query_string(&self) -> String {
        let page = self.page.to_string();
        let per_page = self.per_page.to_string();
        let fields: [(&str, &str); 9] = [
            ("page", &page),
            ("per_page", &per_page),
            ("sort", &self.sort),
            ("filter[transit_status]", &self.transit_status),
            ("filter[year]", &self.year),
            ("filter[q]", &self.q),
            ("filter[buyer]", &self.buyer),
            ("filter[responsible]", &self.responsible),
            ("filter[transport]", &self.transport),
        ];
        let pairs: Vec<(&str, &str)> =
            fields.into_iter().filter(|(_, value)| !value.is_empty()).collect();
        serde_urlencoded::to_string(&pairs).unwrap_or_default()
    }

    /// Parse the wire form back. Unknown keys are ignored, junk page
    /// numbers fall back to the defaults and an empty sort means the
    /// default chain. A leading `?` is tolerated.
    pub fn from_query_string(raw: &str) -> Self {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let mut state = QueryState::default();
        let pairs: Vec<(String, String)> = serde_urlencoded::from_str(raw).unwrap_or_default();
        for (key, value) in pairs {
            match key.as_str() {
                "page" => state.page = parse_count(&value, 1),
                "per_page" => state.per_page = parse_count(&value, DEFAULT_PER_PAGE),
                "sort" => {
                    if !value.is_empty() {
                        state.sort = value;
                    }
                }
                "filter[transit_status]" => state.transit_status = value,
                "filter[year]" => state.year = value,
                "filter[q]" => state.q = value,
                "filter[buyer]" => state.buyer = value,
                "filter[responsible]" => state.responsible = value,
                "filter[transport]" => state.transport = value,
                _ => {}
            }
        }
        state
    }

    /// Apply a filter or sort change and snap back to the first page.
    pub fn with_page_reset(mut self, patch: impl FnOnce(&mut QueryState)) -> Self {
        patch(&mut self);
        self.page = 1;
        self
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page.max(1);
        self
    }

    /// Clear filters and sort but keep the chosen page size.
    pub fn reset_filters(self) -> Self {
        QueryState { per_page: self.per_page, ..QueryState::default() }
    }
}
