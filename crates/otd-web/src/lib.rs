//! Axum + Askama server for the transit dashboard: the server-rendered
//! legacy page, the flat legacy JSON endpoints and the enveloped v1 API,
//! all over one shared order store.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Form, Path as AxumPath, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Row};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use otd_core::dates;
use otd_core::paginate::{clamp_per_page, slice_page};
use otd_core::timeline::{week_band, ChartKey, ChartSort};
use otd_core::{
    collect_years, default_statuses, filter_orders, layout_timeline, paginate, sort_orders,
    Direction, FilterParams, Order, QueryState, SortChain, SortKey, SortSpec, StatusBucket,
    StatusCounters, User, TABLE_PAGE_SIZE, TIMELINE_PAGE_SIZE,
};
use otd_storage::{OrderDraft, OrderStore, StoreError, StoredOrder};

pub const CRATE_NAME: &str = "otd-web";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub demo_mode: bool,
    pub demo_read_only: bool,
    pub demo_auto_login: bool,
    pub auto_seed: bool,
    pub seed_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8000,
            data_dir: PathBuf::from("./data"),
            demo_mode: false,
            demo_read_only: true,
            demo_auto_login: true,
            auto_seed: true,
            seed_file: None,
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        ServerConfig {
            port: std::env::var("OTD_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            data_dir: std::env::var("OTD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            demo_mode: env_flag("OTD_DEMO_MODE", defaults.demo_mode),
            demo_read_only: env_flag("OTD_DEMO_READONLY", defaults.demo_read_only),
            demo_auto_login: env_flag("OTD_DEMO_AUTO_LOGIN", defaults.demo_auto_login),
            auto_seed: env_flag("OTD_AUTO_SEED", defaults.auto_seed),
            seed_file: std::env::var("OTD_SEED_FILE").ok().map(PathBuf::from),
        }
    }
}

/// Bearer tokens handed out at boot (or by tests) mapped to their users.
/// The demo user never goes through here.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, User>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub async fn issue(&self, user: User) -> String {
        let token = Uuid::new_v4().to_string();
        self.sessions.write().await.insert(token.clone(), user);
        token
    }

    pub async fn lookup(&self, token: &str) -> Option<User> {
        self.sessions.read().await.get(token).cloned()
    }
}

pub struct AppState {
    pub config: ServerConfig,
    pub store: OrderStore,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(config: ServerConfig, store: OrderStore) -> Self {
        AppState { config, store, sessions: SessionRegistry::new() }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn demo_user() -> User {
    User::new(1, "demo", "admin")
}

async fn current_user(state: &AppState, headers: &HeaderMap) -> Option<User> {
    if let Some(token) = bearer_token(headers) {
        if let Some(user) = state.sessions.lookup(token).await {
            return Some(user);
        }
    }
    if state.config.demo_mode && state.config.demo_auto_login {
        return Some(demo_user());
    }
    None
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard_page_handler))
        .route("/api/years", get(years_handler))
        .route("/api/orders", get(legacy_orders_handler))
        .route("/api/products", get(products_handler))
        .route("/api/v1/orders", get(v1_orders_handler))
        .route("/api/v1/auth/me", get(v1_auth_me_handler))
        .route("/add_order", post(add_order_handler))
        .route("/edit_order/{id}", post(edit_order_handler))
        .route("/delete_order/{id}", post(delete_order_handler))
        .route("/stock_order/{id}", post(stock_order_handler))
        .route("/deliver_direct/{id}", post(deliver_direct_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    let store = OrderStore::load_or_default(&config.data_dir).await;
    hydrate_from_db(&store).await;
    maybe_seed(&config, &store).await;

    let port = config.port;
    let state = AppState::new(config, store);
    if !state.config.demo_mode {
        let token = state.sessions.issue(User::new(1, "ops", "admin")).await;
        info!("ops session token: {token}");
    }
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening on 0.0.0.0:{port}");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn maybe_seed(config: &ServerConfig, store: &OrderStore) {
    if !config.auto_seed || !store.is_empty().await {
        return;
    }
    let path = config.seed_file.clone().unwrap_or_else(|| config.data_dir.join("seed.yaml"));
    if !path.exists() {
        return;
    }
    if let Err(err) = store.seed_from_yaml(&path).await {
        warn!("seeding from {} failed: {err:#}", path.display());
    }
}

// ---- legacy server-rendered page ----

#[derive(Debug, Default, Deserialize)]
struct DashboardQuery {
    year: Option<String>,
    q: Option<String>,
    sort: Option<String>,
    dir: Option<String>,
    page: Option<String>,
    statuses: Option<String>,
    chart: Option<String>,
    chart_dir: Option<String>,
    chart_page: Option<String>,
}

struct ColumnHeader {
    label: &'static str,
    href: String,
    marker: &'static str,
}

struct LegendItem {
    name: String,
    css: &'static str,
    active: bool,
    href: String,
}

struct OrderRow {
    id: i64,
    order_date: String,
    order_number: String,
    product_name: String,
    buyer: String,
    responsible: String,
    quantity: String,
    required_delivery: String,
    terms_of_delivery: String,
    payment_date: String,
    etd: String,
    eta: String,
    ata: String,
    transit_status: String,
    status_class: &'static str,
    transport: String,
}

struct BarRow {
    label: String,
    status_class: &'static str,
    title: String,
    left: String,
    width: String,
}

struct BandRow {
    week: u32,
    left: String,
    width: String,
}

#[derive(Template)]
#[template(path = "dashboard.html")]
struct DashboardTemplate {
    username: String,
    can_edit: bool,
    years: Vec<i32>,
    selected_year: String,
    search: String,
    statuses_param: String,
    in_transit: u64,
    warehoused: u64,
    delivered: u64,
    incoming: u64,
    stocked: u64,
    completed: u64,
    columns: Vec<ColumnHeader>,
    rows: Vec<OrderRow>,
    page_label: String,
    has_prev: bool,
    has_next: bool,
    prev_href: String,
    next_href: String,
    legend: Vec<LegendItem>,
    chart_date_href: String,
    chart_name_href: String,
    chart_label: String,
    chart_prev_href: String,
    chart_next_href: String,
    chart_has_prev: bool,
    chart_has_next: bool,
    bars: Vec<BarRow>,
    band: Option<BandRow>,
}

#[derive(Template)]
#[template(path = "sign_in.html")]
struct SignInTemplate;

const TABLE_COLUMNS: [(&str, SortKey); 14] = [
    ("Order Date", SortKey::OrderDate),
    ("Order No.", SortKey::OrderNumber),
    ("Product", SortKey::ProductName),
    ("Buyer", SortKey::Buyer),
    ("Responsible", SortKey::Responsible),
    ("Qty", SortKey::Quantity),
    ("Required Delivery", SortKey::RequiredDelivery),
    ("Terms", SortKey::TermsOfDelivery),
    ("Payment", SortKey::PaymentDate),
    ("ETD", SortKey::Etd),
    ("ETA", SortKey::Eta),
    ("ATA", SortKey::Ata),
    ("Status", SortKey::TransitStatus),
    ("Transport", SortKey::Transport),
];

const LEGEND_STATUSES: [&str; 3] = ["in process", "en route", "arrived"];

fn encode_href(pairs: &[(&str, String)]) -> String {
    let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
    match serde_urlencoded::to_string(&borrowed) {
        Ok(encoded) if !encoded.is_empty() => format!("/?{encoded}"),
        _ => "/".to_string(),
    }
}

fn parse_page(raw: Option<&str>) -> usize {
    raw.and_then(|v| v.trim().parse::<usize>().ok()).filter(|v| *v >= 1).unwrap_or(1)
}

fn pct(value: f64) -> String {
    format!("{value:.3}")
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn push_chart_pairs(pairs: &mut Vec<(&'static str, String)>, key: ChartKey, direction: Direction) {
    if key != ChartKey::Date || direction != Direction::Asc {
        pairs.push(("chart", key.as_str().to_string()));
        pairs.push(("chart_dir", direction.as_str().to_string()));
    }
}

async fn dashboard_page_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<DashboardQuery>,
) -> Response {
    let Some(user) = current_user(&state, &headers).await else {
        return render_html(SignInTemplate);
    };

    let orders = state.store.list_for(&user).await;
    let years = collect_years(&orders);
    let selected_year = params
        .year
        .as_deref()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .or_else(|| years.first().copied());

    let statuses: BTreeSet<String> = match params.statuses.as_deref() {
        None => default_statuses(),
        Some(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
    };
    let search = params.q.clone().unwrap_or_default();

    let filtered = filter_orders(
        &orders,
        &FilterParams {
            query: &search,
            selected_year,
            visible_statuses: &statuses,
        },
    );

    let spec = match params.sort.as_deref().and_then(SortKey::parse) {
        Some(key) => SortSpec::new(
            key,
            params.dir.as_deref().and_then(Direction::parse).unwrap_or(Direction::Asc),
        ),
        None => SortSpec::new(SortKey::OrderDate, Direction::Desc),
    };
    let table_rows = sort_orders(&filtered, spec);
    let table = paginate(&table_rows, TABLE_PAGE_SIZE, parse_page(params.page.as_deref()));

    let chart_key = params.chart.as_deref().and_then(ChartKey::parse).unwrap_or(ChartKey::Date);
    let chart_direction =
        params.chart_dir.as_deref().and_then(Direction::parse).unwrap_or(Direction::Asc);
    let chart_rows = ChartSort::with_state(chart_key, chart_direction).order_rows(&filtered);
    let chart = paginate(&chart_rows, TIMELINE_PAGE_SIZE, parse_page(params.chart_page.as_deref()));

    let bars = match selected_year {
        Some(year) => layout_timeline(&chart.items, year),
        None => Vec::new(),
    };
    let band = selected_year.and_then(|year| week_band(today(), year)).map(|b| BandRow {
        week: b.week,
        left: pct(b.left_pct),
        width: pct(b.width_pct),
    });

    let kpis = state.store.counts_for(&user).await;
    let counters = StatusCounters::tally(&filtered);

    // Links re-encode the whole view so the page stays stateless.
    let statuses_param = statuses.iter().cloned().collect::<Vec<_>>().join(",");
    let mut base: Vec<(&'static str, String)> = Vec::new();
    if let Some(year) = selected_year {
        base.push(("year", year.to_string()));
    }
    if !search.is_empty() {
        base.push(("q", search.clone()));
    }
    if params.statuses.is_some() {
        base.push(("statuses", statuses_param.clone()));
    }

    let columns = TABLE_COLUMNS
        .iter()
        .map(|&(label, key)| {
            let active = key == spec.key;
            let next_dir = if active { spec.direction.flipped() } else { Direction::Asc };
            let mut pairs = base.clone();
            pairs.push(("sort", key.as_str().to_string()));
            pairs.push(("dir", next_dir.as_str().to_string()));
            push_chart_pairs(&mut pairs, chart_key, chart_direction);
            ColumnHeader {
                label,
                href: encode_href(&pairs),
                marker: match (active, spec.direction) {
                    (true, Direction::Asc) => " \u{25b2}",
                    (true, Direction::Desc) => " \u{25bc}",
                    (false, _) => "",
                },
            }
        })
        .collect();

    let mut paging = base.clone();
    paging.push(("sort", spec.key.as_str().to_string()));
    paging.push(("dir", spec.direction.as_str().to_string()));
    push_chart_pairs(&mut paging, chart_key, chart_direction);
    let page_href = |page: usize| {
        let mut pairs = paging.clone();
        pairs.push(("page", page.to_string()));
        encode_href(&pairs)
    };
    let chart_page_href = |page: usize| {
        let mut pairs = paging.clone();
        if table.page > 1 {
            pairs.push(("page", table.page.to_string()));
        }
        pairs.push(("chart_page", page.to_string()));
        encode_href(&pairs)
    };

    // Legend toggles drop sort and page so the view snaps back to the
    // default order, same as the script-driven client did.
    let legend = LEGEND_STATUSES
        .into_iter()
        .map(|name| {
            let active = statuses.contains(name);
            let mut toggled = statuses.clone();
            if active {
                toggled.remove(name);
            } else {
                toggled.insert(name.to_string());
            }
            let mut pairs: Vec<(&'static str, String)> = Vec::new();
            if let Some(year) = selected_year {
                pairs.push(("year", year.to_string()));
            }
            if !search.is_empty() {
                pairs.push(("q", search.clone()));
            }
            pairs.push(("statuses", toggled.iter().cloned().collect::<Vec<_>>().join(",")));
            LegendItem {
                name: name.to_string(),
                css: StatusBucket::classify(name).css_class(),
                active,
                href: encode_href(&pairs),
            }
        })
        .collect();

    let chart_toggle_href = |key: ChartKey| {
        let direction = if key == chart_key { chart_direction.flipped() } else { Direction::Asc };
        let mut pairs = base.clone();
        pairs.push(("sort", spec.key.as_str().to_string()));
        pairs.push(("dir", spec.direction.as_str().to_string()));
        if table.page > 1 {
            pairs.push(("page", table.page.to_string()));
        }
        pairs.push(("chart", key.as_str().to_string()));
        pairs.push(("chart_dir", direction.as_str().to_string()));
        encode_href(&pairs)
    };

    let rows = table
        .items
        .iter()
        .map(|order| OrderRow {
            id: order.id,
            order_date: dates::to_display(&order.order_date),
            order_number: order.order_number.clone(),
            product_name: order.product_name.clone(),
            buyer: order.buyer.clone(),
            responsible: order.responsible.clone(),
            quantity: order.display_quantity(),
            required_delivery: order.required_delivery.clone(),
            terms_of_delivery: order.terms_of_delivery.clone(),
            payment_date: dates::to_display(&order.payment_date),
            etd: dates::to_display(&order.etd),
            eta: dates::to_display(&order.eta),
            ata: dates::to_display(&order.ata),
            transit_status: order.transit_status.clone(),
            status_class: order.status_bucket().css_class(),
            transport: order.transport.clone(),
        })
        .collect();

    let bar_rows = bars
        .iter()
        .map(|bar| {
            let status = if bar.status.trim().is_empty() { "unknown" } else { bar.status.as_str() };
            BarRow {
                label: bar.label.clone(),
                status_class: bar.bucket.css_class(),
                title: format!(
                    "{status}: {} to {}",
                    dates::format_display(bar.start),
                    dates::format_display(bar.end)
                ),
                left: pct(bar.left_pct),
                width: pct(bar.width_pct),
            }
        })
        .collect();

    let tpl = DashboardTemplate {
        username: user.username.clone(),
        can_edit: user.can_edit(),
        years,
        selected_year: selected_year.map(|y| y.to_string()).unwrap_or_default(),
        search,
        statuses_param,
        in_transit: kpis.in_transit,
        warehoused: kpis.warehoused,
        delivered: kpis.delivered,
        incoming: counters.incoming,
        stocked: counters.stocked,
        completed: counters.delivered,
        columns,
        rows,
        page_label: table.label(),
        has_prev: table.has_prev(),
        has_next: table.has_next(),
        prev_href: page_href(table.page.saturating_sub(1)),
        next_href: page_href(table.page + 1),
        legend,
        chart_date_href: chart_toggle_href(ChartKey::Date),
        chart_name_href: chart_toggle_href(ChartKey::ProductName),
        chart_label: chart.label(),
        chart_prev_href: chart_page_href(chart.page.saturating_sub(1)),
        chart_next_href: chart_page_href(chart.page + 1),
        chart_has_prev: chart.has_prev(),
        chart_has_next: chart.has_next(),
        bars: bar_rows,
        band,
    };
    render_html(tpl)
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    warn!("request failed: {err:#}");
    (StatusCode::INTERNAL_SERVER_ERROR, Html("Server error".to_string())).into_response()
}

// ---- legacy JSON endpoints ----

#[derive(Debug, Default, Deserialize)]
struct LegacyOrdersQuery {
    year: Option<String>,
}

async fn years_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user) = current_user(&state, &headers).await else {
        return unauthorized();
    };
    let orders = state.store.list_for(&user).await;
    Json(json!({ "years": collect_years(&orders) })).into_response()
}

/// Strict `dd.mm.yy` re-encode for the legacy payload: anything the
/// codec cannot read goes out blank, matching the old serializer.
fn legacy_date(raw: &str) -> String {
    dates::parse_order_date(raw).map(dates::format_display).unwrap_or_default()
}

fn legacy_order_json(order: &Order) -> serde_json::Value {
    json!({
        "id": order.id,
        "order_number": order.order_number,
        "product_name": order.product_name,
        "buyer": order.buyer,
        "responsible": order.responsible,
        "quantity": order.quantity,
        "required_delivery": order.required_delivery,
        "terms_of_delivery": order.terms_of_delivery,
        "order_date": legacy_date(&order.order_date),
        "payment_date": legacy_date(&order.payment_date),
        "etd": legacy_date(&order.etd),
        "eta": legacy_date(&order.eta),
        "ata": legacy_date(&order.ata),
        "transit_status": order.transit_status,
        "transport": order.transport,
    })
}

fn legacy_recency(order: &Order) -> NaiveDate {
    dates::parse_order_date(&order.order_date)
        .or_else(|| dates::parse_order_date(&order.etd))
        .unwrap_or_else(dates::sort_epoch)
}

async fn legacy_orders_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<LegacyOrdersQuery>,
) -> Response {
    let Some(user) = current_user(&state, &headers).await else {
        return unauthorized();
    };
    let orders = state.store.list_for(&user).await;
    let year = params.year.as_deref().and_then(|v| v.trim().parse::<i32>().ok());

    // Without a year the endpoint stays unscoped, as it always has.
    let mut rows: Vec<&Order> = match year {
        Some(year) => orders.iter().filter(|o| o.touches_year(year)).collect(),
        None => orders.iter().collect(),
    };
    rows.sort_by(|a, b| legacy_recency(b).cmp(&legacy_recency(a)));

    let payload: Vec<serde_json::Value> = rows.iter().map(|o| legacy_order_json(o)).collect();
    Json(json!({ "orders": payload })).into_response()
}

async fn products_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(_user) = current_user(&state, &headers).await else {
        return unauthorized();
    };
    Json(state.store.products().await).into_response()
}

// ---- v1 API ----

fn ok_envelope(data: serde_json::Value, meta: serde_json::Value) -> Response {
    Json(json!({
        "data": data,
        "meta": meta,
        "trace_id": Uuid::new_v4().to_string(),
    }))
    .into_response()
}

fn error_envelope(status: StatusCode, code: &str, message: &str, details: &[String]) -> Response {
    (
        status,
        Json(json!({
            "error": { "code": code, "message": message, "details": details },
            "trace_id": Uuid::new_v4().to_string(),
        })),
    )
        .into_response()
}

fn unauthorized() -> Response {
    error_envelope(StatusCode::UNAUTHORIZED, "unauthorized", "Authentication required.", &[])
}

fn v1_order_json(order: &Order) -> serde_json::Value {
    json!({
        "id": order.id,
        "order_number": order.order_number,
        "product_name": order.product_name,
        "buyer": order.buyer,
        "responsible": order.responsible,
        "quantity": order.quantity,
        "required_delivery": order.required_delivery,
        "terms_of_delivery": order.terms_of_delivery,
        "order_date": dates::to_iso(&order.order_date),
        "payment_date": dates::to_iso(&order.payment_date),
        "etd": dates::to_iso(&order.etd),
        "eta": dates::to_iso(&order.eta),
        "ata": dates::to_iso(&order.ata),
        "transit_status": order.transit_status,
        "transport": order.transport,
        "delivery_year": order.delivery_year,
    })
}

fn filters_meta(query: &QueryState) -> serde_json::Value {
    fn field(value: &str) -> serde_json::Value {
        if value.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(value.to_string())
        }
    }
    json!({
        "q": field(&query.q),
        "transit_status": field(&query.transit_status),
        "year": field(&query.year),
        "buyer": field(&query.buyer),
        "responsible": field(&query.responsible),
        "transport": field(&query.transport),
    })
}

/// Filter, sort and slice the visible orders per the query state. Returns
/// the page rows, the pre-slice total and the effective sort chain.
fn run_v1_query(mut orders: Vec<Order>, query: &QueryState) -> (Vec<Order>, usize, SortChain) {
    if let Some(year) = query.year() {
        orders.retain(|o| o.touches_year(year));
    }
    let status = query.transit_status.trim();
    if !status.is_empty() {
        orders.retain(|o| o.transit_status == status);
    }
    for (needle, pick) in [
        (query.buyer.trim().to_lowercase(), 0usize),
        (query.responsible.trim().to_lowercase(), 1),
        (query.transport.trim().to_lowercase(), 2),
    ] {
        if needle.is_empty() {
            continue;
        }
        orders.retain(|o| {
            let field = match pick {
                0 => &o.buyer,
                1 => &o.responsible,
                _ => &o.transport,
            };
            field.trim().to_lowercase() == needle
        });
    }
    let needle = query.q.trim().to_lowercase();
    if !needle.is_empty() {
        orders.retain(|o| {
            [&o.order_number, &o.product_name, &o.buyer, &o.responsible]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle))
        });
    }

    let chain = SortChain::parse(&query.sort);
    let sorted = chain.apply(&orders);
    let total = sorted.len();
    let rows = slice_page(&sorted, query.page, clamp_per_page(query.per_page));
    (rows, total, chain)
}

async fn v1_orders_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
) -> Response {
    let Some(user) = current_user(&state, &headers).await else {
        return unauthorized();
    };
    let query = QueryState::from_query_string(raw.as_deref().unwrap_or(""));
    let orders = state.store.list_for(&user).await;
    let (rows, total, chain) = run_v1_query(orders, &query);
    let data: Vec<serde_json::Value> = rows.iter().map(v1_order_json).collect();
    ok_envelope(
        json!(data),
        json!({
            "page": query.page,
            "per_page": clamp_per_page(query.per_page),
            "total": total,
            "sort": chain.to_string(),
            "filters": filters_meta(&query),
        }),
    )
}

async fn v1_auth_me_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(user) = current_user(&state, &headers).await else {
        return unauthorized();
    };
    ok_envelope(
        json!({ "id": user.id, "username": user.username, "role": user.role }),
        json!({}),
    )
}

// ---- mutation endpoints ----

fn is_ajax(headers: &HeaderMap) -> bool {
    headers
        .get("x-requested-with")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

fn mutation_response(wants_json: bool, status: StatusCode, success: bool, message: &str) -> Response {
    if wants_json {
        (status, Json(json!({ "success": success, "message": message }))).into_response()
    } else {
        Redirect::to("/").into_response()
    }
}

fn store_error_response(wants_json: bool, err: StoreError) -> Response {
    match err {
        StoreError::NotFound(_) => {
            mutation_response(wants_json, StatusCode::NOT_FOUND, false, "Order not found.")
        }
        StoreError::Draft(draft) => {
            mutation_response(wants_json, StatusCode::BAD_REQUEST, false, &draft.to_string())
        }
        StoreError::Persist(err) => {
            warn!("persisting the order book failed: {err:#}");
            mutation_response(
                wants_json,
                StatusCode::INTERNAL_SERVER_ERROR,
                false,
                "Could not save changes.",
            )
        }
    }
}

/// Auth, demo read-only and role gate shared by every mutation. `Err` is
/// the finished refusal response.
async fn mutation_gate(
    state: &AppState,
    headers: &HeaderMap,
    denial: &str,
) -> Result<User, Box<Response>> {
    let wants_json = is_ajax(headers);
    let Some(user) = current_user(state, headers).await else {
        return Err(Box::new(mutation_response(
            wants_json,
            StatusCode::UNAUTHORIZED,
            false,
            "Authentication required.",
        )));
    };
    if state.config.demo_mode && state.config.demo_read_only {
        return Err(Box::new(mutation_response(
            wants_json,
            StatusCode::FORBIDDEN,
            false,
            "Demo is read-only. Changes are disabled.",
        )));
    }
    if !user.can_edit() {
        return Err(Box::new(mutation_response(wants_json, StatusCode::FORBIDDEN, false, denial)));
    }
    Ok(user)
}

/// Ownership check for the row-level mutations.
async fn owned_target(
    state: &AppState,
    user: &User,
    id: i64,
    wants_json: bool,
    denial: &str,
) -> Result<StoredOrder, Box<Response>> {
    let Some(existing) = state.store.get(id).await else {
        return Err(Box::new(mutation_response(
            wants_json,
            StatusCode::NOT_FOUND,
            false,
            "Order not found.",
        )));
    };
    if !user.may_touch(existing.user_id) {
        return Err(Box::new(mutation_response(wants_json, StatusCode::FORBIDDEN, false, denial)));
    }
    Ok(existing)
}

async fn add_order_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Form(draft): Form<OrderDraft>,
) -> Response {
    let wants_json = is_ajax(&headers);
    let user = match mutation_gate(&state, &headers, "Permission denied.").await {
        Ok(user) => user,
        Err(resp) => return *resp,
    };
    match state.store.insert(user.id, &draft).await {
        Ok(_) => mutation_response(wants_json, StatusCode::OK, true, "Order added successfully!"),
        Err(err) => store_error_response(wants_json, err),
    }
}

async fn edit_order_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
    Form(draft): Form<OrderDraft>,
) -> Response {
    let wants_json = is_ajax(&headers);
    let denial = "You do not have permission to edit this order.";
    let user = match mutation_gate(&state, &headers, denial).await {
        Ok(user) => user,
        Err(resp) => return *resp,
    };
    if let Err(resp) = owned_target(&state, &user, id, wants_json, denial).await {
        return *resp;
    }
    match state.store.update(id, &draft).await {
        Ok(_) => mutation_response(wants_json, StatusCode::OK, true, "Order updated successfully."),
        Err(err) => store_error_response(wants_json, err),
    }
}

async fn delete_order_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> Response {
    let wants_json = is_ajax(&headers);
    let user = match mutation_gate(&state, &headers, "Permission denied.").await {
        Ok(user) => user,
        Err(resp) => return *resp,
    };
    if let Err(resp) = owned_target(&state, &user, id, wants_json, "Permission denied.").await {
        return *resp;
    }
    match state.store.remove(id).await {
        Ok(_) => mutation_response(wants_json, StatusCode::OK, true, "Order deleted successfully!"),
        Err(err) => store_error_response(wants_json, err),
    }
}

async fn stock_order_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> Response {
    let wants_json = is_ajax(&headers);
    let user = match mutation_gate(&state, &headers, "Permission denied.").await {
        Ok(user) => user,
        Err(resp) => return *resp,
    };
    if let Err(resp) = owned_target(&state, &user, id, wants_json, "Permission denied.").await {
        return *resp;
    }
    match state.store.move_to_warehouse(id, today()).await {
        Ok(()) => mutation_response(
            wants_json,
            StatusCode::OK,
            true,
            "Order moved to warehouse successfully!",
        ),
        Err(err) => store_error_response(wants_json, err),
    }
}

async fn deliver_direct_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    headers: HeaderMap,
) -> Response {
    let wants_json = is_ajax(&headers);
    let user = match mutation_gate(&state, &headers, "Permission denied.").await {
        Ok(user) => user,
        Err(resp) => return *resp,
    };
    if let Err(resp) = owned_target(&state, &user, id, wants_json, "Permission denied.").await {
        return *resp;
    }
    match state.store.deliver_direct(id, today()).await {
        Ok(()) => mutation_response(
            wants_json,
            StatusCode::OK,
            true,
            "Order delivered and archived successfully!",
        ),
        Err(err) => store_error_response(wants_json, err),
    }
}

// ---- optional database read-through ----

async fn connect_db_from_env() -> Option<PgPool> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    PgPool::connect(&database_url).await.ok()
}

async fn hydrate_from_db(store: &OrderStore) {
    let Some(pool) = connect_db_from_env().await else {
        return;
    };
    match load_orders_from_db(&pool).await {
        Ok(rows) if !rows.is_empty() => match store.replace_all(rows).await {
            Ok(count) => info!("hydrated {count} orders from the database"),
            Err(err) => warn!("hydrated orders could not be persisted: {err:#}"),
        },
        Ok(_) => {}
        Err(err) => warn!("database hydration failed, keeping the snapshot: {err:#}"),
    }
}

async fn load_orders_from_db(pool: &PgPool) -> anyhow::Result<Vec<StoredOrder>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, order_number, product_name, buyer, responsible,
               quantity, required_delivery, terms_of_delivery, order_date,
               payment_date, etd, eta, ata, transit_status, transport,
               delivery_year
          FROM orders
         ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    fn text(row: &sqlx::postgres::PgRow, name: &str) -> anyhow::Result<String> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    }

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let order = Order {
            id: row.try_get("id")?,
            order_number: text(&row, "order_number")?,
            product_name: text(&row, "product_name")?,
            buyer: text(&row, "buyer")?,
            responsible: text(&row, "responsible")?,
            quantity: row.try_get("quantity")?,
            required_delivery: text(&row, "required_delivery")?,
            terms_of_delivery: text(&row, "terms_of_delivery")?,
            order_date: text(&row, "order_date")?,
            payment_date: text(&row, "payment_date")?,
            etd: text(&row, "etd")?,
            eta: text(&row, "eta")?,
            ata: text(&row, "ata")?,
            transit_status: text(&row, "transit_status")?,
            transport: text(&row, "transport")?,
            delivery_year: row.try_get("delivery_year")?,
        };
        out.push(StoredOrder { user_id: row.try_get("user_id")?, order });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    fn test_config(dir: &TempDir, demo: bool) -> ServerConfig {
        ServerConfig {
            port: 0,
            data_dir: dir.path().to_path_buf(),
            demo_mode: demo,
            demo_read_only: false,
            demo_auto_login: demo,
            auto_seed: false,
            seed_file: None,
        }
    }

    fn draft(number: &str, year: &str) -> OrderDraft {
        OrderDraft {
            order_date: format!("05.01.{year}"),
            order_number: number.to_string(),
            product_name: "Steel coils".to_string(),
            buyer: "Acme".to_string(),
            responsible: "JK".to_string(),
            quantity: "12".to_string(),
            required_delivery: "By Q3".to_string(),
            terms_of_delivery: "CIF".to_string(),
            payment_date: String::new(),
            etd: format!("01.02.{year}"),
            eta: format!("05.03.{year}"),
            ata: String::new(),
            transit_status: "in process".to_string(),
            transport: "sea".to_string(),
        }
    }

    async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .clone()
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    async fn post_form(
        app: &Router,
        uri: &str,
        body: &str,
        ajax: bool,
        bearer: Option<&str>,
    ) -> (StatusCode, String, Option<String>) {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded");
        if ajax {
            builder = builder.header("x-requested-with", "XMLHttpRequest");
        }
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let resp = app.clone().oneshot(builder.body(Body::from(body.to_string())).unwrap()).await.unwrap();
        let status = resp.status();
        let location = resp
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap(), location)
    }

    fn json_body(raw: &str) -> serde_json::Value {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn anonymous_visitors_get_the_sign_in_prompt() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let app = app(AppState::new(test_config(&dir, false), store));

        let (status, body) = get(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Sign in"));
        assert!(!body.contains("<table"));
    }

    #[tokio::test]
    async fn dashboard_renders_table_and_timeline() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        store.insert(1, &draft("PO-1001", "25")).await.unwrap();
        let mut arrived = draft("PO-1002", "25");
        arrived.transit_status = "arrived".to_string();
        arrived.ata = "10.03.25".to_string();
        store.insert(1, &arrived).await.unwrap();
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, body) = get(&app, "/?year=2025").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("PO-1001"));
        assert!(body.contains("PO-1002"));
        assert!(body.contains("Page 1 / 1 (2 rows)"));
        // Two timeline bars, one per order.
        assert_eq!(body.matches("class=\"bar ").count(), 2);
        assert!(body.contains("arrived"));
    }

    #[tokio::test]
    async fn dashboard_scopes_to_the_selected_year() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        store.insert(1, &draft("PO-OLD", "24")).await.unwrap();
        store.insert(1, &draft("PO-NEW", "25")).await.unwrap();
        let app = app(AppState::new(test_config(&dir, true), store));

        let (_, body) = get(&app, "/?year=2024").await;
        assert!(body.contains("PO-OLD"));
        assert!(!body.contains("PO-NEW"));

        // Default view picks the newest year.
        let (_, body) = get(&app, "/").await;
        assert!(body.contains("PO-NEW"));
        assert!(!body.contains("PO-OLD"));
    }

    #[tokio::test]
    async fn legacy_endpoints_speak_the_flat_shapes() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        store.insert(1, &draft("PO-1001", "25")).await.unwrap();
        store.insert(1, &draft("PO-0900", "24")).await.unwrap();
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, body) = get(&app, "/api/years").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body), json!({ "years": [2025, 2024] }));

        let (_, body) = get(&app, "/api/orders?year=2025").await;
        let payload = json_body(&body);
        let orders = payload["orders"].as_array().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0]["order_number"], "PO-1001");
        assert_eq!(orders[0]["order_date"], "05.01.25");
        assert!(orders[0].get("delivery_year").is_none());

        // No year parameter: every visible row, newest order first.
        let (_, body) = get(&app, "/api/orders").await;
        let orders = json_body(&body)["orders"].as_array().unwrap().clone();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0]["order_number"], "PO-1001");
        assert_eq!(orders[1]["order_number"], "PO-0900");

        let (_, body) = get(&app, "/api/products").await;
        assert_eq!(json_body(&body), json!(["Steel coils"]));
    }

    #[tokio::test]
    async fn v1_requires_a_session_when_demo_is_off() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let app = app(AppState::new(test_config(&dir, false), store));

        let (status, body) = get(&app, "/api/v1/orders").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let payload = json_body(&body);
        assert_eq!(payload["error"]["code"], "unauthorized");
        assert!(payload["trace_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn v1_orders_filters_sorts_and_pages() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        for (number, day) in [("PO-3", "03"), ("PO-1", "01"), ("PO-2", "02")] {
            let mut d = draft(number, "25");
            d.order_date = format!("{day}.01.25");
            store.insert(1, &d).await.unwrap();
        }
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, body) =
            get(&app, "/api/v1/orders?filter%5Byear%5D=2025&sort=order_date:asc&per_page=2&page=2")
                .await;
        assert_eq!(status, StatusCode::OK);
        let payload = json_body(&body);
        let data = payload["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["order_number"], "PO-3");
        assert_eq!(data[0]["order_date"], "2025-01-03");
        assert_eq!(data[0]["required_delivery"], "By Q3");
        assert_eq!(payload["meta"]["total"], 3);
        assert_eq!(payload["meta"]["per_page"], 2);
        assert_eq!(payload["meta"]["sort"], "order_date:asc,id:desc");
        assert_eq!(payload["meta"]["filters"]["year"], "2025");
        assert!(payload["meta"]["filters"]["buyer"].is_null());
    }

    #[tokio::test]
    async fn v1_equality_filters_fold_case() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        store.insert(1, &draft("PO-1001", "25")).await.unwrap();
        let mut other = draft("PO-1002", "25");
        other.buyer = "Globex".to_string();
        store.insert(1, &other).await.unwrap();
        let app = app(AppState::new(test_config(&dir, true), store));

        let (_, body) = get(&app, "/api/v1/orders?filter%5Bbuyer%5D=acme").await;
        let payload = json_body(&body);
        assert_eq!(payload["meta"]["total"], 1);
        assert_eq!(payload["data"][0]["order_number"], "PO-1001");
    }

    #[tokio::test]
    async fn v1_auth_me_reports_the_demo_identity() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, body) = get(&app, "/api/v1/auth/me").await;
        assert_eq!(status, StatusCode::OK);
        let payload = json_body(&body);
        assert_eq!(payload["data"]["username"], "demo");
        assert_eq!(payload["data"]["role"], "admin");
    }

    #[tokio::test]
    async fn add_order_round_trips_through_the_form() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let app = app(AppState::new(test_config(&dir, true), store));

        let body = "order_number=PO-1001&product_name=Steel+coils&quantity=12&order_date=05.01.25&etd=01.02.25&eta=05.03.25&transit_status=in+process&transport=sea";
        let (status, resp, _) = post_form(&app, "/add_order", body, true, None).await;
        assert_eq!(status, StatusCode::OK);
        let payload = json_body(&resp);
        assert_eq!(payload["success"], true);
        assert_eq!(payload["message"], "Order added successfully!");

        let (_, listing) = get(&app, "/api/v1/orders").await;
        assert_eq!(json_body(&listing)["meta"]["total"], 1);
    }

    #[tokio::test]
    async fn add_order_reports_validation_messages() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let app = app(AppState::new(test_config(&dir, true), store));

        let body = "order_number=PO-1001&quantity=-5";
        let (status, resp, _) = post_form(&app, "/add_order", body, true, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json_body(&resp)["message"], "Quantity must be a positive number.");
    }

    #[tokio::test]
    async fn read_only_roles_cannot_mutate() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let id = store.insert(1, &draft("PO-1001", "25")).await.unwrap().id;
        let state = AppState::new(test_config(&dir, false), store);
        let token = state.sessions.issue(User::new(5, "vera", "viewer")).await;
        let app = app(state);

        let (status, resp, _) =
            post_form(&app, &format!("/delete_order/{id}"), "", true, Some(&token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json_body(&resp)["message"], "Permission denied.");
    }

    #[tokio::test]
    async fn non_owners_cannot_edit_without_reach() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let id = store.insert(1, &draft("PO-1001", "25")).await.unwrap().id;
        let state = AppState::new(test_config(&dir, false), store);
        let token = state.sessions.issue(User::new(9, "sam", "user")).await;
        let app = app(state);

        let body = "order_number=PO-1001&quantity=3&etd=01.02.25&eta=05.03.25";
        let (status, resp, _) =
            post_form(&app, &format!("/edit_order/{id}"), body, true, Some(&token)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(
            json_body(&resp)["message"],
            "You do not have permission to edit this order."
        );
    }

    #[tokio::test]
    async fn demo_read_only_blocks_every_write() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let mut config = test_config(&dir, true);
        config.demo_read_only = true;
        let app = app(AppState::new(config, store));

        let (status, resp, _) =
            post_form(&app, "/add_order", "order_number=PO-1&quantity=1", true, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json_body(&resp)["message"], "Demo is read-only. Changes are disabled.");
    }

    #[tokio::test]
    async fn browser_posts_are_redirected_home() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let id = store.insert(1, &draft("PO-1001", "25")).await.unwrap().id;
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, _, location) =
            post_form(&app, &format!("/delete_order/{id}"), "", false, None).await;
        assert_eq!(status, StatusCode::SEE_OTHER);
        assert_eq!(location.as_deref(), Some("/"));
    }

    #[tokio::test]
    async fn stock_and_deliver_complete_the_lifecycle() {
        let dir = tempdir().unwrap();
        let store = OrderStore::load_or_default(dir.path()).await;
        let first = store.insert(1, &draft("PO-1001", "25")).await.unwrap().id;
        let second = store.insert(1, &draft("PO-1002", "25")).await.unwrap().id;
        let app = app(AppState::new(test_config(&dir, true), store));

        let (status, resp, _) =
            post_form(&app, &format!("/stock_order/{first}"), "", true, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&resp)["message"], "Order moved to warehouse successfully!");

        let (status, resp, _) =
            post_form(&app, &format!("/deliver_direct/{second}"), "", true, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            json_body(&resp)["message"],
            "Order delivered and archived successfully!"
        );

        let (_, listing) = get(&app, "/api/v1/orders").await;
        assert_eq!(json_body(&listing)["meta"]["total"], 0);

        let (status, resp, _) =
            post_form(&app, &format!("/deliver_direct/{second}"), "", true, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json_body(&resp)["message"], "Order not found.");
    }
}
