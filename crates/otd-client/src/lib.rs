//! Typed client for the dashboard JSON API: an async gateway over the
//! versioned envelope plus the view-state reducer the script-driven
//! front end runs on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use otd_core::paginate::clamp_per_page;
use otd_core::query::DEFAULT_SORT;
use otd_core::{Order, QueryState, SortKey, SortState, User};
use serde::Deserialize;
use tracing::debug;

pub const CRATE_NAME: &str = "otd-client";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error payload the API ships inside its envelope, kept verbatim so the
/// view can show the server's own wording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub code: String,
    pub message: String,
    pub details: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthorized(ApiError),
    #[error("{}", .0.message)]
    Api(ApiError),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// Paging counters from the `meta` object; the sort echo and filter echo
/// also live there but only the view's query state needs those.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageMeta {
    pub page: u32,
    pub per_page: u32,
    pub total: u64,
}

impl Default for PageMeta {
    fn default() -> Self {
        PageMeta { page: 1, per_page: otd_core::DEFAULT_PER_PAGE, total: 0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderPage {
    pub rows: Vec<Order>,
    pub meta: PageMeta,
}

/// Acknowledgement the mutation endpoints return to script callers.
/// `success: false` carries a validation or permission message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MutationAck {
    pub success: bool,
    pub message: String,
}

/// The three calls the dashboard view needs from the server. Kept as a
/// trait so tests drive the session with a scripted gateway.
#[async_trait]
pub trait ApiGateway: Send + Sync {
    async fn auth_me(&self) -> Result<User, GatewayError>;
    async fn list_orders(&self, query: &QueryState) -> Result<OrderPage, GatewayError>;
    async fn post_action(&self, path: &str) -> Result<MutationAck, GatewayError>;
}

/// `reqwest`-backed gateway. Reads use the enveloped v1 endpoints;
/// actions post to the legacy mutation endpoints with the AJAX marker
/// header so the server answers in JSON instead of redirecting.
pub struct HttpGateway {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(HttpGateway { base_url: base_url.into(), token, client })
    }

    fn request(&self, method: reqwest::Method, path_and_query: &str) -> reqwest::RequestBuilder {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path_and_query.trim_start_matches('/')
        );
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// GET an enveloped endpoint. Non-2xx bodies are decoded into
    /// [`ApiError`] so callers see the server's code and message; a 401
    /// gets its own variant because the view treats it as a sign-out.
    async fn fetch_envelope(&self, path_and_query: &str) -> Result<serde_json::Value, GatewayError> {
        let response = self.request(reqwest::Method::GET, path_and_query).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if status.is_success() {
            return Ok(body);
        }
        let error = decode_error(status.as_u16(), &body);
        if status == reqwest::StatusCode::UNAUTHORIZED {
            Err(GatewayError::Unauthorized(error))
        } else {
            Err(GatewayError::Api(error))
        }
    }
}

fn field_str(value: Option<&serde_json::Value>, field: &str) -> Option<String> {
    value.and_then(|v| v.get(field)).and_then(|v| v.as_str()).map(str::to_string)
}

fn decode_error(status: u16, body: &serde_json::Value) -> ApiError {
    let error = body.get("error");
    let details = error
        .and_then(|e| e.get("details"))
        .and_then(|v| v.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    ApiError {
        status,
        code: field_str(error, "code").unwrap_or_else(|| "unknown".to_string()),
        message: field_str(error, "message").unwrap_or_else(|| "Request failed.".to_string()),
        details,
    }
}

#[async_trait]
impl ApiGateway for HttpGateway {
    async fn auth_me(&self) -> Result<User, GatewayError> {
        let body = self.fetch_envelope("/api/v1/auth/me").await?;
        let data = body.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Ok(serde_json::from_value(data)?)
    }

    async fn list_orders(&self, query: &QueryState) -> Result<OrderPage, GatewayError> {
        let path = format!("/api/v1/orders?{}", query.to_query_string());
        let body = self.fetch_envelope(&path).await?;
        let data = body.get("data").cloned().unwrap_or(serde_json::Value::Null);
        let meta = body.get("meta").cloned().unwrap_or(serde_json::Value::Null);
        Ok(OrderPage { rows: serde_json::from_value(data)?, meta: serde_json::from_value(meta)? })
    }

    async fn post_action(&self, path: &str) -> Result<MutationAck, GatewayError> {
        let response = self
            .request(reqwest::Method::POST, path)
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::Unauthorized(ApiError {
                status: status.as_u16(),
                code: "unauthorized".to_string(),
                message: field_str(Some(&body), "message")
                    .unwrap_or_else(|| "Authentication required.".to_string()),
                details: Vec::new(),
            }));
        }
        // Refusals (validation, permission, missing order) still come back
        // as `{success: false, message}` bodies, so they decode here too.
        Ok(serde_json::from_value(body)?)
    }
}

/// Where the viewer stands with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthPhase {
    Loading,
    SignedIn(User),
    Unauthorized,
    Failed(ApiError),
}

/// One dashboard transition. The reducer in [`ViewState::apply`] is the
/// only place state changes, so every path stays replayable in tests.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    AuthOk(User),
    AuthUnauthorized,
    AuthFailed(ApiError),
    LoadStarted,
    LoadOk { rows: Vec<Order>, meta: PageMeta },
    LoadFailed(ApiError),
    QueryPatched(QueryPatch),
    PageSet(u32),
    ColumnClicked(SortKey),
    FiltersReset,
}

/// Partial query update; `None` fields keep their current value. Any
/// patch snaps back to the first page.
#[derive(Debug, Clone, Default)]
pub struct QueryPatch {
    pub q: Option<String>,
    pub transit_status: Option<String>,
    pub year: Option<String>,
    pub buyer: Option<String>,
    pub responsible: Option<String>,
    pub transport: Option<String>,
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ViewState {
    pub auth: AuthPhase,
    pub query: QueryState,
    pub sort_state: SortState,
    pub rows: Vec<Order>,
    pub meta: PageMeta,
    pub loading: bool,
    pub error: Option<ApiError>,
}

impl Default for ViewState {
    fn default() -> Self {
        ViewState {
            auth: AuthPhase::Loading,
            query: QueryState::default(),
            sort_state: SortState::new(),
            rows: Vec::new(),
            meta: PageMeta::default(),
            loading: false,
            error: None,
        }
    }
}

impl ViewState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: ViewEvent) {
        match event {
            ViewEvent::AuthOk(user) => self.auth = AuthPhase::SignedIn(user),
            ViewEvent::AuthUnauthorized => {
                self.auth = AuthPhase::Unauthorized;
                self.rows.clear();
            }
            ViewEvent::AuthFailed(error) => self.auth = AuthPhase::Failed(error),
            ViewEvent::LoadStarted => {
                self.loading = true;
                self.error = None;
            }
            ViewEvent::LoadOk { rows, meta } => {
                self.loading = false;
                self.rows = rows;
                self.meta = meta;
                self.error = None;
            }
            ViewEvent::LoadFailed(error) => {
                // The table never shows half of a failed load; the query
                // stays put so a retry re-runs the same view.
                self.loading = false;
                self.rows.clear();
                if error.status == 401 {
                    self.auth = AuthPhase::Unauthorized;
                    self.error = None;
                } else {
                    self.error = Some(error);
                }
            }
            ViewEvent::QueryPatched(patch) => {
                let year_changed =
                    matches!(&patch.year, Some(year) if *year != self.query.year);
                self.query = self.query.clone().with_page_reset(|q| {
                    if let Some(v) = patch.q {
                        q.q = v;
                    }
                    if let Some(v) = patch.transit_status {
                        q.transit_status = v;
                    }
                    if let Some(v) = patch.year {
                        q.year = v;
                    }
                    if let Some(v) = patch.buyer {
                        q.buyer = v;
                    }
                    if let Some(v) = patch.responsible {
                        q.responsible = v;
                    }
                    if let Some(v) = patch.transport {
                        q.transport = v;
                    }
                    if let Some(v) = patch.per_page {
                        q.per_page = clamp_per_page(v);
                    }
                });
                if year_changed {
                    self.sort_state.reset();
                    self.query.sort = DEFAULT_SORT.to_string();
                }
            }
            ViewEvent::PageSet(page) => self.query = self.query.clone().with_page(page),
            ViewEvent::ColumnClicked(key) => {
                let spec = self.sort_state.click(key);
                self.query =
                    self.query.clone().with_page_reset(|q| q.sort = format!("{spec},id:desc"));
            }
            ViewEvent::FiltersReset => {
                self.query = self.query.clone().reset_filters();
                self.sort_state.reset();
            }
        }
    }
}

/// Ticket for one in-flight load. Only the newest ticket may commit its
/// outcome; anything older is a response that lost the race.
#[derive(Debug)]
pub struct LoadTicket(u64);

impl LoadTicket {
    pub fn generation(&self) -> u64 {
        self.0
    }
}

/// Issues load generations. Responses commit in issuance order, newest
/// wins, so a slow early request can never overwrite a later view.
#[derive(Debug, Default)]
pub struct LoadCoordinator {
    generation: AtomicU64,
}

impl LoadCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> LoadTicket {
        LoadTicket(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, ticket: &LoadTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.0
    }
}

fn to_api_error(error: GatewayError) -> ApiError {
    match error {
        GatewayError::Unauthorized(e) | GatewayError::Api(e) => e,
        GatewayError::Transport(e) => ApiError {
            status: 0,
            code: "transport".to_string(),
            message: e.to_string(),
            details: Vec::new(),
        },
        GatewayError::Decode(e) => ApiError {
            status: 0,
            code: "decode".to_string(),
            message: e.to_string(),
            details: Vec::new(),
        },
    }
}

/// Drives one dashboard view: gateway calls in, reducer events out.
/// Every query change triggers a fresh load through the coordinator.
pub struct DashboardSession<G> {
    gateway: G,
    coordinator: LoadCoordinator,
    pub state: ViewState,
}

impl<G: ApiGateway> DashboardSession<G> {
    pub fn new(gateway: G) -> Self {
        DashboardSession {
            gateway,
            coordinator: LoadCoordinator::new(),
            state: ViewState::new(),
        }
    }

    pub async fn sign_in(&mut self) {
        match self.gateway.auth_me().await {
            Ok(user) => self.state.apply(ViewEvent::AuthOk(user)),
            Err(GatewayError::Unauthorized(_)) => self.state.apply(ViewEvent::AuthUnauthorized),
            Err(error) => self.state.apply(ViewEvent::AuthFailed(to_api_error(error))),
        }
    }

    /// Mark a load as started and take its ticket.
    pub fn begin_load(&mut self) -> LoadTicket {
        self.state.apply(ViewEvent::LoadStarted);
        self.coordinator.begin()
    }

    /// Apply a finished load, unless a newer one started meanwhile.
    pub fn commit_load(&mut self, ticket: LoadTicket, outcome: Result<OrderPage, GatewayError>) {
        if !self.coordinator.is_current(&ticket) {
            debug!("load generation {} superseded, result discarded", ticket.generation());
            return;
        }
        match outcome {
            Ok(page) => self.state.apply(ViewEvent::LoadOk { rows: page.rows, meta: page.meta }),
            Err(error) => self.state.apply(ViewEvent::LoadFailed(to_api_error(error))),
        }
    }

    pub async fn refresh(&mut self) {
        let ticket = self.begin_load();
        let outcome = self.gateway.list_orders(&self.state.query).await;
        self.commit_load(ticket, outcome);
    }

    pub async fn patch_query(&mut self, patch: QueryPatch) {
        self.state.apply(ViewEvent::QueryPatched(patch));
        self.refresh().await;
    }

    pub async fn set_page(&mut self, page: u32) {
        self.state.apply(ViewEvent::PageSet(page));
        self.refresh().await;
    }

    pub async fn click_column(&mut self, key: SortKey) {
        self.state.apply(ViewEvent::ColumnClicked(key));
        self.refresh().await;
    }

    pub async fn reset_filters(&mut self) {
        self.state.apply(ViewEvent::FiltersReset);
        self.refresh().await;
    }

    /// Post a row action, then re-fetch the current query no matter how
    /// the action went; the table is the source of truth, not the ack.
    pub async fn submit(&mut self, path: &str) -> Result<MutationAck, GatewayError> {
        let outcome = self.gateway.post_action(path).await;
        self.refresh().await;
        outcome
    }
}
