//! Axum + Askama dashboard for the grant radar: feed, filters, on-demand
//! enrichment, PDF export and the optional access gate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use chrono::{NaiveDate, Utc};
use radar_adapters::{FeedConfig, FeedSnapshot, FetchError, RowSource};
use radar_core::{
    deadline_urgency, facet_counts, EnrichmentStatus, Facet, FacetCount, Opportunity, OpportunityFilter,
    ProbabilityLevel, SourceRef,
};
use radar_enrich::{DeepResearchInvoker, EnrichConfig, EnrichmentCache, EnrichmentInvoker};
use radar_report::{build_report, render_pdf, report_file_name};
use radar_storage::{env_non_empty, env_parse, ReadThroughCache};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-web";

pub const SESSION_COOKIE: &str = "radar_session";

const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(12 * 60 * 60);
const DEFAULT_FEED_TTL: Duration = Duration::from_secs(600);

/// Per-visitor state: the enrichment cache and whether the gate was passed.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    cache: EnrichmentCache,
    unlocked: AtomicBool,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            cache: EnrichmentCache::new(),
            unlocked: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn cache(&self) -> &EnrichmentCache {
        &self.cache
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    fn unlock(&self) {
        self.unlocked.store(true, Ordering::SeqCst);
    }
}

struct SessionSlot {
    session: Arc<Session>,
    last_seen: Instant,
}

/// Sessions idle for longer than the TTL are dropped, and their enrichment
/// entries with them.
pub struct SessionRegistry {
    ttl: Duration,
    sessions: Mutex<HashMap<Uuid, SessionSlot>>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live session for `id`, refreshing its idle clock.
    pub async fn lookup(&self, id: Option<Uuid>) -> Option<Arc<Session>> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().await;
        self.prune(&mut sessions, now);
        let slot = sessions.get_mut(&id?)?;
        slot.last_seen = now;
        Some(slot.session.clone())
    }

    /// Returns the live session for `id`, or a fresh one (flagged `true`).
    pub async fn resolve(&self, id: Option<Uuid>) -> (Arc<Session>, bool) {
        if let Some(session) = self.lookup(id).await {
            return (session, false);
        }
        let session = Arc::new(Session::new());
        self.sessions.lock().await.insert(
            session.id,
            SessionSlot {
                session: session.clone(),
                last_seen: Instant::now(),
            },
        );
        (session, true)
    }

    fn prune(&self, sessions: &mut HashMap<Uuid, SessionSlot>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, slot| now.duration_since(slot.last_seen) < self.ttl);
        if sessions.len() < before {
            debug!(pruned = before - sessions.len(), "idle sessions pruned");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct AppState {
    rows: Arc<dyn RowSource>,
    feed: ReadThroughCache<Arc<FeedSnapshot>>,
    invoker: Arc<dyn EnrichmentInvoker>,
    sessions: SessionRegistry,
    access_password: Option<String>,
}

impl AppState {
    pub fn new(rows: Arc<dyn RowSource>, invoker: Arc<dyn EnrichmentInvoker>) -> Self {
        Self {
            rows,
            feed: ReadThroughCache::new(DEFAULT_FEED_TTL),
            invoker,
            sessions: SessionRegistry::new(DEFAULT_SESSION_TTL),
            access_password: None,
        }
    }

    pub fn with_feed_ttl(mut self, ttl: Duration) -> Self {
        self.feed = ReadThroughCache::new(ttl);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.sessions = SessionRegistry::new(ttl);
        self
    }

    pub fn with_access_password(mut self, password: impl Into<String>) -> Self {
        self.access_password = Some(password.into()).filter(|p| !p.is_empty());
        self
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let feed = FeedConfig::from_env();
        let rows = feed.build_row_source().context("building feed source")?;
        let invoker = DeepResearchInvoker::from_config(&EnrichConfig::from_env())
            .context("building enrichment invoker")?;
        let session_ttl = Duration::from_secs(env_parse("RADAR_SESSION_TTL_SECS", DEFAULT_SESSION_TTL.as_secs()));

        let mut state = Self::new(rows, Arc::new(invoker))
            .with_feed_ttl(feed.ttl())
            .with_session_ttl(session_ttl);
        if let Some(password) = env_non_empty("RADAR_ACCESS_PASSWORD") {
            state = state.with_access_password(password);
        }
        Ok(state)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    async fn snapshot(&self, refresh: bool) -> Result<Arc<FeedSnapshot>, FetchError> {
        if refresh {
            self.feed.invalidate().await;
        }
        let rows = self.rows.clone();
        self.feed
            .get_or_load(|| async move {
                let snapshot = rows.fetch_rows().await?;
                info!(
                    source = %snapshot.source_label,
                    rows = snapshot.rows.len(),
                    rejected = snapshot.rejected_rows,
                    "feed refreshed"
                );
                Ok::<_, FetchError>(Arc::new(snapshot))
            })
            .await
    }
}

#[derive(Debug, Clone)]
struct CardView {
    id: String,
    title: String,
    quantity: String,
    deadline: String,
    urgency_label: String,
    urgent: bool,
    sector: String,
    scope: String,
    tags: Vec<String>,
    probability: String,
    probability_class: &'static str,
    summary: String,
    justification: String,
    requirements: String,
    reference_link: String,
    has_link: bool,
    has_issues: bool,
    issues_text: String,
    enrichment_label: &'static str,
}

impl CardView {
    fn new(opportunity: &Opportunity, status: EnrichmentStatus, today: NaiveDate) -> Self {
        let urgency = deadline_urgency(&opportunity.deadline, today);
        Self {
            id: opportunity.id.clone(),
            title: opportunity.title.clone(),
            quantity: opportunity.quantity.clone(),
            deadline: opportunity.deadline.clone(),
            urgency_label: urgency.label(),
            urgent: urgency.is_urgent(),
            sector: opportunity.sector.clone(),
            scope: opportunity.scope.clone(),
            tags: opportunity.tags.clone(),
            probability: opportunity.probability.clone(),
            probability_class: ProbabilityLevel::classify(&opportunity.probability).css_class(),
            summary: opportunity.summary.clone(),
            justification: opportunity.justification.clone(),
            requirements: opportunity.requirements.clone(),
            reference_link: opportunity.reference_link.clone(),
            has_link: opportunity.has_reference_link(),
            has_issues: !opportunity.schema_issues.is_empty(),
            issues_text: opportunity.schema_issues.join(", "),
            enrichment_label: enrichment_label(status),
        }
    }
}

fn enrichment_label(status: EnrichmentStatus) -> &'static str {
    match status {
        EnrichmentStatus::Absent => "sin iniciar",
        EnrichmentStatus::Pending => "en curso",
        EnrichmentStatus::Ready => "disponible",
        EnrichmentStatus::Failed => "fallido",
    }
}

#[derive(Debug, Clone)]
struct FacetGroupView {
    key: &'static str,
    label: &'static str,
    options: Vec<FacetCount>,
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    has_error: bool,
    feed_error: String,
    total: usize,
    shown: usize,
    urgent_count: usize,
    rejected_rows: usize,
    fetched_at: String,
    query: String,
    cards: Vec<CardView>,
    facets: Vec<FacetGroupView>,
}

impl IndexTemplate {
    fn unavailable(err: &FetchError) -> Self {
        Self {
            has_error: true,
            feed_error: err.to_string(),
            total: 0,
            shown: 0,
            urgent_count: 0,
            rejected_rows: 0,
            fetched_at: String::new(),
            query: String::new(),
            cards: vec![],
            facets: vec![],
        }
    }
}

#[derive(Template)]
#[template(path = "cards_partial.html")]
struct CardsPartialTemplate {
    cards: Vec<CardView>,
    shown: usize,
}

#[derive(Template)]
#[template(path = "facets_partial.html")]
struct FacetsPartialTemplate {
    facets: Vec<FacetGroupView>,
}

#[derive(Template)]
#[template(path = "opportunity_detail.html")]
struct OpportunityDetailTemplate {
    card: CardView,
    status: &'static str,
    is_absent: bool,
    is_pending: bool,
    is_ready: bool,
    is_failed: bool,
    paragraphs: Vec<String>,
    error_text: String,
    sources: Vec<SourceRef>,
    updated_at: String,
}

#[derive(Template)]
#[template(path = "login.html")]
struct LoginTemplate {
    has_error: bool,
    error: String,
}

#[derive(Template)]
#[template(path = "message.html")]
struct MessageTemplate {
    message: String,
    action_href: String,
    action_label: String,
}

/// Filter and refresh flag from a query string. Facet keys may repeat.
#[derive(Debug, Default)]
struct DashboardParams {
    filter: OpportunityFilter,
    refresh: bool,
}

impl DashboardParams {
    fn from_pairs(pairs: &[(String, String)]) -> Self {
        let mut params = Self::default();
        for (key, value) in pairs {
            let value = value.trim();
            match key.as_str() {
                "q" if !value.is_empty() => params.filter.text = Some(value.to_string()),
                "refresh" => params.refresh = value != "0",
                k if k == Facet::Sector.query_key() && !value.is_empty() => {
                    params.filter.sectors.push(value.to_string())
                }
                k if k == Facet::Probability.query_key() && !value.is_empty() => {
                    params.filter.probabilities.push(value.to_string())
                }
                k if k == Facet::Scope.query_key() && !value.is_empty() => {
                    params.filter.scopes.push(value.to_string())
                }
                _ => {}
            }
        }
        params
    }
}

struct DashboardView {
    cards: Vec<CardView>,
    facets: Vec<FacetGroupView>,
    urgent_count: usize,
}

async fn dashboard_view(snapshot: &FeedSnapshot, filter: &OpportunityFilter, session: &Session) -> DashboardView {
    let today = Utc::now().date_naive();
    let mut cards = Vec::new();
    for opportunity in filter.apply(&snapshot.rows) {
        let status = session.cache.read(&opportunity.id).await.status();
        cards.push(CardView::new(&opportunity, status, today));
    }
    let urgent_count = snapshot
        .rows
        .iter()
        .filter(|o| deadline_urgency(&o.deadline, today).is_urgent())
        .count();
    let facets = Facet::ALL
        .iter()
        .map(|facet| FacetGroupView {
            key: facet.query_key(),
            label: facet.label(),
            options: facet_counts(&snapshot.rows, *facet, filter),
        })
        .collect();
    DashboardView {
        cards,
        facets,
        urgent_count,
    }
}

pub fn app(state: AppState) -> Router {
    router(Arc::new(state))
}

/// Same routes as [`app`], for callers that keep a handle on the state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/opportunities/table", get(opportunities_table_handler))
        .route("/opportunities/facets", get(opportunities_facets_handler))
        .route("/opportunities/{id}", get(opportunity_detail_handler))
        .route("/opportunities/{id}/enrichment", post(enrichment_trigger_handler))
        .route("/opportunities/{id}/enrichment/reset", post(enrichment_reset_handler))
        .route("/opportunities/{id}/report.pdf", get(report_pdf_handler))
        .route("/api/opportunities", get(opportunities_json_handler))
        .route("/login", get(login_page_handler).post(login_submit_handler))
        .route("/healthz", get(healthz_handler))
        .layer(middleware::from_fn_with_state(state.clone(), session_layer))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "radar web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = env_parse("RADAR_WEB_PORT", 8000);
    serve(AppState::from_env()?, port).await
}

fn session_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().strip_prefix(SESSION_COOKIE)?.strip_prefix('='))
        .find_map(|id| Uuid::parse_str(id.trim()).ok())
}

/// Health probes never touch the registry. While the gate is closed, only a
/// login submission creates a session; everything else is redirected or served
/// without one.
async fn session_layer(State(state): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    let path = req.uri().path();
    if path == "/healthz" {
        return next.run(req).await;
    }
    let login_page = path == "/login";
    let login_submit = login_page && *req.method() == Method::POST;

    let gate_on = state.access_password.is_some();
    let existing = state.sessions.lookup(session_id_from_headers(req.headers())).await;
    let locked = gate_on && !existing.as_ref().is_some_and(|s| s.is_unlocked());
    if locked && !login_page {
        return Redirect::to("/login").into_response();
    }

    let (session, created) = match existing {
        Some(session) => (Some(session), false),
        None if !gate_on || login_submit => {
            let (session, created) = state.sessions.resolve(None).await;
            (Some(session), created)
        }
        None => (None, false),
    };
    if let Some(session) = &session {
        req.extensions_mut().insert(session.clone());
    }
    let mut resp = next.run(req).await;

    if let Some(session) = session.filter(|_| created) {
        let cookie = format!("{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax", session.id);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            resp.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    resp
}

async fn index_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = DashboardParams::from_pairs(&pairs);
    match state.snapshot(params.refresh).await {
        Ok(snapshot) => {
            let view = dashboard_view(&snapshot, &params.filter, &session).await;
            render_html(IndexTemplate {
                has_error: false,
                feed_error: String::new(),
                total: snapshot.rows.len(),
                shown: view.cards.len(),
                urgent_count: view.urgent_count,
                rejected_rows: snapshot.rejected_rows,
                fetched_at: snapshot.fetched_at.format("%d/%m/%Y %H:%M UTC").to_string(),
                query: params.filter.text.clone().unwrap_or_default(),
                cards: view.cards,
                facets: view.facets,
            })
        }
        Err(err) => {
            warn!(error = %err, "feed unavailable");
            render_html(IndexTemplate::unavailable(&err))
        }
    }
}

async fn opportunities_table_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = DashboardParams::from_pairs(&pairs);
    match state.snapshot(params.refresh).await {
        Ok(snapshot) => {
            let view = dashboard_view(&snapshot, &params.filter, &session).await;
            let mut resp = render_html(CardsPartialTemplate {
                shown: view.cards.len(),
                cards: view.cards,
            });
            resp.headers_mut().insert(
                header::HeaderName::from_static("hx-trigger"),
                HeaderValue::from_static("opportunitiesTableLoaded"),
            );
            resp
        }
        Err(err) => feed_unavailable(err, StatusCode::OK),
    }
}

async fn opportunities_facets_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = DashboardParams::from_pairs(&pairs);
    match state.snapshot(params.refresh).await {
        Ok(snapshot) => {
            let facets = Facet::ALL
                .iter()
                .map(|facet| FacetGroupView {
                    key: facet.query_key(),
                    label: facet.label(),
                    options: facet_counts(&snapshot.rows, *facet, &params.filter),
                })
                .collect();
            render_html(FacetsPartialTemplate { facets })
        }
        Err(err) => feed_unavailable(err, StatusCode::OK),
    }
}

async fn opportunities_json_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let params = DashboardParams::from_pairs(&pairs);
    match state.snapshot(params.refresh).await {
        Ok(snapshot) => Json(params.filter.apply(&snapshot.rows)).into_response(),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let snapshot = match state.snapshot(false).await {
        Ok(snapshot) => snapshot,
        Err(err) => return feed_unavailable(err, StatusCode::SERVICE_UNAVAILABLE),
    };
    let Some(opportunity) = snapshot.find(&id) else {
        return not_found(&id);
    };

    let entry = session.cache.read(&id).await;
    let status = entry.status();
    let paragraphs = entry
        .result()
        .map(|text| {
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    render_html(OpportunityDetailTemplate {
        card: CardView::new(opportunity, status, Utc::now().date_naive()),
        status: status.as_str(),
        is_absent: status == EnrichmentStatus::Absent,
        is_pending: status == EnrichmentStatus::Pending,
        is_ready: status == EnrichmentStatus::Ready,
        is_failed: status == EnrichmentStatus::Failed,
        paragraphs,
        error_text: entry.error().unwrap_or_default().to_string(),
        sources: entry.sources().to_vec(),
        updated_at: entry
            .updated_at()
            .map(|at| at.format("%d/%m/%Y %H:%M UTC").to_string())
            .unwrap_or_default(),
    })
}

async fn enrichment_trigger_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let snapshot = match state.snapshot(false).await {
        Ok(snapshot) => snapshot,
        Err(err) => return feed_unavailable(err, StatusCode::SERVICE_UNAVAILABLE),
    };
    let Some(opportunity) = snapshot.find(&id) else {
        return not_found(&id);
    };

    match session
        .cache
        .trigger(&id, &opportunity.enrichment_query(), state.invoker.as_ref())
        .await
    {
        Ok(outcome) => debug!(
            id,
            invoked = outcome.invoked(),
            status = outcome.entry().status().as_str(),
            "enrichment trigger handled"
        ),
        Err(err) => warn!(id, error = %err, "enrichment trigger rejected"),
    }
    Redirect::to(&format!("/opportunities/{id}")).into_response()
}

async fn enrichment_reset_handler(
    Extension(session): Extension<Arc<Session>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    session.cache.reset(&id).await;
    Redirect::to(&format!("/opportunities/{id}")).into_response()
}

async fn report_pdf_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let snapshot = match state.snapshot(false).await {
        Ok(snapshot) => snapshot,
        Err(err) => return feed_unavailable(err, StatusCode::SERVICE_UNAVAILABLE),
    };
    let Some(opportunity) = snapshot.find(&id) else {
        return not_found(&id);
    };

    let entry = session.cache.read(&id).await;
    let document = match build_report(opportunity, &entry) {
        Ok(document) => document,
        Err(err) => {
            debug!(id, error = %err, "report requested before enrichment is ready");
            let mut resp = render_html(MessageTemplate {
                message: "El informe estará disponible cuando termine el análisis profundo.".to_string(),
                action_href: format!("/opportunities/{id}"),
                action_label: "Volver a la oportunidad".to_string(),
            });
            *resp.status_mut() = StatusCode::CONFLICT;
            return resp;
        }
    };

    match render_pdf(&document) {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "application/pdf".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", report_file_name(opportunity)),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(err) => server_error(err.into()),
    }
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    password: String,
}

/// Byte comparison that does not stop at the first mismatch.
fn passwords_match(expected: &str, given: &str) -> bool {
    let (expected, given) = (expected.as_bytes(), given.as_bytes());
    if expected.len() != given.len() {
        return false;
    }
    expected
        .iter()
        .zip(given)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

async fn login_page_handler(
    State(state): State<Arc<AppState>>,
    session: Option<Extension<Arc<Session>>>,
) -> Response {
    let unlocked = session.is_some_and(|Extension(session)| session.is_unlocked());
    if state.access_password.is_none() || unlocked {
        return Redirect::to("/").into_response();
    }
    render_html(LoginTemplate {
        has_error: false,
        error: String::new(),
    })
}

async fn login_submit_handler(
    State(state): State<Arc<AppState>>,
    Extension(session): Extension<Arc<Session>>,
    Form(form): Form<LoginForm>,
) -> Response {
    let Some(expected) = state.access_password.as_deref() else {
        return Redirect::to("/").into_response();
    };
    if passwords_match(expected, &form.password) {
        session.unlock();
        info!(session = %session.id, "session unlocked");
        return Redirect::to("/").into_response();
    }
    warn!(session = %session.id, "rejected access password");
    let mut resp = render_html(LoginTemplate {
        has_error: true,
        error: "Contraseña incorrecta.".to_string(),
    });
    *resp.status_mut() = StatusCode::UNAUTHORIZED;
    resp
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn feed_unavailable(err: FetchError, status: StatusCode) -> Response {
    warn!(error = %err, "feed unavailable");
    let mut resp = render_html(MessageTemplate {
        message: format!("No se pudo cargar el radar: {err}"),
        action_href: "/?refresh=1".to_string(),
        action_label: "Reintentar".to_string(),
    });
    *resp.status_mut() = status;
    resp
}

fn not_found(id: &str) -> Response {
    let mut resp = render_html(MessageTemplate {
        message: format!("No existe la oportunidad {id} en el radar actual."),
        action_href: "/".to_string(),
        action_label: "Volver al radar".to_string(),
    });
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}
