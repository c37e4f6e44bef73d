//! End-to-end scenarios over the sample feed: enrichment, export, retry after
//! a timed-out search, empty feeds and free-text deadlines.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use radar_adapters::{CsvFileSource, RowSource};
use radar_enrich::{DeepResearchInvoker, EnrichmentCache, EnrichmentError, SearchHit, SearchProvider, TextGenerator};
use radar_report::{build_report, PageLayout};
use radar_web::{app, AppState};
use tower::ServiceExt;

fn sample_feed() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/feed/sample.csv")
        .canonicalize()
        .unwrap()
}

/// Sleeps past the search timeout while `slow` is set.
#[derive(Default)]
struct FlakySearch {
    slow: AtomicBool,
    calls: AtomicUsize,
}

#[async_trait]
impl SearchProvider for FlakySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(vec![SearchHit {
            url: "https://www.boe.es/buscar/doc.php?id=BOE-A-2026-1021".into(),
            title: "Bases reguladoras".into(),
            content: format!("Bases para {query}"),
        }])
    }
}

struct CannedGenerator;

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(&self, _system: &str, prompt: &str) -> Result<String, EnrichmentError> {
        assert!(prompt.contains("Bases reguladoras"));
        Ok("### Requisitos técnicos ocultos\n* Certificado **ENS** nivel medio.\n### Estrategia ganadora\nPresentar antes del día 10 — sin excepciones.".into())
    }
}

fn invoker(search: Arc<FlakySearch>) -> DeepResearchInvoker {
    DeepResearchInvoker::new(
        search,
        Arc::new(CannedGenerator),
        Duration::from_millis(100),
        Duration::from_secs(5),
    )
}

fn fixture_app(search: Arc<FlakySearch>) -> Router {
    app(AppState::new(
        Arc::new(CsvFileSource::new(sample_feed())),
        Arc::new(invoker(search)),
    ))
}

fn request(method: &str, uri: &str, cookie: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

async fn text(app: &Router, uri: &str, cookie: &str) -> String {
    let resp = app.clone().oneshot(request("GET", uri, Some(cookie))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(body.to_vec()).unwrap()
}

async fn start_session(app: &Router) -> String {
    let resp = app.clone().oneshot(request("GET", "/api/opportunities", None)).await.unwrap();
    resp.headers()[header::SET_COOKIE]
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn successful_enrichment_exports_a_report_with_the_title() {
    let search = Arc::new(FlakySearch::default());
    let app = fixture_app(search.clone());
    let cookie = start_session(&app).await;

    let resp = app
        .clone()
        .oneshot(request("POST", "/opportunities/1/enrichment", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SEE_OTHER);

    let detail = text(&app, "/opportunities/1", &cookie).await;
    assert!(detail.contains("data-status=\"ready\""));
    assert!(detail.contains("Bases reguladoras"));

    let pdf = app
        .clone()
        .oneshot(request("GET", "/opportunities/1/report.pdf", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(pdf.status(), StatusCode::OK);
    let bytes = pdf.into_body().collect().await.unwrap().to_bytes();
    assert!(bytes.starts_with(b"%PDF"));
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn report_pages_carry_the_title_and_sanitized_text() {
    let search = Arc::new(FlakySearch::default());
    let snapshot = CsvFileSource::new(sample_feed()).fetch_rows().await.unwrap();
    let opportunity = snapshot.find("1").unwrap();

    let cache = EnrichmentCache::new();
    let outcome = cache
        .trigger(&opportunity.id, &opportunity.enrichment_query(), &invoker(search))
        .await
        .unwrap();
    assert!(outcome.invoked());

    let document = build_report(opportunity, outcome.entry()).unwrap();
    let pages = document.paginate(PageLayout::default());
    assert!(!pages.is_empty());
    assert!(pages.iter().all(|p| p.header.contains("Ayuda Digitalización PYME")));
    let body = pages
        .iter()
        .flat_map(|p| p.lines.iter().map(|l| l.text.as_str()))
        .collect::<Vec<_>>()
        .join("\n");
    assert!(body.contains("Certificado ENS nivel medio."));
    assert!(body.contains("día 10 - sin excepciones"));
    assert!(!body.contains("**"));
    assert!(!body.contains("###"));
}

#[tokio::test]
async fn timed_out_search_fails_then_retries_after_reset() {
    let search = Arc::new(FlakySearch::default());
    search.slow.store(true, Ordering::SeqCst);
    let app = fixture_app(search.clone());
    let cookie = start_session(&app).await;

    app.clone()
        .oneshot(request("POST", "/opportunities/2/enrichment", Some(&cookie)))
        .await
        .unwrap();
    let detail = text(&app, "/opportunities/2", &cookie).await;
    assert!(detail.contains("data-status=\"failed\""));
    assert!(detail.contains("superó el tiempo máximo"));

    let pdf = app
        .clone()
        .oneshot(request("GET", "/opportunities/2/report.pdf", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(pdf.status(), StatusCode::CONFLICT);

    search.slow.store(false, Ordering::SeqCst);
    app.clone()
        .oneshot(request("POST", "/opportunities/2/enrichment/reset", Some(&cookie)))
        .await
        .unwrap();
    app.clone()
        .oneshot(request("POST", "/opportunities/2/enrichment", Some(&cookie)))
        .await
        .unwrap();

    let detail = text(&app, "/opportunities/2", &cookie).await;
    assert!(detail.contains("data-status=\"ready\""));
    assert_eq!(search.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_feed_renders_zero_results_without_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("empty.csv");
    std::fs::write(&path, "ID,Título,Ámbito,Cuantía,Plazo,Sector,Resumen,Justificación,Requisitos Detallados,Probabilidad\n").unwrap();
    let app = app(AppState::new(
        Arc::new(CsvFileSource::new(path)),
        Arc::new(invoker(Arc::default())),
    ));
    let cookie = start_session(&app).await;

    let index = text(&app, "/", &cookie).await;
    assert!(index.contains("0 oportunidades en el radar"));
    assert!(index.contains("0 subvenciones encontradas"));
    assert!(!index.contains("No se pudo cargar el radar"));

    let filtered = text(&app, "/opportunities/table?q=energ%C3%ADa&sector=Energ%C3%ADa", &cookie).await;
    assert!(filtered.contains("0 subvenciones encontradas"));

    let trigger = app
        .clone()
        .oneshot(request("POST", "/opportunities/1/enrichment", Some(&cookie)))
        .await
        .unwrap();
    assert_eq!(trigger.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn free_text_deadline_is_undated_and_not_urgent() {
    let app = fixture_app(Arc::default());
    let cookie = start_session(&app).await;

    let index = text(&app, "/", &cookie).await;
    assert!(index.contains("3 oportunidades en el radar"));
    assert!(index.contains("1 filas sin título se han descartado"));

    let detail = text(&app, "/opportunities/2", &cookie).await;
    assert!(detail.contains("No especificada"));
    assert!(detail.contains("Sin fecha"));
    assert!(!detail.contains("urgency urgent"));
}
