//! Row source contracts + CSV feed ingestion for the published spreadsheet.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use radar_core::{fold_text, Opportunity, PLACEHOLDER};
use radar_storage::{env_non_empty, env_parse, sha256_hex, HttpClientConfig, HttpError, HttpFetcher};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "radar-adapters";

/// Default published spreadsheet backing the radar.
pub const DEFAULT_SHEET_ID: &str = "1XpsEMDFuvV-0fYM51ajDTdtZz21MGFp7t-M-bkrNpRk";
pub const DEFAULT_SHEET_NAME: &str = "Hoja 1";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("feed request failed: {0}")]
    Http(#[from] HttpError),
    #[error("reading feed file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("feed content is not valid CSV: {0}")]
    Malformed(String),
}

/// One refresh of the feed.
#[derive(Debug, Clone, Serialize)]
pub struct FeedSnapshot {
    pub rows: Vec<Opportunity>,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    /// Data rows dropped at ingestion because their title was blank.
    pub rejected_rows: usize,
    pub source_label: String,
}

impl FeedSnapshot {
    pub fn find(&self, id: &str) -> Option<&Opportunity> {
        self.rows.iter().find(|o| o.id == id)
    }
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn label(&self) -> String;

    async fn fetch_rows(&self) -> Result<FeedSnapshot, FetchError>;
}

/// The ten positional fields of the feed contract, in column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedColumn {
    ReferenceLink,
    Title,
    Scope,
    Quantity,
    Deadline,
    Sector,
    Summary,
    Justification,
    Requirements,
    Probability,
}

impl FeedColumn {
    pub const ORDER: [FeedColumn; 10] = [
        FeedColumn::ReferenceLink,
        FeedColumn::Title,
        FeedColumn::Scope,
        FeedColumn::Quantity,
        FeedColumn::Deadline,
        FeedColumn::Sector,
        FeedColumn::Summary,
        FeedColumn::Justification,
        FeedColumn::Requirements,
        FeedColumn::Probability,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            FeedColumn::ReferenceLink => "ID",
            FeedColumn::Title => "Título",
            FeedColumn::Scope => "Ámbito",
            FeedColumn::Quantity => "Cuantía",
            FeedColumn::Deadline => "Plazo",
            FeedColumn::Sector => "Sector",
            FeedColumn::Summary => "Resumen",
            FeedColumn::Justification => "Justificación",
            FeedColumn::Requirements => "Requisitos Detallados",
            FeedColumn::Probability => "Probabilidad",
        }
    }

    /// Header spellings seen across sheet revisions, already folded.
    fn aliases(&self) -> &'static [&'static str] {
        match self {
            FeedColumn::ReferenceLink => &["id", "enlace", "enlace directo", "enlace boe", "url", "link"],
            FeedColumn::Title => &["titulo", "title", "nombre"],
            FeedColumn::Scope => &["ambito", "beneficiarios", "scope", "tags", "etiquetas"],
            FeedColumn::Quantity => &["cuantia", "importe", "dotacion", "amount"],
            FeedColumn::Deadline => &["plazo", "fecha limite", "deadline"],
            FeedColumn::Sector => &["sector"],
            FeedColumn::Summary => &["resumen", "summary"],
            FeedColumn::Justification => &["justificacion", "justificacion de negocio", "justification"],
            FeedColumn::Requirements => &["requisitos detallados", "requisitos", "requirements"],
            FeedColumn::Probability => &["probabilidad", "probability"],
        }
    }
}

fn normalize_header(raw: &str) -> String {
    fold_text(raw.trim_start_matches('\u{feff}'))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolved cell index for each feed column: by header name first, then by
/// fixed position when the header at that position is not claimed by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    indices: [Option<usize>; 10],
}

impl ColumnMap {
    pub fn resolve(headers: &[String]) -> Self {
        let normalized = headers.iter().map(|h| normalize_header(h)).collect::<Vec<_>>();
        let mut indices = [None; 10];
        let mut claimed = vec![false; headers.len()];

        for (slot, column) in FeedColumn::ORDER.iter().enumerate() {
            let by_name = column
                .aliases()
                .iter()
                .find_map(|alias| normalized.iter().position(|h| h == alias));
            if let Some(idx) = by_name {
                if !claimed[idx] {
                    indices[slot] = Some(idx);
                    claimed[idx] = true;
                }
            }
        }

        for (slot, index) in indices.iter_mut().enumerate() {
            if index.is_none() && slot < headers.len() && !claimed[slot] {
                *index = Some(slot);
                claimed[slot] = true;
            }
        }

        Self { indices }
    }

    pub fn index_of(&self, column: FeedColumn) -> Option<usize> {
        FeedColumn::ORDER
            .iter()
            .position(|c| *c == column)
            .and_then(|slot| self.indices[slot])
    }
}

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub rows: Vec<Opportunity>,
    pub rejected_rows: usize,
}

fn split_tags(scope: &str) -> Vec<String> {
    scope
        .split([',', ';', '/'])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses CSV bytes into opportunities. Missing or blank cells degrade to the
/// placeholder and are flagged in `schema_issues`; rows without a title are
/// rejected. An empty body is an empty feed, not an error.
pub fn parse_feed_csv(bytes: &[u8]) -> Result<ParsedFeed, FetchError> {
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.is_empty() {
        return Ok(ParsedFeed {
            rows: Vec::new(),
            rejected_rows: 0,
        });
    }
    if trimmed.starts_with('<') {
        return Err(FetchError::Malformed(
            "received HTML instead of CSV (is the sheet published?)".to_string(),
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(trimmed.as_bytes());
    let headers = reader
        .headers()
        .map_err(|e| FetchError::Malformed(e.to_string()))?
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let columns = ColumnMap::resolve(&headers);

    let mut rows = Vec::new();
    let mut rejected_rows = 0usize;
    for (position, record) in reader.records().enumerate() {
        let record = record.map_err(|e| FetchError::Malformed(e.to_string()))?;
        let mut issues = Vec::new();
        let mut cell = |column: FeedColumn| -> String {
            let value = columns
                .index_of(column)
                .and_then(|idx| record.get(idx))
                .map(str::trim)
                .unwrap_or_default();
            if value.is_empty() {
                issues.push(column.label().to_string());
                PLACEHOLDER.to_string()
            } else {
                value.to_string()
            }
        };

        let title = cell(FeedColumn::Title);
        if title == PLACEHOLDER {
            rejected_rows += 1;
            continue;
        }
        let scope = cell(FeedColumn::Scope);
        let tags = if scope == PLACEHOLDER {
            Vec::new()
        } else {
            split_tags(&scope)
        };
        let opportunity = Opportunity {
            id: (position + 1).to_string(),
            title,
            quantity: cell(FeedColumn::Quantity),
            deadline: cell(FeedColumn::Deadline),
            sector: cell(FeedColumn::Sector),
            scope,
            tags,
            probability: cell(FeedColumn::Probability),
            summary: cell(FeedColumn::Summary),
            justification: cell(FeedColumn::Justification),
            requirements: cell(FeedColumn::Requirements),
            reference_link: cell(FeedColumn::ReferenceLink),
            schema_issues: issues,
        };
        rows.push(opportunity);
    }

    Ok(ParsedFeed {
        rows,
        rejected_rows,
    })
}

fn snapshot_from_bytes(source_label: String, bytes: &[u8]) -> Result<FeedSnapshot, FetchError> {
    let parsed = parse_feed_csv(bytes)?;
    let flagged = parsed.rows.iter().filter(|o| !o.schema_issues.is_empty()).count();
    if parsed.rejected_rows > 0 || flagged > 0 {
        warn!(
            source = %source_label,
            rejected = parsed.rejected_rows,
            flagged,
            "feed rows did not match the ten-column contract"
        );
    }
    info!(source = %source_label, rows = parsed.rows.len(), "feed loaded");
    Ok(FeedSnapshot {
        rows: parsed.rows,
        fetched_at: Utc::now(),
        content_hash: sha256_hex(bytes),
        rejected_rows: parsed.rejected_rows,
        source_label,
    })
}

/// Google Sheets CSV export of one sheet tab.
pub fn gviz_csv_url(sheet_id: &str, sheet_name: &str) -> String {
    let base = format!("https://docs.google.com/spreadsheets/d/{sheet_id}/gviz/tq");
    match reqwest::Url::parse_with_params(&base, &[("tqx", "out:csv"), ("sheet", sheet_name)]) {
        Ok(url) => url.to_string(),
        Err(_) => format!("{base}?tqx=out:csv"),
    }
}

#[derive(Debug, Clone)]
pub struct PublishedSheetSource {
    http: HttpFetcher,
    url: String,
}

impl PublishedSheetSource {
    pub fn new(http: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn for_sheet(http: HttpFetcher, sheet_id: &str, sheet_name: &str) -> Self {
        Self::new(http, gviz_csv_url(sheet_id, sheet_name))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RowSource for PublishedSheetSource {
    fn label(&self) -> String {
        self.url.clone()
    }

    async fn fetch_rows(&self) -> Result<FeedSnapshot, FetchError> {
        let resp = self.http.get_bytes("feed", &self.url).await?;
        snapshot_from_bytes(self.label(), &resp.body)
    }
}

#[derive(Debug, Clone)]
pub struct CsvFileSource {
    path: PathBuf,
}

impl CsvFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RowSource for CsvFileSource {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch_rows(&self) -> Result<FeedSnapshot, FetchError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        snapshot_from_bytes(self.label(), &bytes)
    }
}

/// In-memory rows, for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticRowSource {
    rows: Vec<Opportunity>,
}

impl StaticRowSource {
    pub fn new(rows: Vec<Opportunity>) -> Self {
        Self { rows }
    }
}

#[async_trait]
impl RowSource for StaticRowSource {
    fn label(&self) -> String {
        "static".to_string()
    }

    async fn fetch_rows(&self) -> Result<FeedSnapshot, FetchError> {
        Ok(FeedSnapshot {
            rows: self.rows.clone(),
            fetched_at: Utc::now(),
            content_hash: sha256_hex(self.rows.len().to_string().as_bytes()),
            rejected_rows: 0,
            source_label: self.label(),
        })
    }
}

/// Where the feed comes from. A local file wins over an explicit URL, which
/// wins over the published sheet.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub sheet_id: String,
    pub sheet_name: String,
    pub feed_url: Option<String>,
    pub feed_file: Option<PathBuf>,
    pub ttl_secs: u64,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            sheet_id: DEFAULT_SHEET_ID.to_string(),
            sheet_name: DEFAULT_SHEET_NAME.to_string(),
            feed_url: None,
            feed_file: None,
            ttl_secs: 600,
            http_timeout_secs: 20,
            user_agent: "radar-subvenciones/0.1".to_string(),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sheet_id: env_non_empty("RADAR_SHEET_ID").unwrap_or(defaults.sheet_id),
            sheet_name: env_non_empty("RADAR_SHEET_NAME").unwrap_or(defaults.sheet_name),
            feed_url: env_non_empty("RADAR_FEED_URL"),
            feed_file: env_non_empty("RADAR_FEED_FILE").map(PathBuf::from),
            ttl_secs: env_parse("RADAR_FEED_TTL_SECS", defaults.ttl_secs),
            http_timeout_secs: env_parse("RADAR_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            user_agent: env_non_empty("RADAR_USER_AGENT").unwrap_or(defaults.user_agent),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn build_row_source(&self) -> anyhow::Result<Arc<dyn RowSource>> {
        if let Some(path) = &self.feed_file {
            return Ok(Arc::new(CsvFileSource::new(path.clone())));
        }
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        })?;
        let source = match &self.feed_url {
            Some(url) => PublishedSheetSource::new(http, url.clone()),
            None => PublishedSheetSource::for_sheet(http, &self.sheet_id, &self.sheet_name),
        };
        Ok(Arc::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    #[tokio::test]
    async fn sample_feed_ingests_and_flags_rows() {
        let source = CsvFileSource::new(workspace_root().join("fixtures/feed/sample.csv"));
        let snapshot = source.fetch_rows().await.expect("sample feed");

        assert_eq!(snapshot.rows.len(), 3);
        assert_eq!(snapshot.rejected_rows, 1);
        assert_eq!(snapshot.content_hash.len(), 64);

        let first = &snapshot.rows[0];
        assert_eq!(first.id, "1");
        assert_eq!(first.title, "Ayuda Digitalización PYME");
        assert_eq!(first.tags, vec!["PYME".to_string(), "Autónomos".to_string()]);
        assert!(first.has_reference_link());
        assert!(first.schema_issues.is_empty());

        let third = snapshot.find("4").expect("row 4 keeps its position id");
        assert_eq!(third.quantity, PLACEHOLDER);
        assert_eq!(third.justification, PLACEHOLDER);
        assert_eq!(
            third.schema_issues,
            vec!["Cuantía".to_string(), "Justificación".to_string()]
        );
        assert_eq!(third.tags.len(), 2);
    }

    #[test]
    fn headers_resolve_by_name_before_position() {
        let headers = ["Probabilidad", "titulo", "Sector"]
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>();
        let map = ColumnMap::resolve(&headers);
        assert_eq!(map.index_of(FeedColumn::Probability), Some(0));
        assert_eq!(map.index_of(FeedColumn::Title), Some(1));
        assert_eq!(map.index_of(FeedColumn::Sector), Some(2));
        // Position 0 is claimed by name, so the link column has nowhere to go.
        assert_eq!(map.index_of(FeedColumn::ReferenceLink), None);
        assert_eq!(map.index_of(FeedColumn::Summary), None);
    }

    #[test]
    fn unknown_headers_fall_back_to_position() {
        let csv = "a,b,c,d,e,f,g,h,i,j\nhttps://boe.es/x,Titulo X,PYME,1 €,01/01/2027,TIC,r,j,q,Alta\n";
        let parsed = parse_feed_csv(csv.as_bytes()).expect("positional feed");
        assert_eq!(parsed.rows.len(), 1);
        let row = &parsed.rows[0];
        assert_eq!(row.title, "Titulo X");
        assert_eq!(row.sector, "TIC");
        assert_eq!(row.probability, "Alta");
    }

    #[test]
    fn short_rows_degrade_to_placeholders() {
        let csv = "ID,Título,Ámbito\n,Solo título\n";
        let parsed = parse_feed_csv(csv.as_bytes()).expect("ragged feed");
        let row = &parsed.rows[0];
        assert_eq!(row.title, "Solo título");
        assert_eq!(row.reference_link, PLACEHOLDER);
        assert_eq!(row.deadline, PLACEHOLDER);
        assert!(!row.has_reference_link());
        assert_eq!(row.schema_issues.len(), 9);
    }

    #[test]
    fn empty_body_is_an_empty_feed() {
        let parsed = parse_feed_csv(b"").expect("empty feed");
        assert!(parsed.rows.is_empty());
        let header_only = parse_feed_csv("ID,Título\n".as_bytes()).expect("header only");
        assert!(header_only.rows.is_empty());
    }

    #[test]
    fn html_body_is_malformed() {
        let err = parse_feed_csv(b"<!DOCTYPE html><html>login</html>").unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)));
    }

    #[test]
    fn gviz_url_encodes_sheet_name() {
        let url = gviz_csv_url("abc", "Hoja 1");
        assert!(url.starts_with("https://docs.google.com/spreadsheets/d/abc/gviz/tq?"));
        assert!(url.contains("tqx=out%3Acsv"));
        assert!(url.contains("sheet=Hoja+1"));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = CsvFileSource::new(dir.path().join("absent.csv"));
        let err = source.fetch_rows().await.unwrap_err();
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[tokio::test]
    async fn feed_file_takes_precedence_over_urls() {
        let fixture = workspace_root().join("fixtures/feed/sample.csv");
        let config = FeedConfig {
            feed_url: Some("https://feeds.example.test/radar.csv".into()),
            feed_file: Some(fixture.clone()),
            ..FeedConfig::default()
        };
        let source = config.build_row_source().expect("row source");
        assert_eq!(source.label(), fixture.display().to_string());
        let snapshot = source.fetch_rows().await.expect("fixture feed");
        assert_eq!(snapshot.rows.len(), 3);

        let remote = FeedConfig {
            feed_url: Some("https://feeds.example.test/radar.csv".into()),
            ..FeedConfig::default()
        };
        let source = remote.build_row_source().expect("row source");
        assert_eq!(source.label(), "https://feeds.example.test/radar.csv");
    }
}
