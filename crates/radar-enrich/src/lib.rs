//! On-demand "deep research" enrichment: search + synthesis invoker and the
//! per-session cache that runs it at most once per opportunity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use radar_core::{EnrichmentEntry, EnrichmentStatus, SourceRef};
use radar_storage::{env_non_empty, env_parse, BackoffPolicy, HttpClientConfig, HttpError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "radar-enrich";

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub search_base_url: String,
    pub search_api_key: Option<String>,
    pub search_max_results: usize,
    pub search_timeout_secs: u64,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub llm_timeout_secs: u64,
    pub user_agent: String,
}

impl EnrichConfig {
    pub fn from_env() -> Self {
        Self {
            search_base_url: env_non_empty("RADAR_SEARCH_BASE_URL")
                .unwrap_or_else(|| "https://api.tavily.com".to_string()),
            search_api_key: env_non_empty("TAVILY_API_KEY"),
            search_max_results: env_parse("RADAR_SEARCH_MAX_RESULTS", 3),
            search_timeout_secs: env_parse("RADAR_SEARCH_TIMEOUT_SECS", 20),
            llm_base_url: env_non_empty("RADAR_LLM_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            llm_api_key: env_non_empty("OPENAI_API_KEY"),
            llm_model: env_non_empty("RADAR_LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            llm_timeout_secs: env_parse("RADAR_LLM_TIMEOUT_SECS", 90),
            user_agent: env_non_empty("RADAR_USER_AGENT")
                .unwrap_or_else(|| "radar-subvenciones/0.1".to_string()),
        }
    }
}

/// Failures of either external call. The display text is what the user sees
/// next to the retry button.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnrichmentError {
    #[error("la consulta de análisis está vacía")]
    EmptyQuery,
    #[error("falta la credencial {0}; configúrala y vuelve a intentarlo")]
    MissingCredential(&'static str),
    #[error("la búsqueda externa falló: {0}")]
    Search(String),
    #[error("la generación del análisis falló: {0}")]
    Generation(String),
    #[error("{stage} superó el tiempo máximo de {secs} s")]
    Timeout { stage: &'static str, secs: u64 },
    #[error("credencial rechazada por {0}")]
    Unauthorized(&'static str),
    #[error("{0} devolvió una respuesta vacía")]
    EmptyResponse(&'static str),
    #[error("el análisis se interrumpió antes de terminar; reinícialo para volver a intentarlo")]
    Interrupted,
}

impl EnrichmentError {
    fn from_http(stage: &'static str, timeout_secs: u64, err: HttpError) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                stage,
                secs: timeout_secs,
            };
        }
        if err.is_auth() {
            return Self::Unauthorized(stage);
        }
        match stage {
            STAGE_SEARCH => Self::Search(err.to_string()),
            _ => Self::Generation(err.to_string()),
        }
    }
}

const STAGE_SEARCH: &str = "la búsqueda";
const STAGE_GENERATION: &str = "el modelo de lenguaje";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub content: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, EnrichmentError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, EnrichmentError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentResult {
    pub text: String,
    pub sources: Vec<SourceRef>,
}

/// Produces the deep analysis for one opportunity's query text.
#[async_trait]
pub trait EnrichmentInvoker: Send + Sync {
    async fn invoke(&self, query_text: &str) -> Result<EnrichmentResult, EnrichmentError>;
}

const TAVILY_QUERY_MAX_CHARS: usize = 400;

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    search_depth: &'a str,
    max_results: usize,
    include_answer: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

/// Tavily-compatible web search.
#[derive(Debug, Clone)]
pub struct TavilySearch {
    http: HttpFetcher,
    base_url: String,
    api_key: Option<String>,
    max_results: usize,
    timeout_secs: u64,
}

impl TavilySearch {
    pub fn new(http: HttpFetcher, config: &EnrichConfig) -> Self {
        Self {
            http,
            base_url: config.search_base_url.trim_end_matches('/').to_string(),
            api_key: config.search_api_key.clone(),
            max_results: config.search_max_results.max(1),
            timeout_secs: config.search_timeout_secs,
        }
    }
}

#[async_trait]
impl SearchProvider for TavilySearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>, EnrichmentError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(EnrichmentError::MissingCredential("TAVILY_API_KEY"))?;
        let query = query.chars().take(TAVILY_QUERY_MAX_CHARS).collect::<String>();
        let request = TavilyRequest {
            api_key,
            query: &query,
            search_depth: "advanced",
            max_results: self.max_results,
            include_answer: false,
        };
        let url = format!("{}/search", self.base_url);
        let resp: TavilyResponse = self
            .http
            .post_json("search", &url, None, &request)
            .await
            .map_err(|e| EnrichmentError::from_http(STAGE_SEARCH, self.timeout_secs, e))?;
        Ok(resp
            .results
            .into_iter()
            .take(self.max_results)
            .map(|r| SearchHit {
                url: r.url,
                title: r.title,
                content: r.content,
            })
            .collect())
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Debug, Clone)]
pub struct ChatCompletionGenerator {
    http: HttpFetcher,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
}

impl ChatCompletionGenerator {
    pub fn new(http: HttpFetcher, config: &EnrichConfig) -> Self {
        Self {
            http,
            base_url: config.llm_base_url.trim_end_matches('/').to_string(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
            timeout_secs: config.llm_timeout_secs,
        }
    }
}

#[async_trait]
impl TextGenerator for ChatCompletionGenerator {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, EnrichmentError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(EnrichmentError::MissingCredential("OPENAI_API_KEY"))?;
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.3,
        };
        let url = format!("{}/chat/completions", self.base_url);
        let resp: ChatCompletionResponse = self
            .http
            .post_json("generation", &url, Some(api_key), &request)
            .await
            .map_err(|e| EnrichmentError::from_http(STAGE_GENERATION, self.timeout_secs, e))?;
        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(EnrichmentError::EmptyResponse(STAGE_GENERATION))
    }
}

pub const SYSTEM_PROMPT: &str = "Eres un consultor senior especializado en subvenciones y ayudas públicas \
españolas. Respondes en español, con precisión y sin inventar datos que no aparezcan en las fuentes.";

const SNIPPET_MAX_CHARS: usize = 1500;

/// User prompt embedding the opportunity and the numbered search snippets.
pub fn build_prompt(query_text: &str, hits: &[SearchHit]) -> String {
    let mut context = String::new();
    if hits.is_empty() {
        context.push_str("(la búsqueda no devolvió resultados)\n");
    }
    for (idx, hit) in hits.iter().enumerate() {
        let snippet = hit.content.chars().take(SNIPPET_MAX_CHARS).collect::<String>();
        context.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            idx + 1,
            hit.title.trim(),
            hit.url.trim(),
            snippet.trim()
        ));
    }
    format!(
        "Convocatoria analizada: {query}\n\n\
         Información encontrada en fuentes oficiales y de prensa:\n{context}\n\
         Redacta una auditoría estratégica con exactamente tres apartados:\n\
         1. Requisitos técnicos ocultos: condiciones que no son evidentes en el resumen.\n\
         2. Exclusiones clave: quién no puede optar y por qué.\n\
         3. Estrategia ganadora: cómo preparar una solicitud con opciones reales de éxito.\n\
         Cita las fuentes por su número entre corchetes cuando las uses.",
        query = query_text.trim(),
    )
}

/// Search, then synthesize. Each external call is bounded by its own timeout.
pub struct DeepResearchInvoker {
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn TextGenerator>,
    search_timeout: Duration,
    generation_timeout: Duration,
}

impl DeepResearchInvoker {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn TextGenerator>,
        search_timeout: Duration,
        generation_timeout: Duration,
    ) -> Self {
        Self {
            search,
            generator,
            search_timeout,
            generation_timeout,
        }
    }

    /// Both clients run without retries: each external call is billed, and a
    /// trigger makes exactly one of each. Reset is the retry path.
    pub fn from_config(config: &EnrichConfig) -> Result<Self> {
        let search_http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.search_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: 4,
            backoff: BackoffPolicy::none(),
        })?;
        let llm_http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.llm_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            concurrency: 4,
            backoff: BackoffPolicy::none(),
        })?;
        Ok(Self::new(
            Arc::new(TavilySearch::new(search_http, config)),
            Arc::new(ChatCompletionGenerator::new(llm_http, config)),
            Duration::from_secs(config.search_timeout_secs),
            Duration::from_secs(config.llm_timeout_secs),
        ))
    }
}

#[async_trait]
impl EnrichmentInvoker for DeepResearchInvoker {
    async fn invoke(&self, query_text: &str) -> Result<EnrichmentResult, EnrichmentError> {
        let hits = tokio::time::timeout(self.search_timeout, self.search.search(query_text))
            .await
            .map_err(|_| EnrichmentError::Timeout {
                stage: STAGE_SEARCH,
                secs: self.search_timeout.as_secs(),
            })??;
        debug!(hits = hits.len(), "search finished");

        let prompt = build_prompt(query_text, &hits);
        let text = tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate(SYSTEM_PROMPT, &prompt),
        )
        .await
        .map_err(|_| EnrichmentError::Timeout {
            stage: STAGE_GENERATION,
            secs: self.generation_timeout.as_secs(),
        })??;

        Ok(EnrichmentResult {
            text,
            sources: hits
                .into_iter()
                .map(|h| SourceRef {
                    url: h.url,
                    title: h.title,
                })
                .collect(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The invoker ran; carries the resulting Ready or Failed entry.
    Started(EnrichmentEntry),
    /// An entry already existed; nothing was invoked.
    AlreadyPresent(EnrichmentEntry),
}

impl TriggerOutcome {
    pub fn entry(&self) -> &EnrichmentEntry {
        match self {
            TriggerOutcome::Started(entry) | TriggerOutcome::AlreadyPresent(entry) => entry,
        }
    }

    pub fn invoked(&self) -> bool {
        matches!(self, TriggerOutcome::Started(_))
    }
}

#[derive(Debug)]
struct Slot {
    ticket: u64,
    entry: EnrichmentEntry,
}

#[derive(Debug, Default)]
struct CacheState {
    next_ticket: u64,
    slots: HashMap<String, Slot>,
}

impl CacheState {
    /// Stores `entry` if the slot still holds the Pending entry for `ticket`.
    fn settle(&mut self, id: &str, ticket: u64, entry: EnrichmentEntry) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.ticket == ticket && slot.entry.status() == EnrichmentStatus::Pending => {
                slot.entry = entry;
                true
            }
            _ => false,
        }
    }
}

/// Session-scoped memo of enrichment entries keyed by opportunity id.
///
/// Transitions are Absent -> Pending -> Ready | Failed, and back to Absent only
/// through [`EnrichmentCache::reset`]. The lock is held for transitions only,
/// never across the external calls.
#[derive(Debug, Default)]
pub struct EnrichmentCache {
    state: Mutex<CacheState>,
}

/// Settles a Pending slot as Failed if the trigger future is dropped before
/// the invoker returns.
struct PendingGuard<'a> {
    cache: &'a EnrichmentCache,
    id: &'a str,
    ticket: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let entry = EnrichmentEntry::failed(EnrichmentError::Interrupted.to_string(), Utc::now());
        if self.cache.lock().settle(self.id, self.ticket, entry) {
            warn!(id = self.id, "enrichment interrupted while pending");
        }
    }
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Transitions never panic midway, so a poisoned map is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn trigger(
        &self,
        id: &str,
        query_text: &str,
        invoker: &dyn EnrichmentInvoker,
    ) -> Result<TriggerOutcome, EnrichmentError> {
        let query = query_text.trim();
        if query.is_empty() {
            return Err(EnrichmentError::EmptyQuery);
        }

        let ticket = {
            let mut state = self.lock();
            if let Some(existing) = state.slots.get(id) {
                debug!(id, status = existing.entry.status().as_str(), "enrichment trigger is a no-op");
                return Ok(TriggerOutcome::AlreadyPresent(existing.entry.clone()));
            }
            state.next_ticket += 1;
            let ticket = state.next_ticket;
            state.slots.insert(
                id.to_string(),
                Slot {
                    ticket,
                    entry: EnrichmentEntry::pending(Utc::now()),
                },
            );
            ticket
        };
        let mut guard = PendingGuard {
            cache: self,
            id,
            ticket,
            armed: true,
        };

        let span = info_span!("enrichment_trigger", id);
        let outcome = invoker.invoke(query).instrument(span).await;
        guard.armed = false;
        let entry = match outcome {
            Ok(result) => {
                info!(id, sources = result.sources.len(), "enrichment ready");
                EnrichmentEntry::ready(result.text, result.sources, Utc::now())
            }
            Err(err) => {
                warn!(id, error = %err, "enrichment failed");
                EnrichmentEntry::failed(err.to_string(), Utc::now())
            }
        };

        if !self.lock().settle(id, ticket, entry.clone()) {
            debug!(id, "entry was reset while pending; late result discarded");
        }
        Ok(TriggerOutcome::Started(entry))
    }

    pub async fn read(&self, id: &str) -> EnrichmentEntry {
        self.lock()
            .slots
            .get(id)
            .map(|slot| slot.entry.clone())
            .unwrap_or_default()
    }

    /// Returns the entry to Absent from any state, Pending included.
    pub async fn reset(&self, id: &str) {
        if self.lock().slots.remove(id).is_some() {
            debug!(id, "enrichment entry reset");
        }
    }

    pub async fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
