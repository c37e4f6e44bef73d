//! Core domain model for the grant radar: opportunities, enrichment state, filters.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "radar-core";

/// Display value for feed cells that are missing or blank.
pub const PLACEHOLDER: &str = "No especificado";

/// One row of the feed: a single funding/grant item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub quantity: String,
    pub deadline: String,
    pub sector: String,
    pub scope: String,
    pub tags: Vec<String>,
    pub probability: String,
    pub summary: String,
    pub justification: String,
    pub requirements: String,
    pub reference_link: String,
    /// Columns that were missing or blank at ingestion.
    #[serde(default)]
    pub schema_issues: Vec<String>,
}

impl Opportunity {
    /// Every field a user can see on a card, in display order.
    pub fn displayed_fields(&self) -> impl Iterator<Item = &str> {
        [
            self.title.as_str(),
            self.quantity.as_str(),
            self.deadline.as_str(),
            self.sector.as_str(),
            self.scope.as_str(),
            self.probability.as_str(),
            self.summary.as_str(),
            self.justification.as_str(),
            self.requirements.as_str(),
            self.reference_link.as_str(),
        ]
        .into_iter()
        .chain(self.tags.iter().map(String::as_str))
    }

    pub fn has_reference_link(&self) -> bool {
        let link = self.reference_link.trim();
        link.starts_with("http://") || link.starts_with("https://")
    }

    /// Text handed to the enrichment invoker for this row.
    pub fn enrichment_query(&self) -> String {
        if self.has_reference_link() {
            format!("{} {}", self.title.trim(), self.reference_link.trim())
        } else {
            self.title.trim().to_string()
        }
    }
}

/// Lowercases and strips Spanish diacritics so "Digitalizacion" matches "Digitalización".
pub fn fold_text(input: &str) -> String {
    input
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'ä' | 'â' => 'a',
            'é' | 'è' | 'ë' | 'ê' => 'e',
            'í' | 'ì' | 'ï' | 'î' => 'i',
            'ó' | 'ò' | 'ö' | 'ô' => 'o',
            'ú' | 'ù' | 'ü' | 'û' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Absent,
    Pending,
    Ready,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

/// Search hit cited by an enrichment result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub url: String,
    pub title: String,
}

/// Per-opportunity deep-analysis state. `result` is only set when Ready,
/// `error` only when Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentEntry {
    status: EnrichmentStatus,
    result: Option<String>,
    error: Option<String>,
    sources: Vec<SourceRef>,
    updated_at: Option<DateTime<Utc>>,
}

impl EnrichmentEntry {
    pub fn absent() -> Self {
        Self {
            status: EnrichmentStatus::Absent,
            result: None,
            error: None,
            sources: Vec::new(),
            updated_at: None,
        }
    }

    pub fn pending(at: DateTime<Utc>) -> Self {
        Self {
            status: EnrichmentStatus::Pending,
            updated_at: Some(at),
            ..Self::absent()
        }
    }

    pub fn ready(result: String, sources: Vec<SourceRef>, at: DateTime<Utc>) -> Self {
        Self {
            status: EnrichmentStatus::Ready,
            result: Some(result),
            error: None,
            sources,
            updated_at: Some(at),
        }
    }

    pub fn failed(error: String, at: DateTime<Utc>) -> Self {
        Self {
            status: EnrichmentStatus::Failed,
            result: None,
            error: Some(error),
            sources: Vec::new(),
            updated_at: Some(at),
        }
    }

    pub fn status(&self) -> EnrichmentStatus {
        self.status
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn sources(&self) -> &[SourceRef] {
        &self.sources
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_absent(&self) -> bool {
        self.status == EnrichmentStatus::Absent
    }
}

impl Default for EnrichmentEntry {
    fn default() -> Self {
        Self::absent()
    }
}

/// Facets offered next to the free-text search box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Sector,
    Probability,
    Scope,
}

impl Facet {
    pub const ALL: [Facet; 3] = [Facet::Sector, Facet::Probability, Facet::Scope];

    pub fn value_of<'a>(&self, opportunity: &'a Opportunity) -> &'a str {
        match self {
            Facet::Sector => opportunity.sector.trim(),
            Facet::Probability => opportunity.probability.trim(),
            Facet::Scope => opportunity.scope.trim(),
        }
    }

    pub fn query_key(&self) -> &'static str {
        match self {
            Facet::Sector => "sector",
            Facet::Probability => "probability",
            Facet::Scope => "scope",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Facet::Sector => "Sector",
            Facet::Probability => "Probabilidad",
            Facet::Scope => "Ámbito",
        }
    }
}

/// Free-text + multi-select facet filter. Empty lists mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpportunityFilter {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub probabilities: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OpportunityFilter {
    pub fn is_empty(&self) -> bool {
        self.needle().is_none()
            && self.sectors.is_empty()
            && self.probabilities.is_empty()
            && self.scopes.is_empty()
    }

    pub fn selected(&self, facet: Facet) -> &[String] {
        match facet {
            Facet::Sector => &self.sectors,
            Facet::Probability => &self.probabilities,
            Facet::Scope => &self.scopes,
        }
    }

    fn needle(&self) -> Option<String> {
        self.text
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(fold_text)
    }

    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        let facets_ok = Facet::ALL.iter().all(|facet| {
            let selected = self.selected(*facet);
            selected.is_empty()
                || selected
                    .iter()
                    .any(|value| value.trim() == facet.value_of(opportunity))
        });
        if !facets_ok {
            return false;
        }
        match self.needle() {
            Some(needle) => opportunity
                .displayed_fields()
                .any(|field| fold_text(field).contains(&needle)),
            None => true,
        }
    }

    /// Pure and idempotent; an empty filter returns the rows unchanged.
    pub fn apply(&self, rows: &[Opportunity]) -> Vec<Opportunity> {
        if self.is_empty() {
            return rows.to_vec();
        }
        rows.iter().filter(|o| self.matches(o)).cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FacetCount {
    pub value: String,
    pub count: usize,
    pub selected: bool,
}

/// Distinct facet values over the full feed, sorted by value.
pub fn facet_counts(rows: &[Opportunity], facet: Facet, filter: &OpportunityFilter) -> Vec<FacetCount> {
    let mut counts = BTreeMap::<String, usize>::new();
    for o in rows {
        let value = facet.value_of(o);
        if value.is_empty() {
            continue;
        }
        *counts.entry(value.to_string()).or_default() += 1;
    }
    let selected = filter.selected(facet);
    counts
        .into_iter()
        .map(|(value, count)| FacetCount {
            selected: selected.iter().any(|s| s.trim() == value),
            value,
            count,
        })
        .collect()
}

/// Days before a deadline at which a card is flagged as urgent.
pub const URGENT_WITHIN_DAYS: i64 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Expired,
    Urgent { days_left: i64 },
    Open { days_left: i64 },
    /// Deadline text carries no parseable date.
    Undated,
}

impl Urgency {
    pub fn is_urgent(&self) -> bool {
        matches!(self, Urgency::Urgent { .. })
    }

    pub fn label(&self) -> String {
        match self {
            Urgency::Expired => "Plazo vencido".to_string(),
            Urgency::Urgent { days_left: 0 } => "Cierra hoy".to_string(),
            Urgency::Urgent { days_left } => format!("Cierra en {days_left} días"),
            Urgency::Open { days_left } => format!("{days_left} días restantes"),
            Urgency::Undated => "Sin fecha".to_string(),
        }
    }
}

const DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%d.%m.%Y"];

/// First date found in free deadline text, if any.
pub fn parse_deadline(text: &str) -> Option<NaiveDate> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_ascii_alphanumeric()))
        .filter(|token| !token.is_empty())
        .find_map(|token| {
            DATE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(token, fmt).ok())
        })
}

/// Never fails: free text without a date is `Undated`, which is not urgent.
pub fn deadline_urgency(deadline: &str, today: NaiveDate) -> Urgency {
    let Some(date) = parse_deadline(deadline) else {
        return Urgency::Undated;
    };
    let days_left = (date - today).num_days();
    if days_left < 0 {
        Urgency::Expired
    } else if days_left <= URGENT_WITHIN_DAYS {
        Urgency::Urgent { days_left }
    } else {
        Urgency::Open { days_left }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbabilityLevel {
    High,
    Medium,
    Low,
    Unknown,
}

/// Ordered (needle, level) rules; first match wins.
const PROBABILITY_RULES: [(&str, ProbabilityLevel); 6] = [
    ("alta", ProbabilityLevel::High),
    ("high", ProbabilityLevel::High),
    ("media", ProbabilityLevel::Medium),
    ("medium", ProbabilityLevel::Medium),
    ("baja", ProbabilityLevel::Low),
    ("low", ProbabilityLevel::Low),
];

impl ProbabilityLevel {
    pub fn classify(text: &str) -> Self {
        let folded = fold_text(text);
        PROBABILITY_RULES
            .iter()
            .find(|(needle, _)| folded.contains(needle))
            .map(|(_, level)| *level)
            .unwrap_or(ProbabilityLevel::Unknown)
    }

    pub fn css_class(&self) -> &'static str {
        match self {
            ProbabilityLevel::High => "prob-high",
            ProbabilityLevel::Medium => "prob-medium",
            ProbabilityLevel::Low => "prob-low",
            ProbabilityLevel::Unknown => "prob-unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk(id: &str, title: &str, sector: &str, probability: &str) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            title: title.to_string(),
            quantity: "100.000 €".into(),
            deadline: "30/06/2026".into(),
            sector: sector.to_string(),
            scope: "PYME".into(),
            tags: vec!["PYME".into()],
            probability: probability.to_string(),
            summary: "Resumen".into(),
            justification: "Justificación".into(),
            requirements: "Requisitos".into(),
            reference_link: "https://www.boe.es/diario_boe/txt.php?id=BOE-A-2026-1".into(),
            schema_issues: vec![],
        }
    }

    fn rows() -> Vec<Opportunity> {
        vec![
            mk("1", "Ayuda Digitalización PYME", "Tecnología", "Alta"),
            mk("2", "Subvención eficiencia energética", "Energía", "Media"),
            mk("3", "Programa Kit Consulting", "Tecnología", "Baja"),
        ]
    }

    #[test]
    fn empty_filter_returns_rows_unchanged() {
        let rows = rows();
        let filter = OpportunityFilter::default();
        assert!(filter.is_empty());
        assert_eq!(filter.apply(&rows), rows);

        let blank_text = OpportunityFilter {
            text: Some("   ".into()),
            ..Default::default()
        };
        assert!(blank_text.is_empty());
        assert_eq!(blank_text.apply(&rows), rows);
    }

    #[test]
    fn filtering_is_idempotent() {
        let rows = rows();
        let filter = OpportunityFilter {
            text: Some("pyme".into()),
            sectors: vec!["Tecnología".into()],
            probabilities: vec!["Alta".into(), "Baja".into()],
            scopes: vec![],
        };
        let once = filter.apply(&rows);
        let twice = filter.apply(&once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn free_text_is_case_and_accent_insensitive() {
        let rows = rows();
        let filter = OpportunityFilter {
            text: Some("DIGITALIZACION".into()),
            ..Default::default()
        };
        let hits = filter.apply(&rows);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "1");
    }

    #[test]
    fn facets_are_exact_match() {
        let rows = rows();
        let filter = OpportunityFilter {
            sectors: vec!["Tecno".into()],
            ..Default::default()
        };
        assert!(filter.apply(&rows).is_empty());
    }

    #[test]
    fn empty_feed_filters_to_nothing() {
        let filter = OpportunityFilter {
            sectors: vec!["Energía".into()],
            ..Default::default()
        };
        assert!(filter.apply(&[]).is_empty());
        assert!(facet_counts(&[], Facet::Sector, &filter).is_empty());
    }

    #[test]
    fn facet_counts_mark_selection() {
        let filter = OpportunityFilter {
            sectors: vec!["Energía".into()],
            ..Default::default()
        };
        let counts = facet_counts(&rows(), Facet::Sector, &filter);
        assert_eq!(
            counts,
            vec![
                FacetCount { value: "Energía".into(), count: 1, selected: true },
                FacetCount { value: "Tecnología".into(), count: 2, selected: false },
            ]
        );
    }

    #[test]
    fn malformed_deadline_is_not_urgent() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let urgency = deadline_urgency("No especificada", today);
        assert_eq!(urgency, Urgency::Undated);
        assert!(!urgency.is_urgent());
        assert_eq!(deadline_urgency("", today), Urgency::Undated);
    }

    #[test]
    fn deadline_urgency_buckets() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        assert_eq!(deadline_urgency("Hasta el 10/06/2026.", today), Urgency::Urgent { days_left: 9 });
        assert_eq!(deadline_urgency("2026-09-01", today), Urgency::Open { days_left: 92 });
        assert_eq!(deadline_urgency("31-05-2026", today), Urgency::Expired);
    }

    #[test]
    fn probability_rules_first_match_wins() {
        assert_eq!(ProbabilityLevel::classify("Alta (85%)"), ProbabilityLevel::High);
        assert_eq!(ProbabilityLevel::classify("media-alta"), ProbabilityLevel::High);
        assert_eq!(ProbabilityLevel::classify("Media"), ProbabilityLevel::Medium);
        assert_eq!(ProbabilityLevel::classify("BAJA"), ProbabilityLevel::Low);
        assert_eq!(ProbabilityLevel::classify("?"), ProbabilityLevel::Unknown);
    }

    #[test]
    fn enrichment_entry_fields_follow_status() {
        let now = Utc::now();
        let ready = EnrichmentEntry::ready("texto".into(), vec![], now);
        assert_eq!(ready.result(), Some("texto"));
        assert_eq!(ready.error(), None);
        let failed = EnrichmentEntry::failed("boom".into(), now);
        assert_eq!(failed.result(), None);
        assert_eq!(failed.error(), Some("boom"));
        assert!(EnrichmentEntry::default().is_absent());
    }
}
