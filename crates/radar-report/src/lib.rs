//! Strategic report export: text sanitizing, pagination and PDF rendering.

use std::io::BufWriter;

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfLayerReference};
use radar_core::{fold_text, EnrichmentEntry, EnrichmentStatus, Opportunity};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "radar-report";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("the enrichment for this opportunity is {0}, not ready")]
    NotReady(&'static str),
    #[error("pdf generation failed: {0}")]
    Pdf(String),
}

fn push_mapped(out: &mut String, c: char) {
    match c {
        '\u{2010}'..='\u{2015}' | '\u{2212}' => out.push('-'),
        '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{2032}' => out.push('\''),
        '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{2033}' => out.push('"'),
        '\u{2026}' => out.push_str("..."),
        '\u{2022}' | '\u{2023}' | '\u{25CF}' | '\u{25AA}' | '\u{25E6}' => out.push('-'),
        '\u{20AC}' => out.push_str("EUR"),
        '\u{00A0}' | '\u{2002}'..='\u{200A}' | '\u{202F}' | '\t' => out.push(' '),
        '\u{200B}'..='\u{200D}' | '\u{FEFF}' => {}
        c if c.is_control() => {}
        ' '..='~' | '\u{00A1}'..='\u{00FF}' => out.push(c),
        _ => out.push('?'),
    }
}

/// Makes arbitrary text safe for the builtin PDF fonts: strips markdown
/// heading/bold markers and maps everything to printable Latin-1. Total over
/// all inputs.
pub fn sanitize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (idx, raw_line) in text.lines().enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        let trimmed = raw_line.trim_start();
        let mut line = trimmed.trim_start_matches('#');
        if line.len() != trimmed.len() {
            line = line.trim_start();
        }
        let line = line.replace("**", "").replace("__", "").replace('`', "");
        let line = match line.strip_prefix("* ") {
            Some(rest) => format!("- {rest}"),
            None => line,
        };
        for c in line.chars() {
            if c == '*' {
                continue;
            }
            push_mapped(&mut out, c);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSection {
    pub heading: String,
    pub body: String,
}

/// Sanitized content of one exported report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportDocument {
    pub title: String,
    pub metadata: Vec<String>,
    pub sections: Vec<ReportSection>,
}

/// Executive summary, official requirements and strategic audit, in that order.
pub fn build_report(opportunity: &Opportunity, entry: &EnrichmentEntry) -> Result<ReportDocument, ReportError> {
    let audit = match (entry.status(), entry.result()) {
        (EnrichmentStatus::Ready, Some(result)) => result,
        (status, _) => return Err(ReportError::NotReady(status.as_str())),
    };

    let mut strategic = audit.trim().to_string();
    if !entry.sources().is_empty() {
        strategic.push_str("\n\nFuentes consultadas:");
        for source in entry.sources() {
            strategic.push_str(&format!("\n- {} ({})", source.title.trim(), source.url.trim()));
        }
    }

    let mut metadata = vec![format!(
        "Cuantía: {} | Plazo: {} | Sector: {}",
        opportunity.quantity, opportunity.deadline, opportunity.sector
    )];
    metadata.push(format!(
        "Ámbito: {} | Probabilidad: {}",
        opportunity.scope, opportunity.probability
    ));
    if opportunity.has_reference_link() {
        metadata.push(format!("Documento oficial: {}", opportunity.reference_link.trim()));
    }

    Ok(ReportDocument {
        title: sanitize(&opportunity.title),
        metadata: metadata.iter().map(|m| sanitize(m)).collect(),
        sections: vec![
            ReportSection {
                heading: "1. Resumen ejecutivo".to_string(),
                body: sanitize(&format!(
                    "{}\n\nJustificación de negocio: {}",
                    opportunity.summary, opportunity.justification
                )),
            },
            ReportSection {
                heading: "2. Requisitos oficiales".to_string(),
                body: sanitize(&opportunity.requirements),
            },
            ReportSection {
                heading: "3. Auditoría estratégica".to_string(),
                body: sanitize(&strategic),
            },
        ],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct PageLayout {
    pub chars_per_line: usize,
    pub lines_per_page: usize,
}

impl Default for PageLayout {
    fn default() -> Self {
        Self {
            chars_per_line: 92,
            lines_per_page: 46,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineKind {
    Title,
    Meta,
    Heading,
    Body,
    Blank,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Line {
    pub kind: LineKind,
    pub text: String,
}

impl Line {
    fn new(kind: LineKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page {
    pub number: usize,
    pub header: String,
    pub footer: String,
    pub lines: Vec<Line>,
}

/// Greedy word wrap; words longer than the width are split.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut current = String::new();
        let mut current_len = 0usize;
        for word in paragraph.split_whitespace() {
            let mut word = word.chars().collect::<Vec<_>>();
            while word.len() > width {
                if current_len > 0 {
                    lines.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                let rest = word.split_off(width);
                lines.push(word.into_iter().collect());
                word = rest;
            }
            let needed = if current_len == 0 { word.len() } else { current_len + 1 + word.len() };
            if needed > width && current_len > 0 {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
            if current_len > 0 {
                current.push(' ');
                current_len += 1;
            }
            current.extend(word.iter());
            current_len += word.len();
        }
        lines.push(current);
    }
    lines
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out = text.chars().take(max.saturating_sub(3)).collect::<String>();
    out.push_str("...");
    out
}

impl ReportDocument {
    fn lines(&self, layout: PageLayout) -> Vec<Line> {
        let width = layout.chars_per_line;
        let mut lines = Vec::new();
        for text in wrap_text(&self.title, width) {
            lines.push(Line::new(LineKind::Title, text));
        }
        for meta in &self.metadata {
            for text in wrap_text(meta, width) {
                lines.push(Line::new(LineKind::Meta, text));
            }
        }
        for section in &self.sections {
            lines.push(Line::new(LineKind::Blank, ""));
            lines.push(Line::new(LineKind::Heading, section.heading.clone()));
            for text in wrap_text(&section.body, width) {
                if text.is_empty() {
                    lines.push(Line::new(LineKind::Blank, ""));
                } else {
                    lines.push(Line::new(LineKind::Body, text));
                }
            }
        }
        lines
    }

    /// Splits the document into pages with a running header and a
    /// "Página N de M" footer. A heading never ends a page.
    pub fn paginate(&self, layout: PageLayout) -> Vec<Page> {
        let per_page = layout.lines_per_page.max(2);
        let mut chunks: Vec<Vec<Line>> = vec![Vec::new()];
        for line in self.lines(layout) {
            let Some(current) = chunks.last_mut() else {
                break;
            };
            let full = current.len() >= per_page;
            let orphan_heading = line.kind == LineKind::Heading && current.len() + 1 == per_page;
            if full || orphan_heading {
                chunks.push(Vec::new());
            }
            let Some(current) = chunks.last_mut() else {
                break;
            };
            if current.is_empty() && line.kind == LineKind::Blank {
                continue;
            }
            current.push(line);
        }

        let total = chunks.len();
        let header = truncate_chars(&self.title, layout.chars_per_line);
        chunks
            .into_iter()
            .enumerate()
            .map(|(idx, lines)| Page {
                number: idx + 1,
                header: header.clone(),
                footer: format!("Página {} de {}", idx + 1, total),
                lines,
            })
            .collect()
    }
}

const PAGE_WIDTH_MM: f32 = 210.0;
const PAGE_HEIGHT_MM: f32 = 297.0;
const MARGIN_MM: f32 = 18.0;
const LINE_HEIGHT_MM: f32 = 5.2;
const BODY_TOP_MM: f32 = PAGE_HEIGHT_MM - 30.0;

struct Fonts {
    regular: IndirectFontRef,
    bold: IndirectFontRef,
}

fn draw_page(layer: &PdfLayerReference, page: &Page, fonts: &Fonts) {
    layer.use_text(
        page.header.clone(),
        8.0,
        Mm(MARGIN_MM),
        Mm(PAGE_HEIGHT_MM - 14.0),
        &fonts.regular,
    );
    layer.use_text(page.footer.clone(), 8.0, Mm(MARGIN_MM), Mm(10.0), &fonts.regular);

    let mut y = BODY_TOP_MM;
    for line in &page.lines {
        match line.kind {
            LineKind::Title => layer.use_text(line.text.clone(), 13.0, Mm(MARGIN_MM), Mm(y), &fonts.bold),
            LineKind::Heading => layer.use_text(line.text.clone(), 11.0, Mm(MARGIN_MM), Mm(y), &fonts.bold),
            LineKind::Meta => layer.use_text(line.text.clone(), 9.0, Mm(MARGIN_MM), Mm(y), &fonts.regular),
            LineKind::Body => layer.use_text(line.text.clone(), 10.0, Mm(MARGIN_MM), Mm(y), &fonts.regular),
            LineKind::Blank => {}
        }
        y -= LINE_HEIGHT_MM;
    }
}

/// Renders the paginated document as A4 PDF bytes using the builtin Helvetica fonts.
pub fn render_pdf(document: &ReportDocument) -> Result<Vec<u8>, ReportError> {
    let pages = document.paginate(PageLayout::default());
    let (doc, first_page, first_layer) = PdfDocument::new(
        document.title.clone(),
        Mm(PAGE_WIDTH_MM),
        Mm(PAGE_HEIGHT_MM),
        "Página 1".to_string(),
    );
    let fonts = Fonts {
        regular: doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| ReportError::Pdf(e.to_string()))?,
        bold: doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| ReportError::Pdf(e.to_string()))?,
    };

    let mut pages_iter = pages.iter();
    if let Some(first) = pages_iter.next() {
        let layer = doc.get_page(first_page).get_layer(first_layer);
        draw_page(&layer, first, &fonts);
    }
    for page in pages_iter {
        let (page_idx, layer_idx) = doc.add_page(
            Mm(PAGE_WIDTH_MM),
            Mm(PAGE_HEIGHT_MM),
            format!("Página {}", page.number),
        );
        let layer = doc.get_page(page_idx).get_layer(layer_idx);
        draw_page(&layer, page, &fonts);
    }

    let mut writer = BufWriter::new(Vec::new());
    doc.save(&mut writer).map_err(|e| ReportError::Pdf(e.to_string()))?;
    let bytes = writer
        .into_inner()
        .map_err(|e| ReportError::Pdf(e.to_string()))?;
    debug!(pages = pages.len(), bytes = bytes.len(), "report rendered");
    Ok(bytes)
}

/// ASCII slug of the title, e.g. `ayuda-digitalizacion-pyme.pdf`.
pub fn report_file_name(opportunity: &Opportunity) -> String {
    let folded = fold_text(&opportunity.title);
    let slug = folded
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let slug = slug.chars().take(60).collect::<String>();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        format!("oportunidad-{}.pdf", opportunity.id)
    } else {
        format!("{slug}.pdf")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use radar_core::SourceRef;

    fn opportunity() -> Opportunity {
        Opportunity {
            id: "7".into(),
            title: "Ayuda Digitalización PYME".into(),
            quantity: "12.000 €".into(),
            deadline: "15/07/2026".into(),
            sector: "Tecnología".into(),
            scope: "PYME".into(),
            tags: vec!["PYME".into()],
            probability: "Alta".into(),
            summary: "Ayudas para implantar soluciones digitales.".into(),
            justification: "Encaja con **consultoría** digital.".into(),
            requirements: "Menos de 50 empleados.".into(),
            reference_link: "https://www.boe.es/diario_boe/txt.php?id=BOE-A-2026-1021".into(),
            schema_issues: vec![],
        }
    }

    fn is_safe(c: char) -> bool {
        c == '\n' || (' '..='~').contains(&c) || ('\u{00A1}'..='\u{00FF}').contains(&c)
    }

    #[test]
    fn sanitize_is_total_and_latin1_safe() {
        let inputs = [
            "",
            "###",
            "** __ ``",
            "# \n## \n",
            "Plazo — 30 días “hábiles” … 🚀 ✅ 中文 \u{0007}\u{0000}",
            "\r\n\r\n",
            "a\u{200B}b\u{FEFF}c\u{00A0}d\te",
            "€ 12.000 • ñ ü ç",
        ];
        for input in inputs {
            let out = sanitize(input);
            assert!(out.chars().all(is_safe), "unsafe output for {input:?}: {out:?}");
        }
    }

    #[test]
    fn sanitize_strips_markup_and_maps_punctuation() {
        let text = "### 1. Requisitos **ocultos**\n* punto uno\nPlazo — “20” días…\n€500 🚀";
        assert_eq!(
            sanitize(text),
            "1. Requisitos ocultos\n- punto uno\nPlazo - \"20\" días...\nEUR500 ?"
        );
        // Fragments and underscores inside links survive.
        assert_eq!(sanitize("https://x.es/a_b#c"), "https://x.es/a_b#c");
    }

    #[test]
    fn report_requires_ready_entry() {
        let o = opportunity();
        for entry in [
            EnrichmentEntry::absent(),
            EnrichmentEntry::pending(Utc::now()),
            EnrichmentEntry::failed("boom".into(), Utc::now()),
        ] {
            assert!(matches!(build_report(&o, &entry), Err(ReportError::NotReady(_))));
        }
    }

    #[test]
    fn report_has_three_ordered_sections_and_title() {
        let entry = EnrichmentEntry::ready(
            "## Estrategia\n**Clave**: presentar antes del plazo.".into(),
            vec![SourceRef {
                url: "https://www.boe.es/x".into(),
                title: "BOE".into(),
            }],
            Utc::now(),
        );
        let doc = build_report(&opportunity(), &entry).expect("report");
        assert_eq!(doc.title, "Ayuda Digitalización PYME");
        let headings = doc.sections.iter().map(|s| s.heading.as_str()).collect::<Vec<_>>();
        assert_eq!(
            headings,
            vec!["1. Resumen ejecutivo", "2. Requisitos oficiales", "3. Auditoría estratégica"]
        );
        assert!(doc.sections[0].body.contains("Encaja con consultoría digital."));
        assert!(doc.sections[2].body.starts_with("Estrategia\nClave: presentar"));
        assert!(doc.sections[2].body.contains("- BOE (https://www.boe.es/x)"));
        assert!(doc.metadata[0].contains("12.000 EUR"));

        let pages = doc.paginate(PageLayout::default());
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].lines[0].text, "Ayuda Digitalización PYME");
        assert_eq!(pages[0].footer, "Página 1 de 1");

        let bytes = render_pdf(&doc).expect("pdf");
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn long_reports_paginate_within_layout() {
        let long = (0..400).map(|i| format!("palabra{i}")).collect::<Vec<_>>().join(" ");
        let entry = EnrichmentEntry::ready(format!("{long}\n\n{long}"), vec![], Utc::now());
        let doc = build_report(&opportunity(), &entry).expect("report");
        let layout = PageLayout {
            chars_per_line: 40,
            lines_per_page: 20,
        };
        let pages = doc.paginate(layout);
        assert!(pages.len() > 3);
        let total = pages.len();
        for page in &pages {
            assert!(page.lines.len() <= 20);
            assert!(page.lines.iter().all(|l| l.text.chars().count() <= 40));
            assert_eq!(page.footer, format!("Página {} de {}", page.number, total));
            assert_ne!(page.lines.last().map(|l| l.kind), Some(LineKind::Heading));
        }
        assert!(render_pdf(&doc).expect("pdf").starts_with(b"%PDF"));
    }

    #[test]
    fn wrap_splits_long_words() {
        assert_eq!(wrap_text("abcdefghij xy", 4), vec!["abcd", "efgh", "ij", "xy"]);
        assert_eq!(wrap_text("", 10), vec![String::new()]);
        assert_eq!(wrap_text("uno dos tres", 7), vec!["uno dos", "tres"]);
    }

    #[test]
    fn file_name_is_ascii_slug() {
        assert_eq!(report_file_name(&opportunity()), "ayuda-digitalizacion-pyme.pdf");
        let mut untitled = opportunity();
        untitled.title = "🚀🚀".into();
        assert_eq!(report_file_name(&untitled), "oportunidad-7.pdf");
    }
}
