use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use radar_adapters::{FeedConfig, RowSource};
use radar_core::{EnrichmentEntry, EnrichmentStatus, Opportunity, OpportunityFilter};
use radar_enrich::{DeepResearchInvoker, EnrichConfig, EnrichmentCache};
use radar_report::{build_report, render_pdf, report_file_name};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "radar")]
#[command(about = "Radar de Subvenciones: grant feed dashboard and deep analysis")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the web dashboard (default).
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Fetch the feed and print the rows that pass the filter.
    Fetch(FetchArgs),
    /// Run the deep analysis for one opportunity and print it.
    Enrich {
        #[arg(long)]
        id: String,
    },
    /// Run the deep analysis for one opportunity and write the PDF report.
    Export {
        #[arg(long)]
        id: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct FetchArgs {
    /// Free-text search, accent-insensitive.
    #[arg(long)]
    q: Option<String>,
    #[arg(long)]
    sector: Vec<String>,
    #[arg(long)]
    probability: Vec<String>,
    #[arg(long)]
    scope: Vec<String>,
    /// Print JSON instead of one tab-separated line per row.
    #[arg(long)]
    json: bool,
}

impl FetchArgs {
    fn filter(&self) -> OpportunityFilter {
        OpportunityFilter {
            text: self.q.clone(),
            sectors: self.sector.clone(),
            probabilities: self.probability.clone(),
            scopes: self.scope.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port: None } => radar_web::serve_from_env().await?,
        Commands::Serve { port: Some(port) } => {
            let state = radar_web::AppState::from_env()?;
            radar_web::serve(state, port).await?;
        }
        Commands::Fetch(args) => fetch(args).await?,
        Commands::Enrich { id } => {
            let (_, entry) = enrich_one(&id).await?;
            println!("{}", entry.result().unwrap_or_default());
            for source in entry.sources() {
                println!("- {} ({})", source.title, source.url);
            }
        }
        Commands::Export { id, out } => {
            let (opportunity, entry) = enrich_one(&id).await?;
            let document = build_report(&opportunity, &entry)?;
            let bytes = render_pdf(&document)?;
            let out = out.unwrap_or_else(|| PathBuf::from(report_file_name(&opportunity)));
            tokio::fs::write(&out, &bytes)
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            println!("report written: {} ({} bytes)", out.display(), bytes.len());
        }
    }

    Ok(())
}

async fn fetch(args: FetchArgs) -> Result<()> {
    let source = FeedConfig::from_env().build_row_source()?;
    let snapshot = source.fetch_rows().await.context("fetching feed")?;
    let rows = args.filter().apply(&snapshot.rows);
    info!(
        source = %snapshot.source_label,
        total = snapshot.rows.len(),
        shown = rows.len(),
        rejected = snapshot.rejected_rows,
        "feed fetched"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    for row in rows {
        println!("{}\t{}\t{}\t{}", row.id, row.title, row.deadline, row.probability);
    }
    Ok(())
}

async fn enrich_one(id: &str) -> Result<(Opportunity, EnrichmentEntry)> {
    let source = FeedConfig::from_env().build_row_source()?;
    let snapshot = source.fetch_rows().await.context("fetching feed")?;
    let Some(opportunity) = snapshot.find(id).cloned() else {
        bail!("no opportunity with id {id} in {}", snapshot.source_label);
    };

    let invoker = DeepResearchInvoker::from_config(&EnrichConfig::from_env())?;
    let cache = EnrichmentCache::new();
    let outcome = cache
        .trigger(&opportunity.id, &opportunity.enrichment_query(), &invoker)
        .await?;
    let entry = outcome.entry().clone();
    if entry.status() == EnrichmentStatus::Failed {
        bail!("enrichment failed: {}", entry.error().unwrap_or_default());
    }
    Ok((opportunity, entry))
}
