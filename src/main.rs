mod db;
mod fetcher;
mod ingest;
mod pipeline;
mod processor;
mod registry;
mod sentiment;
mod settings;
mod utils;

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rusqlite::Connection;

use crate::fetcher::HttpClient;
use crate::sentiment::llm::OpenAiClassifier;
use crate::sentiment::{Label, ANALYZER_NAME};
use crate::settings::{Settings, DEFAULT_CONFIG_PATH};
use crate::utils::{format_duration, truncate};

#[derive(Parser)]
#[command(name = "finnews", about = "Financial news collector with sentiment labelling")]
struct Cli {
    /// Settings file (TOML); missing file means defaults plus environment
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// SQLite database path, overrides `database_path`
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every configured source and store new articles
    Fetch,
    /// Clean raw text of unprocessed articles
    Process {
        /// Max articles to process (default: all unprocessed)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Label processed articles with sentiment
    Analyze {
        /// Max articles to analyze (default: all pending)
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
    /// Fetch + process + analyze in one pass
    Run,
    /// Show pipeline statistics
    Stats,
    /// Most recent articles with their sentiment
    Recent {
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {:?}", cli.config))?;
    if let Some(db) = cli.db {
        settings.database_path = db;
    }

    let result = execute(cli.command, &settings).await;

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn open_db(settings: &Settings) -> anyhow::Result<Connection> {
    let conn = db::connect(&settings.database_path)?;
    db::init_schema(&conn)?;
    Ok(conn)
}

async fn execute(command: Commands, settings: &Settings) -> anyhow::Result<()> {
    match command {
        Commands::Fetch => {
            let conn = open_db(settings)?;
            let client = HttpClient::new(&settings.http)?;
            println!("Fetching {} sources...", settings.sources.len());
            let stats = pipeline::fetch_and_ingest_all(&conn, &client, &settings.sources).await;
            println!(
                "Stored {} new articles from {} sources ({} failed).",
                stats.stored, stats.sources, stats.failed_sources
            );
        }
        Commands::Process { limit } => {
            let conn = open_db(settings)?;
            let stats = processor::process_all(&conn, limit)?;
            println!("Processed {} articles ({} failed).", stats.processed, stats.failed);
        }
        Commands::Analyze { limit } => {
            let classifier = OpenAiClassifier::from_config(&settings.classifier)?;
            let conn = open_db(settings)?;
            let stats = sentiment::analyze_all(&conn, &classifier, limit).await?;
            println!(
                "Analyzed {} articles, {} recorded as failed, {} storage errors.",
                stats.labelled, stats.failed, stats.store_errors
            );
        }
        Commands::Run => {
            let classifier = OpenAiClassifier::from_config(&settings.classifier)?;
            let client = HttpClient::new(&settings.http)?;
            let conn = open_db(settings)?;
            let summary = pipeline::run_full(&conn, &client, &classifier, &settings.sources).await?;
            println!(
                "Fetched {} new articles, processed {}, analyzed {} ({} failed).",
                summary.fetch.stored,
                summary.process.processed,
                summary.analyze.labelled,
                summary.analyze.failed
            );
        }
        Commands::Stats => {
            let conn = open_db(settings)?;
            let s = db::get_stats(&conn, ANALYZER_NAME, Label::Failed.as_str())?;
            println!("Sources:     {}", s.sources);
            println!("Articles:    {}", s.articles);
            println!("Processed:   {}", s.processed);
            println!("Unprocessed: {}", s.unprocessed);
            println!("Analyzed:    {}", s.analyzed);
            println!("Failed:      {}", s.failed);
            if !s.labels.is_empty() {
                println!("\n--- {} labels ---", ANALYZER_NAME);
                for (label, n) in &s.labels {
                    println!("  {:<10} {}", label, n);
                }
            }
        }
        Commands::Recent { limit } => {
            let conn = open_db(settings)?;
            let rows = db::fetch_overview(&conn, ANALYZER_NAME, limit)?;
            if rows.is_empty() {
                println!("No articles yet. Run 'fetch' first.");
                return Ok(());
            }

            println!(
                "{:>5} | {:<18} | {:<16} | {:<8} | {:<48}",
                "ID", "Source", "Published", "Label", "Title"
            );
            println!("{}", "-".repeat(106));
            for r in &rows {
                let published = r
                    .published_at
                    .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:>5} | {:<18} | {:<16} | {:<8} | {:<48}",
                    r.id,
                    truncate(&r.source, 18),
                    published,
                    r.label.as_deref().unwrap_or("-"),
                    truncate(&r.title, 48)
                );
            }
            println!("\n{} articles", rows.len());
        }
    }
    Ok(())
}
