//! Fetch → ingest, process, analyze.

use anyhow::{bail, Result};
use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::fetcher::{fetch_candidates, PageClient};
use crate::ingest::ingest;
use crate::processor::{process_all, ProcessStats};
use crate::registry::resolve_source;
use crate::sentiment::{analyze_all, AnalyzeStats, Classifier};
use crate::settings::SourceConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FetchStats {
    pub sources: usize,
    pub stored: usize,
    pub failed_sources: usize,
}

/// Fetch every configured source in order and store new articles. A source
/// that cannot be registered is logged and skipped.
pub async fn fetch_and_ingest_all<P>(conn: &Connection, pages: &P, sources: &[SourceConfig]) -> FetchStats
where
    P: PageClient + ?Sized,
{
    let mut stats = FetchStats::default();
    for config in sources {
        stats.sources += 1;
        let source = match resolve_source(conn, config) {
            Ok(source) => source,
            Err(e) => {
                warn!(source = %config.name, error = %format!("{:#}", e), "Cannot register source, skipping");
                stats.failed_sources += 1;
                continue;
            }
        };

        let candidates = fetch_candidates(pages, config).await;
        stats.stored += ingest(conn, &source, &candidates);
    }

    info!(
        sources = stats.sources,
        stored = stats.stored,
        failed_sources = stats.failed_sources,
        "Fetch phase done"
    );
    stats
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub fetch: FetchStats,
    pub process: ProcessStats,
    pub analyze: AnalyzeStats,
}

/// One full pass. Every phase runs regardless of how the previous one went;
/// if any phase aborted the run reports failure after the last one.
pub async fn run_full<P, C>(
    conn: &Connection,
    pages: &P,
    classifier: &C,
    sources: &[SourceConfig],
) -> Result<RunSummary>
where
    P: PageClient + ?Sized,
    C: Classifier + ?Sized,
{
    let mut summary = RunSummary::default();
    let mut aborted = Vec::new();

    info!("Phase 1/3: fetch and ingest");
    summary.fetch = fetch_and_ingest_all(conn, pages, sources).await;

    info!("Phase 2/3: process");
    match process_all(conn, None) {
        Ok(stats) => summary.process = stats,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Process phase aborted");
            aborted.push("process");
        }
    }

    info!("Phase 3/3: analyze");
    match analyze_all(conn, classifier, None).await {
        Ok(stats) => summary.analyze = stats,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Analyze phase aborted");
            aborted.push("analyze");
        }
    }

    if !aborted.is_empty() {
        bail!("Phases aborted: {}", aborted.join(", "));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::fetcher::{StaticPages, LISTING_FIXTURE};
    use crate::sentiment::{ScriptedClassifier, ANALYZER_NAME};
    use crate::settings::sample_source;

    const GOOD: &str = "https://wire.example.com/markets/today";

    #[tokio::test]
    async fn failing_source_does_not_stop_others() {
        let conn = db::connect_in_memory().unwrap();
        let pages = StaticPages::default().with_page(GOOD, LISTING_FIXTURE);
        let sources = vec![
            sample_source("Down", "https://down.example.com/"),
            sample_source("Wire", GOOD),
        ];

        let stats = fetch_and_ingest_all(&conn, &pages, &sources).await;
        assert_eq!(stats.sources, 2);
        assert_eq!(stats.stored, 3);
        assert_eq!(stats.failed_sources, 0);

        // Both sources are registered even though one returned nothing.
        let s = db::get_stats(&conn, ANALYZER_NAME, "failed").unwrap();
        assert_eq!(s.sources, 2);
        assert_eq!(s.articles, 3);
    }

    #[tokio::test]
    async fn run_full_end_to_end() {
        let conn = db::connect_in_memory().unwrap();
        let pages = StaticPages::default().with_page(GOOD, LISTING_FIXTURE);
        let classifier = ScriptedClassifier::replying("negative");
        let sources = vec![sample_source("Wire", GOOD)];

        let summary = run_full(&conn, &pages, &classifier, &sources).await.unwrap();
        assert_eq!(summary.fetch.stored, 3);
        assert_eq!(summary.process.processed, 3);
        // Only "Stocks rally" has a summary; empty texts are recorded as failed.
        assert_eq!(summary.analyze.labelled, 1);
        assert_eq!(summary.analyze.failed, 2);
        assert_eq!(classifier.calls(), 1);

        let again = run_full(&conn, &pages, &classifier, &sources).await.unwrap();
        assert_eq!(again, RunSummary {
            fetch: FetchStats {
                sources: 1,
                ..FetchStats::default()
            },
            ..RunSummary::default()
        });
        assert_eq!(classifier.calls(), 1);

        let stats = db::get_stats(&conn, ANALYZER_NAME, "failed").unwrap();
        assert_eq!(stats.articles, 3);
        assert_eq!(stats.unprocessed, 0);
        assert_eq!(stats.analyzed, 3);
        assert_eq!(stats.failed, 2);
    }

    #[tokio::test]
    async fn run_full_with_unreachable_sources_still_runs_later_phases() {
        let conn = db::connect_in_memory().unwrap();
        let pages = StaticPages::default().with_page(GOOD, LISTING_FIXTURE);
        let classifier = ScriptedClassifier::replying("positive");
        fetch_and_ingest_all(&conn, &pages, &[sample_source("Wire", GOOD)]).await;

        let offline = StaticPages::default();
        let summary = run_full(&conn, &offline, &classifier, &[sample_source("Wire", GOOD)])
            .await
            .unwrap();
        assert_eq!(summary.fetch.stored, 0);
        assert_eq!(summary.process.processed, 3);
        assert_eq!(summary.analyze.labelled, 1);
    }
}
