use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::db;
use crate::utils::{progress_bar, truncate};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Strip tags, collapse whitespace runs, trim. Idempotent.
pub fn clean(raw: &str) -> String {
    let without_tags = TAG_RE.replace_all(raw, "");
    let collapsed = WS_RE.replace_all(&without_tags, " ");
    collapsed.trim().to_string()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessStats {
    pub processed: usize,
    pub failed: usize,
}

/// Clean every article that has no processed text yet. Each article is
/// committed on its own, so an interrupted pass keeps its finished work.
pub fn process_all(conn: &Connection, limit: Option<usize>) -> Result<ProcessStats> {
    let articles = db::fetch_unprocessed(conn, limit)?;
    let mut stats = ProcessStats::default();
    if articles.is_empty() {
        info!("No unprocessed articles");
        return Ok(stats);
    }

    let pb = progress_bar(articles.len() as u64);
    for article in &articles {
        let cleaned = clean(&article.raw_text);
        match db::save_processed_text(conn, article.id, &cleaned) {
            Ok(true) => {
                stats.processed += 1;
                info!(id = article.id, title = %truncate(&article.title, 60), "Processed");
            }
            // Processed by someone else since the scan.
            Ok(false) => {}
            Err(e) => {
                stats.failed += 1;
                warn!(id = article.id, error = %e, "Failed to save processed text");
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(processed = stats.processed, failed = stats.failed, "Text processing done");
    Ok(stats)
}
