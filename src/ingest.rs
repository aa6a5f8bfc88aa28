use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::db::{self, NewArticle, Source};
use crate::fetcher::CandidateArticle;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub stored: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Store candidates not yet seen, keyed by canonical link. Returns the number
/// of new articles. Each article commits on its own; a storage error only
/// loses that candidate and is logged.
pub fn ingest(conn: &Connection, source: &Source, candidates: &[CandidateArticle]) -> usize {
    let metadata = serde_json::json!({ "listing_url": source.base_url });
    let mut stats = IngestStats::default();

    for candidate in candidates {
        let title = candidate.title.trim();
        let link = candidate.link.trim();
        if title.is_empty() || link.is_empty() {
            stats.skipped += 1;
            continue;
        }

        match db::article_exists(conn, link) {
            Ok(true) => {
                debug!(source = %source.name, url = %link, "Duplicate link, skipping");
                stats.duplicates += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(source = %source.name, url = %link, error = %e, "Lookup failed");
                stats.failed += 1;
                continue;
            }
        }

        let article = NewArticle {
            source_id: source.id,
            title,
            raw_text: &candidate.summary,
            url: link,
            published_at: candidate.published_at,
            metadata: Some(&metadata),
        };
        match db::insert_article(conn, &article) {
            Ok(true) => stats.stored += 1,
            Ok(false) => stats.duplicates += 1,
            Err(e) => {
                warn!(source = %source.name, %title, error = %e, "Failed to store article");
                stats.failed += 1;
            }
        }
    }

    info!(
        source = %source.name,
        stored = stats.stored,
        duplicates = stats.duplicates,
        skipped = stats.skipped,
        failed = stats.failed,
        "Ingested candidates"
    );
    stats.stored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::resolve_source;
    use crate::settings::sample_source;

    fn candidate(title: &str, link: &str, summary: &str) -> CandidateArticle {
        CandidateArticle {
            title: title.to_string(),
            summary: summary.to_string(),
            link: link.to_string(),
            published_at: None,
        }
    }

    fn setup() -> (Connection, Source) {
        let conn = db::connect_in_memory().unwrap();
        let source = resolve_source(&conn, &sample_source("Wire", "https://wire.example.com/")).unwrap();
        (conn, source)
    }

    #[test]
    fn ingest_twice_is_noop() {
        let (conn, source) = setup();
        let batch = vec![
            candidate("A", "https://wire.example.com/a", "<p>a</p>"),
            candidate("B", "https://wire.example.com/b", "b"),
        ];

        assert_eq!(ingest(&conn, &source, &batch), 2);
        assert_eq!(ingest(&conn, &source, &batch), 0);
        assert_eq!(db::fetch_articles(&conn).unwrap().len(), 2);
    }

    #[test]
    fn candidate_without_link_is_skipped() {
        let (conn, source) = setup();
        let batch = vec![candidate("A", "", "x"), candidate("", "https://wire.example.com/z", "x")];
        assert_eq!(ingest(&conn, &source, &batch), 0);
        assert!(db::fetch_articles(&conn).unwrap().is_empty());
    }

    #[test]
    fn first_of_duplicate_links_wins() {
        let (conn, source) = setup();
        let batch = vec![
            candidate("First", "https://wire.example.com/same", "one"),
            candidate("Second", "https://wire.example.com/same", "two"),
        ];
        assert_eq!(ingest(&conn, &source, &batch), 1);

        let stored = db::fetch_articles(&conn).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "First");
        assert_eq!(stored[0].raw_text, "one");
    }

    #[test]
    fn new_article_starts_unprocessed() {
        let (conn, source) = setup();
        let mut c = candidate("A", "https://wire.example.com/a", "summary");
        c.published_at = crate::fetcher::parse_published("2024-03-04T05:06:07Z");
        ingest(&conn, &source, &[c.clone()]);

        let stored = &db::fetch_articles(&conn).unwrap()[0];
        assert_eq!(stored.source_id, source.id);
        assert_eq!(stored.processed_text, None);
        assert_eq!(stored.published_at, c.published_at);
        assert_eq!(
            stored.metadata,
            Some(serde_json::json!({ "listing_url": "https://wire.example.com/" }))
        );
    }

    #[test]
    fn full_database_keeps_articles_stored_before_it_filled() {
        let (conn, source) = setup();
        let pages: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0)).unwrap();
        let _: i64 = conn
            .query_row(&format!("PRAGMA max_page_count = {}", pages + 6), [], |r| r.get(0))
            .unwrap();

        let body = "x".repeat(3000);
        let batch: Vec<CandidateArticle> = (0..20)
            .map(|i| candidate(&format!("Story {}", i), &format!("https://wire.example.com/{}", i), &body))
            .collect();

        let stored = ingest(&conn, &source, &batch);
        let articles = db::fetch_articles(&conn).unwrap();
        assert!(stored > 0 && stored < 20, "stored {}", stored);
        assert_eq!(articles.len(), stored);
        assert_eq!(articles[0].title, "Story 0");
    }
}
