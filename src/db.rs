use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let conn = Connection::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

#[cfg(test)]
pub fn connect_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sources (
            id         INTEGER PRIMARY KEY,
            name       TEXT UNIQUE NOT NULL,
            domain     TEXT NOT NULL,
            base_url   TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS articles (
            id             INTEGER PRIMARY KEY,
            source_id      INTEGER NOT NULL REFERENCES sources(id),
            title          TEXT NOT NULL,
            raw_text       TEXT NOT NULL,
            processed_text TEXT,
            url            TEXT UNIQUE NOT NULL,
            published_at   TEXT,
            scraped_at     TEXT NOT NULL DEFAULT (datetime('now')),
            metadata       TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_articles_source ON articles(source_id);
        CREATE INDEX IF NOT EXISTS idx_articles_unprocessed
            ON articles(id) WHERE processed_text IS NULL;

        CREATE TABLE IF NOT EXISTS analyses (
            id            INTEGER PRIMARY KEY,
            article_id    INTEGER NOT NULL REFERENCES articles(id),
            analyzer_name TEXT NOT NULL,
            result        TEXT NOT NULL,
            analyzed_at   TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(article_id, analyzer_name)
        );
        CREATE INDEX IF NOT EXISTS idx_analyses_analyzer ON analyses(analyzer_name);
        ",
    )?;
    Ok(())
}

// ── Sources ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub domain: String,
    pub base_url: String,
}

pub fn find_source_by_name(conn: &Connection, name: &str) -> Result<Option<Source>> {
    let row = conn
        .query_row(
            "SELECT id, name, domain, base_url FROM sources WHERE name = ?1",
            [name],
            |row| {
                Ok(Source {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    domain: row.get(2)?,
                    base_url: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

pub fn insert_source(conn: &Connection, name: &str, domain: &str, base_url: &str) -> Result<Source> {
    conn.execute(
        "INSERT INTO sources (name, domain, base_url) VALUES (?1, ?2, ?3)",
        rusqlite::params![name, domain, base_url],
    )?;
    Ok(Source {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        domain: domain.to_string(),
        base_url: base_url.to_string(),
    })
}

// ── Articles ──

pub struct NewArticle<'a> {
    pub source_id: i64,
    pub title: &'a str,
    pub raw_text: &'a str,
    pub url: &'a str,
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: Option<&'a serde_json::Value>,
}

pub fn article_exists(conn: &Connection, url: &str) -> Result<bool> {
    let found = conn
        .query_row("SELECT 1 FROM articles WHERE url = ?1", [url], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// Insert an article. Returns `false` when the link is already stored.
pub fn insert_article(conn: &Connection, article: &NewArticle) -> Result<bool> {
    let metadata = article.metadata.map(|m| m.to_string());
    let inserted = conn.execute(
        "INSERT INTO articles (source_id, title, raw_text, url, published_at, scraped_at, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(url) DO NOTHING",
        rusqlite::params![
            article.source_id,
            article.title,
            article.raw_text,
            article.url,
            article.published_at,
            Utc::now(),
            metadata,
        ],
    )?;
    Ok(inserted == 1)
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub raw_text: String,
    pub processed_text: Option<String>,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub scraped_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
pub fn fetch_articles(conn: &Connection) -> Result<Vec<Article>> {
    let mut stmt = conn.prepare(
        "SELECT id, source_id, title, raw_text, processed_text, url, published_at, scraped_at, metadata
         FROM articles ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let metadata: Option<String> = row.get(8)?;
            Ok(Article {
                id: row.get(0)?,
                source_id: row.get(1)?,
                title: row.get(2)?,
                raw_text: row.get(3)?,
                processed_text: row.get(4)?,
                url: row.get(5)?,
                published_at: row.get(6)?,
                scraped_at: row.get(7)?,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Processing ──

pub struct UnprocessedArticle {
    pub id: i64,
    pub title: String,
    pub raw_text: String,
}

pub fn fetch_unprocessed(conn: &Connection, limit: Option<usize>) -> Result<Vec<UnprocessedArticle>> {
    let sql = format!(
        "SELECT id, title, raw_text FROM articles WHERE processed_text IS NULL ORDER BY id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(UnprocessedArticle {
                id: row.get(0)?,
                title: row.get(1)?,
                raw_text: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Write processed text once. Returns `false` if the article was already processed.
pub fn save_processed_text(conn: &Connection, article_id: i64, text: &str) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE articles SET processed_text = ?2 WHERE id = ?1 AND processed_text IS NULL",
        rusqlite::params![article_id, text],
    )?;
    Ok(updated == 1)
}

// ── Analysis ──

pub struct PendingArticle {
    pub id: i64,
    pub title: String,
    pub processed_text: String,
}

/// Processed articles with no analysis recorded under `analyzer_name`.
pub fn fetch_unanalyzed(
    conn: &Connection,
    analyzer_name: &str,
    limit: Option<usize>,
) -> Result<Vec<PendingArticle>> {
    let sql = format!(
        "SELECT a.id, a.title, a.processed_text
         FROM articles a
         WHERE a.processed_text IS NOT NULL
           AND NOT EXISTS (
               SELECT 1 FROM analyses an
               WHERE an.article_id = a.id AND an.analyzer_name = ?1
           )
         ORDER BY a.id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([analyzer_name], |row| {
            Ok(PendingArticle {
                id: row.get(0)?,
                title: row.get(1)?,
                processed_text: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn analysis_exists(conn: &Connection, article_id: i64, analyzer_name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM analyses WHERE article_id = ?1 AND analyzer_name = ?2",
            rusqlite::params![article_id, analyzer_name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Record an analysis. Returns `false` if one already exists for the pair.
pub fn insert_analysis(
    conn: &Connection,
    article_id: i64,
    analyzer_name: &str,
    result: &serde_json::Value,
) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT INTO analyses (article_id, analyzer_name, result, analyzed_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(article_id, analyzer_name) DO NOTHING",
        rusqlite::params![article_id, analyzer_name, result.to_string(), Utc::now()],
    )?;
    Ok(inserted == 1)
}

#[cfg(test)]
#[derive(Debug, Clone)]
pub struct AnalysisRow {
    pub id: i64,
    pub article_id: i64,
    pub analyzer_name: String,
    pub result: serde_json::Value,
    pub analyzed_at: DateTime<Utc>,
}

#[cfg(test)]
pub fn fetch_analyses(conn: &Connection, analyzer_name: &str) -> Result<Vec<AnalysisRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, article_id, analyzer_name, result, analyzed_at
         FROM analyses WHERE analyzer_name = ?1 ORDER BY id",
    )?;
    let rows = stmt
        .query_map([analyzer_name], |row| {
            let result: String = row.get(3)?;
            Ok(AnalysisRow {
                id: row.get(0)?,
                article_id: row.get(1)?,
                analyzer_name: row.get(2)?,
                result: serde_json::from_str(&result).unwrap_or(serde_json::Value::Null),
                analyzed_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Overview ──

pub struct OverviewRow {
    pub id: i64,
    pub source: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub label: Option<String>,
}

/// Most recent articles with their label under `analyzer_name`, if any.
pub fn fetch_overview(conn: &Connection, analyzer_name: &str, limit: usize) -> Result<Vec<OverviewRow>> {
    let sql = format!(
        "SELECT a.id, s.name, a.title, a.published_at, json_extract(an.result, '$.label')
         FROM articles a
         JOIN sources s ON s.id = a.source_id
         LEFT JOIN analyses an ON an.article_id = a.id AND an.analyzer_name = ?1
         ORDER BY a.id DESC
         LIMIT {}",
        limit
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([analyzer_name], |row| {
            Ok(OverviewRow {
                id: row.get(0)?,
                source: row.get(1)?,
                title: row.get(2)?,
                published_at: row.get(3)?,
                label: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub sources: usize,
    pub articles: usize,
    pub processed: usize,
    pub unprocessed: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub labels: Vec<(String, usize)>,
}

pub fn get_stats(conn: &Connection, analyzer_name: &str, failure_label: &str) -> Result<Stats> {
    let sources: usize = conn.query_row("SELECT COUNT(*) FROM sources", [], |r| r.get(0))?;
    let articles: usize = conn.query_row("SELECT COUNT(*) FROM articles", [], |r| r.get(0))?;
    let processed: usize = conn.query_row(
        "SELECT COUNT(*) FROM articles WHERE processed_text IS NOT NULL",
        [],
        |r| r.get(0),
    )?;
    let analyzed: usize = conn.query_row(
        "SELECT COUNT(*) FROM analyses WHERE analyzer_name = ?1",
        [analyzer_name],
        |r| r.get(0),
    )?;

    let mut stmt = conn.prepare(
        "SELECT COALESCE(json_extract(result, '$.label'), ''), COUNT(*)
         FROM analyses WHERE analyzer_name = ?1
         GROUP BY 1 ORDER BY 2 DESC, 1",
    )?;
    let labels = stmt
        .query_map([analyzer_name], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<(String, usize)>, _>>()?;
    let failed = labels
        .iter()
        .find(|(label, _)| label == failure_label)
        .map(|(_, n)| *n)
        .unwrap_or(0);

    Ok(Stats {
        sources,
        articles,
        processed,
        unprocessed: articles - processed,
        analyzed,
        failed,
        labels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_article(conn: &Connection, source_id: i64, url: &str) -> bool {
        insert_article(
            conn,
            &NewArticle {
                source_id,
                title: "Title",
                raw_text: "<p>body</p>",
                url,
                published_at: None,
                metadata: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_article_rejects_duplicate_url() {
        let conn = connect_in_memory().unwrap();
        let source = insert_source(&conn, "S", "finance", "https://example.com").unwrap();

        assert!(seed_article(&conn, source.id, "https://example.com/a"));
        assert!(!seed_article(&conn, source.id, "https://example.com/a"));
        assert!(article_exists(&conn, "https://example.com/a").unwrap());
        assert!(!article_exists(&conn, "https://example.com/b").unwrap());
        assert_eq!(fetch_articles(&conn).unwrap().len(), 1);
    }

    #[test]
    fn processed_text_written_once() {
        let conn = connect_in_memory().unwrap();
        let source = insert_source(&conn, "S", "finance", "https://example.com").unwrap();
        seed_article(&conn, source.id, "https://example.com/a");
        let id = fetch_unprocessed(&conn, None).unwrap()[0].id;

        assert!(save_processed_text(&conn, id, "body").unwrap());
        assert!(!save_processed_text(&conn, id, "other").unwrap());
        let article = &fetch_articles(&conn).unwrap()[0];
        assert_eq!(article.processed_text.as_deref(), Some("body"));
        assert_eq!(article.url, "https://example.com/a");
        assert!(article.scraped_at <= Utc::now());
        assert!(fetch_unprocessed(&conn, None).unwrap().is_empty());
    }

    #[test]
    fn analysis_unique_per_article_and_analyzer() {
        let conn = connect_in_memory().unwrap();
        let source = insert_source(&conn, "S", "finance", "https://example.com").unwrap();
        seed_article(&conn, source.id, "https://example.com/a");
        let id = fetch_unprocessed(&conn, None).unwrap()[0].id;
        save_processed_text(&conn, id, "body").unwrap();

        let result = serde_json::json!({ "label": "positive" });
        assert!(insert_analysis(&conn, id, "sentiment_v1", &result).unwrap());
        assert!(!insert_analysis(&conn, id, "sentiment_v1", &result).unwrap());
        assert!(insert_analysis(&conn, id, "sentiment_v2", &result).unwrap());
        assert!(analysis_exists(&conn, id, "sentiment_v1").unwrap());
        assert!(fetch_unanalyzed(&conn, "sentiment_v1", None).unwrap().is_empty());

        let rows = fetch_analyses(&conn, "sentiment_v1").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].id > 0);
        assert_eq!(rows[0].article_id, id);
        assert_eq!(rows[0].analyzer_name, "sentiment_v1");
        assert_eq!(rows[0].result, result);
        assert!(rows[0].analyzed_at <= Utc::now());
    }

    #[test]
    fn unanalyzed_requires_processed_text() {
        let conn = connect_in_memory().unwrap();
        let source = insert_source(&conn, "S", "finance", "https://example.com").unwrap();
        seed_article(&conn, source.id, "https://example.com/a");
        seed_article(&conn, source.id, "https://example.com/b");

        assert!(fetch_unanalyzed(&conn, "sentiment_v1", None).unwrap().is_empty());
        let first = fetch_unprocessed(&conn, Some(1)).unwrap();
        assert_eq!(first.len(), 1);
        save_processed_text(&conn, first[0].id, "body").unwrap();
        let pending = fetch_unanalyzed(&conn, "sentiment_v1", None).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, first[0].id);
    }

    #[test]
    fn stats_counts_labels() {
        let conn = connect_in_memory().unwrap();
        let source = insert_source(&conn, "S", "finance", "https://example.com").unwrap();
        for url in ["https://example.com/a", "https://example.com/b", "https://example.com/c"] {
            seed_article(&conn, source.id, url);
        }
        let ids: Vec<i64> = fetch_unprocessed(&conn, None).unwrap().iter().map(|a| a.id).collect();
        save_processed_text(&conn, ids[0], "x").unwrap();
        save_processed_text(&conn, ids[1], "y").unwrap();
        insert_analysis(&conn, ids[0], "sentiment_v1", &serde_json::json!({ "label": "positive" })).unwrap();
        insert_analysis(&conn, ids[1], "sentiment_v1", &serde_json::json!({ "label": "failed", "error": "boom" })).unwrap();

        let s = get_stats(&conn, "sentiment_v1", "failed").unwrap();
        assert_eq!(s.sources, 1);
        assert_eq!(s.articles, 3);
        assert_eq!(s.processed, 2);
        assert_eq!(s.unprocessed, 1);
        assert_eq!(s.analyzed, 2);
        assert_eq!(s.failed, 1);
        assert_eq!(s.labels.len(), 2);

        let overview = fetch_overview(&conn, "sentiment_v1", 10).unwrap();
        assert_eq!(overview.len(), 3);
        assert_eq!(overview[0].id, ids[2]);
        assert_eq!(overview[0].label, None);
        assert_eq!(overview[2].label.as_deref(), Some("positive"));
        assert_eq!(overview[2].source, "S");
    }
}
