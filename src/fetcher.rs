use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, warn};
use url::Url;

use crate::settings::{HttpConfig, SourceConfig};

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// An article seen on a listing page, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateArticle {
    pub title: String,
    pub summary: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PageClient: Send + Sync {
    /// Body of a successful response. Transport errors and non-2xx statuses are errors.
    async fn get_text(&self, url: &Url) -> Result<String>;
}

pub struct HttpClient {
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PageClient for HttpClient {
    async fn get_text(&self, url: &Url) -> Result<String> {
        let resp = self.http.get(url.clone()).send().await?.error_for_status()?;
        Ok(resp.text().await?)
    }
}

/// Fetch one source's listing page and extract candidates. Never fails: any
/// transport error is logged and yields no candidates.
pub async fn fetch_candidates<P>(client: &P, source: &SourceConfig) -> Vec<CandidateArticle>
where
    P: PageClient + ?Sized,
{
    let start = Instant::now();
    let body = match client.get_text(&source.base_url).await {
        Ok(body) => body,
        Err(e) => {
            warn!(
                source = %source.name,
                url = %source.base_url,
                error = %format!("{:#}", e),
                "Fetch failed, skipping source"
            );
            return Vec::new();
        }
    };

    let candidates = extract_candidates(&body, source);
    info!(
        source = %source.name,
        count = candidates.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Extracted candidates"
    );
    candidates
}

/// Apply a source's selectors to a listing page. Items without a title or a
/// resolvable link are dropped.
pub fn extract_candidates(html: &str, source: &SourceConfig) -> Vec<CandidateArticle> {
    let document = Html::parse_document(html);
    let sel = &source.selectors;
    let mut candidates = Vec::new();

    for item in document.select(&sel.list) {
        let Some(title) = first_text(item, &sel.title) else {
            debug!(source = %source.name, "Skipping item without title");
            continue;
        };
        let link = item
            .select(&sel.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| canonical_link(&source.base_url, href));
        let Some(link) = link else {
            debug!(source = %source.name, %title, "Skipping item without usable link");
            continue;
        };

        let summary = sel
            .summary
            .as_ref()
            .and_then(|s| first_text(item, s))
            .unwrap_or_default();
        let published_at = sel
            .date
            .as_ref()
            .and_then(|s| item.select(s).next())
            .and_then(|el| match el.value().attr("datetime") {
                Some(attr) => parse_published(attr),
                None => parse_published(&element_text(el)),
            });

        candidates.push(CandidateArticle {
            title,
            summary,
            link,
            published_at,
        });
    }

    candidates
}

fn first_text(item: ElementRef, selector: &Selector) -> Option<String> {
    item.select(selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn element_text(el: ElementRef) -> String {
    let text: String = el.text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Resolve `href` against the listing URL; only http(s) links survive, without fragment.
pub fn canonical_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let mut url = base.join(href).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Best-effort timestamp parsing. Anything unrecognised is `None`.
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc2822(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// In-memory pages keyed by URL; anything else fails like an unreachable host.
#[cfg(test)]
#[derive(Default)]
pub struct StaticPages {
    pages: std::collections::HashMap<String, String>,
}

#[cfg(test)]
impl StaticPages {
    pub fn with_page(mut self, url: &str, body: &str) -> Self {
        let key = Url::parse(url).unwrap().to_string();
        self.pages.insert(key, body.to_string());
        self
    }
}

#[cfg(test)]
#[async_trait]
impl PageClient for StaticPages {
    async fn get_text(&self, url: &Url) -> Result<String> {
        self.pages
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused: {}", url))
    }
}

#[cfg(test)]
pub const LISTING_FIXTURE: &str = r#"
<html><body>
<ul class="feed">
  <li class="story">
    <h3>  Stocks
      rally </h3>
    <p>Markets <b>up</b> today</p>
    <a href="/news/rally#comments">more</a>
    <time datetime="2024-05-01T09:30:00+08:00">May 1</time>
  </li>
  <li class="story">
    <h3>Absolute link</h3>
    <a href="https://other.example.com/a">read</a>
    <time datetime="not a date">sometime</time>
  </li>
  <li class="story"><h3>   </h3><a href="/news/untitled">read</a></li>
  <li class="story"><h3>No link</h3><p>summary only</p></li>
  <li class="story"><h3>Script link</h3><a href="javascript:void(0)">read</a></li>
  <li class="story"><h3>Empty href</h3><a href="">read</a></li>
  <li class="story"><h3>Naive date</h3><a href="story-7">read</a><time>2024-05-02</time></li>
</ul>
<div class="sidebar"><h3>Not a list item</h3><a href="/elsewhere">read</a></div>
</body></html>
"#;
