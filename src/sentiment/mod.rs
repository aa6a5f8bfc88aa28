//! Sentiment labelling of processed articles.
//!
//! Each article gets at most one result per analyzer name. A failed or
//! unusable classification is stored like any other result, with the
//! `failed` label and the error text, so the article is not retried.

pub mod llm;

use anyhow::Result;
use async_trait::async_trait;
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db;
use crate::utils::{progress_bar, truncate};

pub const ANALYZER_NAME: &str = "sentiment_v1";

pub const INSTRUCTION: &str = "Classify the sentiment of the following financial news text \
as positive, negative, or neutral. Reply with exactly one word: positive, negative, or neutral.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Negative,
    Neutral,
    /// Recorded when no usable label could be obtained.
    Failed,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Positive => "positive",
            Label::Negative => "negative",
            Label::Neutral => "neutral",
            Label::Failed => "failed",
        }
    }
}

/// Stored result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub label: Label,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Classification {
    fn failed(error: String, raw: Option<String>) -> Self {
        Classification {
            label: Label::Failed,
            raw,
            error: Some(error),
        }
    }
}

/// External text classifier: an instruction plus the text, returning the reply.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn complete(&self, instruction: &str, text: &str) -> Result<String>;
}

/// Map a free-form reply onto a label.
pub fn normalize_label(reply: &str) -> Option<Label> {
    let token = reply
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    match token.as_str() {
        "positive" | "正面" => return Some(Label::Positive),
        "negative" | "負面" | "负面" => return Some(Label::Negative),
        "neutral" | "中性" => return Some(Label::Neutral),
        _ => {}
    }

    let lower = reply.to_lowercase();
    let mut hits = [
        ("positive", Label::Positive),
        ("negative", Label::Negative),
        ("neutral", Label::Neutral),
    ]
    .into_iter()
    .filter(|(word, _)| lower.contains(word))
    .map(|(_, label)| label);
    match (hits.next(), hits.next()) {
        (Some(label), None) => Some(label),
        _ => None,
    }
}

/// Classify `text`. Never fails: errors become a `failed` result.
pub async fn classify<C>(client: &C, text: &str) -> Classification
where
    C: Classifier + ?Sized,
{
    if text.trim().is_empty() {
        return Classification::failed("empty text".to_string(), None);
    }
    match client.complete(INSTRUCTION, text).await {
        Ok(reply) => match normalize_label(&reply) {
            Some(label) => Classification {
                label,
                raw: Some(reply),
                error: None,
            },
            None => Classification::failed(
                format!("unrecognized label: {}", truncate(reply.trim(), 80)),
                Some(reply),
            ),
        },
        Err(e) => Classification::failed(format!("{:#}", e), None),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalyzeStats {
    pub labelled: usize,
    pub failed: usize,
    pub skipped: usize,
    pub store_errors: usize,
}

/// Classify every processed article that has no `sentiment_v1` result yet.
pub async fn analyze_all<C>(conn: &Connection, client: &C, limit: Option<usize>) -> Result<AnalyzeStats>
where
    C: Classifier + ?Sized,
{
    let articles = db::fetch_unanalyzed(conn, ANALYZER_NAME, limit)?;
    let mut stats = AnalyzeStats::default();
    if articles.is_empty() {
        info!("No articles awaiting analysis");
        return Ok(stats);
    }

    let pb = progress_bar(articles.len() as u64);
    for article in &articles {
        pb.inc(1);
        match db::analysis_exists(conn, article.id, ANALYZER_NAME) {
            Ok(true) => {
                debug!(id = article.id, "Already analyzed");
                stats.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(id = article.id, error = %e, "Analysis lookup failed");
                stats.store_errors += 1;
                continue;
            }
        }

        let result = classify(client, &article.processed_text).await;
        let payload = serde_json::to_value(&result)?;
        match db::insert_analysis(conn, article.id, ANALYZER_NAME, &payload) {
            Ok(true) if result.label == Label::Failed => {
                stats.failed += 1;
                warn!(
                    id = article.id,
                    title = %truncate(&article.title, 60),
                    error = result.error.as_deref().unwrap_or_default(),
                    "Classification failed, recorded"
                );
            }
            Ok(true) => {
                stats.labelled += 1;
                info!(
                    id = article.id,
                    title = %truncate(&article.title, 60),
                    label = result.label.as_str(),
                    "Analyzed"
                );
            }
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                stats.store_errors += 1;
                warn!(id = article.id, error = %e, "Failed to store analysis");
            }
        }
    }
    pb.finish_and_clear();

    info!(
        labelled = stats.labelled,
        failed = stats.failed,
        skipped = stats.skipped,
        store_errors = stats.store_errors,
        "Sentiment analysis done"
    );
    Ok(stats)
}

/// Classifier with a fixed reply that counts its calls.
#[cfg(test)]
pub struct ScriptedClassifier {
    reply: std::result::Result<String, String>,
    calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedClassifier {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            calls: Default::default(),
        }
    }

    pub fn failing(error: &str) -> Self {
        Self {
            reply: Err(error.to_string()),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn complete(&self, _instruction: &str, _text: &str) -> Result<String> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.reply.clone().map_err(anyhow::Error::msg)
    }
}
