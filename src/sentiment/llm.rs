//! OpenAI-compatible chat-completions classifier.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Classifier;
use crate::settings::ClassifierConfig;
use crate::utils::truncate;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [Message<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiClassifier {
    http: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
}

impl OpenAiClassifier {
    /// Fails when no API key is configured, so callers refuse to start
    /// rather than recording every article as failed.
    pub fn from_config(config: &ClassifierConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("No classifier API key: set classifier.api_key, FINNEWS_CLASSIFIER__API_KEY or OPENAI_API_KEY")
            })?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("Failed to build classifier HTTP client")?;

        Ok(Self {
            http,
            url: completions_url(&config.endpoint),
            model: config.model.clone(),
            api_key,
        })
    }
}

fn completions_url(endpoint: &str) -> String {
    format!("{}/chat/completions", endpoint.trim().trim_end_matches('/'))
}

fn first_content(body: ChatResponse) -> Result<String> {
    body.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| anyhow!("Classifier returned no content"))
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn complete(&self, instruction: &str, text: &str) -> Result<String> {
        let req = ChatRequest {
            model: &self.model,
            messages: [
                Message {
                    role: "system",
                    content: instruction,
                },
                Message {
                    role: "user",
                    content: text,
                },
            ],
            temperature: 0.0,
            max_tokens: 10,
        };

        let resp = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("Classifier request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Classifier returned {}: {}", status, truncate(body.trim(), 200));
        }

        let body: ChatResponse = resp.json().await.context("Invalid classifier response")?;
        first_content(body)
    }
}
