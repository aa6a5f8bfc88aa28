//! Runtime settings: database location, HTTP and classifier clients, and the
//! list of news sources with their compiled extraction selectors.
//!
//! Settings come from an optional TOML file layered under `FINNEWS_*`
//! environment variables. Every source is validated when the settings are
//! loaded, so a bad selector or URL fails the command before any fetch runs.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use scraper::Selector;
use serde::Deserialize;
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "config/finnews.toml";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),
    #[error("source #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("source {name:?} is defined more than once")]
    DuplicateSource { name: String },
    #[error("source {name:?}: invalid base_url {url:?}: {reason}")]
    InvalidBaseUrl {
        name: String,
        url: String,
        reason: String,
    },
    #[error("source {name:?}: invalid {field} selector {selector:?}: {reason}")]
    InvalidSelector {
        name: String,
        field: &'static str,
        selector: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (compatible; finnews/0.1)".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Base URL of an OpenAI-compatible API.
    pub endpoint: String,
    pub model: String,
    /// Falls back to `OPENAI_API_KEY` when unset.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Source as written in the settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    pub base_url: String,
    pub selectors: SelectorSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorSpec {
    pub list: String,
    pub title: String,
    pub summary: Option<String>,
    pub link: String,
    pub date: Option<String>,
}

fn default_domain() -> String {
    "finance".to_string()
}

/// A validated source: parsed base URL and compiled selectors.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub domain: String,
    pub base_url: Url,
    pub selectors: Selectors,
}

#[derive(Debug, Clone)]
pub struct Selectors {
    pub list: Selector,
    pub title: Selector,
    pub summary: Option<Selector>,
    pub link: Selector,
    pub date: Option<Selector>,
}

impl SourceConfig {
    pub fn from_spec(spec: &SourceSpec, index: usize) -> Result<Self, SettingsError> {
        let name = spec.name.trim().to_string();
        if name.is_empty() {
            return Err(SettingsError::EmptyName { index });
        }

        let base_url = Url::parse(spec.base_url.trim()).map_err(|e| SettingsError::InvalidBaseUrl {
            name: name.clone(),
            url: spec.base_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(SettingsError::InvalidBaseUrl {
                name,
                url: spec.base_url.clone(),
                reason: "scheme must be http or https".to_string(),
            });
        }

        let compile = |field: &'static str, css: &str| -> Result<Selector, SettingsError> {
            Selector::parse(css).map_err(|e| SettingsError::InvalidSelector {
                name: name.clone(),
                field,
                selector: css.to_string(),
                reason: e.to_string(),
            })
        };
        let s = &spec.selectors;
        let selectors = Selectors {
            list: compile("list", &s.list)?,
            title: compile("title", &s.title)?,
            summary: s.summary.as_deref().map(|css| compile("summary", css)).transpose()?,
            link: compile("link", &s.link)?,
            date: s.date.as_deref().map(|css| compile("date", css)).transpose()?,
        };

        Ok(SourceConfig {
            name,
            domain: spec.domain.trim().to_string(),
            base_url,
            selectors,
        })
    }
}

/// Built-in source used when the settings name none.
pub fn default_sources() -> Vec<SourceSpec> {
    vec![SourceSpec {
        name: "Yahoo Finance TW".to_string(),
        domain: "finance".to_string(),
        base_url: "https://tw.stock.yahoo.com/news".to_string(),
        selectors: SelectorSpec {
            list: "ul.List\\(n\\) li".to_string(),
            title: "h3".to_string(),
            summary: Some("p".to_string()),
            link: "a".to_string(),
            date: Some("time".to_string()),
        },
    }]
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSettings {
    database_path: Option<PathBuf>,
    http: HttpConfig,
    classifier: ClassifierConfig,
    sources: Option<Vec<SourceSpec>>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub http: HttpConfig,
    pub classifier: ClassifierConfig,
    pub sources: Vec<SourceConfig>,
}

impl Settings {
    /// Load from `path` (optional) and `FINNEWS_*` environment variables.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let builder = Config::builder()
            .add_source(File::new(&path.to_string_lossy(), FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix("FINNEWS")
                    .prefix_separator("_")
                    .separator("__"),
            );
        Self::from_raw(builder.build()?.try_deserialize()?)
    }

    #[cfg(test)]
    pub fn from_toml_str(toml: &str) -> Result<Self, SettingsError> {
        let raw = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, SettingsError> {
        let specs = raw.sources.unwrap_or_else(default_sources);
        let mut seen = HashSet::new();
        let mut sources = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let source = SourceConfig::from_spec(spec, index)?;
            if !seen.insert(source.name.clone()) {
                return Err(SettingsError::DuplicateSource { name: source.name });
            }
            sources.push(source);
        }

        Ok(Settings {
            database_path: raw
                .database_path
                .unwrap_or_else(|| PathBuf::from("data/finnews.sqlite")),
            http: raw.http,
            classifier: raw.classifier,
            sources,
        })
    }
}

#[cfg(test)]
pub fn sample_source(name: &str, base_url: &str) -> SourceConfig {
    let spec = SourceSpec {
        name: name.to_string(),
        domain: "finance".to_string(),
        base_url: base_url.to_string(),
        selectors: SelectorSpec {
            list: "li.story".to_string(),
            title: "h3".to_string(),
            summary: Some("p".to_string()),
            link: "a".to_string(),
            date: Some("time".to_string()),
        },
    };
    SourceConfig::from_spec(&spec, 0).unwrap()
}
