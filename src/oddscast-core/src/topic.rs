//! Topics (prediction markets) and the provider that ranks them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::error::ShowError;

/// One named outcome and its probability-like price (0.65 = 65%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub name: String,
    pub price: f64,
}

/// A market the hosts can discuss. Immutable once fetched; shared as `Arc<Topic>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub question: String,
    pub slug: String,
    pub description: String,
    pub outcomes: Vec<Outcome>,
    pub volume_24h: f64,
    pub liquidity: f64,
    pub category: Option<String>,
    pub end_date: Option<String>,
}

impl Topic {
    pub fn new(id: impl Into<String>, question: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            question: question.into(),
            slug: String::new(),
            description: String::new(),
            outcomes: Vec::new(),
            volume_24h: 0.0,
            liquidity: 0.0,
            category: None,
            end_date: None,
        }
    }

    pub fn with_outcomes(mut self, outcomes: Vec<(&str, f64)>) -> Self {
        self.outcomes = outcomes
            .into_iter()
            .map(|(name, price)| Outcome {
                name: name.to_string(),
                price,
            })
            .collect();
        self
    }

    pub fn with_volume(mut self, volume_24h: f64) -> Self {
        self.volume_24h = volume_24h;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Outcome odds as `(name, "65.0%")` pairs, in provider order.
    pub fn formatted_odds(&self) -> Vec<(String, String)> {
        self.outcomes
            .iter()
            .map(|o| (o.name.clone(), format!("{:.1}%", o.price * 100.0)))
            .collect()
    }

    /// Human-readable 24h volume.
    pub fn formatted_volume(&self) -> String {
        if self.volume_24h >= 1_000_000.0 {
            format!("${:.1}M", self.volume_24h / 1_000_000.0)
        } else if self.volume_24h >= 1_000.0 {
            format!("${:.1}K", self.volume_24h / 1_000.0)
        } else {
            format!("${:.0}", self.volume_24h)
        }
    }

    /// Question truncated for overlays and chat.
    pub fn short_question(&self) -> String {
        if self.question.chars().count() <= 50 {
            return self.question.clone();
        }
        let head: String = self.question.chars().take(47).collect();
        format!("{}...", head)
    }

    pub fn summary(&self) -> String {
        let odds = self
            .formatted_odds()
            .iter()
            .map(|(name, pct)| format!("{}: {}", name, pct))
            .collect::<Vec<_>>()
            .join(" | ");
        format!(
            "{}\n{}\n24h Volume: {}",
            self.question,
            odds,
            self.formatted_volume()
        )
    }
}

/// Source of ranked topics.
#[async_trait]
pub trait TopicProvider: Send + Sync {
    /// Up to `limit` open topics, most popular first.
    async fn fetch_trending(&self, limit: usize) -> Result<Vec<Arc<Topic>>, ShowError>;

    /// Trending topics with the given ids removed, ranking preserved.
    async fn fetch_candidates(
        &self,
        exclude_ids: &[String],
        limit: usize,
    ) -> Result<Vec<Arc<Topic>>, ShowError> {
        let topics = self.fetch_trending(limit).await?;
        Ok(topics
            .into_iter()
            .filter(|t| !exclude_ids.contains(&t.id))
            .collect())
    }
}

/// Longest single backoff step, in powers of two seconds.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Run `call` until it succeeds, backing off 1s, 2s, 4s... (up to 64s)
/// between attempts.
///
/// Only transient errors are retried; the last error is returned once
/// `max_attempts` is used up.
pub async fn with_retries<T, F, Fut>(
    what: &str,
    max_attempts: u32,
    mut call: F,
) -> Result<T, ShowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ShowError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                let delay = Duration::from_secs(1 << attempt.min(MAX_BACKOFF_EXPONENT));
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    max_attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Polymarket Gamma API client.
pub struct GammaClient {
    http: reqwest::Client,
    base: String,
    max_retries: u32,
}

impl GammaClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, ShowError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base: config.gamma_base.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    async fn get_markets(&self, limit: usize) -> Result<Vec<Arc<Topic>>, ShowError> {
        let limit = limit.to_string();
        let response = self
            .http
            .get(format!("{}/markets", self.base))
            .query(&[
                ("closed", "false"),
                ("active", "true"),
                ("order", "volume24hr"),
                ("ascending", "false"),
                ("limit", limit.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ShowError::ExternalFetch(format!("market request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ShowError::ExternalFetch(format!(
                "market request returned {}",
                status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ShowError::ExternalFetch(format!("invalid market payload: {}", e)))?;

        Ok(parse_markets(&body))
    }
}

#[async_trait]
impl TopicProvider for GammaClient {
    async fn fetch_trending(&self, limit: usize) -> Result<Vec<Arc<Topic>>, ShowError> {
        with_retries("fetch trending markets", self.max_retries, || {
            self.get_markets(limit)
        })
        .await
    }
}

/// Parse a Gamma `/markets` response, skipping entries that do not parse.
pub fn parse_markets(body: &Value) -> Vec<Arc<Topic>> {
    let Some(entries) = body.as_array() else {
        warn!("Market payload is not an array");
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match parse_market(entry) {
            Ok(topic) => Some(Arc::new(topic)),
            Err(reason) => {
                warn!("Skipping market: {}", reason);
                None
            }
        })
        .collect()
}

fn parse_market(entry: &Value) -> Result<Topic, String> {
    let id = match entry.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err("missing id".to_string()),
    };
    let question = entry
        .get("question")
        .and_then(Value::as_str)
        .ok_or_else(|| format!("market {} has no question", id))?
        .to_string();

    let names: Vec<String> = string_encoded_list(entry.get("outcomes"))?;
    let prices: Vec<f64> = string_encoded_list::<Value>(entry.get("outcomePrices"))?
        .iter()
        .map(number_like)
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| format!("market {} has a non-numeric price", id))?;

    let outcomes = names
        .into_iter()
        .zip(prices)
        .map(|(name, price)| Outcome { name, price })
        .collect();

    let text = |key: &str| entry.get(key).and_then(Value::as_str).map(str::to_string);

    debug!("Parsed market {}", id);
    Ok(Topic {
        slug: text("slug").unwrap_or_default(),
        description: text("description").unwrap_or_default(),
        outcomes,
        volume_24h: entry.get("volume24hr").and_then(number_like).unwrap_or(0.0),
        liquidity: entry.get("liquidityNum").and_then(number_like).unwrap_or(0.0),
        category: text("category"),
        end_date: text("endDate"),
        id,
        question,
    })
}

/// Gamma encodes list fields as JSON strings (`"[\"Yes\", \"No\"]"`).
fn string_encoded_list<T: serde::de::DeserializeOwned>(field: Option<&Value>) -> Result<Vec<T>, String> {
    match field {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| e.to_string()),
        Some(other) => serde_json::from_value(other.clone()).map_err(|e| e.to_string()),
    }
}

fn number_like(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
