//! Page scraping providers.
//!
//! Firecrawl is the primary provider and BrowserUse the fallback. Both
//! normalize into [`PageData`]; a provider that answers with too little
//! content is treated as a hard failure so the fallback gets its turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use super::schema::PageData;
use super::Scraper;
use crate::error::{PipelineError, PipelineResult};

const FIRECRAWL_TIMEOUT: Duration = Duration::from_secs(30);
const BROWSER_USE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_MARKDOWN_CHARS: usize = 15_000;
const MIN_DESCRIPTION_CHARS: usize = 20;
const MIN_MARKDOWN_CHARS: usize = 100;
pub const UNKNOWN_TITLE: &str = "Unknown Product";

fn build_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("promoreel/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Send a provider request and decode the JSON body, mapping every transport
/// or status problem to an adapter error.
async fn post_json(request: reqwest::RequestBuilder, provider: &str) -> PipelineResult<Value> {
    let resp = request
        .send()
        .await
        .map_err(|e| PipelineError::Adapter(format!("{} request failed: {}", provider, e)))?;

    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(PipelineError::Adapter(format!(
            "{} returned {}: {}",
            provider,
            status,
            truncate_chars(&text, 500)
        )));
    }

    serde_json::from_str(&text)
        .map_err(|e| PipelineError::Adapter(format!("{} returned malformed JSON: {}", provider, e)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Firecrawl
// ─────────────────────────────────────────────────────────────────────────────

pub struct FirecrawlScraper {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl FirecrawlScraper {
    pub fn new(api_key: String, endpoint: String) -> Self {
        Self {
            client: build_client(FIRECRAWL_TIMEOUT),
            api_key,
            endpoint,
        }
    }

    fn request_body(url: &str) -> Value {
        json!({
            "url": url,
            "formats": ["markdown", "extract"],
            "extract": {
                "schema": {
                    "type": "object",
                    "properties": {
                        "product_name": {"type": "string"},
                        "tagline": {"type": "string"},
                        "description": {"type": "string"},
                        "features": {"type": "array", "items": {"type": "string"}},
                        "og_image": {"type": "string"}
                    }
                }
            }
        })
    }
}

/// Normalize a Firecrawl `/v1/scrape` response body.
pub fn normalize_firecrawl(body: &Value) -> PipelineResult<PageData> {
    if body.get("success").and_then(|v| v.as_bool()) != Some(true) {
        let reason = str_field(body, "error").unwrap_or("unknown error");
        return Err(PipelineError::Adapter(format!("firecrawl reported failure: {}", reason)));
    }

    let empty = json!({});
    let data = body.get("data").unwrap_or(&empty);
    let metadata = data.get("metadata").unwrap_or(&empty);
    let extract = data.get("extract").unwrap_or(&empty);
    let markdown = data.get("markdown").and_then(|v| v.as_str()).unwrap_or("");

    let title = str_field(extract, "product_name")
        .or_else(|| str_field(metadata, "og:title"))
        .or_else(|| str_field(metadata, "title"))
        .unwrap_or(UNKNOWN_TITLE);
    let description = str_field(extract, "description")
        .or_else(|| str_field(metadata, "og:description"))
        .unwrap_or("");
    let tagline = str_field(extract, "tagline")
        .or_else(|| str_field(metadata, "description"))
        .unwrap_or("");
    let og_image = str_field(extract, "og_image").or_else(|| str_field(metadata, "og:image"));
    let features = string_list(extract, "features");

    if description.chars().count() < MIN_DESCRIPTION_CHARS
        && markdown.chars().count() < MIN_MARKDOWN_CHARS
    {
        return Err(PipelineError::Adapter(
            "firecrawl returned too little content".to_string(),
        ));
    }

    Ok(PageData {
        title: title.to_string(),
        tagline: tagline.to_string(),
        description: description.to_string(),
        gallery: og_image.map(|s| vec![s.to_string()]).unwrap_or_default(),
        features,
        markdown: truncate_chars(markdown, MAX_MARKDOWN_CHARS),
        source: "firecrawl".to_string(),
    })
}

#[async_trait]
impl Scraper for FirecrawlScraper {
    fn name(&self) -> &str {
        "firecrawl"
    }

    async fn scrape(&self, url: &str) -> PipelineResult<PageData> {
        tracing::info!(url = %url, provider = "firecrawl", "Scraping page");
        let body = post_json(
            self.client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&Self::request_body(url)),
            "firecrawl",
        )
        .await?;
        normalize_firecrawl(&body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// BrowserUse
// ─────────────────────────────────────────────────────────────────────────────

pub struct BrowserUseScraper {
    client: Client,
    api_key: String,
    endpoint: String,
}

impl BrowserUseScraper {
    pub fn new(api_key: String, endpoint: String) -> Self {
        Self {
            client: build_client(BROWSER_USE_TIMEOUT),
            api_key,
            endpoint,
        }
    }
}

/// Normalize a BrowserUse skill response; the payload may be wrapped in
/// `result` or `output`.
pub fn normalize_browser_use(body: &Value) -> PipelineResult<PageData> {
    if body.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let reason = str_field(body, "error").unwrap_or("unknown error");
        return Err(PipelineError::Adapter(format!("browser-use reported failure: {}", reason)));
    }

    let result = ["result", "output"]
        .iter()
        .filter_map(|key| body.get(*key))
        .find(|v| v.is_object())
        .unwrap_or(body);

    let product_name = str_field(result, "product_name");
    let description = str_field(result, "description");
    if product_name.is_none() && description.is_none() {
        return Err(PipelineError::Adapter("browser-use returned empty content".to_string()));
    }

    let description = [
        description,
        str_field(result, "problem"),
        str_field(result, "solution"),
    ]
    .iter()
    .flatten()
    .copied()
    .collect::<Vec<_>>()
    .join("\n\n");

    Ok(PageData {
        title: product_name.unwrap_or(UNKNOWN_TITLE).to_string(),
        tagline: str_field(result, "tagline").unwrap_or("").to_string(),
        description,
        gallery: str_field(result, "og_image")
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        features: string_list(result, "features"),
        markdown: String::new(),
        source: "browser-use".to_string(),
    })
}

#[async_trait]
impl Scraper for BrowserUseScraper {
    fn name(&self) -> &str {
        "browser-use"
    }

    async fn scrape(&self, url: &str) -> PipelineResult<PageData> {
        tracing::info!(url = %url, provider = "browser-use", "Scraping page");
        let body = post_json(
            self.client
                .post(&self.endpoint)
                .header("X-Browser-Use-API-Key", &self.api_key)
                .json(&json!({ "parameters": { "url": url } })),
            "browser-use",
        )
        .await?;
        normalize_browser_use(&body)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Primary + fallback
// ─────────────────────────────────────────────────────────────────────────────

/// Tries the primary provider, then the fallback on any adapter failure.
pub struct FallbackScraper {
    primary: Option<Arc<dyn Scraper>>,
    fallback: Option<Arc<dyn Scraper>>,
}

impl FallbackScraper {
    pub fn new(primary: Option<Arc<dyn Scraper>>, fallback: Option<Arc<dyn Scraper>>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl Scraper for FallbackScraper {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn scrape(&self, url: &str) -> PipelineResult<PageData> {
        let mut failures = Vec::new();

        for provider in [&self.primary, &self.fallback].into_iter().flatten() {
            match provider.scrape(url).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        url = %url,
                        provider = provider.name(),
                        error = %e,
                        "Scraping provider failed"
                    );
                    failures.push(format!("{}: {}", provider.name(), e));
                }
                Err(e) => return Err(e),
            }
        }

        if failures.is_empty() {
            return Err(PipelineError::Adapter(
                "no scraping provider is configured".to_string(),
            ));
        }
        Err(PipelineError::Adapter(format!(
            "all scraping providers failed ({})",
            failures.join("; ")
        )))
    }
}
