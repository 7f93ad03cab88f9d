use std::time::Duration;

use async_trait::async_trait;
use spider_client::shapes::request::{RequestType, ReturnFormat, ReturnFormatHandling};
use spider_client::{RequestParams, Spider};
use tracing::{debug, warn};

use crate::error::FetchError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// A fetched page as the site loop sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: u16,
    pub html: String,
    pub final_url: String,
}

impl FetchedPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Something that turns a URL into rendered HTML.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Rate limiting and transient server errors are worth another try.
pub fn should_retry(result: &Result<FetchedPage, FetchError>) -> bool {
    match result {
        Ok(page) => page.status == 429 || matches!(page.status, 502..=504),
        Err(FetchError::Request(msg)) => msg.contains("429") || msg.contains("rate"),
        Err(_) => false,
    }
}

/// Fetch with exponential backoff on [`should_retry`] outcomes.
pub async fn fetch_with_retry(
    fetcher: &dyn PageFetcher,
    url: &str,
    max_retries: u32,
    base_backoff: Duration,
) -> Result<FetchedPage, FetchError> {
    let mut attempt = 0;
    loop {
        let result = fetcher.fetch(url).await;
        if attempt >= max_retries || !should_retry(&result) {
            return result;
        }
        let backoff = base_backoff * 2u32.pow(attempt);
        warn!(
            url,
            attempt = attempt + 1,
            max_retries,
            backoff_secs = backoff.as_secs_f64(),
            "transient fetch failure, backing off"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

/// Plain HTTP client. Does not execute JavaScript.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            return FetchError::Timeout(self.timeout.as_secs());
        }
        let chain = error_chain(&e);
        let lower = chain.to_lowercase();
        if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
            FetchError::Tls(chain)
        } else {
            FetchError::Request(chain)
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let html = response.text().await.map_err(|e| self.map_error(e))?;
        debug!(url, status, bytes = html.len(), "fetched");
        Ok(FetchedPage {
            status,
            html,
            final_url,
        })
    }
}

/// spider.cloud rendering API; pages come back after client-side rendering.
pub struct SpiderFetcher {
    spider: Spider,
    timeout: Duration,
}

impl SpiderFetcher {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, FetchError> {
        let spider = Spider::new(Some(api_key))
            .map_err(|e| FetchError::Request(format!("failed to create Spider client: {e}")))?;
        Ok(Self { spider, timeout })
    }

    /// Reads `SPIDER_API_KEY`.
    pub fn from_env(timeout: Duration) -> Result<Self, FetchError> {
        let key = std::env::var("SPIDER_API_KEY").map_err(|_| {
            FetchError::Request("SPIDER_API_KEY environment variable must be set".into())
        })?;
        Self::new(key, timeout)
    }
}

#[async_trait]
impl PageFetcher for SpiderFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let params = RequestParams {
            return_format: Some(ReturnFormatHandling::Single(ReturnFormat::Raw)),
            request: Some(RequestType::Chrome),
            ..Default::default()
        };
        let response = tokio::time::timeout(
            self.timeout,
            self.spider.scrape_url(url, Some(params), "application/json"),
        )
        .await
        .map_err(|_| FetchError::Timeout(self.timeout.as_secs()))?
        .map_err(|e| FetchError::Request(error_chain(&e)))?;

        parse_spider_response(response, url)
    }
}

/// Pull status, content and final URL out of the first result object.
pub fn parse_spider_response(value: serde_json::Value, url: &str) -> Result<FetchedPage, FetchError> {
    let parsed: serde_json::Value = match value.as_str() {
        Some(s) => serde_json::from_str(s).unwrap_or(value.clone()),
        None => value,
    };
    let first = parsed.as_array().and_then(|arr| arr.first()).unwrap_or(&parsed);

    if let Some(error) = first.get("error").and_then(|e| e.as_str()) {
        if !error.is_empty() {
            return Err(FetchError::Request(error.to_string()));
        }
    }

    let html = first
        .get("content")
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .to_string();
    let status = first
        .get("status")
        .and_then(|s| s.as_u64())
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(200);
    let final_url = first
        .get("url")
        .and_then(|u| u.as_str())
        .unwrap_or(url)
        .to_string();

    if html.is_empty() && (200..300).contains(&status) {
        return Err(FetchError::EmptyResponse(url.to_string()));
    }
    Ok(FetchedPage {
        status,
        html,
        final_url,
    })
}

fn error_chain(e: &dyn std::error::Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
