use async_trait::async_trait;
use futures::TryStreamExt;
use moka::future::Cache;
use parking_lot::Mutex;
use reqwest::{Client, Response, StatusCode, Url};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Result, SchemaError};
use crate::source::{InvalidationListener, RefreshOutcome, SchemaSource, SourceResolver};

/// Configuration for the HTTP resolver
#[derive(Debug, Clone)]
pub struct HttpResolverConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Number of retry attempts
    pub retry_attempts: u32,
    /// Initial retry delay in milliseconds
    pub retry_delay_ms: u64,
    /// Maximum retry delay in milliseconds (for exponential backoff cap)
    pub max_retry_delay_ms: u64,
    /// Largest schema accepted, in bytes
    pub max_schema_size: u64,
    /// How long downloaded text is served without going back to the network
    pub max_age_ms: u64,
    /// User agent string
    pub user_agent: String,
}

impl Default for HttpResolverConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for HttpResolverConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout_seconds: config.network.timeout_seconds,
            retry_attempts: config.network.retry_attempts,
            retry_delay_ms: config.network.retry_delay_ms,
            max_retry_delay_ms: config.network.max_retry_delay_ms,
            max_schema_size: config.network.max_schema_size,
            max_age_ms: config.cache.max_age_ms,
            user_agent: format!("xsd-cache/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Why a single request attempt failed
#[derive(Debug)]
enum RequestError {
    Timeout,
    Http(reqwest::Error),
}

/// Remote resolver for `http` and `https` schema locations
///
/// Downloaded text is kept for `max_age_ms`; after that the next lookup
/// downloads again, and if the text changed the cache is told to recompile
/// the schema and everything built on it.
pub struct HttpSchemaResolver {
    client: Client,
    config: HttpResolverConfig,
    texts: Cache<String, Arc<str>>,
    /// Last text served per URL, for change detection
    served: Mutex<HashMap<String, Arc<str>>>,
    listener: Mutex<Option<InvalidationListener>>,
}

impl HttpSchemaResolver {
    pub const ID: &'static str = "http";

    pub fn new(config: HttpResolverConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(&config.user_agent)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(SchemaError::from)?;

        let texts = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_millis(config.max_age_ms))
            .build();

        Ok(Self {
            client,
            config,
            texts,
            served: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &HttpResolverConfig {
        &self.config
    }

    fn handles(uri: &str) -> bool {
        Url::parse(uri).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
    }

    /// Download schema text, enforcing the size limit while streaming
    pub async fn download(&self, url: &str) -> Result<Arc<str>> {
        let response = self.get_response_with_retry(url).await?;

        let limit = self.config.max_schema_size;
        if let Some(length) = response.content_length() {
            if length > limit {
                return Err(size_exceeded(url, limit));
            }
        }

        let mut buffer = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = TryStreamExt::try_next(&mut stream)
            .await
            .map_err(SchemaError::from)?
        {
            if (buffer.len() + chunk.len()) as u64 > limit {
                return Err(size_exceeded(url, limit));
            }
            buffer.extend_from_slice(&chunk);
        }

        let text = check_schema_content(&buffer, url)?;
        debug!(url = %url, bytes = buffer.len(), "Downloaded schema");
        Ok(Arc::from(text))
    }

    /// Remember `text` as served for `url`; true if it differs from what was served before
    fn remember(&self, url: &str, text: &Arc<str>) -> bool {
        match self.served.lock().insert(url.to_string(), text.clone()) {
            Some(previous) => previous != *text,
            None => false,
        }
    }

    fn notify_changed(&self, url: &str) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            info!(url = %url, "Remote schema changed; invalidating");
            listener.invalidate(url, true);
        }
    }

    /// Get response with retry logic
    async fn get_response_with_retry(&self, url: &str) -> Result<Response> {
        let mut current_attempt = 0;

        loop {
            match self.make_request(url).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }

                    // Retry on server errors (5xx) but not client errors (4xx)
                    if status.is_server_error() && current_attempt < self.config.retry_attempts {
                        debug!(url = %url, status = status.as_u16(), attempt = current_attempt, "Retrying schema download");
                        self.wait_before_retry(current_attempt).await;
                        current_attempt += 1;
                        continue;
                    }

                    return Err(SchemaError::HttpStatus {
                        uri: url.to_string(),
                        status: status.as_u16(),
                    });
                }
                Err(error) => {
                    if current_attempt < self.config.retry_attempts && is_retryable_error(&error) {
                        debug!(url = %url, attempt = current_attempt, "Retrying schema download");
                        self.wait_before_retry(current_attempt).await;
                        current_attempt += 1;
                        continue;
                    }
                    return Err(match error {
                        RequestError::Timeout => SchemaError::Timeout {
                            uri: url.to_string(),
                            timeout_seconds: self.config.timeout_seconds,
                        },
                        RequestError::Http(error) => SchemaError::from(error),
                    });
                }
            }
        }
    }

    /// Make a single HTTP request with timeout
    async fn make_request(&self, url: &str) -> std::result::Result<Response, RequestError> {
        let request_future = self.client.get(url).send();

        timeout(
            Duration::from_secs(self.config.timeout_seconds),
            request_future,
        )
        .await
        .map_err(|_| RequestError::Timeout)?
        .map_err(RequestError::Http)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .retry_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.config.max_retry_delay_ms))
    }

    /// Wait before retry with exponential backoff
    async fn wait_before_retry(&self, attempt: u32) {
        sleep(self.retry_delay(attempt)).await;
    }
}

/// Retry on network errors and timeouts, but not on invalid URLs or similar
fn is_retryable_error(error: &RequestError) -> bool {
    match error {
        RequestError::Timeout => true,
        RequestError::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
    }
}

fn size_exceeded(url: &str, limit: u64) -> SchemaError {
    SchemaError::io(url, format!("schema exceeds the {} byte size limit", limit))
}

/// Basic sanity check on downloaded bytes: UTF-8 and an XML Schema root
pub(crate) fn check_schema_content(data: &[u8], source: &str) -> Result<String> {
    let content = std::str::from_utf8(data)
        .map_err(|_| SchemaError::invalid(source, "Schema content is not valid UTF-8"))?;

    if !content.trim_start().starts_with('<') {
        return Err(SchemaError::invalid(
            source,
            "Schema content does not appear to be XML",
        ));
    }

    // Check for schema-specific elements
    if !content.contains("<xs:schema")
        && !content.contains("<xsd:schema")
        && !content.contains("<schema")
    {
        return Err(SchemaError::invalid(
            source,
            "Content does not appear to be an XML Schema (XSD)",
        ));
    }

    Ok(content.to_string())
}

#[async_trait]
impl SourceResolver for HttpSchemaResolver {
    fn id(&self) -> &str {
        Self::ID
    }

    async fn get_by_uri(&self, uri: &str) -> Result<Option<SchemaSource>> {
        if !Self::handles(uri) {
            return Ok(None);
        }
        if let Some(text) = self.texts.get(uri).await {
            return Ok(Some(SchemaSource::new(uri, text, Self::ID).remote()));
        }

        let text = self.download(uri).await?;
        self.texts.insert(uri.to_string(), text.clone()).await;
        if self.remember(uri, &text) {
            self.notify_changed(uri);
        }
        Ok(Some(SchemaSource::new(uri, text, Self::ID).remote()))
    }

    async fn refresh(&self, uri: &str) -> Result<RefreshOutcome> {
        if !Self::handles(uri) {
            return Ok(RefreshOutcome::Unchanged);
        }
        // Text younger than max_age is trusted as is
        if self.texts.contains_key(uri) {
            return Ok(RefreshOutcome::Unchanged);
        }
        match self.download(uri).await {
            Ok(text) => {
                self.texts.insert(uri.to_string(), text.clone()).await;
                if self.remember(uri, &text) {
                    Ok(RefreshOutcome::Changed)
                } else {
                    Ok(RefreshOutcome::Unchanged)
                }
            }
            Err(SchemaError::HttpStatus { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() || status == StatusCode::GONE.as_u16() =>
            {
                self.served.lock().remove(uri);
                Ok(RefreshOutcome::Gone)
            }
            Err(error) => Err(error),
        }
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn is_transient(&self) -> bool {
        true
    }

    fn subscribe(&self, listener: InvalidationListener) {
        *self.listener.lock() = Some(listener);
    }
}
