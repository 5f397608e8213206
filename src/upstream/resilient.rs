//! Circuit-breaker-protected HTTP access to the stats provider.
//!
//! Every upstream call is described as an [`UpstreamCall`] and executed
//! through an injected [`Fetcher`] transport. Direct calls retry bounded
//! times on 429, qualifying failure statuses feed the shared
//! [`BreakerBoard`], and an open breaker reroutes calls through the
//! configured fallback proxy. A real response is never swallowed: whatever
//! status the wire produced is handed back to the caller.

use std::{error::Error, sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::{Client, Method, StatusCode, header::RETRY_AFTER};
use serde_json::{Value, json};
use thiserror::Error;
use time::{OffsetDateTime, format_description::well_known::Rfc2822};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{
    config::{AppConfig, ProxyConfig, ProxyMode, UpstreamConfig},
    upstream::breaker::BreakerBoard,
};

/// Header carrying the shared secret expected by the fallback proxy.
pub const PROXY_AUTH_HEADER: &str = "x-proxy-auth";

/// The wire could not be used at all; distinct from a served error status.
#[derive(Debug, Error)]
#[error("transport failure for `{url}`")]
pub struct TransportError {
    url: String,
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl TransportError {
    /// Wrap any transport-level failure.
    pub fn new(url: impl Into<String>, source: impl Error + Send + Sync + 'static) -> Self {
        Self {
            url: url.into(),
            source: Box::new(source),
        }
    }
}

/// One HTTP request as handed to the transport.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

/// One HTTP response as seen by the caller.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    /// Raw `retry-after` header, if the server sent one.
    pub retry_after: Option<String>,
    /// Decoded JSON body, or the raw text as a JSON string when the body
    /// was not JSON, or `Null` when empty.
    pub body: Value,
}

/// Low-level transport seam; tests substitute a recording fake.
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: FetchRequest)
    -> BoxFuture<'static, Result<FetchResponse, TransportError>>;
}

/// reqwest-backed transport.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Build the shared HTTP client.
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().build()?,
        })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> BoxFuture<'static, Result<FetchResponse, TransportError>> {
        let client = self.client.clone();
        Box::pin(async move {
            let mut builder = client.request(request.method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = &request.body {
                builder = builder.json(body);
            }

            let response = builder
                .send()
                .await
                .map_err(|source| TransportError::new(&request.url, source))?;
            let status = response.status();
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(String::from);
            let text = response
                .text()
                .await
                .map_err(|source| TransportError::new(&request.url, source))?;
            let body = if text.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            };

            Ok(FetchResponse {
                status,
                retry_after,
                body,
            })
        })
    }
}

/// A logical call against the stats provider, carrying both of its
/// addressings: the direct URL path and the RPC method/args pair the
/// fallback proxy understands.
#[derive(Debug, Clone)]
pub struct UpstreamCall {
    /// RPC method name understood by the proxy.
    pub method: &'static str,
    /// RPC arguments, in provider order.
    pub args: Vec<Value>,
    /// Path and query appended to the direct base URL.
    pub path: String,
}

/// Breaker-aware executor for [`UpstreamCall`]s.
pub struct ResilientFetcher {
    transport: Arc<dyn Fetcher>,
    breaker: Arc<BreakerBoard>,
    upstream: UpstreamConfig,
    proxy: Option<ProxyConfig>,
}

impl ResilientFetcher {
    /// Wire the executor from configuration.
    pub fn new(transport: Arc<dyn Fetcher>, breaker: Arc<BreakerBoard>, config: &AppConfig) -> Self {
        Self {
            transport,
            breaker,
            upstream: config.upstream.clone(),
            proxy: config.proxy.clone(),
        }
    }

    /// Execute `call`, rerouting through the proxy while the breaker is open
    /// and feeding qualifying failures back into it.
    pub async fn execute(&self, call: &UpstreamCall) -> Result<FetchResponse, TransportError> {
        if let Some(proxy) = &self.proxy {
            if self.breaker.should_reroute(&self.upstream.target).await {
                debug!(method = call.method, "circuit open; calling through proxy");
                return self.via_proxy(proxy, call).await;
            }
        }

        let response = self.direct_with_retry(call).await?;

        if self.breaker.qualifies(response.status.as_u16()) {
            let url = self.direct_url(call);
            let opened = self
                .breaker
                .record_failure(&self.upstream.target, response.status.as_u16(), &url)
                .await;
            if opened {
                if let Some(proxy) = &self.proxy {
                    info!(
                        method = call.method,
                        "breaker opened; retrying the call through the proxy"
                    );
                    return self.via_proxy(proxy, call).await;
                }
            }
        }

        Ok(response)
    }

    fn direct_url(&self, call: &UpstreamCall) -> String {
        join_url(&self.upstream.base_url, &call.path)
    }

    async fn direct_with_retry(&self, call: &UpstreamCall) -> Result<FetchResponse, TransportError> {
        let url = self.direct_url(call);
        let max_attempts = self.upstream.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let request = FetchRequest {
                method: Method::GET,
                url: url.clone(),
                headers: self
                    .upstream
                    .headers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
                body: None,
            };
            let response = self.transport.fetch(request).await?;
            if response.status != StatusCode::TOO_MANY_REQUESTS || attempt + 1 >= max_attempts {
                // The final 429, like every other status, goes back to the
                // caller unchanged.
                return Ok(response);
            }

            let wait = response
                .retry_after
                .as_deref()
                .and_then(parse_retry_after)
                .unwrap_or_else(|| backoff_delay(attempt, self.upstream.retry.base_backoff));
            warn!(
                %url,
                attempt,
                wait_ms = wait.as_millis() as u64,
                "direct call rate limited; backing off"
            );
            sleep(wait).await;
            attempt += 1;
        }
    }

    async fn via_proxy(
        &self,
        proxy: &ProxyConfig,
        call: &UpstreamCall,
    ) -> Result<FetchResponse, TransportError> {
        let mut headers = Vec::new();
        if let Some(token) = &proxy.auth_token {
            headers.push((PROXY_AUTH_HEADER.to_string(), token.clone()));
        }

        match proxy.mode {
            ProxyMode::Rewrite => {
                let request = FetchRequest {
                    method: Method::GET,
                    url: join_url(&proxy.base_url, &call.path),
                    headers,
                    body: None,
                };
                self.transport.fetch(request).await
            }
            ProxyMode::Rpc => {
                let request = FetchRequest {
                    method: Method::POST,
                    url: format!(
                        "{}/proxy/{}",
                        proxy.base_url.trim_end_matches('/'),
                        self.upstream.target
                    ),
                    headers,
                    body: Some(json!({
                        "method": call.method,
                        "args": call.args,
                    })),
                };
                let response = self.transport.fetch(request).await?;
                Ok(decode_rpc_response(response))
            }
        }
    }
}

/// Unwrap the RPC proxy envelope: successes carry the upstream payload
/// under `result`, failures carry a message that usually embeds the
/// original status text.
fn decode_rpc_response(response: FetchResponse) -> FetchResponse {
    if response.status.is_success() {
        let FetchResponse {
            status,
            retry_after,
            mut body,
        } = response;
        if let Some(result) = body.get_mut("result") {
            return FetchResponse {
                status,
                retry_after,
                body: result.take(),
            };
        }
        return FetchResponse {
            status,
            retry_after,
            body,
        };
    }

    let Some(message) = extract_error_message(&response.body) else {
        return response;
    };
    let status = parse_embedded_status(&message).unwrap_or(response.status);
    FetchResponse {
        status,
        retry_after: response.retry_after,
        body: Value::String(message),
    }
}

fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .or_else(|| body.get("message").and_then(Value::as_str))
        .map(String::from)
}

/// Pull a leading `NNN` status out of a proxy error message like
/// `404 Not Found for url ...`.
fn parse_embedded_status(message: &str) -> Option<StatusCode> {
    let trimmed = message.trim_start();
    let digits = trimmed.get(..3)?;
    if !matches!(trimmed.as_bytes().get(3), None | Some(b' ') | Some(b':')) {
        return None;
    }
    let code = digits.parse::<u16>().ok()?;
    StatusCode::from_u16(code).ok()
}

/// Parse a `retry-after` header value, either delay-seconds or an HTTP
/// date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // HTTP dates spell the zone as `GMT`, which the RFC 2822 parser
    // rejects.
    let normalized = value.replace(" GMT", " +0000");
    let date = OffsetDateTime::parse(&normalized, &Rfc2822).ok()?;
    let wait = date - OffsetDateTime::now_utc();
    if wait.is_positive() {
        Some(wait.unsigned_abs())
    } else {
        Some(Duration::ZERO)
    }
}

/// Exponential backoff used when a 429 carries no usable `retry-after`.
fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
