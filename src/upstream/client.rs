//! Typed accessors over the resilient fetch layer.
//!
//! [`StatsClient`] is the only place that knows provider paths and RPC
//! method names; everything above it works with the [`MatchSource`] seam so
//! the poll pipeline can run against a scripted provider in tests.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::upstream::{
    models::{MatchHistory, MatchRecord, MatchStats, MatchStub, PlayerSkill, SkillResponse},
    rate_limit::{RateLimiter, Throttled},
    resilient::{FetchResponse, ResilientFetcher, TransportError, UpstreamCall, parse_retry_after},
};

/// Failures surfaced by the typed provider accessors.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The wire could not be used at all.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The provider served an error status.
    #[error("upstream returned {status} for `{path}`")]
    Status {
        status: StatusCode,
        path: String,
        detail: Option<String>,
    },
    /// The provider rejected the call for pacing.
    #[error("upstream rate limited `{path}`")]
    RateLimited {
        path: String,
        retry_after: Option<Duration>,
    },
    /// The payload did not match the expected shape.
    #[error("failed to decode upstream payload for `{path}`")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Throttled for UpstreamError {
    fn is_rate_limited(&self) -> bool {
        matches!(self, UpstreamError::RateLimited { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Provider operations the tracker needs.
pub trait MatchSource: Send + Sync {
    /// Most recent matches of one player, newest first.
    fn recent_matches(
        &self,
        player_id: String,
        count: u32,
    ) -> BoxFuture<'static, Result<Vec<MatchStub>, UpstreamError>>;
    /// Full stats of one match.
    fn match_stats(&self, match_id: Uuid)
    -> BoxFuture<'static, Result<MatchRecord, UpstreamError>>;
    /// Skill numbers for the given players in one match.
    fn match_skill(
        &self,
        match_id: Uuid,
        player_ids: Vec<String>,
    ) -> BoxFuture<'static, Result<Vec<PlayerSkill>, UpstreamError>>;
    /// Provider-wide medal metadata, passed through verbatim.
    fn medal_metadata(&self) -> BoxFuture<'static, Result<Value, UpstreamError>>;
}

/// Throttled, breaker-protected provider client.
#[derive(Clone)]
pub struct StatsClient {
    fetcher: Arc<ResilientFetcher>,
    limiter: Arc<RateLimiter>,
}

impl StatsClient {
    /// Wire the client over its transport and throttle.
    pub fn new(fetcher: Arc<ResilientFetcher>, limiter: Arc<RateLimiter>) -> Self {
        Self { fetcher, limiter }
    }

    /// Run `call` through the throttle and classify the response.
    async fn run(&self, call: UpstreamCall) -> Result<FetchResponse, UpstreamError> {
        self.limiter
            .execute(|| {
                let fetcher = self.fetcher.clone();
                let call = call.clone();
                async move {
                    let response = fetcher.execute(&call).await?;
                    classify(&call.path, response)
                }
            })
            .await
    }
}

/// Map a served response onto the typed error space. Every non-2xx status
/// is an error here; the resilient layer has already done its own retrying.
fn classify(path: &str, response: FetchResponse) -> Result<FetchResponse, UpstreamError> {
    if response.status == StatusCode::TOO_MANY_REQUESTS {
        return Err(UpstreamError::RateLimited {
            path: path.to_string(),
            retry_after: response.retry_after.as_deref().and_then(parse_retry_after),
        });
    }
    if !response.status.is_success() {
        return Err(UpstreamError::Status {
            status: response.status,
            path: path.to_string(),
            detail: response.body.as_str().map(String::from),
        });
    }
    Ok(response)
}

fn decode_body<T: DeserializeOwned>(path: &str, body: Value) -> Result<T, UpstreamError> {
    serde_json::from_value(body).map_err(|source| UpstreamError::Decode {
        path: path.to_string(),
        source,
    })
}

impl MatchSource for StatsClient {
    fn recent_matches(
        &self,
        player_id: String,
        count: u32,
    ) -> BoxFuture<'static, Result<Vec<MatchStub>, UpstreamError>> {
        let client = self.clone();
        Box::pin(async move {
            let call = UpstreamCall {
                method: "listPlayerMatches",
                args: vec![json!(player_id), json!(count)],
                path: format!("stats/players/{player_id}/matches?count={count}"),
            };
            let path = call.path.clone();
            let response = client.run(call).await?;
            let history: MatchHistory = decode_body(&path, response.body)?;
            Ok(history.matches)
        })
    }

    fn match_stats(
        &self,
        match_id: Uuid,
    ) -> BoxFuture<'static, Result<MatchRecord, UpstreamError>> {
        let client = self.clone();
        Box::pin(async move {
            let call = UpstreamCall {
                method: "getMatchStats",
                args: vec![json!(match_id)],
                path: format!("stats/matches/{match_id}"),
            };
            let path = call.path.clone();
            let response = client.run(call).await?;
            let stats: MatchStats = decode_body(&path, response.body.clone())?;
            Ok(MatchRecord {
                stats,
                raw: response.body,
            })
        })
    }

    fn match_skill(
        &self,
        match_id: Uuid,
        player_ids: Vec<String>,
    ) -> BoxFuture<'static, Result<Vec<PlayerSkill>, UpstreamError>> {
        let client = self.clone();
        Box::pin(async move {
            let players = player_ids.join(",");
            let call = UpstreamCall {
                method: "getMatchSkill",
                args: vec![json!(match_id), json!(player_ids)],
                path: format!("stats/matches/{match_id}/skill?players={players}"),
            };
            let path = call.path.clone();
            let response = client.run(call).await?;
            let skills: SkillResponse = decode_body(&path, response.body)?;
            Ok(skills.skills)
        })
    }

    fn medal_metadata(&self) -> BoxFuture<'static, Result<Value, UpstreamError>> {
        let client = self.clone();
        Box::pin(async move {
            let call = UpstreamCall {
                method: "listMedals",
                args: Vec::new(),
                path: "metadata/medals".to_string(),
            };
            let response = client.run(call).await?;
            Ok(response.body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: Value) -> FetchResponse {
        FetchResponse {
            status: StatusCode::from_u16(status).unwrap(),
            retry_after: None,
            body,
        }
    }

    #[test]
    fn classify_maps_429_to_rate_limited() {
        let mut throttled = response(429, Value::Null);
        throttled.retry_after = Some("3".into());
        let error = classify("stats/x", throttled).unwrap_err();
        assert!(error.is_rate_limited());
        assert_eq!(error.retry_after(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn classify_keeps_proxy_error_text_as_detail() {
        let error = classify("stats/x", response(404, Value::String("404 Not Found".into())))
            .unwrap_err();
        match error {
            UpstreamError::Status { status, detail, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(detail.as_deref(), Some("404 Not Found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn classify_passes_success_through() {
        let ok = classify("stats/x", response(200, json!({"matches": []}))).unwrap();
        assert_eq!(ok.body, json!({"matches": []}));
    }
}
