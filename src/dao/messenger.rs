//! Outbound chat relay hosting the live score message.
//!
//! The tracker never talks to the chat platform directly; it renders the
//! series view and hands it to a relay service that owns the actual message.
//! Without a configured relay the [`NullMessenger`] keeps the rest of the
//! pipeline exercised.

use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::MessengerConfig;

/// Result alias for relay operations.
pub type MessengerResult<T> = Result<T, MessengerError>;

/// Failures talking to the chat relay.
#[derive(Debug, Error)]
pub enum MessengerError {
    /// Building the HTTP client failed.
    #[error("failed to build messenger client")]
    ClientBuilder {
        #[source]
        source: reqwest::Error,
    },
    /// The relay could not be reached.
    #[error("failed to send messenger request to `{path}`")]
    RequestSend {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    /// The relay answered with an unexpected status.
    #[error("unexpected messenger response status {status} for `{path}`")]
    RequestStatus { path: String, status: StatusCode },
    /// The relay answer could not be decoded.
    #[error("failed to decode messenger response for `{path}`")]
    DecodeResponse {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

impl MessengerError {
    /// Whether the relay rejected the call for lack of channel permission.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            MessengerError::RequestStatus { status, .. } if *status == StatusCode::FORBIDDEN
        )
    }
}

/// Abstraction over the service hosting the live score message.
pub trait Messenger: Send + Sync {
    /// Post a new message, returning the relay-assigned message id if the
    /// relay hands one out.
    fn post(
        &self,
        channel_id: String,
        payload: Value,
    ) -> BoxFuture<'static, MessengerResult<Option<String>>>;
    /// Replace the content of an existing message.
    fn edit(
        &self,
        channel_id: String,
        message_id: String,
        payload: Value,
    ) -> BoxFuture<'static, MessengerResult<()>>;
}

/// HTTP relay client.
#[derive(Clone)]
pub struct HttpMessenger {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostMessageResponse {
    #[serde(default)]
    message_id: Option<String>,
}

impl HttpMessenger {
    /// Build a relay client from configuration.
    pub fn new(config: &MessengerConfig) -> MessengerResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| MessengerError::ClientBuilder { source })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match self.auth_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl Messenger for HttpMessenger {
    fn post(
        &self,
        channel_id: String,
        payload: Value,
    ) -> BoxFuture<'static, MessengerResult<Option<String>>> {
        let messenger = self.clone();
        Box::pin(async move {
            let path = format!("channels/{channel_id}/messages");
            let response = messenger
                .request(reqwest::Method::POST, &path)
                .json(&payload)
                .send()
                .await
                .map_err(|source| MessengerError::RequestSend {
                    path: path.clone(),
                    source,
                })?;

            if !response.status().is_success() {
                return Err(MessengerError::RequestStatus {
                    path,
                    status: response.status(),
                });
            }

            let decoded = response
                .json::<PostMessageResponse>()
                .await
                .map_err(|source| MessengerError::DecodeResponse { path, source })?;
            Ok(decoded.message_id)
        })
    }

    fn edit(
        &self,
        channel_id: String,
        message_id: String,
        payload: Value,
    ) -> BoxFuture<'static, MessengerResult<()>> {
        let messenger = self.clone();
        Box::pin(async move {
            let path = format!("channels/{channel_id}/messages/{message_id}");
            let response = messenger
                .request(reqwest::Method::PATCH, &path)
                .json(&payload)
                .send()
                .await
                .map_err(|source| MessengerError::RequestSend {
                    path: path.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(MessengerError::RequestStatus {
                    path,
                    status: response.status(),
                })
            }
        })
    }
}

/// No-op relay used when no messenger is configured.
#[derive(Default)]
pub struct NullMessenger;

impl Messenger for NullMessenger {
    fn post(
        &self,
        channel_id: String,
        _payload: Value,
    ) -> BoxFuture<'static, MessengerResult<Option<String>>> {
        Box::pin(async move {
            debug!(%channel_id, "no messenger configured; dropping post");
            Ok(None)
        })
    }

    fn edit(
        &self,
        channel_id: String,
        message_id: String,
        _payload: Value,
    ) -> BoxFuture<'static, MessengerResult<()>> {
        Box::pin(async move {
            debug!(%channel_id, %message_id, "no messenger configured; dropping edit");
            Ok(())
        })
    }
}
