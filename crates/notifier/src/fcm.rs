//! Firebase Cloud Messaging HTTP v1 client.
//!
//! The v1 API has no multicast endpoint, so a batch is fanned out as
//! individual `messages:send` calls with bounded concurrency. Outcomes are
//! returned in the same order as the input tokens.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use relay_common::error::RelayError;
use relay_common::types::DeviceToken;

use crate::auth::AccessTokenSource;
use crate::push::{
    BatchResponse, DeliveryFailure, FailureKind, PushClient, PushMessage, PushPriority,
    SendOutcome,
};

pub struct FcmClient {
    http: reqwest::Client,
    tokens: Arc<dyn AccessTokenSource>,
    send_url: String,
    max_concurrency: usize,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
}

impl FcmClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        project_id: &str,
        tokens: Arc<dyn AccessTokenSource>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            http,
            tokens,
            send_url: format!(
                "{}/v1/projects/{}/messages:send",
                base_url.trim_end_matches('/'),
                project_id
            ),
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn send_url(&self) -> &str {
        &self.send_url
    }

    /// JSON body of a single `messages:send` request.
    pub fn request_body(token: &str, message: &PushMessage) -> Value {
        let (android_priority, apns_priority) = match message.android.priority {
            PushPriority::High => ("HIGH", "10"),
            PushPriority::Normal => ("NORMAL", "5"),
        };

        let mut android = json!({ "priority": android_priority });
        if let Some(channel_id) = &message.android.channel_id {
            android["notification"] = json!({ "channel_id": channel_id });
        }

        let mut aps = json!({});
        if let Some(sound) = &message.apns.sound {
            aps["sound"] = json!(sound);
        }

        json!({
            "message": {
                "token": token,
                "notification": {
                    "title": message.title,
                    "body": message.body,
                },
                "data": message.data,
                "android": android,
                "apns": {
                    "headers": { "apns-priority": apns_priority },
                    "payload": { "aps": aps },
                },
            }
        })
    }

    /// Send to one token. `Err` means the request never got an HTTP response.
    async fn send_one(
        &self,
        bearer: &str,
        token: &str,
        message: &PushMessage,
    ) -> Result<SendOutcome, reqwest::Error> {
        let response = self
            .http
            .post(&self.send_url)
            .bearer_auth(bearer)
            .json(&Self::request_body(token, message))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status.is_success() {
            return Ok(match serde_json::from_str::<SendResponse>(&body) {
                Ok(sent) => SendOutcome::delivered(token, sent.name),
                Err(_) => SendOutcome::delivered(token, String::new()),
            });
        }

        Ok(SendOutcome::failed(token, parse_error(status.as_u16(), &body)))
    }
}

#[async_trait]
impl PushClient for FcmClient {
    /// Fails the whole batch when the access token cannot be fetched or when
    /// no send in the batch reached FCM.
    async fn send_batch(
        &self,
        tokens: &[DeviceToken],
        message: &PushMessage,
    ) -> Result<BatchResponse, RelayError> {
        let bearer = self.tokens.access_token().await?;

        let sends: Vec<_> = tokens
            .iter()
            .map(|token| self.send_one(&bearer, token, message))
            .collect();
        let results: Vec<Result<SendOutcome, reqwest::Error>> = futures::stream::iter(sends)
            .buffered(self.max_concurrency)
            .collect()
            .await;

        if !results.is_empty() && results.iter().all(Result::is_err) {
            if let Some(Err(e)) = results.into_iter().next() {
                return Err(RelayError::Http(e));
            }
            return Err(RelayError::Push("FCM unreachable".to_string()));
        }

        let outcomes = tokens
            .iter()
            .zip(results)
            .map(|(token, result)| {
                result.unwrap_or_else(|e| {
                    SendOutcome::failed(
                        token.as_str(),
                        DeliveryFailure {
                            kind: FailureKind::Transient,
                            code: None,
                            message: e.to_string(),
                        },
                    )
                })
            })
            .collect();

        Ok(BatchResponse { outcomes })
    }
}

/// Turn an FCM error response into a classified delivery failure.
pub fn parse_error(http_status: u16, body: &str) -> DeliveryFailure {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let error_code = envelope
                .error
                .details
                .iter()
                .find_map(|d| d.error_code.clone());
            let kind = classify(
                http_status,
                envelope.error.status.as_deref(),
                error_code.as_deref(),
                &envelope.error.message,
            );
            DeliveryFailure {
                kind,
                code: error_code.or(envelope.error.status),
                message: envelope.error.message,
            }
        }
        Err(_) => DeliveryFailure {
            kind: classify(http_status, None, None, body),
            code: None,
            message: format!("HTTP {}: {}", http_status, body),
        },
    }
}

/// Classify an FCM v1 error by `errorCode`, falling back to the RPC status.
pub fn classify(
    http_status: u16,
    status: Option<&str>,
    error_code: Option<&str>,
    message: &str,
) -> FailureKind {
    match error_code.or(status) {
        Some("UNREGISTERED") | Some("NOT_FOUND") => FailureKind::Unregistered,
        Some("INVALID_ARGUMENT")
            if message.to_ascii_lowercase().contains("registration token") =>
        {
            FailureKind::InvalidToken
        }
        Some("UNAVAILABLE") | Some("INTERNAL") | Some("QUOTA_EXCEEDED") => FailureKind::Transient,
        Some(_) => FailureKind::Other,
        None if http_status == 429 || http_status >= 500 => FailureKind::Transient,
        None => FailureKind::Other,
    }
}
