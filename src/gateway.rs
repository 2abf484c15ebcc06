//! Outbound message delivery.
//!
//! The engine talks to the messaging provider through [`DeliveryGateway`].
//! The HTTP implementation posts one JSON document per message and carries
//! the idempotency key in a header so a retried step is deduplicated
//! downstream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;
use surrealdb::RecordId;
use tracing::{debug, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::types::{CampaignId, IdempotencyKey, LeadId, MessageId, TenantId};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// One message handed to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// E.164 phone number.
    pub destination: String,
    pub body: String,
    pub tenant: TenantId,
    pub lead_ref: LeadId,
    pub idempotency_key: IdempotencyKey,
    pub enrollment_ref: String,
    pub campaign_ref: CampaignId,
    pub step_index: usize,
}

/// What the gateway did with an accepted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { message_id: Option<MessageId> },
    /// Queued by the provider for later delivery.
    Scheduled { scheduled_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Worth retrying on a later tick (timeouts, throttling, 5xx).
    Transient(String),
    /// Will fail the same way every time (bad number, rejected content).
    Permanent(String),
}

impl DeliveryError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(msg) => write!(f, "transient delivery failure: {}", msg),
            Self::Permanent(msg) => write!(f, "permanent delivery failure: {}", msg),
        }
    }
}

impl std::error::Error for DeliveryError {}

#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, DeliveryError>;
}

/// Stable deduplication key for one step of one enrollment.
///
/// The same (enrollment, step, scheduled time) always hashes to the same key,
/// so a retry after a lost response cannot produce a second message.
pub fn idempotency_key(
    enrollment: &RecordId,
    step_index: usize,
    scheduled_at: Option<DateTime<Utc>>,
) -> IdempotencyKey {
    let scheduled = scheduled_at
        .map(|at| at.to_rfc3339())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(enrollment.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(step_index.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(scheduled.as_bytes());
    IdempotencyKey::new(format!("{:x}", hasher.finalize()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GatewayResponse {
    #[serde(default, alias = "id", alias = "sid", alias = "message_id")]
    message_id: Option<String>,
    #[serde(default, alias = "scheduled_at")]
    scheduled_at: Option<DateTime<Utc>>,
}

/// Whether an HTTP status is worth retrying.
fn is_retryable(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Gateway that POSTs each message to an HTTP endpoint.
#[derive(Clone)]
pub struct HttpDeliveryGateway {
    endpoint: Url,
    token: Option<String>,
    client: Client,
}

impl HttpDeliveryGateway {
    pub fn new(config: &GatewayConfig) -> anyhow::Result<Self> {
        let raw = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("gateway.url is not configured"))?;
        let endpoint = Url::parse(raw)?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("gateway.url must be http or https, got {}", endpoint.scheme());
        }

        let timeout = config.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .user_agent(concat!("drip-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            endpoint,
            token: config.token.clone(),
            client,
        })
    }
}

#[async_trait]
impl DeliveryGateway for HttpDeliveryGateway {
    async fn send(&self, request: &SendRequest) -> Result<SendOutcome, DeliveryError> {
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            warn!("Gateway request failed: {}", e);
            DeliveryError::Transient(format!("request failed: {}", e))
        })?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let parsed: GatewayResponse = serde_json::from_slice(&body).unwrap_or_default();
            debug!(
                "Gateway accepted {} (message id: {:?})",
                request.idempotency_key, parsed.message_id
            );

            return Ok(match parsed.scheduled_at {
                Some(scheduled_at) => SendOutcome::Scheduled { scheduled_at },
                None => SendOutcome::Sent {
                    message_id: parsed.message_id.map(MessageId::new),
                },
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("gateway returned {}: {}", status, body.trim());

        if is_retryable(status) {
            Err(DeliveryError::Transient(message))
        } else if status.is_client_error() {
            Err(DeliveryError::Permanent(message))
        } else {
            Err(DeliveryError::Transient(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    async fn spawn_gateway(status: StatusCode, body: serde_json::Value) -> (String, Arc<Mutex<Vec<String>>>) {
        let seen_keys = Arc::new(Mutex::new(Vec::new()));
        let keys = seen_keys.clone();

        let app = Router::new().route(
            "/messages",
            post(move |headers: HeaderMap| {
                let body = body.clone();
                let keys = keys.clone();
                async move {
                    if let Some(key) = headers.get("idempotency-key") {
                        keys.lock().unwrap().push(key.to_str().unwrap().to_string());
                    }
                    (status, axum::Json(body))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        (format!("http://{}/messages", addr), seen_keys)
    }

    fn gateway(url: String) -> HttpDeliveryGateway {
        HttpDeliveryGateway::new(&GatewayConfig {
            url: Some(url),
            token: Some("secret".to_string()),
            timeout_seconds: Some(5),
        })
        .unwrap()
    }

    fn request() -> SendRequest {
        let enrollment = RecordId::from_table_key("enrollment", "acme|l1|welcome");
        SendRequest {
            destination: "+15550102000".to_string(),
            body: "Hi Dana".to_string(),
            tenant: TenantId::new("acme"),
            lead_ref: LeadId::new("l1"),
            idempotency_key: idempotency_key(&enrollment, 0, None),
            enrollment_ref: enrollment.to_string(),
            campaign_ref: CampaignId::new("welcome"),
            step_index: 0,
        }
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let id = RecordId::from_table_key("enrollment", "acme|l1|welcome");
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 14, 0, 0).unwrap();

        assert_eq!(idempotency_key(&id, 1, Some(at)), idempotency_key(&id, 1, Some(at)));
        assert_ne!(idempotency_key(&id, 1, Some(at)), idempotency_key(&id, 2, Some(at)));
        assert_ne!(idempotency_key(&id, 1, Some(at)), idempotency_key(&id, 1, None));
        assert_eq!(idempotency_key(&id, 1, None).as_str().len(), 64);
    }

    #[test]
    fn test_rejects_bad_gateway_url() {
        let config = GatewayConfig {
            url: Some("ftp://example.com".to_string()),
            token: None,
            timeout_seconds: None,
        };
        assert!(HttpDeliveryGateway::new(&config).is_err());
        assert!(HttpDeliveryGateway::new(&GatewayConfig::default()).is_err());
    }

    #[test]
    fn test_request_wire_format() {
        let value = serde_json::to_value(request()).unwrap();
        assert_eq!(value["leadRef"], "l1");
        assert_eq!(value["campaignRef"], "welcome");
        assert_eq!(value["stepIndex"], 0);
        assert!(value["idempotencyKey"].is_string());
    }

    #[tokio::test]
    async fn test_sent_with_message_id_and_key_header() {
        let (url, keys) = spawn_gateway(StatusCode::OK, json!({ "messageId": "m-1" })).await;
        let req = request();

        let outcome = gateway(url).send(&req).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Sent { message_id: Some(MessageId::new("m-1")) }
        );
        assert_eq!(keys.lock().unwrap().as_slice(), &[req.idempotency_key.to_string()]);
    }

    #[tokio::test]
    async fn test_scheduled_response() {
        let (url, _) = spawn_gateway(
            StatusCode::ACCEPTED,
            json!({ "scheduledAt": "2026-01-11T14:00:00Z" }),
        )
        .await;

        let outcome = gateway(url).send(&request()).await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Scheduled {
                scheduled_at: Utc.with_ymd_and_hms(2026, 1, 11, 14, 0, 0).unwrap()
            }
        );
    }

    #[tokio::test]
    async fn test_status_classification() {
        let (url, _) = spawn_gateway(StatusCode::SERVICE_UNAVAILABLE, json!({})).await;
        let err = gateway(url).send(&request()).await.unwrap_err();
        assert!(!err.is_permanent());

        let (url, _) = spawn_gateway(StatusCode::TOO_MANY_REQUESTS, json!({})).await;
        let err = gateway(url).send(&request()).await.unwrap_err();
        assert!(!err.is_permanent());

        let (url, _) = spawn_gateway(StatusCode::UNPROCESSABLE_ENTITY, json!({ "error": "invalid number" })).await;
        let err = gateway(url).send(&request()).await.unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("invalid number"));
    }
}
