//! Clients for the two wide-area collaborators: the push dispatcher and
//! the reply store.
//!
//! Both are thin HTTP functions behind one base URL:
//!
//! | Endpoint      | Body                                   | Response                  |
//! |---------------|----------------------------------------|---------------------------|
//! | `request`     | `{"devices": [t], "device": t, "content": b64}` | 2xx on accepted push |
//! | `poll-reply`  | `{"id": tag}`                          | empty (not yet) or sealed reply |
//! | `reply`       | `{"id": tag, "content": b64}`          | 2xx once stored           |
//!
//! `content` fields carry bytes as base64, so the sealed (already base64)
//! text is encoded once more on the wire. Neither function ever sees a
//! request id or plaintext.

// Rust guideline compliant 2026-02

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::crypto::CorrelationTag;

/// Errors talking to the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Connection, timeout, or body read failure.
    #[error("relay request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The relay answered with a non-success status.
    #[error("relay returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// Serde adapter for byte fields encoded as standard base64.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Body of a push dispatch.
///
/// `device` is the older single-token form; both are sent so either
/// function version accepts the push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Target device tokens.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    /// Single target device token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Sealed request text.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

impl PushRequest {
    /// Push to one device, filling both the list and the single-token field.
    pub fn for_device(token: &str, sealed: &str) -> Self {
        Self {
            devices: vec![token.to_string()],
            device: Some(token.to_string()),
            content: sealed.as_bytes().to_vec(),
        }
    }
}

/// Body of a reply poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    /// Correlation tag.
    pub id: String,
}

/// Body of a reply write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRequest {
    /// Correlation tag.
    pub id: String,
    /// Sealed reply text.
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Per-token outcome of a push dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tokens the push service accepted.
    pub delivered: Vec<String>,
    /// Tokens that failed, with the reason.
    pub failed: Vec<(String, String)>,
}

impl DispatchReport {
    /// True when no token was accepted (including when there were none).
    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty()
    }
}

/// Sends sealed requests to the approving devices.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Push `sealed` to every token, best effort. Never fails as a whole;
    /// inspect the report.
    async fn send(&self, devices: &[String], sealed: &str) -> DispatchReport;
}

/// Untrusted key-value store holding sealed replies under correlation tags.
#[async_trait]
pub trait ReplyStore: Send + Sync {
    /// `Ok(None)` means no reply yet, not an error.
    async fn fetch(&self, tag: &CorrelationTag) -> Result<Option<String>, RelayError>;

    /// Store a sealed reply under `tag`.
    async fn store(&self, tag: &CorrelationTag, sealed: &str) -> Result<(), RelayError>;
}

/// Shorten a device token for logs.
fn short_token(token: &str) -> String {
    token.chars().take(8).collect()
}

/// HTTP client for the relay functions.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    /// Creates a client for the functions under `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: &str) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Creates a client with a pre-configured HTTP client.
    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Returns the base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint)
    }

    async fn post<T: Serialize + Sync>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<String, RelayError> {
        let response = self.client.post(self.url(endpoint)).json(body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(RelayError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }

    /// Push `sealed` to a single device.
    pub async fn push(&self, token: &str, sealed: &str) -> Result<(), RelayError> {
        self.post(constants::PUSH_ENDPOINT, &PushRequest::for_device(token, sealed))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for RelayClient {
    async fn send(&self, devices: &[String], sealed: &str) -> DispatchReport {
        let mut report = DispatchReport::default();
        for token in devices {
            match self.push(token, sealed).await {
                Ok(()) => {
                    log::info!("[Relay] Push accepted for device {}…", short_token(token));
                    report.delivered.push(token.clone());
                }
                Err(e) => {
                    log::warn!("[Relay] Push failed for device {}…: {e}", short_token(token));
                    report.failed.push((token.clone(), e.to_string()));
                }
            }
        }
        report
    }
}

#[async_trait]
impl ReplyStore for RelayClient {
    async fn fetch(&self, tag: &CorrelationTag) -> Result<Option<String>, RelayError> {
        let body = self
            .post(
                constants::POLL_ENDPOINT,
                &PollRequest {
                    id: tag.to_string(),
                },
            )
            .await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(body))
    }

    async fn store(&self, tag: &CorrelationTag, sealed: &str) -> Result<(), RelayError> {
        let request = ReplyRequest {
            id: tag.to_string(),
            content: sealed.as_bytes().to_vec(),
        };
        self.post(constants::REPLY_ENDPOINT, &request).await?;
        log::info!("[Relay] Stored reply under tag {tag}");
        Ok(())
    }
}
