//! Client for the consultation backend: signaling grants and end-of-call
//! notification.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid backend url: {0}")]
    InvalidUrl(String),
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("backend answered {status} for {path}")]
    Status { status: u16, path: String },
}

/// Relay authorization issued for one consultation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingGrant {
    pub token: String,
    #[serde(alias = "relay_url")]
    pub relay_url: String,
}

#[async_trait]
pub trait ConsultationBackend: Send + Sync {
    async fn signaling_token(&self, consultation_id: &str) -> Result<SignalingGrant, BackendError>;
    async fn end_consultation(&self, consultation_id: &str) -> Result<(), BackendError>;
}

pub struct HttpConsultationBackend {
    client: Client,
    base_url: Url,
    bearer: Option<String>,
}

impl HttpConsultationBackend {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let base = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            format!("http://{base_url}")
        };
        let base_url =
            Url::parse(&base).map_err(|err| BackendError::InvalidUrl(format!("{base}: {err}")))?;
        // Short timeouts: a slow backend must not hold up call teardown.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base_url,
            bearer: None,
        })
    }

    pub fn with_bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    fn endpoint(&self, action: &str, consultation_id: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["consultation", action, consultation_id]);
        Ok(url)
    }

    async fn post(&self, url: Url) -> Result<reqwest::Response, BackendError> {
        let path = url.path().to_string();
        let mut request = self.client.post(url);
        if let Some(bearer) = &self.bearer {
            request = request.bearer_auth(bearer);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(BackendError::Status {
                status: response.status().as_u16(),
                path,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl ConsultationBackend for HttpConsultationBackend {
    async fn signaling_token(&self, consultation_id: &str) -> Result<SignalingGrant, BackendError> {
        let url = self.endpoint("signaling-token", consultation_id)?;
        let grant = self.post(url).await?.json::<SignalingGrant>().await?;
        tracing::debug!(
            target: "fieldcall::backend",
            consultation_id,
            relay = %grant.relay_url,
            "signaling grant issued"
        );
        Ok(grant)
    }

    async fn end_consultation(&self, consultation_id: &str) -> Result<(), BackendError> {
        let url = self.endpoint("end", consultation_id)?;
        self.post(url).await?;
        tracing::debug!(target: "fieldcall::backend", consultation_id, "consultation end recorded");
        Ok(())
    }
}
