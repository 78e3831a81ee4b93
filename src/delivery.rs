use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use crate::config::DeliveryConfig;
use crate::error::DeliveryError;
use crate::logging::redact_url;
use crate::record::Record;

/// Something that can deliver a record and confirm it
#[async_trait]
pub trait Deliver: Send + Sync {
    /// Returns the endpoint's response body once the record is confirmed delivered
    async fn deliver(&self, record: &Record) -> Result<String, DeliveryError>;
}

/// POSTs records as JSON to the configured webhook
///
/// The shared secret is attached as a query parameter, not a header.
#[derive(Clone)]
pub struct DeliveryClient {
    client: Client,
    endpoint: String,
    auth_param: String,
    auth_key: String,
}

impl DeliveryClient {
    pub fn new(config: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(DeliveryError::from)?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &DeliveryConfig) -> Self {
        Self {
            client,
            endpoint: config.webhook_url.clone(),
            auth_param: config.auth_param.clone(),
            auth_key: config.auth_key.clone(),
        }
    }

    /// Endpoint with the auth parameter masked, for logs
    pub fn display_endpoint(&self) -> String {
        redact_url(&self.endpoint, &self.auth_param)
    }
}

#[async_trait]
impl Deliver for DeliveryClient {
    async fn deliver(&self, record: &Record) -> Result<String, DeliveryError> {
        let body = serde_json::to_vec(record)?;

        let response = self
            .client
            .post(&self.endpoint)
            .query(&[(self.auth_param.as_str(), self.auth_key.as_str())])
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        // Read the body either way, it is the only diagnostic the endpoint gives
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(e) => format!("<unreadable body: {}>", e.without_url()),
        };

        if !status.is_success() {
            tracing::warn!(
                endpoint = %self.display_endpoint(),
                status = status.as_u16(),
                body = %text,
                datetime = %record.datetime,
                "Endpoint rejected record"
            );
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body: text,
            });
        }

        tracing::debug!(
            endpoint = %self.display_endpoint(),
            status = status.as_u16(),
            body = %text,
            datetime = %record.datetime,
            "Record delivered"
        );
        Ok(text)
    }
}
