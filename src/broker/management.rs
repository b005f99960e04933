//! RabbitMQ management HTTP API client.
//!
//! Only the queue endpoint is used: queue depth for the stats poll and queue
//! type for the startup check.

use super::traits::{QueueDepthSource, QueueInfo};
use crate::config::BrokerConfig;
use crate::error::{LoadGenError, Result};
use async_trait::async_trait;
use reqwest::{Client as HttpClient, ClientBuilder, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ManagementConfig {
    /// e.g. `http://rmq1:15672`
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub timeout: Duration,
}

impl ManagementConfig {
    /// `None` when no management URL is configured
    pub fn from_broker(broker: &BrokerConfig) -> Option<Self> {
        broker.management_url.as_ref().map(|base_url| Self {
            base_url: base_url.clone(),
            username: broker.username.clone(),
            password: broker.password.clone(),
            vhost: broker.vhost.clone(),
            timeout: broker.connect_timeout(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    name: String,
    #[serde(rename = "type", default)]
    queue_type: Option<String>,
    #[serde(default)]
    messages: Option<u64>,
    #[serde(default)]
    consumers: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ManagementClient {
    config: ManagementConfig,
    http_client: HttpClient,
    base_url: Url,
}

impl ManagementClient {
    pub fn new(config: ManagementConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            LoadGenError::InvalidConfig(format!("broker.management_url is invalid: {}", e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(LoadGenError::InvalidConfig(format!(
                "broker.management_url is not a base URL: {}",
                config.base_url
            )));
        }

        let http_client = ClientBuilder::new()
            .timeout(config.timeout)
            .build()
            .map_err(|e| {
                LoadGenError::ManagementApi(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            http_client,
            base_url,
        })
    }

    /// `/api/queues/{vhost}/{queue}` with both segments percent-encoded, so the
    /// default vhost `/` becomes `%2F`
    pub fn queue_url(&self, queue: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                LoadGenError::InvalidConfig("broker.management_url is not a base URL".to_string())
            })?
            .pop_if_empty()
            .extend(["api", "queues", self.config.vhost.as_str(), queue]);
        Ok(url)
    }
}

#[async_trait]
impl QueueDepthSource for ManagementClient {
    async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        let url = self.queue_url(queue)?;
        debug!("GET {}", url);

        let response = self
            .http_client
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LoadGenError::QueueNotFound(format!(
                "{} in vhost {}",
                queue, self.config.vhost
            )));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LoadGenError::ManagementApi(format!(
                "HTTP {}: {}",
                status, error_text
            )));
        }

        let body: QueueResponse = response.json().await?;
        Ok(body.into())
    }
}

impl From<QueueResponse> for QueueInfo {
    fn from(body: QueueResponse) -> Self {
        QueueInfo {
            name: body.name,
            queue_type: body.queue_type.unwrap_or_else(|| "classic".to_string()),
            messages: body.messages.unwrap_or(0),
            consumers: body.consumers.unwrap_or(0),
        }
    }
}
