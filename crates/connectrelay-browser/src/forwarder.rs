//! CRM API forwarder — authenticated POSTs of connection records.
//!
//! A record counts as saved when the API answers 2xx with a JSON body.
//! Anything else (non-2xx, non-JSON body, transport failure) is an error for
//! that record. Batches send every record concurrently and never stop early.

use std::time::Duration;

use futures::future::join_all;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RelaySettings;
use crate::envelope::ResponseEnvelope;
use crate::types::{BatchSummary, ConnectionRecord};
use connectrelay_core::{Error, Result};

/// Where and as whom to send.
#[derive(Debug, Clone)]
pub struct ApiTarget {
    pub url: String,
    pub token: String,
}

#[derive(Clone)]
pub struct ApiForwarder {
    client: Client,
    single_timeout: Duration,
    batch_timeout: Duration,
}

impl ApiForwarder {
    pub fn new(single_timeout: Duration, batch_timeout: Duration) -> Self {
        // Requests orphaned by a fired guard still get cut off eventually.
        let client = Client::builder()
            .timeout(batch_timeout.checked_mul(2).unwrap_or(batch_timeout))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });
        Self {
            client,
            single_timeout,
            batch_timeout,
        }
    }

    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self::new(settings.single_timeout(), settings.batch_timeout())
    }

    pub fn single_timeout(&self) -> Duration {
        self.single_timeout
    }

    pub fn batch_timeout(&self) -> Duration {
        self.batch_timeout
    }

    /// POST one record. Returns the parsed response body.
    pub async fn send_one(&self, target: &ApiTarget, record: &ConnectionRecord) -> Result<Value> {
        post_record(&self.client, target, record).await
    }

    /// POST every record concurrently and wait for all of them to settle.
    pub async fn send_batch(&self, target: &ApiTarget, records: Vec<ConnectionRecord>) -> BatchSummary {
        let total = records.len();
        let sends = records.into_iter().enumerate().map(|(index, record)| {
            let client = self.client.clone();
            let target = target.clone();
            tokio::spawn(async move {
                let result = post_record(&client, &target, &record).await;
                (index, result)
            })
        });

        let mut successful = 0;
        for joined in join_all(sends).await {
            match joined {
                Ok((_, Ok(_))) => successful += 1,
                Ok((index, Err(e))) => warn!("Connection {} failed to save: {}", index, e),
                Err(e) => warn!("Connection send task failed: {}", e),
            }
        }

        BatchSummary {
            total,
            successful,
            failed: total - successful,
        }
    }
}

async fn post_record(client: &Client, target: &ApiTarget, record: &ConnectionRecord) -> Result<Value> {
    debug!("POST {}", target.url);
    let response = client
        .post(&target.url)
        .bearer_auth(&target.token)
        .json(record)
        .send()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Http {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        });
    }

    let body = response
        .text()
        .await
        .map_err(|e| Error::Network(e.to_string()))?;
    serde_json::from_str(&body).map_err(|e| Error::InvalidResponse(e.to_string()))
}

impl BatchSummary {
    /// Partial failure still reports `success: true`; callers inspect
    /// `data.failed`, and `warning` is present iff anything failed.
    pub fn into_envelope(self) -> ResponseEnvelope {
        let data = serde_json::to_value(self).unwrap_or_default();
        let envelope = ResponseEnvelope::with_data(data);
        if self.failed > 0 {
            envelope.warning(format!("{} connections failed to save", self.failed))
        } else {
            envelope
        }
    }
}
