//! Ingestion forwarder: best-effort delivery of readings, one per request
//!
//! Each reading is an independent unit. A failed item is logged and
//! skipped; it is never retried within the same cycle.

use crate::error::ForwardingError;
use crate::reading::Reading;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Destination for a single reading.
#[async_trait]
pub trait ReadingSink: Send + Sync {
    async fn deliver(&self, reading: &Reading) -> Result<(), ForwardingError>;
}

#[async_trait]
impl<T: ReadingSink + ?Sized> ReadingSink for Arc<T> {
    async fn deliver(&self, reading: &Reading) -> Result<(), ForwardingError> {
        (**self).deliver(reading).await
    }
}

/// POSTs readings as JSON to the collection endpoint.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
}

impl HttpSink {
    /// `timeout` bounds every request on its own.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ForwardingError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl ReadingSink for HttpSink {
    async fn deliver(&self, reading: &Reading) -> Result<(), ForwardingError> {
        let response = self.client.post(&self.url).json(reading).send().await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ForwardingError::Status { status: status.as_u16(), body })
            }
        }
    }
}

/// A reading that could not be delivered.
#[derive(Debug)]
pub struct FailedDelivery {
    pub device_id: i64,
    pub parameter: String,
    pub error: ForwardingError,
}

/// Outcome of forwarding one batch.
#[derive(Debug, Default)]
pub struct ForwardReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failures: Vec<FailedDelivery>,
}

impl ForwardReport {
    /// True when something was delivered, or there was nothing to deliver.
    pub fn is_success(&self) -> bool {
        self.attempted == 0 || self.delivered > 0
    }

    pub fn failed(&self) -> usize {
        self.attempted - self.delivered
    }
}

impl fmt::Display for ForwardReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} delivered", self.delivered, self.attempted)
    }
}

/// Drives a sink over a batch of readings.
pub struct Forwarder<S> {
    sink: S,
}

impl<S: ReadingSink> Forwarder<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Attempts every reading, in order, regardless of earlier failures.
    pub async fn forward(&self, readings: &[Reading]) -> ForwardReport {
        let mut report = ForwardReport {
            attempted: readings.len(),
            ..ForwardReport::default()
        };

        for reading in readings {
            match self.sink.deliver(reading).await {
                Ok(()) => {
                    report.delivered += 1;
                    debug!("Sent reading: {} = {}", reading.parameter, reading.value);
                }
                Err(e) => {
                    error!("Failed to send {} from device {}: {}", reading.parameter, reading.device_id, e);
                    report.failures.push(FailedDelivery {
                        device_id: reading.device_id,
                        parameter: reading.parameter.clone(),
                        error: e,
                    });
                }
            }
        }

        if !readings.is_empty() {
            info!("Sent {} readings to API", report);
        }
        report
    }
}
