//! # InfluxDB HTTP Sink
//!
//! Delivers line-protocol batches to the InfluxDB v2 write API:
//!
//! ```text
//! POST {url}/api/v2/write?org={org}&bucket={bucket}&precision=ns
//! Authorization: Token {token}
//! Content-Type: text/plain; charset=utf-8
//! ```

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::de::Error as _;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DeliveryError, Sink};
use crate::config::SinkConfig;
use crate::error::{Result, SpoolerError};
use crate::telemetry::line_protocol::encode_batch;
use crate::telemetry::record::TelemetryRecord;

const CONTENT_TYPE_LINE_PROTOCOL: &str = "text/plain; charset=utf-8";

/// InfluxDB v2 sink
pub struct InfluxSink {
    write_url: Url,
    authorization: String,
    timeout: Duration,
    client: RwLock<reqwest::Client>,
}

impl std::fmt::Debug for InfluxSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the token
        f.debug_struct("InfluxSink")
            .field("write_url", &self.write_url.as_str())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl InfluxSink {
    /// Create a sink from the `[sink]` configuration section
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the URL cannot be parsed or the
    /// HTTP client cannot be built.
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let base = config.url.trim_end_matches('/');
        let write_url = Url::parse_with_params(
            &format!("{}/api/v2/write", base),
            &[
                ("org", config.org.as_str()),
                ("bucket", config.bucket.as_str()),
                ("precision", "ns"),
            ],
        )
        .map_err(|e| {
            SpoolerError::Config(toml::de::Error::custom(format!(
                "invalid sink url {}: {}",
                config.url, e
            )))
        })?;

        let timeout = config.timeout();
        let client = build_client(timeout)?;

        info!("InfluxDB sink: {}", write_url);

        Ok(Self {
            write_url,
            authorization: format!("{} {}", config.auth_scheme, config.token),
            timeout,
            client: RwLock::new(client),
        })
    }

    /// Full write endpoint including query parameters
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }

    fn current_client(&self) -> reqwest::Client {
        match self.client.read() {
            Ok(client) => client.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .map_err(|e| {
            SpoolerError::Config(toml::de::Error::custom(format!(
                "failed to build HTTP client: {}",
                e
            )))
        })
}

/// Map a transport error onto the delivery taxonomy
fn classify_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else if err.is_builder() {
        DeliveryError::Encode(err.to_string())
    } else if let Some(status) = err.status() {
        DeliveryError::from_status(status.as_u16())
    } else {
        DeliveryError::Connect(err.to_string())
    }
}

#[async_trait]
impl Sink for InfluxSink {
    async fn write(&self, records: &[TelemetryRecord]) -> std::result::Result<(), DeliveryError> {
        if records.is_empty() {
            return Ok(());
        }

        let body = encode_batch(records);
        let client = self.current_client();

        let response = client
            .post(self.write_url.clone())
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, CONTENT_TYPE_LINE_PROTOCOL)
            .body(body)
            .send()
            .await
            .map_err(|e| classify_error(&e))?;

        let status = response.status();
        if status.is_success() {
            debug!("Delivered {} records", records.len());
            return Ok(());
        }

        let error = DeliveryError::from_status(status.as_u16());
        let detail = response.text().await.unwrap_or_default();
        debug!("Sink rejected batch of {}: {} {}", records.len(), status, detail.trim());
        Err(error)
    }

    async fn reset(&self) {
        match build_client(self.timeout) {
            Ok(client) => {
                match self.client.write() {
                    Ok(mut guard) => *guard = client,
                    Err(poisoned) => *poisoned.into_inner() = client,
                }
                info!("Sink HTTP client rebuilt");
            }
            Err(e) => warn!("Failed to rebuild sink HTTP client: {}", e),
        }
    }
}
