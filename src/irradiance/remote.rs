//! Unreal Engine Remote Control client
//!
//! The rendering host exposes scene object properties over
//! `PUT /remote/object/property`. The solar actor publishes its irradiance as a
//! numeric property which we read once per tick.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use super::{AdapterError, IrradianceSource};

const PROPERTY_ENDPOINT: &str = "/remote/object/property";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PropertyRequest<'a> {
    object_path: &'a str,
    access: &'static str,
    property_name: &'a str,
}

pub struct RemoteIrradianceSource {
    client: Client,
    base_url: String,
    object_path: String,
    property: String,
    timeout: Duration,
}

impl RemoteIrradianceSource {
    pub fn new(
        host: &str,
        port: u16,
        object_path: &str,
        property: &str,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        Self::with_base_url(format!("http://{}:{}", host, port), object_path, property, timeout)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        object_path: &str,
        property: &str,
        timeout: Duration,
    ) -> Result<Self, AdapterError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdapterError::Request(e.to_string()))?;

        if object_path.is_empty() {
            warn!("solar object path not defined in config, irradiance requests will fail");
        }

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            object_path: object_path.to_string(),
            property: property.to_string(),
            timeout,
        })
    }

    fn extract(&self, body: &Value) -> Result<f64, AdapterError> {
        let value = body
            .get(&self.property)
            .and_then(Value::as_f64)
            .ok_or_else(|| AdapterError::MissingProperty(self.property.clone()))?;

        if !value.is_finite() || value < 0.0 {
            return Err(AdapterError::InvalidValue(value));
        }
        Ok(value)
    }
}

#[async_trait]
impl IrradianceSource for RemoteIrradianceSource {
    async fn irradiance(&self) -> Result<f64, AdapterError> {
        if self.object_path.is_empty() {
            return Err(AdapterError::NotConfigured("empty object path".to_string()));
        }

        let url = format!("{}{}", self.base_url, PROPERTY_ENDPOINT);
        let payload = PropertyRequest {
            object_path: &self.object_path,
            access: "READ_ACCESS",
            property_name: &self.property,
        };

        debug!(%url, object = %self.object_path, "requesting irradiance");

        let response = self
            .client
            .put(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    AdapterError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(AdapterError::Status(response.status().as_u16()));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Request(e.to_string()))?;

        self.extract(&body)
    }

    fn describe(&self) -> String {
        format!("remote {} ({})", self.base_url, self.object_path)
    }
}
