//! Client image : prompt → octets + format.

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Image générée.
#[derive(Debug, Clone)]
pub struct ImageOutput {
    pub bytes: Vec<u8>,
    /// Format déclaré (ex: "png", "webp").
    pub format: String,
}

/// Capacité de génération d'image.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn concurrency(&self) -> usize;

    /// Génère une image depuis un prompt, annulable par token
    async fn generate(&self, prompt: &str, token: CancellationToken) -> Result<ImageOutput>;
}

/// Provider image HTTP.
///
/// Deux formes de réponse sont acceptées : un corps binaire typé
/// `image/*`, ou un JSON `{image: <base64>, format: <str>}`.
pub struct HttpImage {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    concurrency: usize,
}

impl HttpImage {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            client,
            endpoint: endpoint.into(),
            api_key,
            concurrency: concurrency.max(1),
        })
    }

    /// Construit le provider depuis la section `providers.image` de la config
    #[cfg(feature = "itnconfig")]
    pub fn from_config() -> Result<Self> {
        let config = itnconfig::get_config();
        let name = config.get_string_or(&["providers", "image", "name"], "default-image");
        let endpoint = config.get_string_or(
            &["providers", "image", "endpoint"],
            "http://127.0.0.1:7860/generate",
        );
        let api_key = match config.get_string_or(&["providers", "image", "api_key"], "") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let concurrency = config.get_u64_or(&["providers", "image", "concurrency"], 1) as usize;

        Self::new(name, endpoint, api_key, concurrency, Duration::from_secs(120))
    }
}

#[async_trait]
impl ImageProvider for HttpImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn generate(&self, prompt: &str, token: CancellationToken) -> Result<ImageOutput> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .json(&json!({"prompt": prompt}));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(provider = %self.name, "Image call");

        let response = tokio::select! {
            r = builder.send() => r?,
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("image/") {
            let format = content_type
                .strip_prefix("image/")
                .unwrap_or("png")
                .to_string();
            let bytes = tokio::select! {
                r = response.bytes() => r?,
                _ = token.cancelled() => return Err(ProviderError::Cancelled),
            };
            return Ok(ImageOutput {
                bytes: bytes.to_vec(),
                format,
            });
        }

        let payload: Value = tokio::select! {
            r = response.json() => r?,
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
        };

        let encoded = payload["image"].as_str().ok_or_else(|| {
            ProviderError::UnexpectedResponse("missing 'image' field in response".into())
        })?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| ProviderError::UnexpectedResponse(format!("invalid base64: {}", e)))?;
        let format = payload["format"].as_str().unwrap_or("png").to_string();

        Ok(ImageOutput { bytes, format })
    }
}
