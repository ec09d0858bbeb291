//! Client LLM : prompt système + utilisateur, schéma JSON optionnel.

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Requête LLM.
#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub system: String,
    pub user: String,
    /// Schéma JSON attendu ; si présent, la réponse est parsée et doit
    /// être un objet JSON.
    pub schema: Option<Value>,
}

/// Réponse LLM : texte brut, et objet validé si un schéma était fourni.
#[derive(Debug, Clone, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub json: Option<Value>,
}

/// Capacité LLM, indépendante du provider concret.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Nom du provider (clé de registre)
    fn name(&self) -> &str;

    /// Limite de concurrence recommandée (1 = endpoint local single-flight)
    fn concurrency(&self) -> usize;

    /// Exécute une complétion, annulable par token
    async fn complete(&self, request: LlmRequest, token: CancellationToken)
        -> Result<LlmResponse>;
}

/// Provider LLM HTTP (API style chat-completions)
pub struct HttpLlm {
    name: String,
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    concurrency: usize,
    timeout: Duration,
}

impl HttpLlm {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            client,
            endpoint: endpoint.into(),
            api_key,
            model: model.into(),
            concurrency: concurrency.max(1),
            timeout,
        })
    }

    /// Construit le provider depuis la section `providers.llm` de la config
    #[cfg(feature = "itnconfig")]
    pub fn from_config() -> Result<Self> {
        let config = itnconfig::get_config();
        let name = config.get_string_or(&["providers", "llm", "name"], "default-llm");
        let endpoint = config.get_string_or(
            &["providers", "llm", "endpoint"],
            "http://127.0.0.1:11434/v1/chat/completions",
        );
        let api_key = match config.get_string_or(&["providers", "llm", "api_key"], "") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let model = config.get_string_or(&["providers", "llm", "model"], "default");
        let concurrency = config.get_u64_or(&["providers", "llm", "concurrency"], 1) as usize;
        let timeout = config.get_u64_or(&["generation", "llm_timeout_secs"], 360);

        Self::new(
            name,
            endpoint,
            api_key,
            model,
            concurrency,
            Duration::from_secs(timeout),
        )
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    fn name(&self) -> &str {
        &self.name
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn complete(
        &self,
        request: LlmRequest,
        token: CancellationToken,
    ) -> Result<LlmResponse> {
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });
        if request.schema.is_some() {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(provider = %self.name, model = %self.model, "LLM call");

        let response = tokio::select! {
            r = builder.send() => r.map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout.as_secs())
                } else {
                    ProviderError::Http(e)
                }
            })?,
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let payload: Value = tokio::select! {
            r = response.json() => r.map_err(ProviderError::Http)?,
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
        };

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::UnexpectedResponse("missing choices[0].message.content".into())
            })?
            .to_string();

        let json_value = if request.schema.is_some() {
            let parsed: Value = serde_json::from_str(text.trim()).map_err(|e| {
                ProviderError::UnexpectedResponse(format!("response is not valid JSON: {}", e))
            })?;
            if !parsed.is_object() {
                return Err(ProviderError::UnexpectedResponse(
                    "response JSON is not an object".into(),
                ));
            }
            Some(parsed)
        } else {
            None
        };

        Ok(LlmResponse {
            text,
            json: json_value,
        })
    }
}
