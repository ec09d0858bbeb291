//! Client audio : soumission de tâche, polling unitaire et par lot.

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// État d'une tâche audio côté provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioTaskState {
    Running,
    Succeeded,
    Failed,
    NotFound,
}

/// Résultat d'un poll.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioPollResult {
    pub status: AudioTaskState,
    pub audio_path: Option<String>,
    pub error: Option<String>,
}

/// Réponse de soumission.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioSubmitResponse {
    pub task_id: String,
}

/// Capacité du provider audio (pipeline submit-then-poll).
#[async_trait]
pub trait AudioProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Soumet une génération audio ; retourne l'identifiant de tâche
    async fn submit(&self, payload: Value, token: CancellationToken)
        -> Result<AudioSubmitResponse>;

    /// Interroge l'état d'une tâche
    async fn poll(&self, task_id: &str) -> Result<AudioPollResult>;

    /// Interroge plusieurs tâches en un appel (réconciliation au démarrage)
    async fn batch_poll(&self, task_ids: &[String]) -> Result<HashMap<String, AudioPollResult>>;
}

/// Provider audio HTTP (API de type ACE : tasks + polling)
pub struct AceAudio {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl AceAudio {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        submit_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(submit_timeout).build()?;
        Ok(Self {
            name: name.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Construit le provider depuis la section `providers.audio` de la config
    #[cfg(feature = "itnconfig")]
    pub fn from_config() -> Result<Self> {
        let config = itnconfig::get_config();
        let name = config.get_string_or(&["providers", "audio", "name"], "ace");
        let base_url = config.get_string_or(
            &["providers", "audio", "endpoint"],
            "http://127.0.0.1:8001",
        );
        let api_key = match config.get_string_or(&["providers", "audio", "api_key"], "") {
            s if s.is_empty() => None,
            s => Some(s),
        };
        let submit_timeout = config.get_u64_or(&["generation", "audio_submit_timeout_secs"], 30);

        Self::new(name, base_url, api_key, Duration::from_secs(submit_timeout))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn parse_poll(value: &Value) -> AudioPollResult {
        let status = match value["status"].as_str().unwrap_or("") {
            "running" | "queued" | "processing" => AudioTaskState::Running,
            "succeeded" | "success" | "done" => AudioTaskState::Succeeded,
            "failed" | "error" => AudioTaskState::Failed,
            _ => AudioTaskState::NotFound,
        };
        AudioPollResult {
            status,
            audio_path: value["audio_path"]
                .as_str()
                .or_else(|| value["audio_url"].as_str())
                .map(String::from),
            error: value["error"].as_str().map(String::from),
        }
    }
}

#[async_trait]
impl AudioProvider for AceAudio {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        payload: Value,
        token: CancellationToken,
    ) -> Result<AudioSubmitResponse> {
        let url = format!("{}/tasks", self.base_url);
        debug!(provider = %self.name, "Audio submission");

        let response = tokio::select! {
            r = self.authed(self.client.post(&url).json(&payload)).send() => r?,
            _ = token.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let value: Value = response.json().await?;
        let task_id = value["task_id"]
            .as_str()
            .ok_or_else(|| ProviderError::UnexpectedResponse("missing task_id".into()))?
            .to_string();

        Ok(AudioSubmitResponse { task_id })
    }

    async fn poll(&self, task_id: &str) -> Result<AudioPollResult> {
        let url = format!("{}/tasks/{}", self.base_url, task_id);
        let response = self.authed(self.client.get(&url)).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(AudioPollResult {
                status: AudioTaskState::NotFound,
                audio_path: None,
                error: None,
            });
        }

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let value: Value = response.json().await?;
        Ok(Self::parse_poll(&value))
    }

    async fn batch_poll(&self, task_ids: &[String]) -> Result<HashMap<String, AudioPollResult>> {
        let url = format!("{}/tasks/batch_poll", self.base_url);
        let response = self
            .authed(self.client.post(&url).json(&json!({"task_ids": task_ids})))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let value: Value = response.json().await?;
        let map = value
            .as_object()
            .ok_or_else(|| ProviderError::UnexpectedResponse("batch_poll is not a map".into()))?;

        let mut results = HashMap::with_capacity(map.len());
        for (task_id, entry) in map {
            results.insert(task_id.clone(), Self::parse_poll(entry));
        }

        // Les tâches absentes de la réponse sont réputées perdues.
        for task_id in task_ids {
            results.entry(task_id.clone()).or_insert(AudioPollResult {
                status: AudioTaskState::NotFound,
                audio_path: None,
                error: None,
            });
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_parsing_maps_status_aliases() {
        let running = AceAudio::parse_poll(&json!({"status": "processing"}));
        assert_eq!(running.status, AudioTaskState::Running);

        let done = AceAudio::parse_poll(&json!({
            "status": "succeeded",
            "audio_path": "/out/song.mp3",
        }));
        assert_eq!(done.status, AudioTaskState::Succeeded);
        assert_eq!(done.audio_path.as_deref(), Some("/out/song.mp3"));

        let failed = AceAudio::parse_poll(&json!({"status": "failed", "error": "oom"}));
        assert_eq!(failed.status, AudioTaskState::Failed);
        assert_eq!(failed.error.as_deref(), Some("oom"));

        let unknown = AceAudio::parse_poll(&json!({"status": "???"}));
        assert_eq!(unknown.status, AudioTaskState::NotFound);
    }
}
