//! Contexte partagé du pipeline : store, providers, files, réglages.

use crate::settings::GenerationSettings;
use async_trait::async_trait;
use itnproviders::{AudioTaskState, ImageOutput, ProviderRegistry};
use itnqueue::{
    AudioPollStatus, AudioPoller, AudioQueue, ExecError, ExecutorResult, QueueSet, RequestQueue,
};
use itnstore::Store;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// État par playlist tenu par le superviseur.
pub struct PlaylistState {
    /// Sérialise les vérifications de buffer (aucune collision
    /// d'order_index sous création concurrente).
    pub buffer_lock: tokio::sync::Mutex<()>,
}

impl PlaylistState {
    pub fn new() -> Self {
        Self {
            buffer_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl Default for PlaylistState {
    fn default() -> Self {
        Self::new()
    }
}

/// Contexte partagé entre superviseur et workers.
pub struct PipelineCtx {
    pub store: Arc<Store>,
    pub registry: Arc<ProviderRegistry>,
    pub queues: QueueSet<Value, ImageOutput>,
    pub settings: GenerationSettings,
    pub http: reqwest::Client,
    /// Workers vivants, token d'annulation par morceau.
    pub workers: Mutex<HashMap<String, CancellationToken>>,
    /// États par playlist (buffer lock).
    pub playlists: Mutex<HashMap<String, Arc<PlaylistState>>>,
    pub shutdown: CancellationToken,
}

impl PipelineCtx {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<ProviderRegistry>,
        settings: GenerationSettings,
    ) -> Arc<Self> {
        let llm_concurrency = registry
            .default_llm()
            .map(|p| p.concurrency())
            .unwrap_or(1);
        let image_concurrency = registry
            .default_image()
            .map(|p| p.concurrency())
            .unwrap_or(1);

        let poller = Arc::new(RegistryPoller {
            registry: registry.clone(),
        });
        let queues = QueueSet::new(
            RequestQueue::new("llm", llm_concurrency),
            RequestQueue::new("image", image_concurrency),
            AudioQueue::new(poller, settings.audio_poll_interval, settings.not_found_grace),
        );

        Arc::new(Self {
            store,
            registry,
            queues,
            settings,
            http: reqwest::Client::new(),
            workers: Mutex::new(HashMap::new()),
            playlists: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// État (créé à la demande) d'une playlist
    pub fn playlist_state(&self, playlist_id: &str) -> Arc<PlaylistState> {
        let mut playlists = self.playlists.lock().unwrap();
        playlists
            .entry(playlist_id.to_string())
            .or_insert_with(|| Arc::new(PlaylistState::new()))
            .clone()
    }

    /// URL de lecture servie aux players pour un morceau
    pub fn audio_url(&self, song_id: &str) -> String {
        format!("{}/api/songs/{}/audio", self.settings.base_url, song_id)
    }

    /// URL de pochette servie aux players pour un morceau
    pub fn cover_url(&self, song_id: &str) -> String {
        format!("{}/api/songs/{}/cover", self.settings.base_url, song_id)
    }
}

/// Adaptateur : le poller de la file audio délègue au provider du registre.
struct RegistryPoller {
    registry: Arc<ProviderRegistry>,
}

#[async_trait]
impl AudioPoller for RegistryPoller {
    async fn poll(&self, task_id: &str) -> ExecutorResult<AudioPollStatus> {
        let provider = self
            .registry
            .default_audio()
            .map_err(|e| ExecError::fatal(e.to_string()))?;

        let result = provider.poll(task_id).await.map_err(provider_to_exec)?;
        Ok(match result.status {
            AudioTaskState::Running => AudioPollStatus::Running,
            AudioTaskState::Succeeded => AudioPollStatus::Succeeded {
                audio_path: result.audio_path.unwrap_or_default(),
            },
            AudioTaskState::Failed => AudioPollStatus::Failed {
                error: result.error.unwrap_or_else(|| "audio task failed".to_string()),
            },
            AudioTaskState::NotFound => AudioPollStatus::NotFound,
        })
    }
}

/// Projette une erreur provider dans le vocabulaire des files.
pub fn provider_to_exec(e: itnproviders::ProviderError) -> ExecError {
    match e {
        itnproviders::ProviderError::Cancelled => ExecError::Cancelled,
        e if e.is_transient() => ExecError::transient(e.to_string()),
        e => ExecError::fatal(e.to_string()),
    }
}
