//! Providers factices pour les tests (aucun réseau).

use crate::audio::{AudioPollResult, AudioProvider, AudioSubmitResponse, AudioTaskState};
use crate::error::{ProviderError, Result};
use crate::image::{ImageOutput, ImageProvider};
use crate::llm::{LlmProvider, LlmRequest, LlmResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// LLM factice : rejoue une séquence de réponses, puis répète la dernière.
pub struct FakeLlm {
    responses: Mutex<Vec<LlmResponse>>,
    pub calls: AtomicUsize,
}

impl FakeLlm {
    pub fn returning_text(text: &str) -> Self {
        Self {
            responses: Mutex::new(vec![LlmResponse {
                text: text.to_string(),
                json: None,
            }]),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn returning_json(values: Vec<Value>) -> Self {
        Self {
            responses: Mutex::new(
                values
                    .into_iter()
                    .map(|v| LlmResponse {
                        text: v.to_string(),
                        json: Some(v),
                    })
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl LlmProvider for FakeLlm {
    fn name(&self) -> &str {
        "fake-llm"
    }

    fn concurrency(&self) -> usize {
        1
    }

    async fn complete(
        &self,
        _request: LlmRequest,
        token: CancellationToken,
    ) -> Result<LlmResponse> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(ProviderError::UnexpectedResponse("no scripted response".into()));
        }
        if responses.len() > 1 {
            Ok(responses.remove(0))
        } else {
            Ok(responses[0].clone())
        }
    }
}

/// Provider image factice : 1x1 PNG.
pub struct FakeImage {
    pub calls: AtomicUsize,
    pub fail: bool,
}

impl FakeImage {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail: true,
        }
    }
}

impl Default for FakeImage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageProvider for FakeImage {
    fn name(&self) -> &str {
        "fake-image"
    }

    fn concurrency(&self) -> usize {
        1
    }

    async fn generate(&self, _prompt: &str, token: CancellationToken) -> Result<ImageOutput> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::from_status(500, "fake image failure"));
        }
        Ok(ImageOutput {
            bytes: vec![0x89, 0x50, 0x4E, 0x47],
            format: "png".to_string(),
        })
    }
}

/// Provider audio factice : table task_id → séquence d'états.
pub struct FakeAudio {
    scripts: Mutex<HashMap<String, Vec<AudioPollResult>>>,
    next_task: Mutex<Vec<String>>,
    pub submissions: AtomicUsize,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            next_task: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
        }
    }

    /// Programme la prochaine soumission pour retourner `task_id`
    pub fn queue_task(&self, task_id: &str) {
        self.next_task.lock().unwrap().push(task_id.to_string());
    }

    /// Programme la séquence de polls d'une tâche
    pub fn script(&self, task_id: &str, results: Vec<AudioPollResult>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(task_id.to_string(), results);
    }

    /// Raccourci : la tâche réussit immédiatement avec ce chemin audio
    pub fn succeed_immediately(&self, task_id: &str, audio_path: &str) {
        self.queue_task(task_id);
        self.script(
            task_id,
            vec![AudioPollResult {
                status: AudioTaskState::Succeeded,
                audio_path: Some(audio_path.to_string()),
                error: None,
            }],
        );
    }
}

impl Default for FakeAudio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioProvider for FakeAudio {
    fn name(&self) -> &str {
        "fake-audio"
    }

    async fn submit(
        &self,
        _payload: Value,
        token: CancellationToken,
    ) -> Result<AudioSubmitResponse> {
        if token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let index = self.submissions.fetch_add(1, Ordering::SeqCst);
        let task_id = {
            let queued = self.next_task.lock().unwrap();
            queued
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("fake-task-{}", index))
        };
        Ok(AudioSubmitResponse { task_id })
    }

    async fn poll(&self, task_id: &str) -> Result<AudioPollResult> {
        let mut scripts = self.scripts.lock().unwrap();
        let Some(entries) = scripts.get_mut(task_id) else {
            return Ok(AudioPollResult {
                status: AudioTaskState::NotFound,
                audio_path: None,
                error: None,
            });
        };
        if entries.len() > 1 {
            Ok(entries.remove(0))
        } else {
            Ok(entries[0].clone())
        }
    }

    async fn batch_poll(&self, task_ids: &[String]) -> Result<HashMap<String, AudioPollResult>> {
        let mut results = HashMap::new();
        for task_id in task_ids {
            results.insert(task_id.clone(), self.poll(task_id).await?);
        }
        Ok(results)
    }
}
