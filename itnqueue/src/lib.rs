//! # itnqueue - Files d'endpoints d'inférence
//!
//! Trois files de priorité (`llm`, `image`, `audio`) gouvernent le
//! fan-out vers les services d'inférence externes :
//!
//! - [`RequestQueue`] : requête-réponse à concurrence bornée par
//!   provider (LLM, image)
//! - [`AudioQueue`] : soumission puis polling, un seul slot actif
//!   système, grâce not_found et reprise par task_id
//! - [`QueueSet`] : façade combinant les trois files (cancellation d'un
//!   morceau, repriorisation, limites de concurrence en ligne)
//!
//! La priorité numérique est croissante : plus petite = plus urgente ;
//! à priorité égale, l'ordre d'arrivée départage.

mod audio_queue;
mod error;
mod request_queue;

pub use audio_queue::{
    AudioOutcome, AudioPollStatus, AudioPoller, AudioQueue, AudioSubmission, AudioTaskStatus,
};
pub use error::{ExecError, ExecutorResult, QueueError};
pub use request_queue::{EnqueueResponse, RequestQueue};

use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Futur boxé retourné par un executor.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Un executor : exactement un appel par item, annulable par token.
pub type Executor<T> = Box<dyn FnOnce(CancellationToken) -> BoxFuture<ExecutorResult<T>> + Send>;

/// Snapshot de diagnostic d'une file.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub pending: usize,
    pub active: usize,
    pub concurrency: usize,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// Limites de concurrence par provider.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimits {
    pub llm: usize,
    pub image: usize,
}

/// Façade combinant les trois files d'endpoints.
///
/// `L` et `I` sont les types de sortie des executors LLM et image.
pub struct QueueSet<L: Send + 'static, I: Send + 'static> {
    pub llm: RequestQueue<L>,
    pub image: RequestQueue<I>,
    pub audio: AudioQueue,
}

impl<L: Send + 'static, I: Send + 'static> QueueSet<L, I> {
    pub fn new(llm: RequestQueue<L>, image: RequestQueue<I>, audio: AudioQueue) -> Self {
        Self { llm, image, audio }
    }

    /// Annule tous les items d'un morceau sur les trois files.
    ///
    /// Idempotent.
    pub fn cancel_song(&self, song_id: &str) {
        self.llm.cancel_song(song_id);
        self.image.cancel_song(song_id);
        self.audio.cancel_song(song_id);
    }

    /// Repriorise les items pending d'un morceau sur les trois files
    pub fn update_pending_priority(&self, song_id: &str, new_priority: i64) {
        self.llm.update_pending_priority(song_id, new_priority);
        self.image.update_pending_priority(song_id, new_priority);
        self.audio.update_pending_priority(song_id, new_priority);
    }

    /// Retrie les listes pending des trois files
    pub fn resort_pending(&self) {
        self.llm.resort_pending();
        self.image.resort_pending();
        self.audio.resort_pending();
    }

    /// Applique de nouvelles limites de concurrence sans perdre de travail
    pub fn refresh_concurrency(&self, limits: ConcurrencyLimits) {
        self.llm.refresh_concurrency(limits.llm);
        self.image.refresh_concurrency(limits.image);
    }

    /// Arrête les trois files
    pub fn stop(&self) {
        self.llm.stop();
        self.image.stop();
        self.audio.stop();
    }

    /// Snapshots de diagnostic des trois files
    pub fn snapshots(&self) -> Vec<QueueSnapshot> {
        vec![
            self.llm.snapshot(),
            self.image.snapshot(),
            self.audio.snapshot(),
        ]
    }
}
