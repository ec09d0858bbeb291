//! File audio : soumission puis polling, un seul slot actif système.
//!
//! Le slot a deux sous-états : *submitting* (un executor de soumission est
//! en vol et produit un task_id) et *polling* (l'item est représenté par
//! son task_id et avance au rythme d'un ticker global). La reprise
//! (`resume_poll`) insère un item priorité 0 qui saute la soumission.

use crate::error::{ExecError, ExecutorResult, QueueError};
use crate::request_queue::EnqueueResponse;
use crate::{Executor, QueueSnapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Résultat d'une soumission : l'identifiant de la tâche externe.
#[derive(Debug, Clone)]
pub struct AudioSubmission {
    pub task_id: String,
}

/// État d'une tâche audio externe vu par le poller.
#[derive(Debug, Clone)]
pub enum AudioPollStatus {
    Running,
    Succeeded { audio_path: String },
    Failed { error: String },
    NotFound,
}

/// Statut final résolu pour l'appelant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioTaskStatus {
    Succeeded,
    Failed,
    NotFound,
}

/// Résolution d'un item audio.
#[derive(Debug, Clone)]
pub struct AudioOutcome {
    pub task_id: String,
    pub audio_path: Option<String>,
    pub status: AudioTaskStatus,
    pub error: Option<String>,
}

/// Interface de polling du provider audio.
#[async_trait]
pub trait AudioPoller: Send + Sync {
    async fn poll(&self, task_id: &str) -> ExecutorResult<AudioPollStatus>;
}

enum ItemKind {
    /// Soumission complète : l'executor POSTe et retourne le task_id.
    Submit(Executor<AudioSubmission>),
    /// Reprise : le task_id est déjà connu, on saute la soumission.
    Resume {
        task_id: String,
        submitted_at: DateTime<Utc>,
    },
}

struct PendingItem {
    seq: u64,
    song_id: String,
    priority: i64,
    token: CancellationToken,
    kind: ItemKind,
    tx: oneshot::Sender<EnqueueResponse<AudioOutcome>>,
}

enum SlotPhase {
    Submitting,
    Polling {
        task_id: String,
        submitted_at: DateTime<Utc>,
    },
}

struct ActiveSlot {
    seq: u64,
    song_id: String,
    token: CancellationToken,
    phase: SlotPhase,
    started: Instant,
    tx: Option<oneshot::Sender<EnqueueResponse<AudioOutcome>>>,
}

struct State {
    pending: Vec<PendingItem>,
    active: Option<ActiveSlot>,
    poll_in_flight: bool,
    last_error: Option<String>,
}

struct Inner {
    state: Mutex<State>,
    poller: Arc<dyn AudioPoller>,
    not_found_grace: Duration,
    seq: AtomicU64,
    error_count: AtomicU64,
    stopped: AtomicBool,
}

/// File audio à slot unique
pub struct AudioQueue {
    inner: Arc<Inner>,
}

impl Clone for AudioQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl AudioQueue {
    /// Crée la file et démarre son ticker de polling
    pub fn new(
        poller: Arc<dyn AudioPoller>,
        poll_interval: Duration,
        not_found_grace: Duration,
    ) -> Self {
        let queue = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pending: Vec::new(),
                    active: None,
                    poll_in_flight: false,
                    last_error: None,
                }),
                poller,
                not_found_grace,
                seq: AtomicU64::new(1),
                error_count: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        };

        // Ticker global : un poll par intervalle tant que la file vit
        {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if queue.inner.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    queue.tick().await;
                }
            });
        }

        queue
    }

    /// Soumet un morceau au provider audio et attend la résolution finale
    /// (succeeded / failed / not_found après grâce).
    pub async fn enqueue(
        &self,
        song_id: impl Into<String>,
        priority: i64,
        executor: Executor<AudioSubmission>,
    ) -> Result<EnqueueResponse<AudioOutcome>, QueueError> {
        self.enqueue_kind(song_id.into(), priority, ItemKind::Submit(executor))
            .await
    }

    /// Ré-attache un morceau à son task_id connu, sans re-soumission.
    ///
    /// L'item est inséré à la priorité 0 ; l'invariant de slot unique est
    /// préservé.
    pub async fn resume_poll(
        &self,
        song_id: impl Into<String>,
        task_id: impl Into<String>,
        submitted_at: DateTime<Utc>,
    ) -> Result<EnqueueResponse<AudioOutcome>, QueueError> {
        self.enqueue_kind(
            song_id.into(),
            0,
            ItemKind::Resume {
                task_id: task_id.into(),
                submitted_at,
            },
        )
        .await
    }

    async fn enqueue_kind(
        &self,
        song_id: String,
        priority: i64,
        kind: ItemKind,
    ) -> Result<EnqueueResponse<AudioOutcome>, QueueError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let (tx, rx) = oneshot::channel();
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending.push(PendingItem {
                seq,
                song_id,
                priority,
                token: CancellationToken::new(),
                kind,
                tx,
            });
            state.pending.sort_by_key(|item| (item.priority, item.seq));
        }
        self.pump();

        rx.await.map_err(|_| QueueError::Stopped)
    }

    /// Annule tous les items d'un morceau.
    ///
    /// Un poll en cours côté provider continue d'exister : la tâche
    /// externe finira en not_found ou sera ignorée.
    pub fn cancel_song(&self, song_id: &str) {
        let (cancelled_pending, cancelled_active) = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;

            let mut removed = Vec::new();
            let mut kept = Vec::new();
            for item in state.pending.drain(..) {
                if item.song_id == song_id {
                    removed.push(item);
                } else {
                    kept.push(item);
                }
            }
            state.pending = kept;

            // En polling, aucun task n'attend le token : on résout ici.
            let take_polling = state.active.as_mut().is_some_and(|slot| {
                if slot.song_id == song_id {
                    slot.token.cancel();
                    matches!(slot.phase, SlotPhase::Polling { .. })
                } else {
                    false
                }
            });
            let active = if take_polling { state.active.take() } else { None };
            (removed, active)
        };

        for item in cancelled_pending {
            let _ = item.tx.send(EnqueueResponse {
                result: Err(ExecError::Cancelled),
                processing_ms: 0,
            });
        }
        if let Some(mut slot) = cancelled_active {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(EnqueueResponse {
                    result: Err(ExecError::Cancelled),
                    processing_ms: slot.started.elapsed().as_millis() as u64,
                });
            }
            self.pump();
        }
    }

    /// Change la priorité des items pending d'un morceau
    pub fn update_pending_priority(&self, song_id: &str, new_priority: i64) {
        let mut state = self.inner.state.lock().unwrap();
        for item in state.pending.iter_mut() {
            if item.song_id == song_id {
                item.priority = new_priority;
            }
        }
        state.pending.sort_by_key(|item| (item.priority, item.seq));
    }

    /// Retrie la liste pending
    pub fn resort_pending(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.pending.sort_by_key(|item| (item.priority, item.seq));
    }

    /// Arrête la file et son ticker
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);

        let (drained, active) = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            let take_polling = state.active.as_ref().is_some_and(|slot| {
                slot.token.cancel();
                matches!(slot.phase, SlotPhase::Polling { .. })
            });
            let active = if take_polling { state.active.take() } else { None };
            (state.pending.drain(..).collect::<Vec<_>>(), active)
        };

        for item in drained {
            let _ = item.tx.send(EnqueueResponse {
                result: Err(ExecError::Cancelled),
                processing_ms: 0,
            });
        }
        if let Some(mut slot) = active {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(EnqueueResponse {
                    result: Err(ExecError::Cancelled),
                    processing_ms: 0,
                });
            }
        }
    }

    /// Snapshot de diagnostic
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.state.lock().unwrap();
        QueueSnapshot {
            name: "audio".to_string(),
            pending: state.pending.len(),
            active: usize::from(state.active.is_some()),
            concurrency: 1,
            error_count: self.inner.error_count.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }

    /// Promeut le prochain item si le slot est libre
    fn pump(&self) {
        loop {
            enum Promoted {
                Cancelled(oneshot::Sender<EnqueueResponse<AudioOutcome>>),
                Resume,
                Submit {
                    seq: u64,
                    token: CancellationToken,
                    executor: Executor<AudioSubmission>,
                },
            }

            let promoted = {
                let mut state = self.inner.state.lock().unwrap();
                if state.active.is_some() || state.pending.is_empty() {
                    return;
                }
                let PendingItem {
                    seq,
                    song_id,
                    priority: _,
                    token,
                    kind,
                    tx,
                } = state.pending.remove(0);

                if token.is_cancelled() {
                    Promoted::Cancelled(tx)
                } else {
                    debug!(song_id = %song_id, "Audio slot occupied");
                    let (phase, action) = match kind {
                        ItemKind::Submit(executor) => (
                            SlotPhase::Submitting,
                            Promoted::Submit {
                                seq,
                                token: token.clone(),
                                executor,
                            },
                        ),
                        ItemKind::Resume {
                            task_id,
                            submitted_at,
                        } => (
                            SlotPhase::Polling {
                                task_id,
                                submitted_at,
                            },
                            Promoted::Resume,
                        ),
                    };
                    state.active = Some(ActiveSlot {
                        seq,
                        song_id,
                        token,
                        phase,
                        started: Instant::now(),
                        tx: Some(tx),
                    });
                    action
                }
            };

            match promoted {
                Promoted::Cancelled(tx) => {
                    let _ = tx.send(EnqueueResponse {
                        result: Err(ExecError::Cancelled),
                        processing_ms: 0,
                    });
                    continue;
                }
                Promoted::Resume => {
                    // Le ticker prend le relais dès le prochain tick.
                    return;
                }
                Promoted::Submit {
                    seq,
                    token,
                    executor,
                } => {
                    let queue = self.clone();
                    tokio::spawn(async move {
                        let fut = executor(token.clone());
                        let result = tokio::select! {
                            r = fut => r,
                            _ = token.cancelled() => Err(ExecError::Cancelled),
                        };

                        match result {
                            Ok(submission) => {
                                let mut state = queue.inner.state.lock().unwrap();
                                if let Some(slot) = &mut state.active {
                                    if slot.seq == seq {
                                        slot.phase = SlotPhase::Polling {
                                            task_id: submission.task_id,
                                            submitted_at: Utc::now(),
                                        };
                                    }
                                }
                            }
                            Err(err) => {
                                queue.record_error(&err);
                                queue.finish_active(seq, Err(err));
                            }
                        }
                    });
                    return;
                }
            }
        }
    }

    /// Un tick de polling : avance le slot s'il est en phase polling
    async fn tick(&self) {
        let (seq, task_id, submitted_at, token) = {
            let mut guard = self.inner.state.lock().unwrap();
            let state = &mut *guard;
            if state.poll_in_flight {
                return;
            }
            let Some(slot) = state.active.as_ref() else {
                return;
            };
            let SlotPhase::Polling {
                task_id,
                submitted_at,
            } = &slot.phase
            else {
                return;
            };
            state.poll_in_flight = true;
            (slot.seq, task_id.clone(), *submitted_at, slot.token.clone())
        };

        let poll_result = tokio::select! {
            r = self.inner.poller.poll(&task_id) => r,
            _ = token.cancelled() => Err(ExecError::Cancelled),
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            state.poll_in_flight = false;
        }

        match poll_result {
            Ok(AudioPollStatus::Running) => {}
            Ok(AudioPollStatus::Succeeded { audio_path }) => {
                self.finish_active(
                    seq,
                    Ok(AudioOutcome {
                        task_id,
                        audio_path: Some(audio_path),
                        status: AudioTaskStatus::Succeeded,
                        error: None,
                    }),
                );
            }
            Ok(AudioPollStatus::Failed { error }) => {
                self.finish_active(
                    seq,
                    Ok(AudioOutcome {
                        task_id,
                        audio_path: None,
                        status: AudioTaskStatus::Failed,
                        error: Some(error),
                    }),
                );
            }
            Ok(AudioPollStatus::NotFound) => {
                let age = Utc::now().signed_duration_since(submitted_at);
                if age.to_std().unwrap_or_default() >= self.inner.not_found_grace {
                    warn!(task_id = %task_id, "Audio task not found after grace period");
                    self.finish_active(
                        seq,
                        Ok(AudioOutcome {
                            task_id,
                            audio_path: None,
                            status: AudioTaskStatus::NotFound,
                            error: None,
                        }),
                    );
                }
                // Dans la période de grâce : on laisse le slot en place.
            }
            Err(ExecError::Cancelled) => {
                self.finish_active(seq, Err(ExecError::Cancelled));
            }
            Err(err @ ExecError::Transient { .. }) => {
                // Erreur de poll transitoire : on retentera au prochain tick.
                self.record_error(&err);
            }
            Err(err) => {
                self.record_error(&err);
                self.finish_active(seq, Err(err));
            }
        }
    }

    /// Libère le slot identifié par `seq` et résout son futur.
    ///
    /// Sans effet si le slot a déjà été libéré (cancel concurrent).
    fn finish_active(&self, seq: u64, result: ExecutorResult<AudioOutcome>) {
        let slot = {
            let mut state = self.inner.state.lock().unwrap();
            match &state.active {
                Some(slot) if slot.seq == seq => state.active.take(),
                _ => None,
            }
        };

        if let Some(mut slot) = slot {
            if let Some(tx) = slot.tx.take() {
                let _ = tx.send(EnqueueResponse {
                    result,
                    processing_ms: slot.started.elapsed().as_millis() as u64,
                });
            }
            self.pump();
        }
    }

    fn record_error(&self, err: &ExecError) {
        if matches!(err, ExecError::Cancelled) {
            return;
        }
        self.inner.error_count.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock().unwrap();
        state.last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    /// Poller de test : table task_id → séquence de statuts.
    struct ScriptedPoller {
        scripts: Mutex<HashMap<String, Vec<AudioPollStatus>>>,
        polls: AtomicUsize,
    }

    impl ScriptedPoller {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                polls: AtomicUsize::new(0),
            }
        }

        fn script(&self, task_id: &str, statuses: Vec<AudioPollStatus>) {
            self.scripts
                .lock()
                .unwrap()
                .insert(task_id.to_string(), statuses);
        }
    }

    #[async_trait]
    impl AudioPoller for ScriptedPoller {
        async fn poll(&self, task_id: &str) -> ExecutorResult<AudioPollStatus> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut scripts = self.scripts.lock().unwrap();
            let Some(entries) = scripts.get_mut(task_id) else {
                return Ok(AudioPollStatus::NotFound);
            };
            if entries.len() > 1 {
                Ok(entries.remove(0))
            } else {
                Ok(entries[0].clone())
            }
        }
    }

    fn submit_executor(task_id: &str) -> Executor<AudioSubmission> {
        let task_id = task_id.to_string();
        Box::new(move |_token| Box::pin(async move { Ok(AudioSubmission { task_id }) }))
    }

    #[tokio::test]
    async fn submit_then_poll_until_success() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script(
            "t1",
            vec![
                AudioPollStatus::Running,
                AudioPollStatus::Succeeded {
                    audio_path: "/audio/t1.mp3".to_string(),
                },
            ],
        );

        let queue = AudioQueue::new(
            poller,
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let response = queue.enqueue("song-1", 5, submit_executor("t1")).await.unwrap();
        let outcome = response.result.unwrap();
        assert_eq!(outcome.status, AudioTaskStatus::Succeeded);
        assert_eq!(outcome.audio_path.as_deref(), Some("/audio/t1.mp3"));
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn single_slot_is_exclusive() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script(
            "t1",
            vec![
                AudioPollStatus::Running,
                AudioPollStatus::Running,
                AudioPollStatus::Succeeded {
                    audio_path: "/audio/t1.mp3".to_string(),
                },
            ],
        );
        poller.script(
            "t2",
            vec![AudioPollStatus::Succeeded {
                audio_path: "/audio/t2.mp3".to_string(),
            }],
        );

        let queue = AudioQueue::new(
            poller,
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("song-1", 5, submit_executor("t1")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("song-2", 5, submit_executor("t2")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Pendant que song-1 occupe le slot, song-2 reste pending.
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.active, 1);
        assert_eq!(snapshot.pending, 1);

        assert!(first.await.unwrap().unwrap().result.is_ok());
        assert!(second.await.unwrap().unwrap().result.is_ok());
    }

    #[tokio::test]
    async fn not_found_waits_for_grace() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script("t1", vec![AudioPollStatus::NotFound]);

        let queue = AudioQueue::new(
            poller,
            Duration::from_millis(10),
            Duration::from_millis(80),
        );

        let started = Instant::now();
        let response = queue.enqueue("song-1", 5, submit_executor("t1")).await.unwrap();
        let outcome = response.result.unwrap();

        assert_eq!(outcome.status, AudioTaskStatus::NotFound);
        // Résolu seulement après la période de grâce.
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn resume_poll_skips_submission() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script(
            "t-known",
            vec![AudioPollStatus::Succeeded {
                audio_path: "/audio/known.mp3".to_string(),
            }],
        );

        let queue = AudioQueue::new(
            poller.clone(),
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let response = queue
            .resume_poll("song-1", "t-known", Utc::now())
            .await
            .unwrap();
        let outcome = response.result.unwrap();

        assert_eq!(outcome.status, AudioTaskStatus::Succeeded);
        assert_eq!(outcome.task_id, "t-known");
        assert!(poller.polls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn cancel_mid_poll_frees_slot() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script("t1", vec![AudioPollStatus::Running]);

        let queue = AudioQueue::new(
            poller,
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let handle = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue("song-1", 5, submit_executor("t1")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        queue.cancel_song("song-1");

        let response = handle.await.unwrap().unwrap();
        assert!(matches!(response.result, Err(ExecError::Cancelled)));
        assert_eq!(queue.snapshot().active, 0);
    }

    #[tokio::test]
    async fn failed_task_resolves_failed() {
        let poller = Arc::new(ScriptedPoller::new());
        poller.script(
            "t1",
            vec![AudioPollStatus::Failed {
                error: "generation blew up".to_string(),
            }],
        );

        let queue = AudioQueue::new(
            poller,
            Duration::from_millis(10),
            Duration::from_millis(500),
        );

        let response = queue.enqueue("song-1", 5, submit_executor("t1")).await.unwrap();
        let outcome = response.result.unwrap();
        assert_eq!(outcome.status, AudioTaskStatus::Failed);
        assert_eq!(outcome.error.as_deref(), Some("generation blew up"));
    }
}
