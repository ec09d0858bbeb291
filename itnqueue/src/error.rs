//! Types d'erreurs pour itnqueue

use std::time::Duration;

/// Erreurs du dispatcher de files
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is stopped")]
    Stopped,

    #[error("Item was cancelled")]
    Cancelled,
}

/// Résultat d'un executor : la cancellation et les erreurs transitoires
/// sont des valeurs de première classe, pas des exceptions.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("cancelled")]
    Cancelled,

    #[error("transient error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl ExecError {
    pub fn transient(message: impl Into<String>) -> Self {
        ExecError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        ExecError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transient { .. })
    }
}

/// Résultat retourné par les executors
pub type ExecutorResult<T> = std::result::Result<T, ExecError>;
