//! Session error types.

use thiserror::Error;

use crate::host::HostError;
use crate::models::TabId;
use crate::services::matching::EngineError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("match dispatcher has shut down")]
    DispatcherClosed,

    #[error("host error: {0}")]
    Host(#[from] HostError),

    #[error("a batch is already running")]
    BatchInProgress,

    #[error("match engine rejected the request: {0}")]
    Engine(EngineError),
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::DispatcherClosed => SessionError::DispatcherClosed,
            other => SessionError::Engine(other),
        }
    }
}

/// Why a retry request was refused.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("no intent recorded for tab {0}")]
    UnknownIntent(TabId),

    #[error("tab {id} is {state}, only failed intents can be retried")]
    NotFailed { id: TabId, state: &'static str },

    #[error("tab {id} already retried {max} times")]
    RetryLimitExceeded { id: TabId, max: u32 },

    #[error("tab {0} is already closed")]
    TabAlreadyClosed(TabId),

    #[error(transparent)]
    Session(#[from] SessionError),
}
