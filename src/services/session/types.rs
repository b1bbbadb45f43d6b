//! Session events and reports.

use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::models::{FailureReason, Intent, IntentState, MatchTier, Tab, TabId, TriggerStrategy};

/// Progress events emitted during a batch.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Batch accepted; downloads with id <= `epoch` are ignored.
    BatchStarted { total: usize, epoch: u64 },
    TabStarted {
        tab: TabId,
        url: String,
        attempt: u32,
    },
    TabClicked {
        tab: TabId,
        strategy: TriggerStrategy,
        resolved_url: Option<String>,
    },
    TabMatched {
        tab: TabId,
        download_id: u64,
        tier: MatchTier,
    },
    TabFailed { tab: TabId, reason: FailureReason },
    /// Tab closed after its download was confirmed.
    TabClosed { tab: TabId },
    BatchFinished { succeeded: usize, failed: usize },
}

/// Final (or current) view of one tab's attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TabOutcome {
    pub tab: TabId,
    pub url: String,
    pub state: IntentState,
    pub strategy: Option<TriggerStrategy>,
    pub download_id: Option<u64>,
    pub tier: Option<MatchTier>,
    pub retry_count: u32,
}

impl TabOutcome {
    pub fn from_intent(intent: &Intent) -> Self {
        Self {
            tab: intent.id.clone(),
            url: intent.source_url.clone(),
            state: intent.state.clone(),
            strategy: intent.strategy,
            download_id: intent.state.download_id(),
            tier: intent.tier,
            retry_count: intent.retry_count,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state.is_success()
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        self.state.failure()
    }
}

/// Aggregate result of a batch (or retry round).
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub epoch: u64,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<TabOutcome>,
}

impl BatchReport {
    pub fn new(epoch: u64, outcomes: Vec<TabOutcome>) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let failed = outcomes.iter().filter(|o| o.failure().is_some()).count();
        Self {
            epoch,
            succeeded,
            failed,
            outcomes,
        }
    }

    pub fn total(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &TabOutcome> {
        self.outcomes.iter().filter(|o| o.failure().is_some())
    }
}

/// Knobs for a session, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_concurrency: usize,
    pub admission_delay: Duration,
    pub max_retries: u32,
    pub page_extensions: Vec<String>,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrency: config.max_concurrency,
            admission_delay: config.admission_delay(),
            max_retries: config.max_retries,
            page_extensions: config.page_extensions.clone(),
        }
    }
}

/// Per-tab bookkeeping kept for reporting and retry.
#[derive(Debug, Clone)]
pub(super) struct TabRecord {
    pub tab: Tab,
    pub intent: Intent,
    pub order: usize,
}
