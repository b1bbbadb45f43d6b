//! Intent model: one tab's in-flight click-to-download attempt.
//!
//! State machine:
//!
//! ```text
//! Pending -> Clicked -> Matched(id) -> Closed(id)
//!                   \-> Failed(reason)
//! Pending ----------/
//! ```
//!
//! `Matched`, `Closed` and `Failed` are terminal for matching purposes.
//! The only way out of `Failed` is an explicit retry back to `Pending`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use super::tab::{Actuation, Tab, TabId, TriggerStrategy};

/// Why an intent failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FailureReason {
    #[error("no download trigger found on page")]
    NoTriggerFound,
    #[error("page script failed: {0}")]
    ExecutionFailed(String),
    #[error("no matching download before the deadline")]
    Timeout,
    #[error("tab is already closed")]
    TabAlreadyClosed,
    #[error("retry limit exceeded")]
    RetryLimitExceeded,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTriggerFound => "no_trigger_found",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::Timeout => "timeout",
            Self::TabAlreadyClosed => "tab_already_closed",
            Self::RetryLimitExceeded => "retry_limit_exceeded",
        }
    }

    /// Whether an automatic retry round should pick this failure up.
    ///
    /// A page without a trigger will not grow one on a second attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed(_) | Self::Timeout)
    }
}

/// Which match rule bound a download to an intent, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ClickedUrl,
    Referrer,
    Filename,
    Singleton,
}

impl MatchTier {
    pub const ALL: [MatchTier; 4] = [
        MatchTier::ClickedUrl,
        MatchTier::Referrer,
        MatchTier::Filename,
        MatchTier::Singleton,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClickedUrl => "clicked_url",
            Self::Referrer => "referrer",
            Self::Filename => "filename",
            Self::Singleton => "singleton",
        }
    }
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum IntentState {
    Pending,
    Clicked,
    Matched(u64),
    Closed(u64),
    Failed(FailureReason),
}

impl IntentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Clicked => "clicked",
            Self::Matched(_) => "matched",
            Self::Closed(_) => "closed",
            Self::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Matched(_) | Self::Closed(_) | Self::Failed(_))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Matched(_) | Self::Closed(_))
    }

    pub fn download_id(&self) -> Option<u64> {
        match self {
            Self::Matched(id) | Self::Closed(id) => Some(*id),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Rejected state transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("intent {id}: cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: TabId,
    pub from: &'static str,
    pub to: &'static str,
}

#[derive(Debug, Clone)]
pub struct Intent {
    pub id: TabId,
    pub source_url: String,
    /// Final path segment of `source_url`, decoded, page extension stripped.
    pub expected_filename: Option<String>,
    pub clicked_url: Option<String>,
    pub strategy: Option<TriggerStrategy>,
    pub state: IntentState,
    pub submitted_at: Instant,
    pub retry_count: u32,
    pub tier: Option<MatchTier>,
}

impl Intent {
    pub fn new(tab: &Tab, page_extensions: &[String]) -> Self {
        Self {
            id: tab.id.clone(),
            source_url: tab.url.clone(),
            expected_filename: expected_filename(&tab.url, page_extensions),
            clicked_url: None,
            strategy: None,
            state: IntentState::Pending,
            submitted_at: Instant::now(),
            retry_count: 0,
            tier: None,
        }
    }

    /// Host of `source_url`, used by the referrer rule.
    pub fn source_host(&self) -> Option<String> {
        Url::parse(&self.source_url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, allowed: bool, to: IntentState) -> Result<(), InvalidTransition> {
        if !allowed {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: self.state.as_str(),
                to: to.as_str(),
            });
        }
        self.state = to;
        Ok(())
    }

    pub fn mark_clicked(&mut self, actuation: &Actuation) -> Result<(), InvalidTransition> {
        let allowed = self.state == IntentState::Pending;
        self.transition(allowed, IntentState::Clicked)?;
        self.strategy = Some(actuation.strategy);
        self.clicked_url = actuation.resolved_url.clone();
        Ok(())
    }

    pub fn mark_matched(&mut self, download_id: u64, tier: MatchTier) -> Result<(), InvalidTransition> {
        let allowed = self.state == IntentState::Clicked;
        self.transition(allowed, IntentState::Matched(download_id))?;
        self.tier = Some(tier);
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: FailureReason) -> Result<(), InvalidTransition> {
        let allowed = matches!(self.state, IntentState::Pending | IntentState::Clicked);
        self.transition(allowed, IntentState::Failed(reason))
    }

    pub fn mark_closed(&mut self) -> Result<(), InvalidTransition> {
        match self.state {
            IntentState::Matched(id) => self.transition(true, IntentState::Closed(id)),
            _ => self.transition(false, IntentState::Closed(0)),
        }
    }

    /// Move a failed intent back to `Pending` for another attempt.
    ///
    /// Clears everything learned from the previous actuation.
    pub fn reset_for_retry(&mut self) -> Result<(), InvalidTransition> {
        let allowed = matches!(self.state, IntentState::Failed(_));
        self.transition(allowed, IntentState::Pending)?;
        self.retry_count += 1;
        self.clicked_url = None;
        self.strategy = None;
        self.tier = None;
        self.submitted_at = Instant::now();
        Ok(())
    }
}

/// Derive the filename a download from `source_url` is expected to carry.
///
/// Takes the last non-empty path segment, percent-decodes it and strips one
/// trailing page extension (case-insensitive). Returns `None` when nothing
/// usable is left.
pub fn expected_filename(source_url: &str, page_extensions: &[String]) -> Option<String> {
    let url = Url::parse(source_url).ok()?;
    let segment = url
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()?
        .to_string();

    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);

    let lower = decoded.to_ascii_lowercase();
    let stripped = page_extensions
        .iter()
        .filter(|ext| !ext.is_empty())
        .find(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
        .map(|ext| &decoded[..decoded.len() - ext.len()])
        .unwrap_or(&decoded)
        .trim();

    if stripped.is_empty() {
        None
    } else {
        Some(stripped.to_string())
    }
}
