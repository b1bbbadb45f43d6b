//! Host download lifecycle models.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a host download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    InProgress,
    Complete,
    Interrupted,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Interrupted => "interrupted",
        }
    }

    /// Whether a download in this state counts as evidence that a click worked.
    pub fn is_qualifying(&self) -> bool {
        matches!(self, Self::InProgress | Self::Complete)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Interrupted)
    }
}

/// Full snapshot of a host download, as re-emitted by the event bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadEvent {
    /// Host-assigned identifier; monotonically increasing.
    pub id: u64,
    pub url: String,
    /// URL after redirects, when the host knows it.
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub referrer: Option<String>,
    /// Target filename; empty until the host has decided on one.
    #[serde(default)]
    pub filename: String,
    pub state: DownloadState,
}

impl DownloadEvent {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            final_url: None,
            referrer: None,
            filename: String::new(),
            state: DownloadState::InProgress,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_final_url(mut self, final_url: impl Into<String>) -> Self {
        self.final_url = Some(final_url.into());
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_state(mut self, state: DownloadState) -> Self {
        self.state = state;
        self
    }

    /// Merge a delta into this snapshot. Absent fields are left untouched.
    pub fn apply(&mut self, delta: &DownloadDelta) {
        if let Some(ref url) = delta.url {
            self.url = url.clone();
        }
        if let Some(ref final_url) = delta.final_url {
            self.final_url = Some(final_url.clone());
        }
        if let Some(ref filename) = delta.filename {
            self.filename = filename.clone();
        }
        if let Some(state) = delta.state {
            self.state = state;
        }
    }
}

/// Partial change to a known download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDelta {
    pub id: u64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub final_url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub state: Option<DownloadState>,
}

impl DownloadDelta {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Raw update delivered by a host subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadUpdate {
    Created(DownloadEvent),
    Changed(DownloadDelta),
}

impl DownloadUpdate {
    pub fn id(&self) -> u64 {
        match self {
            Self::Created(event) => event.id,
            Self::Changed(delta) => delta.id,
        }
    }
}

/// Query for `DownloadHost::search_downloads`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadQuery {
    pub state: Option<DownloadState>,
    pub limit: Option<usize>,
}
