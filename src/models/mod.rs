//! Data models for tabsweep.

mod download;
mod intent;
mod tab;

pub use download::{DownloadDelta, DownloadEvent, DownloadQuery, DownloadState, DownloadUpdate};
pub use intent::{expected_filename, FailureReason, Intent, IntentState, InvalidTransition, MatchTier};
pub use tab::{Actuation, Tab, TabFilter, TabId, TriggerStrategy};
