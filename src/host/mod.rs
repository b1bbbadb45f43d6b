//! Host environment collaborators.
//!
//! The browser owns the tabs and the download manager; tabsweep only talks
//! to it through these traits. The Chromium implementation lives behind the
//! `browser` feature; tests use in-memory fakes.

#[cfg(feature = "browser")]
mod chromium;
mod polling;

#[cfg(feature = "browser")]
pub use chromium::ChromiumHost;
pub use polling::poll_downloads;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::models::{DownloadEvent, DownloadQuery, DownloadUpdate, Tab, TabFilter, TabId};

#[derive(Debug, Error)]
pub enum HostError {
    #[error("tab not found: {0}")]
    TabNotFound(TabId),
    #[error("script execution failed: {0}")]
    ScriptExecution(String),
    #[error("host connection error: {0}")]
    Connection(String),
    #[error("not supported by this host: {0}")]
    Unsupported(&'static str),
}

/// Tab query, page-script execution and tab closing.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// List open tabs that match `filter`.
    async fn list_tabs(&self, filter: &TabFilter) -> Result<Vec<Tab>, HostError>;

    /// Look up a single tab. `Ok(None)` means it no longer exists.
    async fn get_tab(&self, id: &TabId) -> Result<Option<Tab>, HostError>;

    /// Evaluate a script expression in the tab's page and return its JSON value.
    async fn execute_on_tab(
        &self,
        id: &TabId,
        script: &str,
    ) -> Result<serde_json::Value, HostError>;

    async fn close_tab(&self, id: &TabId) -> Result<(), HostError>;
}

/// The host's download manager.
#[async_trait]
pub trait DownloadHost: Send + Sync {
    /// Snapshot of downloads the host currently knows about.
    async fn search_downloads(
        &self,
        query: &DownloadQuery,
    ) -> Result<Vec<DownloadEvent>, HostError>;

    /// Push subscription to download lifecycle updates.
    ///
    /// Hosts without push events return `HostError::Unsupported`; callers
    /// then fall back to [`poll_downloads`].
    async fn subscribe(&self) -> Result<BoxStream<'static, DownloadUpdate>, HostError> {
        Err(HostError::Unsupported("download subscriptions"))
    }
}
