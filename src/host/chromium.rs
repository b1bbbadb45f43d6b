//! Chromium host over the DevTools protocol.
//!
//! Connects to an already-running Chrome/Chromium (started with
//! `--remote-debugging-port`), treats its pages as tabs and turns the
//! browser-level download events into `DownloadUpdate`s.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::browser::{
    DownloadProgressState, EventDownloadProgress, EventDownloadWillBegin,
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::{Browser, Page};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{DownloadHost, HostError, TabHost};
use crate::config::BrowserSettings;
use crate::models::{
    DownloadDelta, DownloadEvent, DownloadQuery, DownloadState, DownloadUpdate, Tab, TabFilter,
    TabId,
};

/// Download bookkeeping shared between the event mappers and `search_downloads`.
///
/// CDP identifies downloads by GUID; the matcher needs monotonically
/// increasing numeric ids, so they are assigned here in arrival order.
#[derive(Default)]
struct DownloadLedger {
    next_id: u64,
    ids: HashMap<String, u64>,
    snapshots: HashMap<u64, DownloadEvent>,
    /// Page URL per target id, refreshed on every tab listing.
    page_urls: HashMap<String, String>,
}

impl DownloadLedger {
    fn begin(&mut self, event: &EventDownloadWillBegin) -> DownloadUpdate {
        self.next_id += 1;
        let id = self.next_id;
        self.ids.insert(event.guid.clone(), id);

        let referrer = self.page_urls.get(event.frame_id.inner()).cloned();
        let download = DownloadEvent {
            id,
            url: event.url.clone(),
            final_url: None,
            referrer,
            filename: event.suggested_filename.clone(),
            state: DownloadState::InProgress,
        };
        self.snapshots.insert(id, download.clone());
        DownloadUpdate::Created(download)
    }

    fn progress(&mut self, event: &EventDownloadProgress) -> Option<DownloadUpdate> {
        let id = *self.ids.get(&event.guid)?;
        let state = match event.state {
            DownloadProgressState::InProgress => DownloadState::InProgress,
            DownloadProgressState::Completed => DownloadState::Complete,
            DownloadProgressState::Canceled => DownloadState::Interrupted,
        };

        let snapshot = self.snapshots.get_mut(&id)?;
        if snapshot.state == state {
            return None;
        }
        snapshot.state = state;

        let mut delta = DownloadDelta::new(id);
        delta.state = Some(state);
        Some(DownloadUpdate::Changed(delta))
    }
}

/// Tab and download host backed by a remote Chromium instance.
pub struct ChromiumHost {
    browser: Arc<Mutex<Browser>>,
    ledger: Arc<StdMutex<DownloadLedger>>,
    settings: BrowserSettings,
}

impl ChromiumHost {
    /// Connect to the browser at `settings.remote_url`.
    pub async fn connect(settings: &BrowserSettings) -> Result<Self, HostError> {
        let url = settings.remote_url.as_str();
        info!(
            "Connecting to remote browser at {} (timeout: {}s)",
            url, settings.request_timeout_secs
        );

        // Resolve the WebSocket URL from the /json/version endpoint
        let http_url = url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let resp: serde_json::Value = reqwest::Client::new()
            .get(&version_url)
            .send()
            .await
            .map_err(|e| HostError::Connection(format!("Failed to reach browser: {}", e)))?
            .json()
            .await
            .map_err(|e| {
                HostError::Connection(format!("Failed to parse browser version info: {}", e))
            })?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HostError::Connection("No webSocketDebuggerUrl in response".into()))?;

        debug!("Connecting to WebSocket: {}", ws_url);

        let handler_config = chromiumoxide::handler::HandlerConfig {
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            ..Default::default()
        };

        let (mut browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
            .await
            .map_err(|e| HostError::Connection(format!("Failed to connect: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        // Attach to tabs that were open before we connected
        browser
            .fetch_targets()
            .await
            .map_err(|e| HostError::Connection(format!("Failed to fetch targets: {}", e)))?;

        Ok(Self {
            browser: Arc::new(Mutex::new(browser)),
            ledger: Arc::new(StdMutex::new(DownloadLedger::default())),
            settings: settings.clone(),
        })
    }

    async fn pages(&self) -> Result<Vec<Page>, HostError> {
        let browser = self.browser.lock().await;
        browser
            .pages()
            .await
            .map_err(|e| HostError::Connection(e.to_string()))
    }

    async fn find_page(&self, id: &TabId) -> Result<Option<Page>, HostError> {
        Ok(self
            .pages()
            .await?
            .into_iter()
            .find(|p| p.target_id().inner() == id.as_str()))
    }

    async fn describe(page: &Page) -> Option<Tab> {
        let url = page.url().await.ok().flatten()?;
        let title = page.get_title().await.ok().flatten();
        Some(Tab {
            id: TabId::new(page.target_id().inner().clone()),
            url,
            title,
        })
    }
}

#[async_trait]
impl TabHost for ChromiumHost {
    async fn list_tabs(&self, filter: &TabFilter) -> Result<Vec<Tab>, HostError> {
        let mut tabs = Vec::new();
        for page in self.pages().await? {
            if let Some(tab) = Self::describe(&page).await {
                tabs.push(tab);
            }
        }

        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.page_urls = tabs
                .iter()
                .map(|t| (t.id.0.clone(), t.url.clone()))
                .collect();
        }

        tabs.retain(|t| filter.matches(t));
        debug!("{} tabs match filter", tabs.len());
        Ok(tabs)
    }

    async fn get_tab(&self, id: &TabId) -> Result<Option<Tab>, HostError> {
        match self.find_page(id).await? {
            Some(page) => Ok(Self::describe(&page).await),
            None => Ok(None),
        }
    }

    async fn execute_on_tab(
        &self,
        id: &TabId,
        script: &str,
    ) -> Result<serde_json::Value, HostError> {
        let page = self
            .find_page(id)
            .await?
            .ok_or_else(|| HostError::TabNotFound(id.clone()))?;

        let result = page
            .evaluate(script.to_string())
            .await
            .map_err(|e| HostError::ScriptExecution(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn close_tab(&self, id: &TabId) -> Result<(), HostError> {
        let page = self
            .find_page(id)
            .await?
            .ok_or_else(|| HostError::TabNotFound(id.clone()))?;
        page.close()
            .await
            .map_err(|e| HostError::Connection(e.to_string()))
    }
}

#[async_trait]
impl DownloadHost for ChromiumHost {
    async fn search_downloads(
        &self,
        query: &DownloadQuery,
    ) -> Result<Vec<DownloadEvent>, HostError> {
        let ledger = self
            .ledger
            .lock()
            .map_err(|_| HostError::Connection("download ledger poisoned".into()))?;

        let mut downloads: Vec<DownloadEvent> = ledger
            .snapshots
            .values()
            .filter(|d| query.state.map_or(true, |s| d.state == s))
            .cloned()
            .collect();
        downloads.sort_by_key(|d| d.id);
        if let Some(limit) = query.limit {
            let skip = downloads.len().saturating_sub(limit);
            downloads.drain(..skip);
        }
        Ok(downloads)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DownloadUpdate>, HostError> {
        let browser = self.browser.lock().await;

        let mut behavior = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Default)
            .events_enabled(true);
        if let Some(ref dir) = self.settings.download_dir {
            behavior = behavior
                .behavior(SetDownloadBehaviorBehavior::Allow)
                .download_path(dir.display().to_string());
        }
        let behavior = behavior.build().map_err(HostError::Connection)?;
        browser
            .execute(behavior)
            .await
            .map_err(|e| HostError::Connection(format!("Failed to enable download events: {}", e)))?;

        let began = browser
            .event_listener::<EventDownloadWillBegin>()
            .await
            .map_err(|e| HostError::Connection(e.to_string()))?;
        let progressed = browser
            .event_listener::<EventDownloadProgress>()
            .await
            .map_err(|e| HostError::Connection(e.to_string()))?;

        let begin_ledger = self.ledger.clone();
        let began = began.filter_map(move |event| {
            let update = match begin_ledger.lock() {
                Ok(mut ledger) => Some(ledger.begin(&event)),
                Err(_) => {
                    warn!("Download ledger poisoned; dropping downloadWillBegin");
                    None
                }
            };
            async move { update }
        });

        let progress_ledger = self.ledger.clone();
        let progressed = progressed.filter_map(move |event| {
            let update = progress_ledger
                .lock()
                .ok()
                .and_then(|mut ledger| ledger.progress(&event));
            async move { update }
        });

        info!("Subscribed to browser download events");
        Ok(stream::select(began, progressed).boxed())
    }
}
