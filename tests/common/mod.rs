//! In-memory browser fake shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use tabsweep::host::{DownloadHost, HostError, TabHost};
use tabsweep::models::{
    DownloadDelta, DownloadEvent, DownloadQuery, DownloadState, DownloadUpdate, Tab, TabFilter,
    TabId,
};
use tabsweep::services::{DownloadEventBus, SessionController, SessionEvent};
use tabsweep::Config;

/// What a click on a page makes the browser download.
#[derive(Debug, Clone)]
pub struct FakeDownload {
    pub url: String,
    pub referrer: Option<String>,
    /// Filled in by a delta after creation, like a real download manager.
    pub filename: Option<String>,
    pub delay: Duration,
}

impl FakeDownload {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            referrer: None,
            filename: None,
            delay: Duration::from_millis(20),
        }
    }

    pub fn referrer(mut self, referrer: &str) -> Self {
        self.referrer = Some(referrer.to_string());
        self
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct FakePage {
    tab: Tab,
    html: String,
    download: Option<FakeDownload>,
}

#[derive(Default)]
struct FakeState {
    pages: Vec<FakePage>,
    next_download_id: u64,
    downloads: HashMap<u64, DownloadEvent>,
    clicks: HashMap<TabId, usize>,
    closed: Vec<TabId>,
    refuse_close: HashSet<TabId>,
}

pub struct FakeBrowser {
    state: Mutex<FakeState>,
    updates: mpsc::UnboundedSender<DownloadUpdate>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<DownloadUpdate>>>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        let (updates, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            updates,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    /// Downloads that finished before the batch started.
    pub fn seed_downloads(&self, count: u64) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.next_download_id += 1;
            let id = state.next_download_id;
            let event = DownloadEvent::new(id, format!("https://old.example/{}", id))
                .with_state(DownloadState::Complete);
            state.downloads.insert(id, event);
        }
    }

    pub fn add_tab(&self, id: &str, url: &str, html: &str, download: Option<FakeDownload>) -> Tab {
        let tab = Tab::new(id, url);
        self.state.lock().unwrap().pages.push(FakePage {
            tab: tab.clone(),
            html: html.to_string(),
            download,
        });
        tab
    }

    pub fn set_download(&self, id: &str, download: Option<FakeDownload>) {
        let mut state = self.state.lock().unwrap();
        if let Some(page) = state.pages.iter_mut().find(|p| p.tab.id.as_str() == id) {
            page.download = download;
        }
    }

    /// Deliver an arbitrary update, as if the download manager sent it.
    pub fn push(&self, update: DownloadUpdate) {
        let _ = self.updates.send(update);
    }

    /// The user closes a tab behind our back.
    pub fn close_externally(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .pages
            .retain(|p| p.tab.id.as_str() != id);
    }

    pub fn refuse_close(&self, id: &str) {
        self.state.lock().unwrap().refuse_close.insert(TabId::from(id));
    }

    pub fn clicks(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .clicks
            .get(&TabId::from(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn closed(&self) -> Vec<TabId> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn tabs(&self) -> Vec<Tab> {
        self.state
            .lock()
            .unwrap()
            .pages
            .iter()
            .map(|p| p.tab.clone())
            .collect()
    }

    fn click(&self, id: &TabId) {
        let mut state = self.state.lock().unwrap();
        *state.clicks.entry(id.clone()).or_default() += 1;

        let Some(download) = state
            .pages
            .iter()
            .find(|p| &p.tab.id == id)
            .and_then(|p| p.download.clone())
        else {
            return;
        };

        state.next_download_id += 1;
        let download_id = state.next_download_id;
        let mut event = DownloadEvent::new(download_id, download.url.clone());
        event.referrer = download.referrer.clone();
        state.downloads.insert(download_id, event.clone());

        let tx = self.updates.clone();
        tokio::spawn(async move {
            tokio::time::sleep(download.delay).await;
            let _ = tx.send(DownloadUpdate::Created(event));

            if let Some(filename) = download.filename {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let mut delta = DownloadDelta::new(download_id);
                delta.filename = Some(filename);
                let _ = tx.send(DownloadUpdate::Changed(delta));
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
            let mut done = DownloadDelta::new(download_id);
            done.state = Some(DownloadState::Complete);
            let _ = tx.send(DownloadUpdate::Changed(done));
        });
    }
}

#[async_trait]
impl TabHost for FakeBrowser {
    async fn list_tabs(&self, filter: &TabFilter) -> Result<Vec<Tab>, HostError> {
        Ok(self.tabs().into_iter().filter(|t| filter.matches(t)).collect())
    }

    async fn get_tab(&self, id: &TabId) -> Result<Option<Tab>, HostError> {
        Ok(self.tabs().into_iter().find(|t| &t.id == id))
    }

    async fn execute_on_tab(&self, id: &TabId, script: &str) -> Result<Value, HostError> {
        let html = {
            let state = self.state.lock().unwrap();
            state
                .pages
                .iter()
                .find(|p| &p.tab.id == id)
                .map(|p| p.html.clone())
                .ok_or_else(|| HostError::TabNotFound(id.clone()))?
        };

        if script.contains("outerHTML") {
            return Ok(Value::String(html));
        }
        if script.contains(".click()") {
            self.click(id);
            return Ok(Value::Bool(true));
        }
        Err(HostError::ScriptExecution(format!("unexpected script: {}", script)))
    }

    async fn close_tab(&self, id: &TabId) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_close.contains(id) {
            return Err(HostError::Connection("tab is pinned".to_string()));
        }
        let before = state.pages.len();
        state.pages.retain(|p| &p.tab.id != id);
        if state.pages.len() == before {
            return Err(HostError::TabNotFound(id.clone()));
        }
        state.closed.push(id.clone());
        Ok(())
    }
}

#[async_trait]
impl DownloadHost for FakeBrowser {
    async fn search_downloads(&self, query: &DownloadQuery) -> Result<Vec<DownloadEvent>, HostError> {
        let state = self.state.lock().unwrap();
        let mut downloads: Vec<DownloadEvent> = state
            .downloads
            .values()
            .filter(|d| query.state.map_or(true, |s| d.state == s))
            .cloned()
            .collect();
        downloads.sort_by_key(|d| d.id);
        Ok(downloads)
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, DownloadUpdate>, HostError> {
        let receiver = self
            .receiver
            .lock()
            .unwrap()
            .take()
            .ok_or(HostError::Unsupported("second subscription"))?;
        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|update| (update, rx))
        })
        .boxed())
    }
}

pub fn test_config() -> Config {
    Config {
        admission_delay_ms: 10,
        ..Config::default()
    }
}

/// Attach a bus to the fake and build a session that reports into a channel.
pub async fn session(
    config: &Config,
    browser: &Arc<FakeBrowser>,
) -> (SessionController, mpsc::Receiver<SessionEvent>) {
    let bus = DownloadEventBus::new(config.event_bus_capacity);
    bus.attach(browser.clone(), config.poll_interval())
        .await
        .expect("attach bus");
    let (tx, rx) = mpsc::channel(1024);
    let session = SessionController::new(config, browser.clone(), browser.clone(), bus)
        .expect("valid config")
        .with_events(tx);
    (session, rx)
}

pub fn drain(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Page whose only trigger is a labelled button (no URL to match on).
pub const BUTTON_PAGE: &str = r#"<html><body><button class="btn">Download</button></body></html>"#;

pub const EMPTY_PAGE: &str = r#"<html><body><p>File not available</p></body></html>"#;

pub fn direct_link_page(href: &str) -> String {
    format!(
        r#"<html><body><a href="/about">About</a><a href="{}">Get file</a></body></html>"#,
        href
    )
}
