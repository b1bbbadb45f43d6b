//! Batch session orchestration.
//!
//! A [`SessionController`] owns one batch at a time: it captures the epoch,
//! feeds tabs through the [`ConcurrencyScheduler`], actuates each tab,
//! waits for the match dispatcher to resolve it and closes the tab once its
//! download is confirmed. Failures are data, never errors: every tab ends in
//! a terminal [`IntentState`] in the report.

mod error;
mod types;

pub use error::{RetryError, SessionError};
pub use types::{BatchReport, SessionEvent, SessionSettings, TabOutcome};

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError};
use crate::host::{DownloadHost, HostError, TabHost};
use crate::models::{DownloadQuery, FailureReason, Intent, IntentState, Tab, TabId};
use crate::services::actuator::{TabActuator, TriggerPatterns};
use crate::services::bus::DownloadEventBus;
use crate::services::matching::{MatchDispatcher, MatchHandle, MatchPolicy};
use crate::services::scheduler::ConcurrencyScheduler;
use types::TabRecord;

/// Clears the running flag when a batch or retry round ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SessionController {
    tabs: Arc<dyn TabHost>,
    downloads: Arc<dyn DownloadHost>,
    bus: DownloadEventBus,
    actuator: TabActuator,
    matcher: MatchHandle,
    scheduler: ConcurrencyScheduler,
    settings: SessionSettings,
    events: Option<mpsc::Sender<SessionEvent>>,
    records: Mutex<HashMap<TabId, TabRecord>>,
    running: AtomicBool,
    epoch: AtomicU64,
}

impl SessionController {
    /// Build a controller and spawn its match dispatcher.
    ///
    /// The bus should already be attached to `downloads` (see
    /// [`DownloadEventBus::attach`]); the controller only subscribes to it.
    pub fn new(
        config: &Config,
        tabs: Arc<dyn TabHost>,
        downloads: Arc<dyn DownloadHost>,
        bus: DownloadEventBus,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let settings = SessionSettings::from_config(config);
        let scheduler =
            ConcurrencyScheduler::new(settings.max_concurrency, settings.admission_delay)?;
        let actuator = TabActuator::new(tabs.clone(), TriggerPatterns::from_config(config)?);
        let (matcher, _task) =
            MatchDispatcher::spawn(MatchPolicy::from_config(config), bus.subscribe());

        Ok(Self {
            tabs,
            downloads,
            bus,
            actuator,
            matcher,
            scheduler,
            settings,
            events: None,
            records: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        })
    }

    /// Send progress events to `tx`.
    pub fn with_events(mut self, tx: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Run one batch over `tabs`, replacing any previous session state.
    ///
    /// Duplicate tab ids are processed once.
    pub async fn run_batch(&self, tabs: Vec<Tab>) -> Result<BatchReport, SessionError> {
        let _guard = self.begin()?;
        self.reset().await?;
        let epoch = self.capture_epoch().await?;

        let mut seen = HashSet::new();
        let work: Vec<(Tab, Intent)> = tabs
            .into_iter()
            .filter(|t| seen.insert(t.id.clone()))
            .map(|tab| {
                let intent = Intent::new(&tab, &self.settings.page_extensions);
                (tab, intent)
            })
            .collect();

        {
            let mut records = self.records();
            for (order, (tab, intent)) in work.iter().enumerate() {
                records.insert(
                    tab.id.clone(),
                    TabRecord {
                        tab: tab.clone(),
                        intent: intent.clone(),
                        order,
                    },
                );
            }
        }

        info!(
            "Starting batch of {} tabs (concurrency {}, epoch {})",
            work.len(),
            self.scheduler.limit(),
            epoch
        );
        self.emit(SessionEvent::BatchStarted {
            total: work.len(),
            epoch,
        })
        .await;

        let report = BatchReport::new(epoch, self.schedule(work).await);
        self.finish(&report).await;
        Ok(report)
    }

    /// Retry one failed tab.
    ///
    /// Allowed only from a failed state, below the retry limit, and while
    /// the tab is still open. The tab's original source URL is kept.
    pub async fn retry(&self, id: &TabId) -> Result<TabOutcome, RetryError> {
        let _guard = self.begin()?;
        let work = self.prepare_retry(id).await?;
        self.raise_epoch().await?;

        self.schedule(vec![work])
            .await
            .pop()
            .ok_or_else(|| RetryError::UnknownIntent(id.clone()))
    }

    /// Retry every failure whose reason is retryable and whose tab is below
    /// the retry limit, as one scheduled round.
    pub async fn retry_failed(&self) -> Result<BatchReport, SessionError> {
        let _guard = self.begin()?;

        let candidates: Vec<TabId> = {
            let records = self.records();
            let mut eligible: Vec<&TabRecord> = records
                .values()
                .filter(|r| {
                    r.intent.state.failure().is_some_and(|f| f.is_retryable())
                        && r.intent.retry_count < self.settings.max_retries
                })
                .collect();
            eligible.sort_by_key(|r| r.order);
            eligible.into_iter().map(|r| r.tab.id.clone()).collect()
        };

        let mut work = Vec::with_capacity(candidates.len());
        for id in candidates {
            match self.prepare_retry(&id).await {
                Ok(item) => work.push(item),
                Err(e) => debug!("Not retrying {}: {}", id, e),
            }
        }

        let epoch = self.raise_epoch().await?;
        if work.is_empty() {
            return Ok(BatchReport::new(epoch, Vec::new()));
        }

        info!("Retrying {} failed tabs", work.len());
        self.emit(SessionEvent::BatchStarted {
            total: work.len(),
            epoch,
        })
        .await;
        let report = BatchReport::new(epoch, self.schedule(work).await);
        self.finish(&report).await;
        Ok(report)
    }

    /// Every tab of the current session in submission order, as last seen.
    pub fn snapshot(&self) -> Vec<TabOutcome> {
        let records = self.records();
        let mut ordered: Vec<&TabRecord> = records.values().collect();
        ordered.sort_by_key(|r| r.order);
        ordered
            .into_iter()
            .map(|r| TabOutcome::from_intent(&r.intent))
            .collect()
    }

    /// Report over the whole session, including retried tabs.
    pub fn report(&self) -> BatchReport {
        BatchReport::new(self.epoch(), self.snapshot())
    }

    /// Intents currently held by the match engine.
    pub async fn live_intents(&self) -> Result<Vec<Intent>, SessionError> {
        Ok(self.matcher.snapshot().await?)
    }

    /// Forget all session state, cancelling any live timeouts.
    pub async fn clear(&self) -> Result<(), SessionError> {
        let _guard = self.begin()?;
        self.reset().await
    }

    fn begin(&self) -> Result<RunGuard<'_>, SessionError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SessionError::BatchInProgress);
        }
        Ok(RunGuard(&self.running))
    }

    fn records(&self) -> MutexGuard<'_, HashMap<TabId, TabRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn reset(&self) -> Result<(), SessionError> {
        let dropped = self.matcher.clear().await?;
        if !dropped.is_empty() {
            debug!("Dropped {} live intents", dropped.len());
        }
        self.records().clear();
        Ok(())
    }

    /// Epoch = highest download id known before anything is clicked.
    async fn capture_epoch(&self) -> Result<u64, SessionError> {
        let existing = self
            .downloads
            .search_downloads(&DownloadQuery::default())
            .await?;
        if let Some(max) = existing.iter().map(|d| d.id).max() {
            self.bus.observe_id(max);
        }
        let epoch = self.bus.high_water_mark();
        self.matcher.set_epoch(epoch).await?;
        self.epoch.store(epoch, Ordering::SeqCst);
        Ok(epoch)
    }

    /// Downloads that started while an intent sat in `Failed` are not its own.
    async fn raise_epoch(&self) -> Result<u64, SessionError> {
        let high_water = self.bus.high_water_mark();
        self.matcher.raise_epoch(high_water).await?;
        let previous = self.epoch.fetch_max(high_water, Ordering::SeqCst);
        Ok(previous.max(high_water))
    }

    async fn prepare_retry(&self, id: &TabId) -> Result<(Tab, Intent), RetryError> {
        let record = self
            .records()
            .get(id)
            .cloned()
            .ok_or_else(|| RetryError::UnknownIntent(id.clone()))?;

        if !matches!(record.intent.state, IntentState::Failed(_)) {
            return Err(RetryError::NotFailed {
                id: id.clone(),
                state: record.intent.state.as_str(),
            });
        }
        if record.intent.retry_count >= self.settings.max_retries {
            self.set_failure(id, FailureReason::RetryLimitExceeded);
            return Err(RetryError::RetryLimitExceeded {
                id: id.clone(),
                max: self.settings.max_retries,
            });
        }

        let live = match self.tabs.get_tab(id).await {
            Ok(Some(tab)) => tab,
            Ok(None) | Err(HostError::TabNotFound(_)) => {
                self.set_failure(id, FailureReason::TabAlreadyClosed);
                return Err(RetryError::TabAlreadyClosed(id.clone()));
            }
            Err(e) => return Err(SessionError::Host(e).into()),
        };

        let mut intent = record.intent;
        intent
            .reset_for_retry()
            .map_err(|e| RetryError::NotFailed {
                id: id.clone(),
                state: e.from,
            })?;
        self.update_record(&intent);
        debug!("Tab {} re-queued (attempt {})", id, intent.retry_count + 1);
        Ok((live, intent))
    }

    /// Overwrite a failed record's reason without touching the retry count.
    fn set_failure(&self, id: &TabId, reason: FailureReason) {
        if let Some(record) = self.records().get_mut(id) {
            record.intent.state = IntentState::Failed(reason);
        }
    }

    fn update_record(&self, intent: &Intent) {
        if let Some(record) = self.records().get_mut(&intent.id) {
            record.intent = intent.clone();
        }
    }

    async fn schedule(&self, work: Vec<(Tab, Intent)>) -> Vec<TabOutcome> {
        let this = self;
        let mut outcomes: Vec<TabOutcome> = self
            .scheduler
            .run(work, move |(tab, intent)| this.process(tab, intent))
            .collect()
            .await;

        let records = self.records();
        outcomes.sort_by_key(|o| records.get(&o.tab).map_or(usize::MAX, |r| r.order));
        outcomes
    }

    async fn process(&self, tab: Tab, intent: Intent) -> TabOutcome {
        self.emit(SessionEvent::TabStarted {
            tab: tab.id.clone(),
            url: tab.url.clone(),
            attempt: intent.retry_count + 1,
        })
        .await;

        let intent = self.attempt(&tab, intent).await;
        self.update_record(&intent);
        if let Some(reason) = intent.state.failure() {
            self.emit(SessionEvent::TabFailed {
                tab: tab.id.clone(),
                reason: reason.clone(),
            })
            .await;
        }
        TabOutcome::from_intent(&intent)
    }

    /// Admit, actuate, wait for resolution and close. Always returns a
    /// terminal intent.
    async fn attempt(&self, tab: &Tab, mut intent: Intent) -> Intent {
        if let Err(e) = self.matcher.admit(intent.clone()).await {
            warn!("Tab {}: could not register intent: {}", tab.id, e);
            let _ = intent.mark_failed(FailureReason::ExecutionFailed(e.to_string()));
            return intent;
        }

        let actuation = match self.actuator.actuate(tab).await {
            Ok(actuation) => actuation,
            Err(e) => {
                warn!("Tab {}: {}", tab.id, e);
                let reason = FailureReason::from(e);
                return match self.matcher.fail(&tab.id, reason.clone()).await {
                    Ok(failed) => failed,
                    Err(_) => {
                        let _ = intent.mark_failed(reason);
                        intent
                    }
                };
            }
        };

        self.emit(SessionEvent::TabClicked {
            tab: tab.id.clone(),
            strategy: actuation.strategy,
            resolved_url: actuation.resolved_url.clone(),
        })
        .await;

        let resolution = match self.matcher.clicked(&tab.id, actuation.clone()).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!("Tab {}: could not arm match: {}", tab.id, e);
                let _ = self
                    .matcher
                    .fail(&tab.id, FailureReason::ExecutionFailed(e.to_string()))
                    .await;
                let _ = intent.mark_failed(FailureReason::ExecutionFailed(e.to_string()));
                return intent;
            }
        };
        if intent.mark_clicked(&actuation).is_ok() {
            self.update_record(&intent);
        }

        let mut resolved = match resolution.await {
            Ok(resolved) => resolved,
            Err(_) => {
                let reason = FailureReason::ExecutionFailed("match dispatcher stopped".into());
                let _ = intent.mark_failed(reason);
                return intent;
            }
        };

        if let IntentState::Matched(download_id) = resolved.state {
            if let Some(tier) = resolved.tier {
                self.emit(SessionEvent::TabMatched {
                    tab: tab.id.clone(),
                    download_id,
                    tier,
                })
                .await;
            }
            match self.tabs.close_tab(&tab.id).await {
                Ok(()) => {
                    if resolved.mark_closed().is_ok() {
                        self.emit(SessionEvent::TabClosed {
                            tab: tab.id.clone(),
                        })
                        .await;
                    }
                }
                // The download started; a lingering tab is not a failure.
                Err(e) => warn!(
                    "Tab {}: download {} confirmed but closing the tab failed: {}",
                    tab.id, download_id, e
                ),
            }
        }
        resolved
    }

    async fn finish(&self, report: &BatchReport) {
        info!(
            "Batch finished: {} succeeded, {} failed",
            report.succeeded, report.failed
        );
        self.emit(SessionEvent::BatchFinished {
            succeeded: report.succeeded,
            failed: report.failed,
        })
        .await;
    }

    async fn emit(&self, event: SessionEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event).await;
        }
    }
}
