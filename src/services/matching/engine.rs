//! Tiered download-to-intent matching.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_TIMEOUT_MS};
use crate::models::{
    Actuation, DownloadEvent, FailureReason, Intent, InvalidTransition, MatchTier, TabId,
};

/// Unclaimed events kept around for intents that register late.
const BACKLOG_LIMIT: usize = 64;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tab {0} already has an intent in flight")]
    AlreadyInFlight(TabId),
    #[error("no intent in flight for tab {0}")]
    UnknownIntent(TabId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("match dispatcher has shut down")]
    DispatcherClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchPolicy {
    /// Deadline from click to a matching download.
    pub timeout: Duration,
    /// Allow the degenerate "only one intent in flight" rule.
    pub singleton_fallback: bool,
}

impl MatchPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.timeout(),
            singleton_fallback: config.singleton_fallback,
        }
    }
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::config::DEFAULT_TIMEOUT_MS),
            singleton_fallback: true,
        }
    }
}

/// A download nobody claimed, with the newest intent admitted when it arrived.
#[derive(Clone)]
struct Unclaimed {
    event: DownloadEvent,
    admitted_by: u64,
}

struct Entry {
    intent: Intent,
    seq: u64,
    /// Live only while the intent is `Clicked`.
    timeout: Option<delay_queue::Key>,
}

/// Intent table plus the matching rules.
///
/// Only intents in `Clicked` take part in matching. Resolved intents are
/// removed from the table and handed back to the caller, so a second event
/// or a stale timer can never touch them again.
pub struct MatchEngine {
    policy: MatchPolicy,
    epoch: u64,
    next_seq: u64,
    intents: HashMap<TabId, Entry>,
    /// Clicked intents in submission order.
    clicked: BTreeMap<u64, TabId>,
    claimed: HashSet<u64>,
    backlog: VecDeque<Unclaimed>,
    timeouts: DelayQueue<TabId>,
}

impl MatchEngine {
    /// Timeouts longer than [`MAX_TIMEOUT_MS`] are clamped to it.
    pub fn new(mut policy: MatchPolicy) -> Self {
        policy.timeout = policy.timeout.min(Duration::from_millis(MAX_TIMEOUT_MS));
        Self {
            policy,
            epoch: 0,
            next_seq: 0,
            intents: HashMap::new(),
            clicked: BTreeMap::new(),
            claimed: HashSet::new(),
            backlog: VecDeque::new(),
            timeouts: DelayQueue::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Start a new run: downloads with id <= `epoch` are ignored.
    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
        self.purge_backlog();
        info!("Match epoch set to {}", epoch);
    }

    /// Move the epoch forward, never back.
    pub fn raise_epoch(&mut self, at_least: u64) {
        if at_least > self.epoch {
            self.set_epoch(at_least);
        }
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    pub fn clicked_count(&self) -> usize {
        self.clicked.len()
    }

    /// Live intents in submission order.
    pub fn snapshot(&self) -> Vec<Intent> {
        let mut entries: Vec<&Entry> = self.intents.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.intent.clone()).collect()
    }

    /// Register a `Pending` intent.
    pub fn admit(&mut self, intent: Intent) -> Result<(), EngineError> {
        if self.intents.contains_key(&intent.id) {
            return Err(EngineError::AlreadyInFlight(intent.id));
        }
        if intent.is_terminal() {
            return Err(InvalidTransition {
                id: intent.id.clone(),
                from: intent.state.as_str(),
                to: "pending",
            }
            .into());
        }
        self.next_seq += 1;
        debug!("Admitted intent {} (seq {})", intent.id, self.next_seq);
        self.intents.insert(
            intent.id.clone(),
            Entry {
                intent,
                seq: self.next_seq,
                timeout: None,
            },
        );
        Ok(())
    }

    /// Record a successful actuation and start the intent's timeout.
    ///
    /// Returns any intents resolved by already-seen unclaimed downloads.
    /// A backlogged download only binds to intents admitted before it
    /// arrived, and never through the singleton rule.
    pub fn mark_clicked(
        &mut self,
        id: &TabId,
        actuation: &Actuation,
    ) -> Result<Vec<Intent>, EngineError> {
        let entry = self
            .intents
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownIntent(id.clone()))?;
        entry.intent.mark_clicked(actuation)?;
        entry.timeout = Some(self.timeouts.insert(id.clone(), self.policy.timeout));
        self.clicked.insert(entry.seq, id.clone());

        let pending: Vec<Unclaimed> = self.backlog.iter().cloned().collect();
        let mut resolved = Vec::new();
        for unclaimed in pending {
            if !self.is_candidate(&unclaimed.event) {
                continue;
            }
            if let Some(hit) = self.find_match(&unclaimed.event, Some(unclaimed.admitted_by)) {
                if let Some(intent) = self.bind(&unclaimed.event, hit) {
                    resolved.push(intent);
                }
            }
        }
        Ok(resolved)
    }

    /// Resolve a live intent as failed.
    pub fn fail(&mut self, id: &TabId, reason: FailureReason) -> Result<Intent, EngineError> {
        let entry = self
            .intents
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownIntent(id.clone()))?;
        entry.intent.mark_failed(reason)?;
        self.remove(id)
            .map(|e| e.intent)
            .ok_or_else(|| EngineError::UnknownIntent(id.clone()))
    }

    /// Offer a download snapshot to the clicked intents.
    ///
    /// Returns the intent it was bound to, if any.
    pub fn on_download_event(&mut self, event: &DownloadEvent) -> Option<Intent> {
        if !self.is_candidate(event) {
            if !event.state.is_qualifying() {
                self.backlog.retain(|u| u.event.id != event.id);
            }
            return None;
        }

        match self.find_match(event, None) {
            Some(hit) => self.bind(event, hit),
            None => {
                self.remember_unclaimed(event);
                None
            }
        }
    }

    fn is_candidate(&self, event: &DownloadEvent) -> bool {
        if event.id <= self.epoch {
            debug!("Download {} predates epoch {}; ignored", event.id, self.epoch);
            return false;
        }
        !self.claimed.contains(&event.id) && event.state.is_qualifying()
    }

    fn bind(&mut self, event: &DownloadEvent, (id, tier): (TabId, MatchTier)) -> Option<Intent> {
        if let Err(e) = self.intents.get_mut(&id)?.intent.mark_matched(event.id, tier) {
            warn!("Could not bind download {}: {}", event.id, e);
            return None;
        }
        let entry = self.remove(&id)?;
        self.claimed.insert(event.id);
        self.backlog.retain(|u| u.event.id != event.id);
        info!(
            "Download {} matched tab {} via {} ({})",
            event.id, id, tier, event.url
        );
        Some(entry.intent)
    }

    /// `admitted_by` limits a replay to intents with `seq <= admitted_by`
    /// and turns the singleton rule off.
    fn find_match(
        &self,
        event: &DownloadEvent,
        admitted_by: Option<u64>,
    ) -> Option<(TabId, MatchTier)> {
        let limit = admitted_by.unwrap_or(u64::MAX);
        for tier in [MatchTier::ClickedUrl, MatchTier::Referrer, MatchTier::Filename] {
            let hit = self
                .clicked
                .range(..=limit)
                .map(|(_, id)| id)
                .find(|id| {
                    self.intents
                        .get(*id)
                        .is_some_and(|e| satisfies(tier, &e.intent, event))
                });
            if let Some(id) = hit {
                return Some((id.clone(), tier));
            }
        }

        if admitted_by.is_none() && self.policy.singleton_fallback && self.clicked.len() == 1 {
            let id = self.clicked.values().next()?;
            warn!(
                "Download {} carries nothing tying it to a tab; assigning it to {}, the only tab in flight",
                event.id, id
            );
            return Some((id.clone(), MatchTier::Singleton));
        }
        None
    }

    fn remember_unclaimed(&mut self, event: &DownloadEvent) {
        // Later deltas refresh the snapshot but keep the arrival point.
        if let Some(known) = self.backlog.iter_mut().find(|u| u.event.id == event.id) {
            known.event = event.clone();
            return;
        }
        if self.backlog.len() == BACKLOG_LIMIT {
            self.backlog.pop_front();
        }
        self.backlog.push_back(Unclaimed {
            event: event.clone(),
            admitted_by: self.next_seq,
        });
        debug!("Download {} left unclaimed", event.id);
    }

    fn purge_backlog(&mut self) {
        let epoch = self.epoch;
        self.backlog.retain(|u| u.event.id > epoch);
    }

    /// Take an entry out of the table, cancelling its timeout.
    fn remove(&mut self, id: &TabId) -> Option<Entry> {
        let mut entry = self.intents.remove(id)?;
        if let Some(key) = entry.timeout.take() {
            self.timeouts.remove(&key);
        }
        self.clicked.remove(&entry.seq);
        Some(entry)
    }

    /// Poll for the next intent whose deadline passed.
    ///
    /// Stays pending while no timeouts are armed.
    pub fn poll_expired(&mut self, cx: &mut Context<'_>) -> Poll<Intent> {
        loop {
            let expired = match self.timeouts.poll_expired(cx) {
                Poll::Ready(Some(expired)) => expired,
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            };
            let id = expired.into_inner();

            // The key was just yielded, so it must not be removed again.
            let Some(entry) = self.intents.get_mut(&id) else {
                continue;
            };
            entry.timeout = None;
            if entry.intent.mark_failed(FailureReason::Timeout).is_err() {
                continue;
            }
            warn!(
                "Tab {}: no matching download within {:?}",
                id, self.policy.timeout
            );
            if let Some(entry) = self.remove(&id) {
                return Poll::Ready(entry.intent);
            }
        }
    }

    pub async fn next_expired(&mut self) -> Intent {
        std::future::poll_fn(|cx| self.poll_expired(cx)).await
    }

    /// Drop every live intent and cancel all timeouts.
    pub fn clear(&mut self) -> Vec<Intent> {
        self.timeouts.clear();
        self.clicked.clear();
        self.claimed.clear();
        self.backlog.clear();
        let mut entries: Vec<Entry> = self.intents.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.intent).collect()
    }
}

fn satisfies(tier: MatchTier, intent: &Intent, event: &DownloadEvent) -> bool {
    match tier {
        MatchTier::ClickedUrl => intent.clicked_url.as_deref().is_some_and(|clicked| {
            clicked == event.url || event.final_url.as_deref() == Some(clicked)
        }),
        MatchTier::Referrer => event
            .referrer
            .as_deref()
            .filter(|r| !r.is_empty())
            .is_some_and(|referrer| {
                referrer == intent.source_url
                    || intent.source_host().as_deref() == Some(referrer)
                    || intent.source_url.starts_with(referrer)
            }),
        MatchTier::Filename => intent
            .expected_filename
            .as_deref()
            .filter(|f| !f.is_empty())
            .is_some_and(|expected| event.filename.contains(expected)),
        MatchTier::Singleton => false,
    }
}
