//! Process-wide download event bus.
//!
//! Turns raw host updates (created / changed deltas) into full
//! `DownloadEvent` snapshots and fans them out to every subscriber in
//! arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::host::{poll_downloads, DownloadHost, HostError};
use crate::models::{DownloadEvent, DownloadUpdate};

struct BusInner {
    tx: broadcast::Sender<DownloadEvent>,
    high_water: AtomicU64,
    /// Last known snapshot per live download; dropped once terminal.
    snapshots: Mutex<HashMap<u64, DownloadEvent>>,
}

/// Broadcast bus for host download events.
#[derive(Clone)]
pub struct DownloadEventBus {
    inner: Arc<BusInner>,
}

impl DownloadEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                tx,
                high_water: AtomicU64::new(0),
                snapshots: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.tx.subscribe()
    }

    /// Largest download id this bus has seen (or been told about).
    pub fn high_water_mark(&self) -> u64 {
        self.inner.high_water.load(Ordering::SeqCst)
    }

    /// Record ids known from elsewhere, e.g. a `search_downloads` snapshot.
    pub fn observe_id(&self, id: u64) {
        self.inner.high_water.fetch_max(id, Ordering::SeqCst);
    }

    /// Merge a host update and broadcast the resulting snapshot.
    ///
    /// Returns the snapshot that was published, or `None` when a delta
    /// refers to a download this bus never saw created.
    pub fn publish_update(&self, update: DownloadUpdate) -> Option<DownloadEvent> {
        let event = {
            let mut snapshots = match self.inner.snapshots.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };

            let event = match update {
                DownloadUpdate::Created(event) => event,
                DownloadUpdate::Changed(delta) => {
                    let Some(known) = snapshots.get(&delta.id) else {
                        debug!("Ignoring delta for unknown download {}", delta.id);
                        return None;
                    };
                    let mut merged = known.clone();
                    merged.apply(&delta);
                    merged
                }
            };

            if event.state.is_terminal() {
                snapshots.remove(&event.id);
            } else {
                snapshots.insert(event.id, event.clone());
            }
            event
        };

        self.observe_id(event.id);
        debug!(
            "download {} [{}] url={} filename={:?}",
            event.id,
            event.state.as_str(),
            event.url,
            event.filename
        );

        // No receivers is fine: nothing is in flight.
        let _ = self.inner.tx.send(event.clone());
        Some(event)
    }

    /// Drain a host update stream into the bus on a background task.
    pub fn spawn_forwarder(&self, mut updates: BoxStream<'static, DownloadUpdate>) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                bus.publish_update(update);
            }
            debug!("Download update stream ended");
        })
    }

    /// Wire a host into the bus, preferring push events over polling.
    pub async fn attach(
        &self,
        host: Arc<dyn DownloadHost>,
        poll_interval: Duration,
    ) -> Result<JoinHandle<()>, HostError> {
        let updates = match host.subscribe().await {
            Ok(stream) => stream,
            Err(HostError::Unsupported(what)) => {
                info!(
                    "Host has no {}; polling downloads every {:?}",
                    what, poll_interval
                );
                poll_downloads(host, poll_interval)
            }
            Err(e) => return Err(e),
        };
        Ok(self.spawn_forwarder(updates))
    }
}

/// Receive the next event, skipping over any gap caused by lagging.
///
/// Returns `None` once the bus is gone.
pub async fn next_event(rx: &mut broadcast::Receiver<DownloadEvent>) -> Option<DownloadEvent> {
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Download event subscriber lagged; {} events dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DownloadDelta, DownloadQuery, DownloadState};
    use async_trait::async_trait;

    #[tokio::test]
    async fn deltas_are_merged_into_full_snapshots() {
        let bus = DownloadEventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish_update(DownloadUpdate::Created(DownloadEvent::new(
            4,
            "https://host/dl/tok",
        )));
        let mut named = DownloadDelta::new(4);
        named.filename = Some("/tmp/report.pdf".to_string());
        bus.publish_update(DownloadUpdate::Changed(named));

        let first = next_event(&mut rx).await.unwrap();
        assert!(first.filename.is_empty());
        let second = next_event(&mut rx).await.unwrap();
        assert_eq!(second.url, "https://host/dl/tok");
        assert_eq!(second.filename, "/tmp/report.pdf");
        assert_eq!(bus.high_water_mark(), 4);
    }

    #[tokio::test]
    async fn unknown_and_finished_downloads_are_not_revived() {
        let bus = DownloadEventBus::new(16);
        assert!(bus
            .publish_update(DownloadUpdate::Changed(DownloadDelta::new(9)))
            .is_none());

        bus.publish_update(DownloadUpdate::Created(
            DownloadEvent::new(2, "https://host/a").with_state(DownloadState::Complete),
        ));
        let mut late = DownloadDelta::new(2);
        late.filename = Some("a".to_string());
        assert!(bus.publish_update(DownloadUpdate::Changed(late)).is_none());
    }

    #[test]
    fn high_water_mark_only_grows() {
        let bus = DownloadEventBus::new(4);
        bus.observe_id(10);
        bus.observe_id(3);
        assert_eq!(bus.high_water_mark(), 10);
    }

    struct PollOnlyHost;

    #[async_trait]
    impl DownloadHost for PollOnlyHost {
        async fn search_downloads(
            &self,
            _query: &DownloadQuery,
        ) -> Result<Vec<DownloadEvent>, HostError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attach_falls_back_to_polling() {
        let bus = DownloadEventBus::new(4);
        let handle = bus
            .attach(Arc::new(PollOnlyHost), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!handle.is_finished());
        handle.abort();
    }
}
