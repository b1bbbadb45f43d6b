//! Polling fallback for hosts that cannot push download events.
//!
//! Re-queries the whole download list on an interval and turns differences
//! into `DownloadUpdate`s. Strictly worse than a subscription (latency,
//! repeated work), so it is only wired in when `subscribe` is unsupported.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, warn};

use super::DownloadHost;
use crate::models::{DownloadDelta, DownloadEvent, DownloadQuery, DownloadUpdate};

struct PollState {
    host: Arc<dyn DownloadHost>,
    ticker: Interval,
    known: HashMap<u64, DownloadEvent>,
    queued: VecDeque<DownloadUpdate>,
    seeded: bool,
}

/// Turn periodic `search_downloads` calls into an update stream.
///
/// The first successful poll only records what already exists; those
/// downloads predate the caller and are never reported.
pub fn poll_downloads(
    host: Arc<dyn DownloadHost>,
    every: Duration,
) -> BoxStream<'static, DownloadUpdate> {
    let mut ticker = interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = PollState {
        host,
        ticker,
        known: HashMap::new(),
        queued: VecDeque::new(),
        seeded: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(update) = state.queued.pop_front() {
                return Some((update, state));
            }

            state.ticker.tick().await;

            let current = match state.host.search_downloads(&DownloadQuery::default()).await {
                Ok(list) => list,
                Err(e) => {
                    warn!("Download poll failed: {}", e);
                    continue;
                }
            };

            if !state.seeded {
                debug!("Seeding download poller with {} entries", current.len());
                state.known = current.into_iter().map(|d| (d.id, d)).collect();
                state.seeded = true;
                continue;
            }

            let mut fresh: Vec<DownloadEvent> = current;
            fresh.sort_by_key(|d| d.id);
            for download in fresh {
                match state.known.get(&download.id) {
                    None => {
                        state.queued.push_back(DownloadUpdate::Created(download.clone()));
                    }
                    Some(previous) if previous != &download => {
                        state.queued.push_back(DownloadUpdate::Changed(diff(previous, &download)));
                    }
                    Some(_) => {}
                }
                state.known.insert(download.id, download);
            }
        }
    })
    .boxed()
}

fn diff(previous: &DownloadEvent, current: &DownloadEvent) -> DownloadDelta {
    let mut delta = DownloadDelta::new(current.id);
    if previous.url != current.url {
        delta.url = Some(current.url.clone());
    }
    if previous.final_url != current.final_url {
        delta.final_url = current.final_url.clone();
    }
    if previous.filename != current.filename {
        delta.filename = Some(current.filename.clone());
    }
    if previous.state != current.state {
        delta.state = Some(current.state);
    }
    delta
}
