//! Bounded-concurrency admission of per-tab work.
//!
//! Behaves like `buffer_unordered(limit)` with a short pause between
//! successive admissions, so a large batch never bursts the host's tab and
//! scripting APIs.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::time::{sleep, Sleep};

use crate::config::{ConfigError, MAX_CONCURRENCY, MIN_CONCURRENCY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyScheduler {
    limit: usize,
    admission_delay: Duration,
}

impl ConcurrencyScheduler {
    pub fn new(limit: usize, admission_delay: Duration) -> Result<Self, ConfigError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&limit) {
            return Err(ConfigError::ConcurrencyOutOfRange(limit));
        }
        Ok(Self {
            limit,
            admission_delay,
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `op` over every item with at most `limit` in flight.
    ///
    /// Outcomes are yielded in completion order. The returned stream is
    /// lazy: nothing starts until it is polled.
    pub fn run<I, F, Fut>(&self, items: I, op: F) -> ScheduledRun<I::Item, F, Fut>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future,
    {
        ScheduledRun {
            queue: items.into_iter().collect(),
            op,
            in_flight: FuturesUnordered::new(),
            limit: self.limit,
            admission_delay: self.admission_delay,
            gate: None,
        }
    }
}

/// Stream of outcomes from [`ConcurrencyScheduler::run`].
#[must_use = "streams do nothing unless polled"]
pub struct ScheduledRun<T, F, Fut> {
    queue: VecDeque<T>,
    op: F,
    in_flight: FuturesUnordered<Fut>,
    limit: usize,
    admission_delay: Duration,
    gate: Option<Pin<Box<Sleep>>>,
}

// No field is structurally pinned: futures live inside FuturesUnordered
// and the gate is boxed.
impl<T, F, Fut> Unpin for ScheduledRun<T, F, Fut> {}

impl<T, F, Fut> ScheduledRun<T, F, Fut> {
    /// Items not yet admitted.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl<T, F, Fut> Stream for ScheduledRun<T, F, Fut>
where
    F: FnMut(T) -> Fut,
    Fut: Future,
{
    type Item = Fut::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        while this.in_flight.len() < this.limit && !this.queue.is_empty() {
            if let Some(gate) = this.gate.as_mut() {
                if gate.as_mut().poll(cx).is_pending() {
                    break;
                }
                this.gate = None;
            }
            let Some(item) = this.queue.pop_front() else {
                break;
            };
            this.in_flight.push((this.op)(item));
            if !this.queue.is_empty() && !this.admission_delay.is_zero() {
                this.gate = Some(Box::pin(sleep(this.admission_delay)));
            }
        }

        match this.in_flight.poll_next_unpin(cx) {
            Poll::Ready(Some(outcome)) => Poll::Ready(Some(outcome)),
            // Empty set with work still queued: the gate's waker brings us back.
            Poll::Ready(None) if !this.queue.is_empty() => Poll::Pending,
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.queue.len() + self.in_flight.len();
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn limit_is_validated() {
        assert!(ConcurrencyScheduler::new(0, Duration::ZERO).is_err());
        assert!(ConcurrencyScheduler::new(51, Duration::ZERO).is_err());
        assert_eq!(ConcurrencyScheduler::new(50, Duration::ZERO).unwrap().limit(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_limit_and_runs_everything_once() {
        let scheduler = ConcurrencyScheduler::new(3, Duration::from_millis(10)).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let outcomes: Vec<usize> = scheduler
            .run(0..20usize, |i| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    // Uneven work so slots free in a shuffled order.
                    sleep(Duration::from_millis(50 + (i as u64 * 37) % 200)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .collect()
            .await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let mut sorted = outcomes.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_are_spaced() {
        let scheduler = ConcurrencyScheduler::new(10, Duration::from_millis(250)).unwrap();
        let start = Instant::now();
        let admitted: Vec<Duration> = scheduler
            .run(0..4, |_| async move { start.elapsed() })
            .collect()
            .await;

        let mut admitted = admitted;
        admitted.sort();
        assert_eq!(admitted[0], Duration::ZERO);
        assert!(admitted[3] >= Duration::from_millis(750));
    }

    #[tokio::test]
    async fn empty_batch_finishes_immediately() {
        let scheduler = ConcurrencyScheduler::new(2, Duration::from_millis(250)).unwrap();
        let outcomes: Vec<()> = scheduler.run(Vec::<u8>::new(), |_| async {}).collect().await;
        assert!(outcomes.is_empty());
    }
}
