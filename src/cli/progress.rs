//! Multi-progress display for a running batch.
//!
//! One summary bar plus one spinner per tab in flight; spinners are created
//! when a tab is admitted and cleared once it resolves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::models::TabId;
use crate::services::SessionEvent;

pub struct BatchProgress {
    multi: MultiProgress,
    summary_bar: ProgressBar,
    /// Spinner and display label per tab in flight.
    slots: Mutex<HashMap<TabId, (ProgressBar, String)>>,
    /// (succeeded, failed)
    counts: Mutex<(usize, usize)>,
}

fn summary_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:30.cyan/blue}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░")
}

fn slot_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("  {spinner:.cyan} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl BatchProgress {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let summary_bar = multi.add(ProgressBar::new(0));
        summary_bar.set_style(summary_style());
        summary_bar.set_message("Waiting");

        Self {
            multi,
            summary_bar,
            slots: Mutex::new(HashMap::new()),
            counts: Mutex::new((0, 0)),
        }
    }

    pub fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::BatchStarted { total, .. } => {
                self.summary_bar.set_length(*total as u64);
                self.summary_bar.set_position(0);
                self.set_summary();
            }
            SessionEvent::TabStarted { tab, url, attempt } => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(slot_style());
                let mut label = truncate(url, 60);
                if *attempt > 1 {
                    label.push_str(&format!(" (attempt {})", attempt));
                }
                bar.set_message(format!("{} - locating trigger", label));
                bar.enable_steady_tick(Duration::from_millis(100));
                if let Ok(mut slots) = self.slots.lock() {
                    slots.insert(tab.clone(), (bar, label));
                }
            }
            SessionEvent::TabClicked { tab, strategy, .. } => {
                if let Ok(slots) = self.slots.lock() {
                    if let Some((bar, label)) = slots.get(tab) {
                        bar.set_message(format!(
                            "{} - clicked {}, waiting for download",
                            label, strategy
                        ));
                    }
                }
            }
            SessionEvent::TabMatched {
                tab,
                download_id,
                tier,
            } => {
                let _ = self.multi.println(format!(
                    "{} {} -> download #{} ({})",
                    style("✓").green(),
                    tab,
                    download_id,
                    tier
                ));
                self.resolve(tab, true);
            }
            SessionEvent::TabFailed { tab, reason } => {
                let _ = self.multi.println(format!(
                    "{} {}: {}",
                    style("✗").red(),
                    tab,
                    reason
                ));
                self.resolve(tab, false);
            }
            SessionEvent::TabClosed { .. } => {}
            SessionEvent::BatchFinished { .. } => {
                self.summary_bar.set_message("Done");
            }
        }
    }

    fn resolve(&self, tab: &TabId, success: bool) {
        if let Ok(mut slots) = self.slots.lock() {
            if let Some((bar, _)) = slots.remove(tab) {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
        }
        if let Ok(mut counts) = self.counts.lock() {
            if success {
                counts.0 += 1;
            } else {
                counts.1 += 1;
            }
        }
        self.summary_bar.inc(1);
        self.set_summary();
    }

    fn set_summary(&self) {
        let (ok, failed) = self.counts.lock().map(|c| *c).unwrap_or((0, 0));
        self.summary_bar
            .set_message(format!("Downloaded: {} | Failed: {}", ok, failed));
    }

    /// Finish all progress bars and clear the display.
    pub fn finish(&self) {
        if let Ok(mut slots) = self.slots.lock() {
            for (_, (bar, _)) in slots.drain() {
                bar.finish_and_clear();
            }
        }
        self.summary_bar.finish_and_clear();
    }
}

impl Default for BatchProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let tail: String = s
        .chars()
        .rev()
        .take(max.saturating_sub(1))
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("…{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_the_tail() {
        assert_eq!(truncate("short", 10), "short");
        let long = "https://example.com/file/12345/very-long-report-name.pdf.html";
        let cut = truncate(long, 20);
        assert_eq!(cut.chars().count(), 20);
        assert!(cut.ends_with("name.pdf.html"));
    }
}
