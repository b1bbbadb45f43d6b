//! Page-side download trigger actuation.
//!
//! Reads the tab's DOM, picks the strongest trigger in Rust, then clicks it
//! with a single injected script. The click is irreversible, so `actuate`
//! must run at most once per intent attempt.

mod locate;

pub use locate::{locate_trigger, Trigger, TriggerPatterns};

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::host::{HostError, TabHost};
use crate::models::{Actuation, FailureReason, Tab, TabId};

const OUTER_HTML_SCRIPT: &str = "document.documentElement.outerHTML";

#[derive(Debug, Error)]
pub enum ActuationError {
    #[error("no download trigger found on {0}")]
    NoTriggerFound(String),
    #[error("page script failed: {0}")]
    ExecutionFailed(String),
    #[error("tab {0} is closed")]
    TabClosed(TabId),
}

impl From<ActuationError> for FailureReason {
    fn from(err: ActuationError) -> Self {
        match err {
            ActuationError::NoTriggerFound(_) => FailureReason::NoTriggerFound,
            ActuationError::ExecutionFailed(msg) => FailureReason::ExecutionFailed(msg),
            ActuationError::TabClosed(_) => FailureReason::TabAlreadyClosed,
        }
    }
}

fn host_error(err: HostError) -> ActuationError {
    match err {
        HostError::TabNotFound(id) => ActuationError::TabClosed(id),
        other => ActuationError::ExecutionFailed(other.to_string()),
    }
}

/// Clicks download triggers through a `TabHost`.
pub struct TabActuator {
    host: Arc<dyn TabHost>,
    patterns: TriggerPatterns,
}

impl TabActuator {
    pub fn new(host: Arc<dyn TabHost>, patterns: TriggerPatterns) -> Self {
        Self { host, patterns }
    }

    pub async fn actuate(&self, tab: &Tab) -> Result<Actuation, ActuationError> {
        let html = self
            .host
            .execute_on_tab(&tab.id, OUTER_HTML_SCRIPT)
            .await
            .map_err(host_error)?;
        let html = html
            .as_str()
            .ok_or_else(|| ActuationError::ExecutionFailed("page content unavailable".into()))?;

        let trigger = locate_trigger(html, &tab.url, &self.patterns)
            .ok_or_else(|| ActuationError::NoTriggerFound(tab.url.clone()))?;
        debug!(
            "Tab {}: {} trigger at {}[{}]",
            tab.id, trigger.strategy, trigger.selector, trigger.index
        );

        let clicked = self
            .host
            .execute_on_tab(&tab.id, &trigger.click_script())
            .await
            .map_err(host_error)?;
        if clicked.as_bool() != Some(true) {
            return Err(ActuationError::ExecutionFailed(
                "trigger element disappeared before click".into(),
            ));
        }

        info!("Tab {}: clicked {} trigger", tab.id, trigger.strategy);
        Ok(Actuation {
            strategy: trigger.strategy,
            resolved_url: trigger.resolved_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{TabFilter, TriggerStrategy};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::Mutex;

    struct OnePage {
        html: Option<String>,
        click_result: Value,
        scripts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TabHost for OnePage {
        async fn list_tabs(&self, _filter: &TabFilter) -> Result<Vec<Tab>, HostError> {
            Ok(Vec::new())
        }

        async fn get_tab(&self, _id: &TabId) -> Result<Option<Tab>, HostError> {
            Ok(None)
        }

        async fn execute_on_tab(&self, id: &TabId, script: &str) -> Result<Value, HostError> {
            self.scripts.lock().unwrap().push(script.to_string());
            let Some(ref html) = self.html else {
                return Err(HostError::TabNotFound(id.clone()));
            };
            if script == OUTER_HTML_SCRIPT {
                Ok(Value::String(html.clone()))
            } else {
                Ok(self.click_result.clone())
            }
        }

        async fn close_tab(&self, _id: &TabId) -> Result<(), HostError> {
            Ok(())
        }
    }

    fn actuator(html: Option<&str>, click_result: Value) -> (TabActuator, Arc<OnePage>) {
        let host = Arc::new(OnePage {
            html: html.map(str::to_string),
            click_result,
            scripts: Mutex::new(Vec::new()),
        });
        let patterns = TriggerPatterns::from_config(&Config::default()).unwrap();
        (TabActuator::new(host.clone(), patterns), host)
    }

    fn tab() -> Tab {
        Tab::new("t1", "https://host/file/1/a.pdf.html")
    }

    #[tokio::test]
    async fn clicks_direct_link_once() {
        let (actuator, host) = actuator(
            Some(r#"<a href="https://host/dl/x1/a.pdf">a.pdf</a>"#),
            Value::Bool(true),
        );
        let actuation = actuator.actuate(&tab()).await.unwrap();
        assert_eq!(actuation.strategy, TriggerStrategy::DirectLink);
        assert_eq!(actuation.resolved_url.as_deref(), Some("https://host/dl/x1/a.pdf"));

        let scripts = host.scripts.lock().unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(scripts[1].contains(".click()"));
    }

    #[tokio::test]
    async fn missing_trigger_never_clicks() {
        let (actuator, host) = actuator(Some("<p>nothing</p>"), Value::Bool(true));
        let err = actuator.actuate(&tab()).await.unwrap_err();
        assert!(matches!(err, ActuationError::NoTriggerFound(_)));
        assert_eq!(host.scripts.lock().unwrap().len(), 1);
        assert_eq!(FailureReason::from(err), FailureReason::NoTriggerFound);
    }

    #[tokio::test]
    async fn failed_click_is_execution_failure() {
        let (actuator, _) = actuator(Some("<button>Download</button>"), Value::Bool(false));
        let err = actuator.actuate(&tab()).await.unwrap_err();
        assert!(matches!(err, ActuationError::ExecutionFailed(_)));
    }

    #[tokio::test]
    async fn closed_tab_maps_to_tab_closed() {
        let (actuator, _) = actuator(None, Value::Null);
        let err = actuator.actuate(&tab()).await.unwrap_err();
        assert_eq!(FailureReason::from(err), FailureReason::TabAlreadyClosed);
    }
}
