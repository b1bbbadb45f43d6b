//! Browser tab models and tab discovery filters.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Opaque tab identifier (a CDP target id for the Chromium host).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl TabId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TabId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A browser tab as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tab {
    pub id: TabId,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Tab {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: TabId::new(id),
            url: url.into(),
            title: None,
        }
    }

    /// Hostname of the tab's current URL, if it parses.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|s| s.to_string()))
    }
}

/// Filter used when listing tabs.
///
/// An empty filter matches every tab with an http(s) URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabFilter {
    /// Hostname to match; subdomains of it match too.
    pub host: Option<String>,
    /// Substring the tab URL must contain.
    pub url_contains: Option<String>,
}

impl TabFilter {
    pub fn host(host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            url_contains: None,
        }
    }

    pub fn matches(&self, tab: &Tab) -> bool {
        let Ok(url) = Url::parse(&tab.url) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }

        if let Some(ref wanted) = self.host {
            let wanted = wanted.trim().trim_start_matches("www.").to_ascii_lowercase();
            let Some(host) = url.host_str() else {
                return false;
            };
            let host = host.trim_start_matches("www.").to_ascii_lowercase();
            if host != wanted && !host.ends_with(&format!(".{}", wanted)) {
                return false;
            }
        }

        if let Some(ref needle) = self.url_contains {
            if !tab.url.contains(needle.as_str()) {
                return false;
            }
        }

        true
    }
}

/// Which page-side strategy located the download trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// A hyperlink matching the host's direct file-download path.
    DirectLink,
    /// A labelled "download" control with no discoverable URL.
    LabeledAction,
    /// Any hyperlink matching the looser `/download/` pattern.
    GenericLink,
}

impl TriggerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectLink => "direct_link",
            Self::LabeledAction => "labeled_action",
            Self::GenericLink => "generic_link",
        }
    }
}

impl fmt::Display for TriggerStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful actuation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actuation {
    pub strategy: TriggerStrategy,
    /// Absolute URL of the activated link, when the strategy resolved one.
    pub resolved_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_filter_matches_subdomains() {
        let filter = TabFilter::host("example.com");
        assert!(filter.matches(&Tab::new("1", "https://example.com/file/1")));
        assert!(filter.matches(&Tab::new("2", "https://www.example.com/file/2")));
        assert!(filter.matches(&Tab::new("3", "https://cdn.example.com/x")));
        assert!(!filter.matches(&Tab::new("4", "https://notexample.com/x")));
        assert!(!filter.matches(&Tab::new("5", "https://example.org/x")));
    }

    #[test]
    fn filter_skips_non_http_tabs() {
        let filter = TabFilter::default();
        assert!(!filter.matches(&Tab::new("1", "chrome://newtab/")));
        assert!(!filter.matches(&Tab::new("2", "about:blank")));
        assert!(filter.matches(&Tab::new("3", "http://host/page")));
    }

    #[test]
    fn url_substring_filter() {
        let filter = TabFilter {
            host: None,
            url_contains: Some("/file/".to_string()),
        };
        assert!(filter.matches(&Tab::new("1", "https://host/file/9/a.pdf.html")));
        assert!(!filter.matches(&Tab::new("2", "https://host/folder/9")));
    }
}
