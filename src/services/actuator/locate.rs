//! Locating a download trigger in page HTML.

use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::{Config, ConfigError};
use crate::models::TriggerStrategy;

const LINK_SELECTOR: &str = "a[href]";
const ACTION_SELECTOR: &str = "button, [role=\"button\"], input[type=\"submit\"], input[type=\"button\"], a:not([href])";

/// Compiled patterns for the three trigger strategies.
#[derive(Debug, Clone)]
pub struct TriggerPatterns {
    direct: Regex,
    generic: Regex,
    labels: Vec<String>,
}

impl TriggerPatterns {
    pub fn new(direct: &str, generic: &str, labels: &[String]) -> Result<Self, regex::Error> {
        Ok(Self {
            direct: Regex::new(direct)?,
            generic: Regex::new(generic)?,
            labels: normalize_labels(labels),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let compile = |field: &'static str, pattern: &str| {
            Regex::new(pattern).map_err(|source| ConfigError::Pattern { field, source })
        };
        Ok(Self {
            direct: compile("direct_link_pattern", &config.direct_link_pattern)?,
            generic: compile("generic_link_pattern", &config.generic_link_pattern)?,
            labels: normalize_labels(&config.action_labels),
        })
    }

    fn is_labelled(&self, element: &ElementRef<'_>) -> bool {
        let attrs = element.value();
        let mut haystacks: Vec<String> = vec![element.text().collect::<String>()];
        for name in ["aria-label", "value", "title", "id"] {
            if let Some(v) = attrs.attr(name) {
                haystacks.push(v.to_string());
            }
        }
        haystacks.iter().any(|h| {
            let h = h.to_lowercase();
            self.labels.iter().any(|label| h.contains(label.as_str()))
        })
    }
}

fn normalize_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect()
}

/// A located trigger element, addressable in the live page as the
/// `index`-th match of `selector` in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub strategy: TriggerStrategy,
    pub selector: &'static str,
    pub index: usize,
    pub resolved_url: Option<String>,
}

impl Trigger {
    /// Page script that clicks this element; evaluates to `true` on success.
    pub fn click_script(&self) -> String {
        let selector =
            serde_json::to_string(self.selector).unwrap_or_else(|_| "\"a[href]\"".to_string());
        format!(
            "(() => {{ const el = document.querySelectorAll({}).item({}); \
             if (!el) return false; el.click(); return true; }})()",
            selector, self.index
        )
    }
}

/// Find the strongest download trigger on a page.
///
/// Strategies are tried in order: direct file link, labelled action
/// control, generic download link. The first hit wins.
pub fn locate_trigger(html: &str, page_url: &str, patterns: &TriggerPatterns) -> Option<Trigger> {
    let document = Html::parse_document(html);
    let base = Url::parse(page_url).ok();

    let links = Selector::parse(LINK_SELECTOR).ok()?;
    let resolved: Vec<Option<String>> = document
        .select(&links)
        .map(|a| a.value().attr("href").and_then(|h| resolve_href(base.as_ref(), h)))
        .collect();

    if let Some((index, url)) = find_link(&resolved, &patterns.direct) {
        return Some(Trigger {
            strategy: TriggerStrategy::DirectLink,
            selector: LINK_SELECTOR,
            index,
            resolved_url: Some(url),
        });
    }

    if !patterns.labels.is_empty() {
        let actions = Selector::parse(ACTION_SELECTOR).ok()?;
        if let Some(index) = document
            .select(&actions)
            .position(|el| patterns.is_labelled(&el))
        {
            return Some(Trigger {
                strategy: TriggerStrategy::LabeledAction,
                selector: ACTION_SELECTOR,
                index,
                resolved_url: None,
            });
        }
    }

    find_link(&resolved, &patterns.generic).map(|(index, url)| Trigger {
        strategy: TriggerStrategy::GenericLink,
        selector: LINK_SELECTOR,
        index,
        resolved_url: Some(url),
    })
}

fn find_link(resolved: &[Option<String>], pattern: &Regex) -> Option<(usize, String)> {
    resolved.iter().enumerate().find_map(|(i, url)| match url {
        Some(u) if pattern.is_match(u) => Some((i, u.clone())),
        _ => None,
    })
}

fn resolve_href(base: Option<&Url>, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }
    let url = match base {
        Some(base) => base.join(href).ok()?,
        None => Url::parse(href).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> TriggerPatterns {
        let config = Config::default();
        TriggerPatterns::from_config(&config).unwrap()
    }

    const PAGE: &str = "https://files.example.com/file/1/report.pdf.html";

    #[test]
    fn direct_link_beats_everything() {
        let html = r#"<html><body>
            <a href="/download/mirror">Mirror</a>
            <button>Download</button>
            <a href="/dl/abc123/report.pdf">report.pdf</a>
        </body></html>"#;
        let trigger = locate_trigger(html, PAGE, &patterns()).unwrap();
        assert_eq!(trigger.strategy, TriggerStrategy::DirectLink);
        assert_eq!(trigger.index, 1);
        assert_eq!(
            trigger.resolved_url.as_deref(),
            Some("https://files.example.com/dl/abc123/report.pdf")
        );
    }

    #[test]
    fn labelled_action_beats_generic_link() {
        let html = r#"<html><body>
            <a href="/download/mirror">Mirror</a>
            <button id="share">Share</button>
            <div role="button" aria-label="Download file"></div>
        </body></html>"#;
        let trigger = locate_trigger(html, PAGE, &patterns()).unwrap();
        assert_eq!(trigger.strategy, TriggerStrategy::LabeledAction);
        assert_eq!(trigger.index, 1);
        assert_eq!(trigger.resolved_url, None);
    }

    #[test]
    fn generic_link_is_last_resort() {
        let html = r#"<a href="mailto:x@y">mail</a><a href="../../download/7">get it</a>"#;
        let trigger = locate_trigger(html, PAGE, &patterns()).unwrap();
        assert_eq!(trigger.strategy, TriggerStrategy::GenericLink);
        assert_eq!(
            trigger.resolved_url.as_deref(),
            Some("https://files.example.com/download/7")
        );
    }

    #[test]
    fn nothing_found() {
        let html = r#"<p>No files here</p><a href="/about">About</a>"#;
        assert_eq!(locate_trigger(html, PAGE, &patterns()), None);
    }

    #[test]
    fn click_script_addresses_the_element() {
        let trigger = Trigger {
            strategy: TriggerStrategy::DirectLink,
            selector: LINK_SELECTOR,
            index: 3,
            resolved_url: None,
        };
        let script = trigger.click_script();
        assert!(script.contains(r#"querySelectorAll("a[href]").item(3)"#));
    }
}
