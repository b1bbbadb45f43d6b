//! tabsweep - batch download-button clicking across browser tabs.
//!
//! Clicks the download trigger in many tabs at once, confirms each click by
//! matching the browser's download events back to the tab that caused it,
//! and closes the tab once its download has started.

pub mod config;
pub mod host;
pub mod models;
pub mod services;

pub use config::Config;
pub use services::{BatchReport, SessionController, SessionEvent};
