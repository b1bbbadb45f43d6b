//! Download confirmation matching.
//!
//! [`MatchEngine`] holds the intent table and the tiered rules;
//! [`MatchDispatcher`] runs it on a single task fed by the event bus.

mod dispatcher;
mod engine;

pub use dispatcher::{MatchDispatcher, MatchHandle, Resolution};
pub use engine::{EngineError, MatchEngine, MatchPolicy};
