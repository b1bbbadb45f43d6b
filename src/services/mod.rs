//! Service layer for tabsweep.
//!
//! Domain logic separated from UI concerns; the CLI drives these through
//! [`SessionController`] and renders the [`SessionEvent`]s it emits.

pub mod actuator;
pub mod bus;
pub mod matching;
pub mod scheduler;
pub mod session;

pub use actuator::{ActuationError, TabActuator, TriggerPatterns};
pub use bus::DownloadEventBus;
pub use matching::{EngineError, MatchDispatcher, MatchEngine, MatchHandle, MatchPolicy};
pub use scheduler::ConcurrencyScheduler;
pub use session::{
    BatchReport, RetryError, SessionController, SessionError, SessionEvent, SessionSettings,
    TabOutcome,
};
