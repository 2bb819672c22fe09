//! Bounded-concurrency execution engine: the work queue, the retry policy,
//! and the call dispatcher that combines the two.

pub mod dispatch;
pub mod queue;
pub mod retry;

pub use dispatch::{DispatchConfig, Dispatcher};
pub use queue::{Completion, NoopObserver, QueueObserver, Task, WorkQueue};
pub use retry::{Classification, RetryPolicy, classify};

use serde::{Deserialize, Serialize};

/// Lifecycle state shared by the queue and the producers built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Constructed, nothing started.
    Initialized,
    /// Lanes are pulling tasks.
    Running,
    /// No new tasks start; executing ones finish.
    Paused,
    /// Drained. Terminal.
    Done,
}

impl EngineState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: EngineState) -> bool {
        use EngineState::*;
        matches!(
            (self, to),
            (Initialized, Running) | (Running, Paused) | (Paused, Running) | (Running, Done)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == EngineState::Done
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Paused => "paused",
            EngineState::Done => "done",
        };
        write!(f, "{s}")
    }
}
