//! Lifecycle state of a test registry instance

use std::fmt;

// =============================================================================
// Lifecycle State
// =============================================================================

/// Where an instance is in its start/stop cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Never started, or a start failed before the service was launched
    #[default]
    NotStarted,
    /// Provisioning, migrating or waiting for the service
    Starting,
    /// The service reported readiness
    Running,
    /// Teardown in progress
    Stopping,
    /// Torn down, or a start failed after the service was launched
    Stopped,
}

impl LifecycleState {
    /// Whether `start()` may begin a new provisioning sequence from this state
    pub fn can_start(&self) -> bool {
        matches!(self, LifecycleState::NotStarted | LifecycleState::Stopped)
    }

    pub fn is_running(&self) -> bool {
        *self == LifecycleState::Running
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::NotStarted => "not started",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}
