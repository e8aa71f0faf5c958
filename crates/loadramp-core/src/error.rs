//! Error types for load plan construction and run plumbing

use thiserror::Error;

/// Result type alias for loadramp operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Errors that can occur while building or loading a load plan
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoadError {
    // === Schedule Errors ===
    /// Ramp schedule is malformed (no steps, zero duration, bad values)
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    // === Plan Errors ===
    /// Plan has no query targets
    #[error("Load plan must contain at least one target")]
    NoTargets,

    /// A duration in the plan is zero or out of range
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    /// Two targets share an id
    #[error("Duplicate target id: {0}")]
    DuplicateTarget(String),

    /// Any other structural problem with the plan
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Plan file could not be parsed
    #[error("Failed to parse plan: {0}")]
    PlanParse(String),

    // === General Errors ===
    /// I/O error (plan files, telemetry files)
    #[error("I/O error: {0}")]
    Io(String),
}

impl LoadError {
    /// Configuration errors are the only class that aborts a run before it starts
    pub fn is_config_error(&self) -> bool {
        !matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for LoadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<toml::de::Error> for LoadError {
    fn from(err: toml::de::Error) -> Self {
        Self::PlanParse(err.to_string())
    }
}

/// Failure of the pre-run connectivity check
#[derive(Error, Debug, Clone)]
pub enum ExecutorError {
    /// Backend could not be reached
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Backend answered with something unusable
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// Failure to obtain a health sample; never toggles pause state
#[derive(Error, Debug, Clone)]
pub enum ProbeError {
    /// Probe source unavailable this cycle
    #[error("Probe unavailable: {0}")]
    Unavailable(String),

    /// Probe returned data that could not be interpreted
    #[error("Malformed probe sample: {0}")]
    Malformed(String),
}
