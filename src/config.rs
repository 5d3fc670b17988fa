//! Tracer configuration
//!
//! Builder-style settings shared by every tracer flavour, with an
//! environment loader for embedders that cannot pass settings in code.
//!
//! # Example
//! ```
//! use panopticon::config::TracerConfig;
//! use panopticon::predicate::Predicate;
//!
//! let config = TracerConfig::new()
//!     .with_skip(Predicate::native())
//!     .with_capture_args(Predicate::always())
//!     .with_trace_threads(true);
//! assert!(config.trace_threads);
//! ```

use crate::predicate::{Predicate, PredicateError};

/// Skip expression, parsed by [`Predicate::from_expr`]
pub const ENV_SKIP: &str = "PANOPTICON_SKIP";

/// Truthy value enables argument capture for every notification
pub const ENV_CAPTURE_ARGS: &str = "PANOPTICON_CAPTURE_ARGS";

/// Truthy value makes new threads inherit the tracer
pub const ENV_TRACE_THREADS: &str = "PANOPTICON_TRACE_THREADS";

/// Settings for a tracer
#[derive(Debug, Clone, Default)]
pub struct TracerConfig {
    /// User skip filter, unioned with the recorder's own exclusions
    pub skip: Option<Predicate>,

    /// Decides per notification whether arguments and return values are
    /// captured
    pub capture_args: Option<Predicate>,

    /// Also become the default observer for threads started via
    /// [`crate::observer::spawn`]
    pub trace_threads: bool,
}

impl TracerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skip(mut self, skip: Predicate) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_capture_args(mut self, capture: Predicate) -> Self {
        self.capture_args = Some(capture);
        self
    }

    pub fn with_trace_threads(mut self, enabled: bool) -> Self {
        self.trace_threads = enabled;
        self
    }

    /// Load settings from `PANOPTICON_*` environment variables
    pub fn from_env() -> Result<Self, PredicateError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, PredicateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();

        if let Some(expr) = lookup(ENV_SKIP).filter(|expr| !expr.trim().is_empty()) {
            config.skip = Some(Predicate::from_expr(&expr)?);
        }

        if lookup(ENV_CAPTURE_ARGS).is_some_and(|value| is_truthy(&value)) {
            config.capture_args = Some(Predicate::always());
        }

        config.trace_threads = lookup(ENV_TRACE_THREADS).is_some_and(|value| is_truthy(&value));

        Ok(config)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
