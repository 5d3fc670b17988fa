//! Predicates over notifications
//!
//! Used both as skip filters (drop a notification before anything else sees
//! it) and to decide when to capture arguments. Predicates compose with
//! [`Predicate::and`], [`Predicate::or`] and `!`.
//!
//! A small expression language covers the common cases for configuration:
//! - `native`: native call/return/exception events
//! - `module=NAME`: units whose parent directory is `NAME`
//! - `file=PREFIX`: units whose path starts with `PREFIX`
//! - `file~REGEX`: units whose path matches `REGEX`
//!
//! Terms are comma separated and OR-ed; a leading `!` negates a term.

use crate::frame::{ActivationEvent, Frame, Payload};
use regex::Regex;
use std::fmt;
use std::ops::Not;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

type PredicateFn = dyn for<'a> Fn(&'a dyn Frame, ActivationEvent, Payload<'a>) -> bool + Send + Sync;

/// Errors from parsing predicate expressions
#[derive(Error, Debug)]
pub enum PredicateError {
    #[error("Empty predicate expression")]
    Empty,

    #[error("Empty term in predicate expression: {0:?}")]
    EmptyTerm(String),

    #[error("Unknown predicate term: {0:?}. Expected native, module=NAME, file=PREFIX or file~REGEX")]
    UnknownTerm(String),

    #[error("Invalid file regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A shareable boolean test over `(frame, event, payload)`
#[derive(Clone)]
pub struct Predicate {
    test: Arc<PredicateFn>,
}

impl Predicate {
    pub fn new<F>(test: F) -> Self
    where
        F: for<'a> Fn(&'a dyn Frame, ActivationEvent, Payload<'a>) -> bool + Send + Sync + 'static,
    {
        Self {
            test: Arc::new(test),
        }
    }

    pub fn matches(&self, frame: &dyn Frame, event: ActivationEvent, payload: Payload<'_>) -> bool {
        (self.test)(frame, event, payload)
    }

    pub fn always() -> Self {
        Self::new(|_, _, _| true)
    }

    pub fn never() -> Self {
        Self::new(|_, _, _| false)
    }

    /// Test the defining unit's path
    pub fn file<F>(test: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::new(move |frame, _, _| test(frame.code().path()))
    }

    pub fn file_matches(pattern: Regex) -> Self {
        Self::file(move |path| pattern.is_match(path))
    }

    /// Guesses the module from the unit's path and compares exactly
    pub fn module_equals(module: impl Into<String>) -> Self {
        let module = module.into();
        Self::file(move |path| extract_module(path) == module)
    }

    /// Native call/return/exception events
    pub fn native() -> Self {
        Self::new(|_, event, _| event.is_native())
    }

    /// Units defined in this crate's own sources, plus anything that looks
    /// like it lives in a `panopticon` package.
    pub fn recorder_internals() -> Self {
        const OWN_SOURCES: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/src/");
        Self::module_equals(env!("CARGO_PKG_NAME"))
            .or(Self::file(|path| path.starts_with(OWN_SOURCES)))
    }

    pub fn and(self, other: Predicate) -> Self {
        Self::new(move |frame, event, payload| {
            self.matches(frame, event, payload) && other.matches(frame, event, payload)
        })
    }

    pub fn or(self, other: Predicate) -> Self {
        Self::new(move |frame, event, payload| {
            self.matches(frame, event, payload) || other.matches(frame, event, payload)
        })
    }

    /// Parse an expression like `native,module=asyncio,!file~^/usr/lib`
    pub fn from_expr(expr: &str) -> Result<Self, PredicateError> {
        if expr.trim().is_empty() {
            return Err(PredicateError::Empty);
        }

        let mut combined: Option<Predicate> = None;
        for term in expr.split(',') {
            if term.trim().is_empty() {
                return Err(PredicateError::EmptyTerm(expr.to_string()));
            }
            let term = Self::from_term(term)?;
            combined = Some(match combined {
                Some(acc) => acc.or(term),
                None => term,
            });
        }
        Ok(combined.unwrap_or_else(Predicate::never))
    }

    fn from_term(term: &str) -> Result<Self, PredicateError> {
        let term = term.trim();
        if term.is_empty() {
            return Err(PredicateError::EmptyTerm(term.to_string()));
        }

        if let Some(negated) = term.strip_prefix('!') {
            return Ok(!Self::from_term(negated)?);
        }

        if term == "native" {
            Ok(Self::native())
        } else if let Some(module) = term.strip_prefix("module=") {
            Ok(Self::module_equals(module))
        } else if let Some(prefix) = term.strip_prefix("file=") {
            let prefix = prefix.to_string();
            Ok(Self::file(move |path| path.starts_with(&prefix)))
        } else if let Some(pattern) = term.strip_prefix("file~") {
            let regex = Regex::new(pattern).map_err(|source| PredicateError::Regex {
                pattern: pattern.to_string(),
                source,
            })?;
            Ok(Self::file_matches(regex))
        } else {
            Err(PredicateError::UnknownTerm(term.to_string()))
        }
    }
}

impl Not for Predicate {
    type Output = Predicate;

    fn not(self) -> Predicate {
        Predicate::new(move |frame, event, payload| !self.matches(frame, event, payload))
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Name of the directory containing `path` (the unit's package)
pub fn extract_module(path: &str) -> String {
    Path::new(path)
        .parent()
        .and_then(Path::file_name)
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
