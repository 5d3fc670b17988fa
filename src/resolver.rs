//! Display names and categories for activations
//!
//! Names look like `module.Class.function`, where the class part is a
//! best-effort guess from the first bound local and may be missing.
//! Results are cached per activation and dropped as soon as the activation
//! is seen finishing, because hosts hand the same identity to unrelated
//! activations later on.

use crate::frame::{ActivationId, Frame};
use fnv::FnvHashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

/// Resolved display identity of an activation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedName {
    pub name: String,
    pub category: String,
}

/// Per-activation name cache
#[derive(Debug, Default)]
pub struct NameResolver {
    cache: FnvHashMap<ActivationId, ResolvedName>,
}

impl NameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `frame`, reusing the cached entry when present.
    ///
    /// With `release` the entry is evicted instead of stored; callers pass
    /// it on the activation's final return.
    pub fn resolve(&mut self, frame: &dyn Frame, release: bool) -> ResolvedName {
        let id = frame.id();
        if release {
            return self
                .cache
                .remove(&id)
                .unwrap_or_else(|| Self::describe(frame));
        }
        self.cache
            .entry(id)
            .or_insert_with(|| Self::describe(frame))
            .clone()
    }

    /// Drop the entry for an activation destroyed without a final return
    pub fn evict(&mut self, id: ActivationId) -> bool {
        self.cache.remove(&id).is_some()
    }

    /// Number of live cache entries
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Uncached resolution
    pub fn describe(frame: &dyn Frame) -> ResolvedName {
        ResolvedName {
            name: Self::frame_name(frame),
            category: frame.code().category(),
        }
    }

    pub fn frame_name(frame: &dyn Frame) -> String {
        let code = frame.code();
        let class = Self::class_name(frame)
            .map(|class| format!(".{}", class))
            .unwrap_or_default();
        format!("{}{}.{}", Self::module_name(code.path()), class, code.name())
    }

    /// Type of the first bound local, if it owns a callable named like the
    /// code unit. Receivers that panic are treated as "no class".
    pub fn class_name(frame: &dyn Frame) -> Option<String> {
        let receiver = frame.receiver()?;
        let name = frame.code().name();
        panic::catch_unwind(AssertUnwindSafe(|| {
            if receiver.has_callable(name) {
                receiver.type_name()
            } else {
                None
            }
        }))
        .ok()
        .flatten()
    }

    /// File stem, qualified by the parent directory for package entry files
    pub fn module_name(path: &str) -> String {
        let path = Path::new(path);
        let stem = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        if stem == "__init__" || stem == "__main__" {
            let parent = path
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            return format!("{}.{}", parent, stem);
        }

        stem
    }
}
