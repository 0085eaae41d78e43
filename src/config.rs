//! Process-wide configuration and small option types.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Version tag written into every serialized grammar, tokenizer and
/// compiled grammar. Payloads carrying another version are rejected.
pub const SERIALIZATION_VERSION: &str = "v1";

/// Default ceiling on nested rule expansions during matching.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 10_000;

static MAX_RECURSION_DEPTH: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_RECURSION_DEPTH);

/// Current process-wide recursion ceiling. Matchers read it once when they
/// are constructed.
pub fn get_max_recursion_depth() -> usize {
    MAX_RECURSION_DEPTH.load(Ordering::Relaxed)
}

/// Replace the process-wide recursion ceiling. Existing matchers keep the
/// value they captured.
pub fn set_max_recursion_depth(depth: usize) {
    MAX_RECURSION_DEPTH.store(depth.max(1), Ordering::Relaxed);
}

pub fn serialization_version() -> &'static str {
    SERIALIZATION_VERSION
}

/// An option that is either left to its default or explicitly set.
///
/// `Set(vec![])` and `Unset` are different things for stop tokens: the first
/// means "no stop tokens at all", the second "use the tokenizer's".
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Setting<T> {
    #[default]
    Unset,
    Set(T),
}

impl<T> Setting<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Setting::Set(_))
    }

    pub fn as_ref(&self) -> Setting<&T> {
        match self {
            Setting::Unset => Setting::Unset,
            Setting::Set(v) => Setting::Set(v),
        }
    }

    /// The explicit value, or `default` when unset.
    pub fn unwrap_or(self, default: T) -> T {
        match self {
            Setting::Unset => default,
            Setting::Set(v) => v,
        }
    }

    pub fn unwrap_or_else(self, default: impl FnOnce() -> T) -> T {
        match self {
            Setting::Unset => default(),
            Setting::Set(v) => v,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Setting::Unset => None,
            Setting::Set(v) => Some(v),
        }
    }
}

impl<T> From<Option<T>> for Setting<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Setting::Set(v),
            None => Setting::Unset,
        }
    }
}
