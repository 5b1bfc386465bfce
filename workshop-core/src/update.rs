//! The update primitive behind every field action.
//!
//! An update is either a literal replacement or a function of the current
//! value. Functions only ever see a shared reference, so the previous value
//! is untouched and callers can compare old against new afterwards.

use std::fmt;

pub enum Update<T> {
    /// Replace the current value wholesale.
    Replace(T),
    /// Compute the next value from the current one.
    Apply(Box<dyn FnOnce(&T) -> T + Send>),
}

impl<T> Update<T> {
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(&T) -> T + Send + 'static,
    {
        Update::Apply(Box::new(f))
    }
}

impl<T> From<T> for Update<T> {
    fn from(value: T) -> Self {
        Update::Replace(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Update<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::Replace(v) => f.debug_tuple("Replace").field(v).finish(),
            Update::Apply(_) => f.write_str("Apply(..)"),
        }
    }
}

/// Compute the next value of a field from its current value.
pub fn apply_update<T>(current: &T, update: Update<T>) -> T {
    match update {
        Update::Replace(next) => next,
        Update::Apply(f) => f(current),
    }
}
