//! Error accumulation.

use std::fmt;

use thiserror::Error;

/// Collects errors from a sequence of independent steps so every step runs
/// even when an earlier one fails.
///
/// ```
/// use savannah_utils::Errors;
///
/// let mut errs = Errors::new();
/// errs.add_result::<(), _>(Err("chain A"));
/// errs.add_result::<(), &str>(Ok(()));
/// assert_eq!(errs.len(), 1);
/// assert!(errs.into_result().is_err());
/// ```
#[derive(Debug, Default, Clone)]
pub struct Errors {
    errors: Vec<String>,
}

/// Every error an [`Errors`] collected, joined with `; `.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct ErrorCollection(pub Vec<String>);

impl Errors {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<E: fmt::Display>(&mut self, error: E) {
        self.errors.push(error.to_string());
    }

    /// Records the error, if any, and passes the success value through.
    pub fn add_result<T, E: fmt::Display>(&mut self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.add(e);
                None
            }
        }
    }

    #[must_use]
    pub fn errored(&self) -> bool {
        !self.errors.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// # Errors
    ///
    /// Returns every collected error if there was at least one.
    pub fn into_result(self) -> Result<(), ErrorCollection> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ErrorCollection(self.errors))
        }
    }
}
