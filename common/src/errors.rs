// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use slog_error_chain::InlineErrorChain;
use std::fmt;

/// Failures of the isolation layer itself, as opposed to failures reported
/// by the adapter it ran.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("{what} panicked: {message}")]
    AdapterPanicked { what: String, message: String },

    #[error("{what} was cancelled before it completed")]
    AdapterCancelled { what: String },
}

impl ContractError {
    pub(crate) fn from_panic(
        what: &str,
        payload: Box<dyn std::any::Any + Send>,
    ) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        ContractError::AdapterPanicked { what: what.to_string(), message }
    }
}

/// Every failure out of a group of independent operations.
///
/// Order follows completion order.  Nothing is ever dropped: a group of `N`
/// failed operations produces exactly `N` entries.
#[derive(Debug)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> Default for MultiError<E> {
    fn default() -> Self {
        Self { errors: Vec::new() }
    }
}

impl<E> MultiError<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: E) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<E> {
        self.errors
    }

    /// `Ok(())` when nothing failed, otherwise `Err(self)`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<E> FromIterator<E> for MultiError<E> {
    fn from_iter<I: IntoIterator<Item = E>>(iter: I) -> Self {
        Self { errors: iter.into_iter().collect() }
    }
}

impl<E: std::error::Error + 'static> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} operation(s) failed", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "\n  [{}] {}", i + 1, InlineErrorChain::new(err))?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for MultiError<E> {}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("step {step} failed")]
    struct StepError {
        step: usize,
        #[source]
        err: std::io::Error,
    }

    fn step_error(step: usize) -> StepError {
        StepError {
            step,
            err: std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        }
    }

    #[test]
    fn test_multi_error_keeps_everything() {
        let errs: MultiError<StepError> = (1..=3).map(step_error).collect();
        assert_eq!(errs.len(), 3);
        let rendered = errs.to_string();
        assert!(rendered.starts_with("3 operation(s) failed"));
        assert!(rendered.contains("[1] step 1 failed: disk gone"));
        assert!(rendered.contains("[3] step 3 failed: disk gone"));
        assert!(errs.into_result().is_err());

        assert!(MultiError::<StepError>::new().into_result().is_ok());
    }

    #[test]
    fn test_panic_payloads() {
        let err = ContractError::from_panic("query", Box::new("boom"));
        assert_eq!(err.to_string(), "query panicked: boom");
        let err =
            ContractError::from_panic("query", Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "query panicked: bang");
        let err = ContractError::from_panic("query", Box::new(17u32));
        assert!(err.to_string().contains("non-string"));
    }
}
