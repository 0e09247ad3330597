// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The plan/ensure protocol shared by every convergeable resource.

use crate::errors::{ContractError, MultiError};

use async_trait::async_trait;
use slog::{debug, warn, Logger};
use std::future::Future;

/// What an ensure action reports when it did not fail.
///
/// An action can succeed without the resource being converged yet, e.g. a
/// node is still rebooting into a new version.  Callers treat that as "try
/// again next pass", never as an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct EnsureOutcome {
    pub done: bool,
}

impl EnsureOutcome {
    pub const DONE: EnsureOutcome = EnsureOutcome { done: true };
    pub const PENDING: EnsureOutcome = EnsureOutcome { done: false };

    /// Done only if both are done.
    pub fn and(self, other: EnsureOutcome) -> EnsureOutcome {
        EnsureOutcome { done: self.done && other.done }
    }
}

/// A planned, not yet executed, set of side effects.
///
/// Implementations are plain values so the plan can be inspected (and
/// asserted on) before anything touches live infrastructure.  Executing the
/// same action twice must be harmless, and an action planned from already
/// converged state must report [`EnsureAction::is_noop`].
#[async_trait]
pub trait EnsureAction: std::fmt::Debug + Send + Sync {
    /// What the action is executed against: a machine, a cluster client, ...
    type Target: ?Sized + Send + Sync;
    type Error: Send;

    /// True when executing the action would not change anything.
    fn is_noop(&self) -> bool;

    async fn ensure(
        &self,
        log: &Logger,
        target: &Self::Target,
    ) -> Result<EnsureOutcome, Self::Error>;
}

/// Runs `fut` on its own task and waits for its single result.
///
/// This is not about parallelism: the caller blocks until the adapter is
/// finished.  A panic inside the adapter becomes
/// [`ContractError::AdapterPanicked`] instead of unwinding into the caller.
pub async fn run_isolated<F>(
    what: &str,
    fut: F,
) -> Result<F::Output, ContractError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(output) => Ok(output),
        Err(err) if err.is_panic() => {
            Err(ContractError::from_panic(what, err.into_panic()))
        }
        Err(_) => {
            Err(ContractError::AdapterCancelled { what: what.to_string() })
        }
    }
}

/// Ensures each of `actions` in order against `target`.
///
/// A failing action does not stop its siblings; every failure is returned.
/// The combined outcome is done only if every action reported done.
pub async fn ensure_siblings<'a, A, I>(
    log: &Logger,
    actions: I,
    target: &A::Target,
) -> Result<EnsureOutcome, MultiError<A::Error>>
where
    A: EnsureAction + 'a,
    I: IntoIterator<Item = &'a A>,
{
    let mut outcome = EnsureOutcome::DONE;
    let mut errors = MultiError::new();
    for action in actions {
        if action.is_noop() {
            debug!(log, "skipping no-op action"; "action" => ?action);
            continue;
        }
        match action.ensure(log, target).await {
            Ok(o) => outcome = outcome.and(o),
            Err(err) => {
                warn!(log, "ensure action failed"; "action" => ?action);
                errors.push(err);
            }
        }
    }
    errors.into_result().map(|()| outcome)
}

#[cfg(test)]
mod test {
    use super::*;
    use fleet_test_utils::dev::test_setup_log;
    use std::sync::Mutex;

    /// Converges a counter towards a desired value in one step.
    #[derive(Debug)]
    struct SetCounter {
        name: &'static str,
        desired: u32,
        current: u32,
    }

    fn plan(name: &'static str, desired: u32, live: &Live) -> SetCounter {
        let current = live.lock().unwrap().get(name).copied().unwrap_or(0);
        SetCounter { name, desired, current }
    }

    type Live = Mutex<std::collections::BTreeMap<&'static str, u32>>;

    #[async_trait]
    impl EnsureAction for SetCounter {
        type Target = Live;
        type Error = String;

        fn is_noop(&self) -> bool {
            self.desired == self.current
        }

        async fn ensure(
            &self,
            _log: &Logger,
            target: &Live,
        ) -> Result<EnsureOutcome, String> {
            if self.name == "broken" {
                return Err(format!("{} is broken", self.name));
            }
            target.lock().unwrap().insert(self.name, self.desired);
            Ok(EnsureOutcome::DONE)
        }
    }

    #[tokio::test]
    async fn test_second_plan_is_noop() {
        let logctx = test_setup_log("test_second_plan_is_noop");
        let live = Live::default();

        let first = plan("a", 3, &live);
        assert!(!first.is_noop());
        assert_eq!(
            first.ensure(&logctx.log, &live).await,
            Ok(EnsureOutcome::DONE)
        );

        let second = plan("a", 3, &live);
        assert!(second.is_noop());

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_siblings_run_past_failures() {
        let logctx = test_setup_log("test_siblings_run_past_failures");
        let live = Live::default();
        let actions = vec![
            plan("a", 1, &live),
            plan("broken", 1, &live),
            plan("b", 2, &live),
        ];

        let errs = ensure_siblings(&logctx.log, &actions, &live)
            .await
            .expect_err("one sibling is broken");
        assert_eq!(errs.errors(), ["broken is broken".to_string()]);
        assert_eq!(live.lock().unwrap().get("a"), Some(&1));
        assert_eq!(live.lock().unwrap().get("b"), Some(&2));

        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_isolated_panic_becomes_error() {
        let result = run_isolated("query", async {
            if true {
                panic!("adapter exploded");
            }
            1
        })
        .await;
        match result {
            Err(ContractError::AdapterPanicked { what, message }) => {
                assert_eq!(what, "query");
                assert_eq!(message, "adapter exploded");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        assert_eq!(run_isolated("query", async { 7 }).await.unwrap(), 7);
    }
}
