// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run many independent operations at once and keep every failure.

use crate::errors::{ContractError, MultiError};

use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// The default number of operations a [`FanOut`] runs at the same time.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// A fixed-size group of tokio tasks whose errors are all collected.
///
/// Unlike a fail-fast join, [`FanOut::join_all`] waits for every spawned
/// operation and returns every error, including panics, which are converted
/// to [`ContractError::AdapterPanicked`].
pub struct FanOut<E> {
    semaphore: Arc<Semaphore>,
    set: JoinSet<Result<(), E>>,
    spawned: usize,
}

impl<E> Default for FanOut<E>
where
    E: From<ContractError> + Send + 'static,
{
    fn default() -> Self {
        FanOut::new()
    }
}

impl<E> FanOut<E>
where
    E: From<ContractError> + Send + 'static,
{
    /// Creates a new [`FanOut`] running at most [`DEFAULT_MAX_PARALLELISM`]
    /// operations at once.
    pub fn new() -> FanOut<E> {
        Self::new_with_parallelism(DEFAULT_MAX_PARALLELISM)
    }

    pub fn new_with_parallelism(max_parallelism: usize) -> FanOut<E> {
        FanOut {
            semaphore: Arc::new(Semaphore::new(max_parallelism.max(1))),
            set: JoinSet::new(),
            spawned: 0,
        }
    }

    /// Spawn `op` immediately; it starts executing once the group is within
    /// its parallelism limit.
    ///
    /// `what` names the operation in the error produced if it panics.
    pub fn spawn<F>(&mut self, what: impl Into<String>, op: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        let what = what.into();
        let semaphore = Arc::clone(&self.semaphore);
        self.spawned += 1;
        self.set.spawn(async move {
            // Hold onto the permit until the operation finishes executing
            let _permit =
                semaphore.acquire_owned().await.expect("semaphore acquire");
            match AssertUnwindSafe(op).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => {
                    Err(E::from(ContractError::from_panic(&what, payload)))
                }
            }
        });
    }

    /// Number of operations spawned so far.
    pub fn len(&self) -> usize {
        self.spawned
    }

    pub fn is_empty(&self) -> bool {
        self.spawned == 0
    }

    /// Wait for every operation and return all of their errors.
    pub async fn join_all(mut self) -> Result<(), MultiError<E>> {
        let mut errors = MultiError::new();
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(_) => errors.push(E::from(
                    ContractError::AdapterCancelled {
                        what: "fan-out operation".to_string(),
                    },
                )),
            }
        }
        errors.into_result()
    }
}
