// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations.

use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Return a policy which retries at a fixed `interval` and gives up once
/// `max_elapsed` has passed since the first attempt.
///
/// This is the only shape of in-process retry the reconcilers use: short,
/// flat, and bounded, for steps such as writing a file to a node whose agent
/// may not be ready yet.
pub fn retry_policy_bounded(
    interval: Duration,
    max_elapsed: Duration,
) -> ::backoff::ExponentialBackoff {
    ::backoff::ExponentialBackoff {
        current_interval: interval,
        initial_interval: interval,
        randomization_factor: 0.0,
        multiplier: 1.0,
        max_interval: interval,
        max_elapsed_time: Some(max_elapsed),
        ..::backoff::ExponentialBackoff::default()
    }
}
