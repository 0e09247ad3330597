// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by every reconciler in the fleet control plane.
//!
//! Each convergeable resource follows the same two-phase protocol:
//!
//! 1. *Planning* inspects desired, current, and live state and returns an
//!    ensure action: a plain value describing exactly which side effects are
//!    needed.  Planning never changes anything.
//! 2. *Ensuring* executes that action against a live target and reports
//!    whether the resource has converged.
//!
//! The [`contract`] module defines the pieces of that protocol, [`fanout`]
//! runs many independent operations and keeps every failure, and [`backoff`]
//! holds the retry policies used where a bounded in-process retry is allowed.

pub mod backoff;
pub mod contract;
pub mod fanout;

mod errors;

pub use contract::{EnsureAction, EnsureOutcome};
pub use errors::{ContractError, MultiError};
