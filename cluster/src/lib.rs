// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reconciles a Kubernetes cluster's pools, version, and membership towards
//! a declared topology.
//!
//! A pass is driven by [`takeoff::takeoff`]: the desired and current state
//! are read from a [`store::StateStore`], [`cluster::ClusterReconciler::query`]
//! computes a [`cluster::ClusterPlan`], and ensuring it runs the commands on
//! the computes handed out by each provider's [`pool::InfraPool`].

pub mod bootstrap;
pub mod cluster;
pub mod config;
mod error;
pub mod join;
pub mod model;
pub mod network;
pub mod pool;
pub mod resources;
pub mod scale;
pub mod store;
pub mod takeoff;
pub mod version;

#[cfg(any(test, feature = "testing"))]
pub mod fakes;

pub use error::Error;
