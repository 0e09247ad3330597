// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives a single reconciliation pass from and back to the state store.

use crate::cluster::ClusterReconciler;
use crate::model::MasterKey;
use crate::store::DesiredDocument;
use crate::Error;

use anyhow::Context;
use fleet_common::contract::run_isolated;
use fleet_common::{EnsureAction, EnsureOutcome};
use slog::{error, info, o, Logger};
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

/// What a pass achieved.
#[derive(Debug)]
pub struct PassReport {
    pub outcome: EnsureOutcome,
    /// Failures of a best-effort teardown, which do not fail the pass.
    pub teardown: Option<Error>,
}

/// Runs one pass: reads the state, queries, ensures, and writes the state
/// back.
///
/// The current state and the node agent specs are written even when
/// ensuring fails.  A failed query is recorded in the store and nothing is
/// changed.
pub async fn takeoff(
    log: &Logger,
    reconciler: &ClusterReconciler,
    key: &MasterKey,
) -> anyhow::Result<PassReport> {
    let log = log.new(o!("cluster" => reconciler.config().cluster_id.clone()));
    let store = reconciler.store();

    let DesiredDocument { spec: desired, migrated } =
        store.desired(key).await.context("reading desired state")?;
    if migrated {
        store
            .push_desired(&desired, key, "Desired state migrated")
            .await
            .context("writing migrated desired state")?;
        info!(log, "Desired state migrated");
    }
    let mut current =
        store.current(key).await.context("reading current state")?;
    let agents_current = store
        .node_agents_current()
        .await
        .context("reading node agents' current state")?;
    let agents_desired = store
        .node_agents_desired()
        .await
        .context("reading node agents' desired state")?;

    let query = {
        let reconciler = reconciler.clone();
        let log = log.clone();
        let desired = desired.clone();
        let current = current.clone();
        let agents_current = agents_current.clone();
        let agents_desired = agents_desired.clone();
        run_isolated("querying cluster", async move {
            reconciler
                .query(
                    &log,
                    &desired,
                    &current,
                    &agents_current,
                    &agents_desired,
                )
                .await
        })
        .await
        .map_err(Error::from)
        .and_then(|query| query)
    };
    let plan = match query {
        Ok(plan) => plan,
        Err(err) => {
            let message = InlineErrorChain::new(&err).to_string();
            error!(log, "Querying cluster failed"; "error" => &message);
            store
                .push_error(&message)
                .await
                .context("recording failed query")?;
            return Err(err.into());
        }
    };

    plan.record_observed(&mut current);
    store
        .push_current(
            &current,
            &agents_desired,
            key,
            "Current state reconciled",
        )
        .await
        .context("writing current state")?;

    if plan.is_noop() {
        info!(log, "Desired state is ensured");
        return Ok(PassReport { outcome: EnsureOutcome::DONE, teardown: None });
    }

    let pass =
        Arc::new(reconciler.pass(current, agents_current, agents_desired));
    let ensured = {
        let plan = Arc::new(plan);
        let pass = Arc::clone(&pass);
        let log = log.clone();
        run_isolated("ensuring cluster", async move {
            plan.ensure(&log, &*pass).await
        })
        .await
        .map_err(Error::from)
        .and_then(|ensured| ensured)
    };
    let state = pass.take();

    let message = match &ensured {
        Ok(outcome) if outcome.done => "Desired state ensured",
        Ok(_) => "Desired state not yet ensured",
        Err(_) => "Ensuring desired state failed",
    };
    store
        .push_current(&state.current, &state.agents_desired, key, message)
        .await
        .context("writing current state")?;

    match ensured {
        Ok(outcome) => {
            info!(log, "{}", message; "done" => outcome.done);
            let teardown = state.teardown.map(Error::Teardown);
            Ok(PassReport { outcome, teardown })
        }
        Err(err) => {
            let message = InlineErrorChain::new(&err).to_string();
            error!(log, "Ensuring cluster failed"; "error" => &message);
            store
                .push_error(&message)
                .await
                .context("recording failed ensure")?;
            Err(err.into())
        }
    }
}
