// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::model::PoolKey;
use crate::resources::ClientError;

use fleet_common::{ContractError, MultiError};
use remote_machine::{ExecutionError, RemoteMachine};

/// Errors returned while reconciling a cluster.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The desired state violates an invariant.  Nothing was attempted.
    #[error("invalid desired state: {0}")]
    Validation(String),

    /// The changes for one resource could not be computed.
    #[error("planning {resource} failed: {reason}")]
    Planning { resource: String, reason: String },

    #[error("{operation} on {machine} failed")]
    Execution {
        machine: String,
        operation: String,
        #[source]
        err: ExecutionError,
    },

    #[error("tearing down the cluster failed")]
    Teardown(#[source] MultiError<Error>),

    #[error("{operation} through the cluster API failed")]
    Cluster {
        operation: String,
        #[source]
        err: ClientError,
    },

    #[error("{operation} in pool {pool} failed: {err:#}")]
    Provider { pool: PoolKey, operation: String, err: anyhow::Error },

    #[error("{operation} failed: {err:#}")]
    State { operation: String, err: anyhow::Error },

    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl Error {
    /// Wraps a failure of `operation` on `machine`, for use with `map_err`.
    pub(crate) fn execution<'a>(
        machine: &'a dyn RemoteMachine,
        operation: &'a str,
    ) -> impl FnOnce(ExecutionError) -> Error + 'a {
        move |err| Error::Execution {
            machine: machine.id().to_string(),
            operation: operation.to_string(),
            err,
        }
    }

    pub(crate) fn cluster(
        operation: &str,
    ) -> impl FnOnce(ClientError) -> Error + '_ {
        move |err| Error::Cluster { operation: operation.to_string(), err }
    }

    pub(crate) fn provider<'a>(
        pool: &'a PoolKey,
        operation: &'a str,
    ) -> impl FnOnce(anyhow::Error) -> Error + 'a {
        move |err| Error::Provider {
            pool: pool.clone(),
            operation: operation.to_string(),
            err,
        }
    }
}
