// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The remote-execution capability every reconciler drives.
//!
//! A [`RemoteMachine`] is an addressable compute node which can run shell
//! commands and transfer files.  How the bytes get there (SSH, an agent, the
//! local host) is up to the implementation; the reconcilers only see this
//! trait.
//!
//! - In production, a provider hands out its own implementation, or
//!   [`HostMachine`] when the reconciler runs on the node itself.
//! - Under test, a [`FakeMachine`] records every call and lets the test decide
//!   what each command returns.

use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use std::net::IpAddr;
use std::sync::Arc;

#[cfg(any(test, feature = "testing"))]
mod fake;
mod host;

#[cfg(any(test, feature = "testing"))]
pub use fake::{FakeMachine, FakeOutput, MachineCall};
pub use host::HostMachine;

/// Describes the commonly-used "safe-to-reference" type describing a machine
/// as a trait object.
pub type BoxedMachine = Arc<dyn RemoteMachine>;

/// Describes a node which can run commands and exchange files.
#[async_trait]
pub trait RemoteMachine: Send + Sync {
    /// Identity of the machine, unique across the whole cluster.
    fn id(&self) -> &str;

    /// Address other nodes use to reach this machine.
    fn ip(&self) -> IpAddr;

    /// Runs `command` through a shell, optionally feeding `stdin`, and waits
    /// for it to complete.
    ///
    /// Returns stdout on success.  A non-zero exit is an error.
    async fn execute(
        &self,
        stdin: Option<&[u8]>,
        command: &str,
    ) -> Result<String, ExecutionError>;

    /// Writes `content` to `path`, replacing whatever was there, and applies
    /// the permission bits in `mode`.
    async fn write_file(
        &self,
        path: &Utf8Path,
        content: &[u8],
        mode: u32,
    ) -> Result<(), ExecutionError>;

    /// Reads the full contents of `path`.
    async fn read_file(&self, path: &Utf8Path)
        -> Result<Vec<u8>, ExecutionError>;
}

#[derive(Debug)]
pub struct CommandFailureInfo {
    pub machine: String,
    pub command: String,
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let status = self
            .status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string());
        write!(
            f,
            "Command [{}] on {} executed and failed with status: {}",
            self.command, self.machine, status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOp {
    Read,
    Write,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FileOp::Read => write!(f, "read"),
            FileOp::Write => write!(f, "write"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}] on {machine}: {err}")]
    ExecutionStart { machine: String, command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("failed to {op} {path} on {machine}: {err}")]
    FileTransfer {
        machine: String,
        op: FileOp,
        path: Utf8PathBuf,
        err: std::io::Error,
    },
}

impl ExecutionError {
    /// Returns the exit status of a failed command, if it ran at all.
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecutionError::CommandFailure(info) => info.status,
            _ => None,
        }
    }
}
