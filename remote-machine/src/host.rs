// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A [`RemoteMachine`] which is the host the reconciler runs on.

use crate::{CommandFailureInfo, ExecutionError, FileOp, RemoteMachine};

use async_trait::async_trait;
use camino::Utf8Path;
use slog::{debug, error, info, Logger};
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

const SHELL: &str = "/bin/sh";

pub(crate) fn log_input(log: &Logger, id: u64, command: &str) {
    info!(log, "running command on machine"; "id" => id, "command" => command);
}

pub(crate) fn log_output(
    log: &Logger,
    id: u64,
    status: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) {
    info!(
        log,
        "finished running command on machine";
        "id" => id,
        "result" => if status == Some(0) { "OK" } else { "ERROR" },
        "status" => status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Runs commands on the local host through `/bin/sh -c`.
///
/// This is what a node agent uses to converge its own machine, e.g. the
/// firewall.
pub struct HostMachine {
    log: Logger,
    id: String,
    ip: IpAddr,
    counter: AtomicU64,
}

impl HostMachine {
    pub fn new(log: &Logger, id: impl Into<String>, ip: IpAddr) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            log: log.new(slog::o!("machine" => id.clone())),
            id,
            ip,
            counter: AtomicU64::new(0),
        })
    }

    pub fn as_machine(self: Arc<Self>) -> crate::BoxedMachine {
        self
    }

    fn start_error(
        &self,
        command: &str,
        err: std::io::Error,
    ) -> ExecutionError {
        ExecutionError::ExecutionStart {
            machine: self.id.clone(),
            command: command.to_string(),
            err,
        }
    }

    fn file_error(
        &self,
        op: FileOp,
        path: &Utf8Path,
        err: std::io::Error,
    ) -> ExecutionError {
        ExecutionError::FileTransfer {
            machine: self.id.clone(),
            op,
            path: path.to_owned(),
            err,
        }
    }
}

#[async_trait]
impl RemoteMachine for HostMachine {
    fn id(&self) -> &str {
        &self.id
    }

    fn ip(&self) -> IpAddr {
        self.ip
    }

    async fn execute(
        &self,
        stdin: Option<&[u8]>,
        command: &str,
    ) -> Result<String, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);

        let mut child = Command::new(SHELL)
            .arg("-c")
            .arg(command)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                error!(self.log, "Could not start program!"; "id" => id);
                self.start_error(command, err)
            })?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)
                    .await
                    .map_err(|err| self.start_error(command, err))?;
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|err| self.start_error(command, err))?;
        let status = output.status.code();
        log_output(&self.log, id, status, &output.stdout, &output.stderr);

        if !output.status.success() {
            return Err(ExecutionError::CommandFailure(Box::new(
                CommandFailureInfo {
                    machine: self.id.clone(),
                    command: command.to_string(),
                    status,
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                },
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn write_file(
        &self,
        path: &Utf8Path,
        content: &[u8],
        mode: u32,
    ) -> Result<(), ExecutionError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.file_error(FileOp::Write, path, err))?;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|err| self.file_error(FileOp::Write, path, err))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| self.file_error(FileOp::Write, path, err))?;
        debug!(
            self.log, "wrote file";
            "path" => %path, "bytes" => content.len(),
        );
        Ok(())
    }

    async fn read_file(
        &self,
        path: &Utf8Path,
    ) -> Result<Vec<u8>, ExecutionError> {
        tokio::fs::read(path)
            .await
            .map_err(|err| self.file_error(FileOp::Read, path, err))
    }
}
