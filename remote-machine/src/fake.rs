// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A machine which records its inputs and responds as the test dictates.

use crate::host::{log_input, log_output};
use crate::{
    BoxedMachine, CommandFailureInfo, ExecutionError, FileOp, RemoteMachine,
};

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use slog::Logger;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One interaction with a [`FakeMachine`], in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineCall {
    Execute { command: String, stdin: Option<Vec<u8>> },
    WriteFile { path: Utf8PathBuf, content: Vec<u8>, mode: u32 },
    ReadFile { path: Utf8PathBuf },
}

/// What a fake command "printed" and how it exited.
#[derive(Debug, Clone, Default)]
pub struct FakeOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    /// Files a successful command leaves behind on the machine.
    pub files: Vec<(Utf8PathBuf, Vec<u8>)>,
}

impl FakeOutput {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self { stdout: stdout.into(), ..Self::default() }
    }

    pub fn failure(status: i32, stderr: impl Into<String>) -> Self {
        Self { status, stderr: stderr.into(), ..Self::default() }
    }

    pub fn with_file(
        mut self,
        path: impl Into<Utf8PathBuf>,
        content: &[u8],
    ) -> Self {
        self.files.push((path.into(), content.to_vec()));
        self
    }
}

/// Handler called for every executed command.
pub type ExecuteFn = dyn FnMut(&str) -> FakeOutput + Send;
pub type BoxedExecuteFn = Box<ExecuteFn>;

/// Handler called for every file write, before the write is recorded.
pub type WriteFn =
    dyn FnMut(&Utf8Path, &[u8]) -> Result<(), std::io::Error> + Send;
pub type BoxedWriteFn = Box<WriteFn>;

/// A machine which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeMachine {
    log: Logger,
    id: String,
    ip: IpAddr,
    counter: AtomicU64,
    calls: Mutex<Vec<MachineCall>>,
    files: Mutex<BTreeMap<Utf8PathBuf, Vec<u8>>>,
    execute_handler: Mutex<BoxedExecuteFn>,
    write_handler: Mutex<BoxedWriteFn>,
}

impl FakeMachine {
    pub fn new(log: &Logger, id: impl Into<String>, ip: IpAddr) -> Arc<Self> {
        let id = id.into();
        Arc::new(Self {
            log: log.new(slog::o!("machine" => id.clone(), "fake" => true)),
            id,
            ip,
            counter: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            files: Mutex::new(BTreeMap::new()),
            execute_handler: Mutex::new(Box::new(|_| FakeOutput::success())),
            write_handler: Mutex::new(Box::new(|_, _| Ok(()))),
        })
    }

    /// Set the command handler to an arbitrary function.
    pub fn set_execute_handler(&self, f: BoxedExecuteFn) {
        *self.execute_handler.lock().unwrap() = f;
    }

    /// Set the file write handler to an arbitrary function.
    pub fn set_write_handler(&self, f: BoxedWriteFn) {
        *self.write_handler.lock().unwrap() = f;
    }

    /// Places a file on the machine without recording a call.
    pub fn insert_file(&self, path: impl Into<Utf8PathBuf>, content: &[u8]) {
        self.files.lock().unwrap().insert(path.into(), content.to_vec());
    }

    pub fn file(&self, path: &Utf8Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn calls(&self) -> Vec<MachineCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Only the executed commands, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                MachineCall::Execute { command, .. } => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_machine(self: Arc<Self>) -> BoxedMachine {
        self
    }

    fn record(&self, call: MachineCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteMachine for FakeMachine {
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
        self.record(MachineCall::Execute {
            command: command.to_string(),
            stdin: stdin.map(|s| s.to_vec()),
        });

        let output = self.execute_handler.lock().unwrap()(command);
        log_output(
            &self.log,
            id,
            Some(output.status),
            output.stdout.as_bytes(),
            output.stderr.as_bytes(),
        );

        if output.status != 0 {
            return Err(ExecutionError::CommandFailure(Box::new(
                CommandFailureInfo {
                    machine: self.id.clone(),
                    command: command.to_string(),
                    status: Some(output.status),
                    stdout: output.stdout,
                    stderr: output.stderr,
                },
            )));
        }
        self.files.lock().unwrap().extend(output.files);
        Ok(output.stdout)
    }

    async fn write_file(
        &self,
        path: &Utf8Path,
        content: &[u8],
        mode: u32,
    ) -> Result<(), ExecutionError> {
        self.record(MachineCall::WriteFile {
            path: path.to_owned(),
            content: content.to_vec(),
            mode,
        });
        self.write_handler.lock().unwrap()(path, content).map_err(|err| {
            ExecutionError::FileTransfer {
                machine: self.id.clone(),
                op: FileOp::Write,
                path: path.to_owned(),
                err,
            }
        })?;
        self.files.lock().unwrap().insert(path.to_owned(), content.to_vec());
        Ok(())
    }

    async fn read_file(
        &self,
        path: &Utf8Path,
    ) -> Result<Vec<u8>, ExecutionError> {
        self.record(MachineCall::ReadFile { path: path.to_owned() });
        self.file(path).ok_or_else(|| ExecutionError::FileTransfer {
            machine: self.id.clone(),
            op: FileOp::Read,
            path: path.to_owned(),
            err: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}
