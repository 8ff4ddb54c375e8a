//! The container backend runs the algorithm of a task in isolation.
//!
//! A backend schedules a run and returns right away. The outcome of every run
//! is delivered as a [`Completion`] on the channel the backend was created
//! with, killed runs included.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use vantage6_core::TaskRef;

/// Everything a backend needs to run the algorithm of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    pub result_id: u64,
    pub run_id: u64,
    pub task: TaskRef,
    /// The token the algorithm uses to talk to the proxy server.
    pub token: String,
    pub database_uri: String,
    /// The decrypted input.
    pub input: Vec<u8>,
}

/// The outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result_id: u64,
    pub task_id: u64,
    pub run_id: u64,
    pub status_code: i32,
    /// The unencrypted output of the algorithm.
    pub output: Vec<u8>,
    pub log: String,
}

impl Completion {
    pub fn failed(&self) -> bool {
        self.status_code != 0
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("`{command}` exited with {status}: {stderr}")]
    Command {
        command: String,
        status: i32,
        stderr: String,
    },
}

#[async_trait]
pub trait ContainerBackend: Send + Sync + 'static {
    /// Schedules `run`. Running a result that is running already is a no-op.
    async fn run(&self, run: ContainerRun) -> Result<(), BackendError>;

    /// Kills the run of result `result_id`. Returns `false` if it isn't
    /// running.
    async fn kill(&self, result_id: u64) -> bool;

    /// Kills every run and returns how many were killed.
    async fn kill_all(&self) -> usize;
}
