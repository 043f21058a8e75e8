//! Core traits for the remote execution service.
//!
//! The service itself is external: these traits describe the capability the
//! rest of the workspace relies on (create, run, stop, reconnect by id).

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{future::BoxFuture, stream::BoxStream};
use thiserror::Error;

use crate::{CommandParts, OutputChunk, RuntimeKind};

/// Remote execution service error.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox creation failed: {0}")]
    CreateFailed(String),
    #[error("Sandbox not found: {0}")]
    NotFound(String),
    #[error("Sandbox {0} has been stopped")]
    Stopped(String),
    #[error("Command failed: {0}")]
    CommandFailed(String),
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Command build error: {0}")]
    CommandBuild(#[from] crate::command::CommandBuildError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collected result of a blocking command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// A command started in detached mode.
///
/// `logs` yields output in emission order and ends when the process exits;
/// `wait` resolves to the exit code.
pub struct LiveCommand {
    logs: BoxStream<'static, Result<OutputChunk, SandboxError>>,
    exit: BoxFuture<'static, Result<i32, SandboxError>>,
}

impl LiveCommand {
    /// Assemble a live command from its log feed and exit future.
    #[must_use]
    pub fn new(
        logs: BoxStream<'static, Result<OutputChunk, SandboxError>>,
        exit: BoxFuture<'static, Result<i32, SandboxError>>,
    ) -> Self {
        Self { logs, exit }
    }

    /// Live log feed.
    pub fn logs(&mut self) -> &mut BoxStream<'static, Result<OutputChunk, SandboxError>> {
        &mut self.logs
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    /// Returns error if the remote side loses track of the process.
    pub async fn wait(self) -> Result<i32, SandboxError> {
        self.exit.await
    }
}

impl fmt::Debug for LiveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveCommand").finish_non_exhaustive()
    }
}

/// Handle to one remote execution environment.
#[async_trait]
pub trait SandboxHandle: Send + Sync {
    /// Stable id usable with [`SandboxProvider::get`].
    fn id(&self) -> &str;

    /// Runtime the environment was created with.
    fn runtime(&self) -> RuntimeKind;

    /// Absolute path of the writable workspace directory.
    fn workspace_root(&self) -> &str;

    /// Run a command to completion.
    async fn run(&self, command: &CommandParts) -> Result<CommandOutput, SandboxError>;

    /// Start a command and return its live log feed.
    async fn run_detached(&self, command: &CommandParts) -> Result<LiveCommand, SandboxError>;

    /// Stop the environment.
    async fn stop(&self) -> Result<(), SandboxError>;
}

/// Shared handle.
pub type SharedHandle = Arc<dyn SandboxHandle>;

/// Factory and lookup for remote execution environments.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Allocate a new environment that lives at most `max_lifetime`.
    async fn create(&self, runtime: RuntimeKind, max_lifetime: Duration) -> Result<SharedHandle, SandboxError>;

    /// Reconnect to an existing environment by its id.
    async fn get(&self, remote_id: &str) -> Result<SharedHandle, SandboxError>;
}
