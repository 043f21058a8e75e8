//! Execution coordinator.
//!
//! Turns a (language, code, conversation) request into a command on the
//! right sandbox. Conversation-bound runs reuse the conversation's session
//! and stream their output through the broker; runs without a conversation
//! get a disposable sandbox that is stopped afterwards.

use std::{path::Path, sync::Arc, time::Duration};

use futures::StreamExt;
use remote_sandbox_core::{
    CommandParts, OutputBroker, OutputStream, RuntimeKind, SandboxConfig, SandboxError, SandboxHandle,
    SandboxProvider, SharedHandle,
};
use remote_sandbox_session::{Session, SessionKey, SessionRegistry};
use serde::{Deserialize, Serialize};

use crate::{ExecutionResult, Language, WriteFileResult, language::runtime_for_write};

/// Request to run code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub language: Language,
    pub code: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Write `code` here first and run the file instead of inline code.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Sandbox id from an earlier result, adopted on a local miss.
    #[serde(default)]
    pub remote_id: Option<String>,
}

impl ExecuteRequest {
    #[must_use]
    pub fn new<S: Into<String>>(language: Language, code: S) -> Self {
        Self {
            language,
            code: code.into(),
            conversation_id: None,
            file_path: None,
            remote_id: None,
        }
    }

    #[must_use]
    pub fn conversation<S: Into<String>>(mut self, conversation_id: S) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    #[must_use]
    pub fn file<S: Into<String>>(mut self, file_path: S) -> Self {
        self.file_path = Some(file_path.into());
        self
    }
}

/// Request to write a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileRequest {
    pub file_path: String,
    pub content: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Language of the conversation; picks the sandbox the file lands in.
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// Execution coordinator.
pub struct ExecutionCoordinator {
    registry: Arc<SessionRegistry>,
    broker: Arc<OutputBroker>,
    max_output_chars: usize,
    max_lifetime: Duration,
}

impl ExecutionCoordinator {
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, broker: Arc<OutputBroker>, config: &SandboxConfig) -> Self {
        Self {
            registry,
            broker,
            max_output_chars: config.max_output_chars,
            max_lifetime: config.max_lifetime,
        }
    }

    fn provider(&self) -> &Arc<dyn SandboxProvider> {
        self.registry.provider()
    }

    /// Run code and report its output.
    ///
    /// Never fails: errors around the command become a result with exit code 1.
    pub async fn execute(&self, request: &ExecuteRequest) -> ExecutionResult {
        let Some(conversation_id) = request.conversation_id.as_deref() else {
            return self.execute_one_off(request).await;
        };

        let key = SessionKey::new(conversation_id, request.language.runtime());
        self.broker.start(conversation_id);
        let outcome = self.execute_in_session(&key, request).await;
        self.broker.end(conversation_id);

        match outcome {
            Ok(result) => result.truncated(self.max_output_chars),
            Err(e) => {
                tracing::warn!(%key, "Execution failed, dropping session: {e}");
                self.registry.drop_dead(&key).await;
                ExecutionResult::from_error(e)
            }
        }
    }

    async fn execute_in_session(
        &self,
        key: &SessionKey,
        request: &ExecuteRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        let session = self
            .registry
            .acquire_with_hint(&key.conversation_id, key.runtime, request.remote_id.as_deref())
            .await?;
        let handle = session.handle().as_ref();

        let command = self.prepare(handle, Some(&session), request).await?;
        tracing::debug!(%key, %command, "Running streamed command");
        let mut result = self.stream(handle, &command, &key.conversation_id).await?;
        result.remote_id = Some(session.remote_id().to_string());
        Ok(result)
    }

    async fn execute_one_off(&self, request: &ExecuteRequest) -> ExecutionResult {
        let handle = match self.provider().create(request.language.runtime(), self.max_lifetime).await {
            Ok(handle) => handle,
            Err(e) => return ExecutionResult::from_error(e),
        };

        let outcome = self.run_one_off(handle.as_ref(), request).await;
        stop_quietly(&handle).await;

        match outcome {
            Ok(result) => result.truncated(self.max_output_chars),
            Err(e) => ExecutionResult::from_error(e),
        }
    }

    async fn run_one_off(&self, handle: &dyn SandboxHandle, request: &ExecuteRequest) -> Result<ExecutionResult, SandboxError> {
        let command = self.prepare(handle, None, request).await?;
        tracing::debug!(remote_id = handle.id(), %command, "Running one-off command");
        let output = handle.run(&command).await?;
        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            remote_id: None,
        })
    }

    /// Write the source file if asked, install the runner, and build the command.
    async fn prepare(
        &self,
        handle: &dyn SandboxHandle,
        session: Option<&Session>,
        request: &ExecuteRequest,
    ) -> Result<CommandParts, SandboxError> {
        let language = request.language;
        if let Some(path) = request.file_path.as_deref() {
            write_via_shell(handle, path, &request.code).await?;
        }

        match session {
            Some(session) => session.prepare_once(|| install_runner(handle, language)).await,
            None => install_runner(handle, language).await,
        }

        Ok(language.command(&request.code, request.file_path.as_deref())?)
    }

    async fn stream(
        &self,
        handle: &dyn SandboxHandle,
        command: &CommandParts,
        stream_id: &str,
    ) -> Result<ExecutionResult, SandboxError> {
        let mut live = handle.run_detached(command).await?;
        let mut result = ExecutionResult::default();

        while let Some(chunk) = live.logs().next().await {
            let chunk = chunk?;
            match chunk.stream {
                OutputStream::Stdout => result.stdout.push_str(&chunk.data),
                OutputStream::Stderr => result.stderr.push_str(&chunk.data),
            }
            self.broker.push(stream_id, chunk);
        }

        result.exit_code = live.wait().await?;
        Ok(result)
    }

    /// Write a file into the conversation's sandbox, or a disposable one.
    pub async fn write_file(&self, request: &WriteFileRequest) -> WriteFileResult {
        let runtime = runtime_for_write(request.language.as_deref());
        let Some(conversation_id) = request.conversation_id.as_deref() else {
            return self.write_file_one_off(runtime, request).await;
        };

        let session = match self
            .registry
            .acquire_with_hint(conversation_id, runtime, request.remote_id.as_deref())
            .await
        {
            Ok(session) => session,
            Err(e) => return WriteFileResult::failed(&request.file_path, e),
        };

        match write_and_verify(session.handle().as_ref(), &request.file_path, &request.content).await {
            Ok(mut result) => {
                result.remote_id = Some(session.remote_id().to_string());
                result
            }
            Err(e) => {
                tracing::warn!(key = %session.key(), "File write failed, dropping session: {e}");
                self.registry.drop_dead(session.key()).await;
                WriteFileResult::failed(&request.file_path, e)
            }
        }
    }

    async fn write_file_one_off(&self, runtime: RuntimeKind, request: &WriteFileRequest) -> WriteFileResult {
        let handle = match self.provider().create(runtime, self.max_lifetime).await {
            Ok(handle) => handle,
            Err(e) => return WriteFileResult::failed(&request.file_path, e),
        };

        let outcome = write_and_verify(handle.as_ref(), &request.file_path, &request.content).await;
        stop_quietly(&handle).await;
        outcome.unwrap_or_else(|e| WriteFileResult::failed(&request.file_path, e))
    }
}

async fn install_runner(handle: &dyn SandboxHandle, language: Language) {
    let command = match language.setup_command() {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(%language, "Invalid runner setup command: {e}");
            return;
        }
    };
    match handle.run(&command).await {
        Ok(output) if output.success() => tracing::debug!(remote_id = handle.id(), %language, "Runner installed"),
        Ok(output) => tracing::debug!(remote_id = handle.id(), %language, exit_code = output.exit_code, "Runner install exited non-zero"),
        Err(e) => tracing::debug!(remote_id = handle.id(), %language, "Runner install failed: {e}"),
    }
}

/// Write `content` to `path` verbatim, creating the parent directory.
async fn write_via_shell(handle: &dyn SandboxHandle, path: &str, content: &str) -> Result<(), SandboxError> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        let mkdir = CommandParts::new("mkdir", vec!["-p".to_string(), parent.to_string_lossy().into_owned()]);
        let output = handle.run(&mkdir).await?;
        if !output.success() {
            tracing::debug!(path, stderr = %output.stderr.trim(), "mkdir failed");
        }
    }

    // Content and path travel as positional parameters, never through the script text.
    let write = CommandParts::new(
        "sh",
        vec![
            "-c".to_string(),
            r#"printf '%s' "$1" > "$2""#.to_string(),
            "sh".to_string(),
            content.to_string(),
            path.to_string(),
        ],
    );
    let output = handle.run(&write).await?;
    if !output.success() {
        tracing::debug!(path, stderr = %output.stderr.trim(), "write failed");
    }
    Ok(())
}

async fn write_and_verify(handle: &dyn SandboxHandle, path: &str, content: &str) -> Result<WriteFileResult, SandboxError> {
    write_via_shell(handle, path, content).await?;

    let verify = handle
        .run(&CommandParts::new("test", vec!["-f".to_string(), path.to_string()]))
        .await?;
    if !verify.success() {
        return Ok(WriteFileResult::failed(path, "File was not created"));
    }

    Ok(WriteFileResult {
        success: true,
        file_path: path.to_string(),
        error: None,
        remote_id: None,
    })
}

async fn stop_quietly(handle: &SharedHandle) {
    if let Err(e) = handle.stop().await {
        tracing::warn!(remote_id = handle.id(), "Failed to stop disposable sandbox: {e}");
    }
}
