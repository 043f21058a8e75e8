//! Process-backed sandboxes.
//!
//! Each sandbox is a directory on the host: `<base>/<id>/workspace` is the
//! working directory of every command, `<base>/<id>/npm-global` receives
//! global npm installs. There is no isolation beyond that; use this provider
//! for development or trusted single-host deployments.

use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::{FutureExt, StreamExt, stream::BoxStream};
use remote_sandbox_core::{
    CommandOutput, CommandParts, LiveCommand, OutputChunk, OutputStream, RuntimeKind, SandboxError,
    SandboxHandle, SandboxProvider, SharedHandle,
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Command,
    sync::{oneshot, watch},
};
use uuid::Uuid;

use crate::shell::{merge_paths, resolve_executable_path};

type SandboxMap = Mutex<HashMap<String, Arc<LocalSandbox>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Provider creating sandboxes as host directories.
#[derive(Clone)]
pub struct LocalProvider {
    base_dir: PathBuf,
    command_timeout: Duration,
    sandboxes: Arc<SandboxMap>,
}

impl LocalProvider {
    /// Create a provider rooted at `base_dir`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            base_dir: base_dir.into(),
            command_timeout,
            sandboxes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Default base directory, under the user cache dir.
    #[must_use]
    pub fn default_base_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("remote-sandbox")
    }

    /// Base directory sandboxes are created in.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Number of sandboxes that have not been stopped.
    #[must_use]
    pub fn live_count(&self) -> usize {
        lock(&self.sandboxes).values().filter(|s| !s.is_stopped()).count()
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    async fn create(&self, runtime: RuntimeKind, max_lifetime: Duration) -> Result<SharedHandle, SandboxError> {
        let id = format!("sbx_{}", Uuid::new_v4().simple());
        let dir = self.base_dir.join(&id);
        let workspace = dir.join("workspace");
        let npm_prefix = dir.join("npm-global");

        for path in [&workspace, &npm_prefix.join("bin")] {
            tokio::fs::create_dir_all(path)
                .await
                .map_err(|e| SandboxError::CreateFailed(format!("{}: {e}", path.display())))?;
        }

        let host_path = std::env::var_os("PATH").unwrap_or_default();
        let sandbox = Arc::new(LocalSandbox {
            id: id.clone(),
            runtime,
            workspace_str: workspace.to_string_lossy().into_owned(),
            path_env: merge_paths(npm_prefix.join("bin").as_os_str(), host_path),
            dir,
            workspace,
            npm_prefix,
            command_timeout: self.command_timeout,
            stopped: AtomicBool::new(false),
            shutdown: watch::channel(false).0,
        });
        lock(&self.sandboxes).insert(id.clone(), Arc::clone(&sandbox));

        // Enforce the absolute lifetime independently of any caller.
        let weak = Arc::downgrade(&sandbox);
        let sandboxes = Arc::downgrade(&self.sandboxes);
        tokio::spawn(async move {
            tokio::time::sleep(max_lifetime).await;
            if let Some(sandbox) = weak.upgrade() {
                if !sandbox.is_stopped() {
                    tracing::info!(sandbox = %sandbox.id, "Sandbox reached max lifetime");
                }
                if let Err(e) = sandbox.stop().await {
                    tracing::warn!(sandbox = %sandbox.id, "Failed to stop expired sandbox: {e}");
                }
            }
            if let Some(sandboxes) = sandboxes.upgrade() {
                lock(&sandboxes).remove(&id);
            }
        });

        tracing::info!(sandbox = %sandbox.id, %runtime, "Created local sandbox");
        Ok(sandbox as SharedHandle)
    }

    async fn get(&self, remote_id: &str) -> Result<SharedHandle, SandboxError> {
        let mut sandboxes = lock(&self.sandboxes);
        let sandbox = sandboxes
            .get(remote_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(remote_id.to_string()))?;
        if sandbox.is_stopped() {
            sandboxes.remove(remote_id);
            return Err(SandboxError::Stopped(remote_id.to_string()));
        }
        Ok(sandbox as SharedHandle)
    }
}

/// One host-directory sandbox.
pub struct LocalSandbox {
    id: String,
    runtime: RuntimeKind,
    dir: PathBuf,
    workspace: PathBuf,
    workspace_str: String,
    npm_prefix: PathBuf,
    path_env: OsString,
    command_timeout: Duration,
    stopped: AtomicBool,
    /// Flipped by `stop`; every running command watches it.
    shutdown: watch::Sender<bool>,
}

impl LocalSandbox {
    /// Whether `stop` has run.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn spawn(&self, parts: &CommandParts) -> Result<AsyncGroupChild, SandboxError> {
        if self.is_stopped() {
            return Err(SandboxError::Stopped(self.id.clone()));
        }

        let program = resolve_executable_path(&parts.program, &self.path_env, &self.workspace)
            .await
            .ok_or_else(|| SandboxError::ExecutableNotFound(parts.program.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(&parts.args)
            .current_dir(&self.workspace)
            .env("PATH", &self.path_env)
            .env("HOME", &self.workspace)
            .env("NPM_CONFIG_PREFIX", &self.npm_prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(sandbox = %self.id, command = %parts, "Spawning command");
        Ok(cmd.group_spawn()?)
    }

    /// Resolves once the sandbox is stopped.
    fn stop_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut shutdown = self.shutdown.subscribe();
        async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        }
    }
}

enum Interrupt {
    Timeout,
    Stopped,
}

impl Interrupt {
    fn into_error(self, sandbox_id: &str, limit: Duration) -> SandboxError {
        match self {
            Self::Timeout => SandboxError::Timeout(limit),
            Self::Stopped => SandboxError::Stopped(sandbox_id.to_string()),
        }
    }
}

async fn kill_group(child: &mut AsyncGroupChild, sandbox_id: &str, interrupt: &Interrupt) {
    let reason = match interrupt {
        Interrupt::Timeout => "timed out",
        Interrupt::Stopped => "sandbox stopped",
    };
    tracing::debug!(sandbox = %sandbox_id, reason, "Killing command group");
    if let Err(e) = child.kill().await {
        tracing::warn!(sandbox = %sandbox_id, reason, "Failed to kill command: {e}");
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<String> {
    let Some(mut pipe) = pipe else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Next newline-terminated piece of a pipe, terminator included.
///
/// A line never splits a UTF-8 sequence, so decoding each piece lossily
/// yields the same text as decoding the whole output at once.
async fn next_chunk<R: AsyncBufRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
) -> Result<Option<(OutputChunk, R)>, SandboxError> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }
    let chunk = OutputChunk {
        stream,
        data: String::from_utf8_lossy(&line).into_owned(),
    };
    Ok(Some((chunk, reader)))
}

fn pipe_chunks<R>(pipe: R, stream: OutputStream) -> BoxStream<'static, Result<OutputChunk, SandboxError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    futures::stream::try_unfold(BufReader::new(pipe), move |reader| next_chunk(reader, stream)).boxed()
}

#[async_trait]
impl SandboxHandle for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    fn workspace_root(&self) -> &str {
        &self.workspace_str
    }

    async fn run(&self, command: &CommandParts) -> Result<CommandOutput, SandboxError> {
        let mut child = self.spawn(command).await?;
        let stdout = child.inner().stdout.take();
        let stderr = child.inner().stderr.take();

        let limit = self.command_timeout;
        let stopped = self.stop_signal();
        let waited = tokio::select! {
            waited = tokio::time::timeout(limit, async {
                tokio::join!(read_pipe(stdout), read_pipe(stderr), child.wait())
            }) => waited.map_err(|_| Interrupt::Timeout),
            () = stopped => Err(Interrupt::Stopped),
        };

        match waited {
            Ok((stdout, stderr, status)) => Ok(CommandOutput {
                stdout: stdout?,
                stderr: stderr?,
                exit_code: exit_code(status?),
            }),
            Err(interrupt) => {
                kill_group(&mut child, &self.id, &interrupt).await;
                Err(interrupt.into_error(&self.id, limit))
            }
        }
    }

    async fn run_detached(&self, command: &CommandParts) -> Result<LiveCommand, SandboxError> {
        let mut child = self.spawn(command).await?;
        let stdout = child
            .inner()
            .stdout
            .take()
            .ok_or_else(|| SandboxError::CommandFailed("stdout not captured".to_string()))?;
        let stderr = child
            .inner()
            .stderr
            .take()
            .ok_or_else(|| SandboxError::CommandFailed("stderr not captured".to_string()))?;

        let logs = futures::stream::select(
            pipe_chunks(stdout, OutputStream::Stdout),
            pipe_chunks(stderr, OutputStream::Stderr),
        )
        .boxed();

        // The watchdog owns the child. Killing it closes the pipes, which ends `logs`.
        let (exit_tx, exit_rx) = oneshot::channel();
        let limit = self.command_timeout;
        let stopped = self.stop_signal();
        let sandbox_id = self.id.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                waited = tokio::time::timeout(limit, child.wait()) => waited.map_err(|_| Interrupt::Timeout),
                () = stopped => Err(Interrupt::Stopped),
            };
            let result = match waited {
                Ok(status) => status.map(exit_code).map_err(SandboxError::from),
                Err(interrupt) => {
                    kill_group(&mut child, &sandbox_id, &interrupt).await;
                    Err(interrupt.into_error(&sandbox_id, limit))
                }
            };
            let _ = exit_tx.send(result);
        });

        let exit = async move {
            exit_rx
                .await
                .unwrap_or_else(|_| Err(SandboxError::CommandFailed("command watchdog dropped".to_string())))
        }
        .boxed();

        Ok(LiveCommand::new(logs, exit))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(sandbox = %self.id, "Stopping local sandbox");
        self.shutdown.send_replace(true);
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
