//! In-memory provider for tests.
//!
//! Every command is answered by a responder closure; commands, creations and
//! stops are recorded so tests can assert on them.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};

use crate::{
    CommandOutput, CommandParts, LiveCommand, OutputChunk, OutputStream, RuntimeKind, SandboxError,
    SandboxHandle, SandboxProvider, SharedHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted answer to one command.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub chunks: Vec<OutputChunk>,
    pub exit_code: i32,
    /// Fail the call itself instead of returning output.
    pub error: Option<String>,
}

impl MockReply {
    /// Successful command printing `data` on stdout.
    #[must_use]
    pub fn stdout(data: &str) -> Self {
        Self {
            chunks: vec![OutputChunk::stdout(data)],
            ..Self::default()
        }
    }

    /// Command that exits with `exit_code` and the given chunks.
    #[must_use]
    pub const fn with_chunks(chunks: Vec<OutputChunk>, exit_code: i32) -> Self {
        Self {
            chunks,
            exit_code,
            error: None,
        }
    }

    /// The sandbox call fails (dead environment, network error).
    #[must_use]
    pub fn fail(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }
}

type Responder = dyn Fn(&CommandParts) -> MockReply + Send + Sync;

/// A fake sandbox.
pub struct MockSandbox {
    id: String,
    runtime: RuntimeKind,
    stopped: AtomicBool,
    fail_stop: bool,
    commands: Mutex<Vec<CommandParts>>,
    responder: Arc<Responder>,
}

impl MockSandbox {
    /// Commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandParts> {
        lock(&self.commands).clone()
    }

    /// Whether `stop` has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn answer(&self, command: &CommandParts) -> Result<MockReply, SandboxError> {
        if self.is_stopped() {
            return Err(SandboxError::Stopped(self.id.clone()));
        }
        lock(&self.commands).push(command.clone());
        let reply = (self.responder)(command);
        match reply.error {
            Some(message) => Err(SandboxError::CommandFailed(message)),
            None => Ok(reply),
        }
    }
}

#[async_trait]
impl SandboxHandle for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> RuntimeKind {
        self.runtime
    }

    fn workspace_root(&self) -> &str {
        "/vercel/sandbox"
    }

    async fn run(&self, command: &CommandParts) -> Result<CommandOutput, SandboxError> {
        let reply = self.answer(command)?;
        let mut output = CommandOutput {
            exit_code: reply.exit_code,
            ..CommandOutput::default()
        };
        for chunk in reply.chunks {
            match chunk.stream {
                OutputStream::Stdout => output.stdout.push_str(&chunk.data),
                OutputStream::Stderr => output.stderr.push_str(&chunk.data),
            }
        }
        Ok(output)
    }

    async fn run_detached(&self, command: &CommandParts) -> Result<LiveCommand, SandboxError> {
        let reply = self.answer(command)?;
        let exit_code = reply.exit_code;
        let logs = futures::stream::iter(reply.chunks.into_iter().map(Ok)).boxed();
        Ok(LiveCommand::new(logs, async move { Ok(exit_code) }.boxed()))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.stopped.store(true, Ordering::SeqCst);
        if self.fail_stop {
            return Err(SandboxError::CommandFailed("stop failed".to_string()));
        }
        Ok(())
    }
}

/// Fake provider that hands out [`MockSandbox`]es.
pub struct MockProvider {
    creates: AtomicUsize,
    create_delay: Duration,
    fail_create: AtomicBool,
    fail_stop: AtomicBool,
    sandboxes: Mutex<HashMap<String, Arc<MockSandbox>>>,
    created: Mutex<Vec<Arc<MockSandbox>>>,
    responder: Arc<Responder>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// Provider whose commands all succeed silently.
    #[must_use]
    pub fn new() -> Self {
        Self::with_responder(|_| MockReply::default())
    }

    /// Provider answering commands with `responder`.
    #[must_use]
    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&CommandParts) -> MockReply + Send + Sync + 'static,
    {
        Self {
            creates: AtomicUsize::new(0),
            create_delay: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            sandboxes: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            responder: Arc::new(responder),
        }
    }

    /// Make `create` take `delay`, to widen race windows.
    #[must_use]
    pub const fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    /// Make subsequent `create` calls fail.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make `stop` on subsequently created sandboxes fail.
    pub fn set_fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Number of `create` calls that succeeded.
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Sandboxes created so far, oldest first.
    #[must_use]
    pub fn created(&self) -> Vec<Arc<MockSandbox>> {
        lock(&self.created).clone()
    }

    /// Forget a sandbox so `get` no longer finds it.
    pub fn forget(&self, id: &str) {
        lock(&self.sandboxes).remove(id);
    }
}

#[async_trait]
impl SandboxProvider for MockProvider {
    async fn create(&self, runtime: RuntimeKind, _max_lifetime: Duration) -> Result<SharedHandle, SandboxError> {
        if !self.create_delay.is_zero() {
            tokio::time::sleep(self.create_delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::CreateFailed("no capacity".to_string()));
        }

        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        let sandbox = Arc::new(MockSandbox {
            id: format!("sbx_mock_{n}"),
            runtime,
            stopped: AtomicBool::new(false),
            fail_stop: self.fail_stop.load(Ordering::SeqCst),
            commands: Mutex::new(Vec::new()),
            responder: Arc::clone(&self.responder),
        });
        lock(&self.sandboxes).insert(sandbox.id.clone(), Arc::clone(&sandbox));
        lock(&self.created).push(Arc::clone(&sandbox));
        Ok(sandbox as SharedHandle)
    }

    async fn get(&self, remote_id: &str) -> Result<SharedHandle, SandboxError> {
        let sandbox = lock(&self.sandboxes)
            .get(remote_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(remote_id.to_string()))?;
        if sandbox.is_stopped() {
            return Err(SandboxError::Stopped(remote_id.to_string()));
        }
        Ok(sandbox as SharedHandle)
    }
}
