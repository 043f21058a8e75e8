//! Core abstractions for remote sandbox sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `OutputBroker` - Replay buffer + broadcast for live command output
//! - `OutputChunk` / `StreamEvent` - Typed output messages
//! - `SandboxProvider` / `SandboxHandle` - The remote execution capability
//! - `CommandBuilder` - Command assembly
//! - `SandboxConfig` - Limits and timings

pub mod broker;
pub mod chunk;
pub mod command;
pub mod config;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod runtime;
pub mod traits;

pub use broker::{OutputBroker, Subscription};
pub use chunk::{OutputChunk, OutputStream, StreamEvent};
pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use config::{ConfigError, SandboxConfig};
pub use runtime::RuntimeKind;
pub use traits::{CommandOutput, LiveCommand, SandboxError, SandboxHandle, SandboxProvider, SharedHandle};
