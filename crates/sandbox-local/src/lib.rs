//! Process-backed sandbox provider.
//!
//! Provides:
//! - `LocalProvider` - Sandboxes as host directories, commands as process groups
//! - Executable lookup against a per-sandbox PATH

pub mod provider;
pub mod shell;

pub use provider::{LocalProvider, LocalSandbox};
pub use shell::{merge_paths, resolve_executable_path};
