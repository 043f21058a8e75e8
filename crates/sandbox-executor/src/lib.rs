//! Code execution on remote sandboxes.
//!
//! Provides:
//! - `Language` - Language to runtime/command mapping
//! - `ExecutionCoordinator` - Run code and write files, per conversation or one-off
//! - `WorkspaceFiles` - List and read files in a conversation's sandboxes

pub mod coordinator;
pub mod language;
pub mod result;
pub mod workspace;

pub use coordinator::{ExecuteRequest, ExecutionCoordinator, WriteFileRequest};
pub use language::{Language, UnknownLanguage};
pub use result::{ExecutionResult, WriteFileResult, truncate_output};
pub use workspace::{EntryKind, FileContent, FileEntry, WorkspaceFiles};
