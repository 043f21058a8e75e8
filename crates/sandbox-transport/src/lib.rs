//! HTTP surface for remote sandboxes.
//!
//! Provides:
//! - Wire types for queries and responses
//! - axum router: live output (SSE), file listing/reading, execution

pub mod error;
pub mod protocol;
pub mod routes;

pub use error::ApiError;
pub use protocol::{ErrorBody, FileListResponse, FilesQuery, ReadFileQuery, StreamQuery};
pub use routes::{SandboxState, router};
