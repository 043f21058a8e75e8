//! Wire types for the sandbox HTTP surface.

use remote_sandbox_executor::FileEntry;
use serde::{Deserialize, Serialize};

/// `GET /api/sandbox/stream` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub chat_id: Option<String>,
}

/// `GET /api/sandbox/files` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesQuery {
    pub chat_id: Option<String>,
    /// Sandbox id from an earlier execution, used when this process has no
    /// session for the chat.
    pub remote_id: Option<String>,
}

/// `GET /api/sandbox/files/read` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFileQuery {
    pub chat_id: Option<String>,
    pub path: Option<String>,
    pub remote_id: Option<String>,
}

/// File listing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileListResponse {
    pub files: Vec<FileEntry>,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Treat empty query values like missing ones.
pub(crate) fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}
