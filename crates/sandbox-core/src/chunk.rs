//! Typed output chunks and stream events.

use serde::{Deserialize, Serialize};

/// Which pipe a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A piece of output produced by a running command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub data: String,
}

impl OutputChunk {
    /// Create a stdout chunk.
    #[must_use]
    pub fn stdout<S: Into<String>>(data: S) -> Self {
        Self {
            stream: OutputStream::Stdout,
            data: data.into(),
        }
    }

    /// Create a stderr chunk.
    #[must_use]
    pub fn stderr<S: Into<String>>(data: S) -> Self {
        Self {
            stream: OutputStream::Stderr,
            data: data.into(),
        }
    }
}

/// Event delivered to stream subscribers.
///
/// Serializes to the wire shape used by the live-output endpoint:
/// `{"type":"stdout","data":".."}`, `{"type":"stderr","data":".."}` or
/// `{"type":"done"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Stdout { data: String },
    Stderr { data: String },
    Done,
}

impl StreamEvent {
    /// Whether this is the terminal event of a stream.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Convert to an SSE event (requires `sse` feature).
    #[cfg(feature = "sse")]
    #[must_use]
    pub fn to_sse_event(&self) -> axum::response::sse::Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"done"}"#.to_string());
        axum::response::sse::Event::default().data(data)
    }
}

impl From<OutputChunk> for StreamEvent {
    fn from(chunk: OutputChunk) -> Self {
        match chunk.stream {
            OutputStream::Stdout => Self::Stdout { data: chunk.data },
            OutputStream::Stderr => Self::Stderr { data: chunk.data },
        }
    }
}
