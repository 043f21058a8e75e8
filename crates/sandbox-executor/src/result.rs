//! Result types returned to the tool layer.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Outcome of running code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Id of the sandbox that ran the code, for later reconnection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl ExecutionResult {
    /// Synthetic result for a failure that happened around the command.
    #[must_use]
    pub fn from_error(error: impl Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: error.to_string(),
            exit_code: 1,
            remote_id: None,
        }
    }

    /// Cap stdout and stderr at `max_chars` each.
    #[must_use]
    pub fn truncated(mut self, max_chars: usize) -> Self {
        self.stdout = truncate_output(self.stdout, max_chars);
        self.stderr = truncate_output(self.stderr, max_chars);
        self
    }
}

/// Outcome of writing a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFileResult {
    pub success: bool,
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

impl WriteFileResult {
    #[must_use]
    pub fn failed(file_path: &str, error: impl Display) -> Self {
        Self {
            success: false,
            file_path: file_path.to_string(),
            error: Some(error.to_string()),
            remote_id: None,
        }
    }
}

/// Cut `output` to `max_chars` characters, appending a marker with the
/// original length. Output of exactly `max_chars` is returned as is.
#[must_use]
pub fn truncate_output(output: String, max_chars: usize) -> String {
    let len = output.chars().count();
    if len <= max_chars {
        return output;
    }
    let mut truncated: String = output.chars().take(max_chars).collect();
    truncated.push_str(&format!(
        "\n\n--- Output truncated ({} chars, limit {}) ---",
        group_thousands(len),
        group_thousands(max_chars)
    ));
    truncated
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
