//! Runtime flavors offered by the remote execution service.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// Environment image a sandbox is created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuntimeKind {
    #[serde(rename = "node24")]
    Node,
    #[serde(rename = "python3.13")]
    Python,
}

impl RuntimeKind {
    /// Every runtime, in lookup order.
    pub const ALL: [Self; 2] = [Self::Node, Self::Python];

    /// Name understood by the remote service.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Node => "node24",
            Self::Python => "python3.13",
        }
    }
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown runtime name.
#[derive(Debug, thiserror::Error)]
#[error("Unknown runtime: {0}")]
pub struct UnknownRuntime(pub String);

impl FromStr for RuntimeKind {
    type Err = UnknownRuntime;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node24" => Ok(Self::Node),
            "python3.13" => Ok(Self::Python),
            other => Err(UnknownRuntime(other.to_string())),
        }
    }
}
