//! Language to runtime and command mapping.

use std::{fmt, str::FromStr};

use remote_sandbox_core::{CommandBuildError, CommandBuilder, CommandParts, RuntimeKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unknown language name.
#[derive(Debug, Error)]
#[error("Unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

/// Language a piece of code is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    JavaScript,
    Python,
    TypeScript,
}

impl Language {
    /// Runtime image the language runs on.
    #[must_use]
    pub const fn runtime(self) -> RuntimeKind {
        match self {
            Self::Python => RuntimeKind::Python,
            Self::JavaScript | Self::TypeScript => RuntimeKind::Node,
        }
    }

    const fn runner(self) -> &'static str {
        match self {
            Self::JavaScript => "node",
            Self::Python => "python3",
            Self::TypeScript => "npx tsx",
        }
    }

    const fn inline_flag(self) -> &'static str {
        match self {
            Self::Python => "-c",
            Self::JavaScript | Self::TypeScript => "-e",
        }
    }

    /// Command running `code` inline, or the file at `file_path` when given.
    ///
    /// # Errors
    /// Returns error if the runner command cannot be assembled.
    pub fn command(self, code: &str, file_path: Option<&str>) -> Result<CommandParts, CommandBuildError> {
        let builder = CommandBuilder::new(self.runner());
        match file_path {
            Some(path) => builder.build_with(&[path.to_string()]),
            None => builder.params([self.inline_flag()]).build_with(&[code.to_string()]),
        }
    }

    /// One-time setup needed before the first run in a session.
    ///
    /// # Errors
    /// Returns error if the setup command cannot be assembled.
    pub fn setup_command(self) -> Result<Option<CommandParts>, CommandBuildError> {
        match self {
            Self::TypeScript => CommandBuilder::new("npm install -g tsx").build_initial().map(Some),
            Self::JavaScript | Self::Python => Ok(None),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::JavaScript => "javascript",
            Self::Python => "python",
            Self::TypeScript => "typescript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "javascript" => Ok(Self::JavaScript),
            "python" => Ok(Self::Python),
            "typescript" => Ok(Self::TypeScript),
            other => Err(UnknownLanguage(other.to_string())),
        }
    }
}

/// Runtime a file write lands in: Python for `python`, Node otherwise.
#[must_use]
pub fn runtime_for_write(language: Option<&str>) -> RuntimeKind {
    if language == Some("python") {
        RuntimeKind::Python
    } else {
        RuntimeKind::Node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &CommandParts) -> Vec<&str> {
        std::iter::once(parts.program.as_str())
            .chain(parts.args.iter().map(String::as_str))
            .collect()
    }

    #[test]
    fn test_inline_commands() {
        let js = Language::JavaScript.command("console.log(1)", None).unwrap();
        assert_eq!(args(&js), ["node", "-e", "console.log(1)"]);

        let py = Language::Python.command("print(40+2)", None).unwrap();
        assert_eq!(args(&py), ["python3", "-c", "print(40+2)"]);

        let ts = Language::TypeScript.command("const x: number = 1", None).unwrap();
        assert_eq!(args(&ts), ["npx", "tsx", "-e", "const x: number = 1"]);
    }

    #[test]
    fn test_file_commands_ignore_code() {
        let py = Language::Python.command("ignored", Some("main.py")).unwrap();
        assert_eq!(args(&py), ["python3", "main.py"]);

        let ts = Language::TypeScript.command("ignored", Some("src/a.ts")).unwrap();
        assert_eq!(args(&ts), ["npx", "tsx", "src/a.ts"]);
    }

    #[test]
    fn test_runtime_mapping() {
        assert_eq!(Language::JavaScript.runtime(), RuntimeKind::Node);
        assert_eq!(Language::TypeScript.runtime(), RuntimeKind::Node);
        assert_eq!(Language::Python.runtime(), RuntimeKind::Python);

        assert_eq!(runtime_for_write(Some("python")), RuntimeKind::Python);
        assert_eq!(runtime_for_write(Some("typescript")), RuntimeKind::Node);
        assert_eq!(runtime_for_write(None), RuntimeKind::Node);
    }

    #[test]
    fn test_only_typescript_needs_setup() {
        let setup = Language::TypeScript.setup_command().unwrap().unwrap();
        assert_eq!(args(&setup), ["npm", "install", "-g", "tsx"]);
        assert!(Language::Python.setup_command().unwrap().is_none());
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("typescript".parse::<Language>().unwrap(), Language::TypeScript);
        assert!("ruby".parse::<Language>().is_err());
        let lang: Language = serde_json::from_str("\"javascript\"").unwrap();
        assert_eq!(lang, Language::JavaScript);
    }
}
