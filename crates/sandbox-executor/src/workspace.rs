//! Listing and reading files inside a sandbox workspace.
//!
//! Everything runs through plain POSIX shell commands on the sandbox, so the
//! same code works against any provider.

use std::collections::HashSet;

use remote_sandbox_core::{CommandBuildError, CommandParts, SandboxError, SandboxHandle};
use remote_sandbox_session::ReconnectionResolver;
use serde::{Deserialize, Serialize};

/// Path patterns left out of listings.
const EXCLUDED_PATHS: &[&str] = &[
    "*/node_modules",
    "*/node_modules/*",
    "*/.npm",
    "*/.npm/*",
    "*/package-lock.json",
    "*/__pycache__",
    "*/__pycache__/*",
];

/// Kind of a workspace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    // Declaration order is the listing order.
    Directory,
    File,
}

/// One file or directory in a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Absolute path under the workspace root.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// File preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub content: String,
    pub size: u64,
}

fn list_command(root: &str) -> Result<CommandParts, CommandBuildError> {
    let root = shlex::try_quote(root)?;
    let excludes: Vec<String> = EXCLUDED_PATHS.iter().map(|p| format!("-not -path '{p}'")).collect();
    let script = format!(
        r#"find {root} {excludes} | while IFS= read -r p; do
  if [ -d "$p" ]; then
    echo "d 0 $p"
  elif [ -f "$p" ]; then
    s=$(stat -c '%s' "$p" 2>/dev/null || stat -f '%z' "$p" 2>/dev/null || echo 0)
    echo "f $s $p"
  fi
done"#,
        excludes = excludes.join(" ")
    );
    Ok(CommandParts::shell(script))
}

/// Parse `d 0 <path>` / `f <size> <path>` lines, skipping `root` itself and
/// malformed lines.
#[must_use]
pub fn parse_listing(stdout: &str, root: &str) -> Vec<FileEntry> {
    let root = root.trim_end_matches('/');
    let mut entries: Vec<FileEntry> = stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ' ');
            let kind = fields.next()?;
            let size: u64 = fields.next()?.parse().ok()?;
            let path = fields.next().filter(|p| !p.is_empty())?;
            if path.trim_end_matches('/') == root {
                return None;
            }
            Some(match kind {
                "d" => FileEntry {
                    path: path.to_string(),
                    kind: EntryKind::Directory,
                    size: None,
                },
                "f" => FileEntry {
                    path: path.to_string(),
                    kind: EntryKind::File,
                    size: Some(size),
                },
                _ => return None,
            })
        })
        .collect();
    sort_entries(&mut entries);
    entries
}

/// Directories first, then by path, ignoring case.
///
/// Paths equal up to case put the lowercase spelling first. This follows
/// the usual collation for ASCII names; unlike a full locale collation,
/// punctuation still counts at the first level.
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        a.kind
            .cmp(&b.kind)
            .then_with(|| caseless(&a.path).cmp(caseless(&b.path)))
            .then_with(|| b.path.cmp(&a.path))
    });
}

fn caseless(path: &str) -> impl Iterator<Item = char> + '_ {
    path.chars().flat_map(char::to_lowercase)
}

/// List the workspace of one sandbox.
///
/// # Errors
/// Returns error if the listing command cannot be run.
pub async fn list_files(handle: &dyn SandboxHandle) -> Result<Vec<FileEntry>, SandboxError> {
    let root = handle.workspace_root();
    let output = handle.run(&list_command(root)?).await?;
    Ok(parse_listing(&output.stdout, root))
}

/// Read one file, or a placeholder when it is larger than `preview_limit`.
///
/// Returns `Ok(None)` when the file does not exist or cannot be read.
///
/// # Errors
/// Returns error if the sandbox cannot run commands.
pub async fn read_file(
    handle: &dyn SandboxHandle,
    path: &str,
    preview_limit: u64,
) -> Result<Option<FileContent>, SandboxError> {
    let quoted = shlex::try_quote(path).map_err(CommandBuildError::from)?;
    let stat = handle
        .run(&CommandParts::shell(format!(
            "stat -c '%s' -- {quoted} 2>/dev/null || stat -f '%z' -- {quoted} 2>/dev/null"
        )))
        .await?;
    if !stat.success() {
        return Ok(None);
    }
    let Ok(size) = stat.stdout.trim().parse::<u64>() else {
        return Ok(None);
    };

    if size > preview_limit {
        return Ok(Some(FileContent {
            content: format!("[File too large to preview: {}]", format_bytes(size)),
            size,
        }));
    }

    let cat = handle
        .run(&CommandParts::new("cat", vec!["--".to_string(), path.to_string()]))
        .await?;
    if !cat.success() {
        return Ok(None);
    }
    Ok(Some(FileContent {
        content: cat.stdout,
        size,
    }))
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    match bytes {
        b if b < KB => format!("{b} B"),
        b if b < MB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{:.1} MB", b as f64 / MB as f64),
    }
}

/// File access for a conversation, across every sandbox it can reach.
#[derive(Clone)]
pub struct WorkspaceFiles {
    resolver: ReconnectionResolver,
    preview_limit: u64,
}

impl WorkspaceFiles {
    #[must_use]
    pub const fn new(resolver: ReconnectionResolver, preview_limit: u64) -> Self {
        Self {
            resolver,
            preview_limit,
        }
    }

    /// All files of a conversation, merged over its sandboxes and
    /// de-duplicated by path. Unreachable sandboxes contribute nothing.
    pub async fn list(&self, conversation_id: &str, remote_id: Option<&str>) -> Vec<FileEntry> {
        let mut seen = HashSet::new();
        let mut merged = Vec::new();

        for handle in self.resolver.resolve_all(conversation_id, remote_id).await {
            match list_files(handle.as_ref()).await {
                Ok(entries) => merged.extend(entries.into_iter().filter(|e| seen.insert(e.path.clone()))),
                Err(e) => tracing::debug!(conversation_id, remote_id = handle.id(), "Listing failed: {e}"),
            }
        }

        sort_entries(&mut merged);
        merged
    }

    /// Read a file from the first sandbox of the conversation that has it.
    pub async fn read(&self, conversation_id: &str, path: &str, remote_id: Option<&str>) -> Option<FileContent> {
        for handle in self.resolver.resolve_all(conversation_id, remote_id).await {
            match read_file(handle.as_ref(), path, self.preview_limit).await {
                Ok(Some(content)) => return Some(content),
                Ok(None) => {}
                Err(e) => tracing::debug!(conversation_id, remote_id = handle.id(), path, "Read failed: {e}"),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use remote_sandbox_core::{
        OutputChunk, RuntimeKind, SandboxProvider,
        mock::{MockProvider, MockReply},
    };
    use remote_sandbox_session::{RegistryConfig, SessionRegistry};

    use super::*;

    const LISTING: &str = "d 0 /vercel/sandbox\n\
        f 12 /vercel/sandbox/main.py\n\
        d 0 /vercel/sandbox/src\n\
        f 3 /vercel/sandbox/src/my file.txt\n\
        garbage\n\
        f x /vercel/sandbox/bad\n";

    fn responder(cmd: &CommandParts) -> MockReply {
        let script = cmd.args.get(1).map_or("", String::as_str);
        if cmd.program == "sh" && script.starts_with("find") {
            MockReply::stdout(LISTING)
        } else if cmd.program == "sh" && script.starts_with("stat") {
            if script.contains("big.bin") {
                MockReply::stdout("2621440\n")
            } else if script.contains("main.py") {
                MockReply::stdout("12\n")
            } else {
                MockReply::with_chunks(Vec::new(), 1)
            }
        } else if cmd.program == "cat" && cmd.args.first().is_some_and(|a| a == "--") {
            MockReply::with_chunks(vec![OutputChunk::stdout("print(40+2)\n")], 0)
        } else {
            MockReply::default()
        }
    }

    fn files(provider: &Arc<MockProvider>) -> (Arc<SessionRegistry>, WorkspaceFiles) {
        let registry = SessionRegistry::new(
            Arc::clone(provider) as Arc<dyn SandboxProvider>,
            RegistryConfig::default(),
        );
        let resolver = ReconnectionResolver::new(Arc::clone(&registry));
        (registry, WorkspaceFiles::new(resolver, 100_000))
    }

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing(LISTING, "/vercel/sandbox/");
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            ["/vercel/sandbox/src", "/vercel/sandbox/main.py", "/vercel/sandbox/src/my file.txt"]
        );
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].size, None);
        assert_eq!(entries[1].size, Some(12));
        assert!(parse_listing("", "/vercel/sandbox").is_empty());
    }

    #[test]
    fn test_sort_ignores_case() {
        let entry = |path: &str| FileEntry {
            path: path.to_string(),
            kind: EntryKind::File,
            size: Some(1),
        };
        let mut entries = vec![entry("/w/b.txt"), entry("/w/Zeta.md"), entry("/w/B.txt"), entry("/w/apple")];
        sort_entries(&mut entries);
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, ["/w/apple", "/w/b.txt", "/w/B.txt", "/w/Zeta.md"]);
    }

    #[test]
    fn test_list_command_skips_dependency_dirs() {
        let cmd = list_command("/tmp/work space").unwrap();
        let script = &cmd.args[1];
        assert!(script.starts_with("find '/tmp/work space' "));
        assert!(script.contains("-not -path '*/node_modules/*'"));
        assert!(script.contains("-not -path '*/__pycache__'"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(150_000), "146.5 KB");
        assert_eq!(format_bytes(2_621_440), "2.5 MB");
    }

    #[test]
    fn test_entry_wire_shape() {
        let json = serde_json::to_value(FileEntry {
            path: "/vercel/sandbox/a".to_string(),
            kind: EntryKind::File,
            size: Some(1),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"path": "/vercel/sandbox/a", "type": "file", "size": 1}));
    }

    #[tokio::test]
    async fn test_list_merges_sessions_without_duplicates() {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let (registry, files) = files(&provider);
        registry.acquire("c1", RuntimeKind::Node).await.unwrap();
        registry.acquire("c1", RuntimeKind::Python).await.unwrap();

        let entries = files.list("c1", None).await;
        assert_eq!(entries.len(), 3);
        assert!(files.list("other", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_read_file_and_placeholder() {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let (registry, files) = files(&provider);
        registry.acquire("c1", RuntimeKind::Python).await.unwrap();

        let file = files.read("c1", "/vercel/sandbox/main.py", None).await.unwrap();
        assert_eq!(file, FileContent { content: "print(40+2)\n".to_string(), size: 12 });

        let big = files.read("c1", "/vercel/sandbox/big.bin", None).await.unwrap();
        assert_eq!(big.content, "[File too large to preview: 2.5 MB]");
        assert_eq!(big.size, 2_621_440);

        assert!(files.read("c1", "/vercel/sandbox/missing", None).await.is_none());
    }

    #[tokio::test]
    async fn test_read_treats_dash_paths_as_files() {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let (registry, files) = files(&provider);
        registry.acquire("c1", RuntimeKind::Python).await.unwrap();

        let file = files.read("c1", "-main.py", None).await.unwrap();
        assert_eq!(file.size, 12);

        let commands = provider.created()[0].commands();
        let [.., stat, cat] = commands.as_slice() else {
            panic!("expected stat and cat, got {commands:?}");
        };
        assert!(stat.args[1].starts_with("stat -c '%s' -- "));
        assert_eq!(cat.program, "cat");
        assert_eq!(cat.args, ["--", "-main.py"]);
    }

    #[tokio::test]
    async fn test_falls_back_to_remote_id() {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let (_registry, files) = files(&provider);
        let remote = provider.create(RuntimeKind::Node, Duration::from_secs(60)).await.unwrap();

        assert_eq!(files.list("c1", Some(remote.id())).await.len(), 3);
        assert!(files.read("c1", "/vercel/sandbox/main.py", Some(remote.id())).await.is_some());

        provider.forget(remote.id());
        assert!(files.list("c1", Some(remote.id())).await.is_empty());
        assert!(files.read("c1", "/vercel/sandbox/main.py", Some(remote.id())).await.is_none());
    }

    #[tokio::test]
    async fn test_dead_sandbox_lists_nothing() {
        let provider = Arc::new(MockProvider::with_responder(responder));
        let (registry, files) = files(&provider);
        let session = registry.acquire("c1", RuntimeKind::Node).await.unwrap();
        session.handle().stop().await.unwrap();

        assert!(files.list("c1", None).await.is_empty());
    }
}
