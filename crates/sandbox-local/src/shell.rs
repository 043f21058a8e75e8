//! Executable lookup and PATH handling for sandboxed commands.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

/// Resolve an executable by name against a sandbox `PATH`.
///
/// The search order is:
/// 1. Explicit paths (absolute, or relative to `cwd` when they contain a separator).
/// 2. The given search path via `which`.
pub async fn resolve_executable_path(executable: &str, search_path: &OsStr, cwd: &Path) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }
    if path.components().count() > 1 {
        let joined = cwd.join(path);
        return joined.is_file().then_some(joined);
    }

    which_async(executable, search_path.to_os_string(), cwd.to_path_buf()).await
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

async fn which_async(executable: &str, search_path: OsString, cwd: PathBuf) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which_in(executable, Some(search_path), cwd))
        .await
        .ok()
        .and_then(Result::ok)
}
