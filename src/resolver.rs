//! Command resolution
//!
//! Maps a command string to an absolute, symlink-resolved executable the way a
//! shell would look it up:
//! - absolute paths are used as-is
//! - paths containing `/` are taken relative to the working directory
//! - bare names are searched in `PATH` (relative entries against the working
//!   directory), first executable regular file wins
//!
//! The candidate is then canonicalized and validated. Failures carry the
//! shell's exit codes: 127 for "not found", 126 for "cannot execute".

use crate::env;
use crate::error::ResolveError;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

/// PATH used when the merged environment has none
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Resolve `command` to an absolute executable path
pub fn resolve_command(command: &str, work_dir: &Path, env_list: &[String]) -> Result<PathBuf, ResolveError> {
    let path_var = env::lookup(env_list, "PATH")
        .filter(|p| !p.is_empty())
        .unwrap_or(DEFAULT_PATH);

    let candidate = if Path::new(command).is_absolute() {
        clean_path(Path::new(command))
    } else if command.contains('/') {
        clean_path(&work_dir.join(command))
    } else {
        search_path(command, work_dir, path_var)
            .ok_or_else(|| ResolveError::NotInPath(command.to_string()))?
    };

    // canonicalize resolves every symlink and always yields an absolute path;
    // a dangling link lands here as "not found"
    let resolved = fs::canonicalize(&candidate).map_err(|source| ResolveError::Symlink {
        path: candidate.clone(),
        source,
    })?;

    let metadata = fs::metadata(&resolved).map_err(|_| ResolveError::Missing(resolved.clone()))?;
    if metadata.is_dir() {
        return Err(ResolveError::IsDirectory(resolved));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(ResolveError::NotExecutable(resolved));
    }
    Ok(resolved)
}

/// First executable regular file named `command` along `path_var`
fn search_path(command: &str, work_dir: &Path, path_var: &str) -> Option<PathBuf> {
    path_var
        .split(':')
        .map(|dir| {
            if dir.is_empty() {
                work_dir.to_path_buf()
            } else if Path::new(dir).is_absolute() {
                PathBuf::from(dir)
            } else {
                work_dir.join(dir)
            }
        })
        .map(|dir| dir.join(command))
        .find(|candidate| is_executable_file(candidate))
}

/// Regular (non-directory) file with at least one executable bit
pub fn is_executable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(metadata) => !metadata.is_dir() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Lexical cleanup: drops `.` and folds `..` without touching the filesystem
pub fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let after_parent = matches!(cleaned.components().next_back(), Some(Component::ParentDir));
                if after_parent || (!cleaned.pop() && !path.is_absolute()) {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    if cleaned.as_os_str().is_empty() {
        cleaned.push(".");
    }
    cleaned
}
