//! Program lookup before spawning.
//!
//! Resolving up front lets startup fail with a clear error in modes that
//! spawn children lazily, instead of on the first connection.

use std::path::{Path, PathBuf};

use super::child::SubprocessError;

/// Resolve `program` to an executable path.
///
/// A program containing a path separator is taken as a path (relative paths
/// are joined onto `working_directory` when one is given). Bare names are
/// searched on `PATH`.
pub fn resolve_program(
    program: &str,
    working_directory: Option<&Path>,
) -> Result<PathBuf, SubprocessError> {
    let not_found = |reason: String| SubprocessError::SpawnFailed {
        program: program.to_string(),
        reason,
    };

    if program.is_empty() {
        return Err(not_found("empty program name".to_string()));
    }

    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        let candidate = match working_directory {
            Some(dir) if as_path.is_relative() => dir.join(as_path),
            _ => as_path.to_path_buf(),
        };
        return if is_executable(&candidate) {
            Ok(candidate)
        } else {
            Err(not_found(format!(
                "{} is not an executable file",
                candidate.display()
            )))
        };
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| not_found("not found on PATH".to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}
