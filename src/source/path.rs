//! Checks applied to local paths before they are opened.

use crate::error::SourceError;
use crate::utils::{format_with_separators, is_symlink};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    pub allow_symlinks: bool,
    pub max_file_size: u64,
}

impl Default for PathPolicy {
    fn default() -> Self {
        Self {
            allow_symlinks: false,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Reject NUL bytes and `..` components.
pub fn validate_no_traversal(path: &Path) -> Result<(), SourceError> {
    if path.as_os_str().to_string_lossy().contains('\0') {
        return Err(SourceError::InvalidPath(
            "path contains a NUL byte".to_string(),
        ));
    }

    if path.components().any(|c| c == Component::ParentDir) {
        return Err(SourceError::InvalidPath(format!(
            "path traversal detected in {}",
            path.display()
        )));
    }

    Ok(())
}

/// Reject a path if it, or any directory above it, is a symbolic link.
pub fn validate_no_symlinks(path: &Path) -> Result<(), SourceError> {
    let absolute = std::path::absolute(path)
        .map_err(|e| SourceError::from_io(path.display().to_string(), e))?;

    for ancestor in absolute.ancestors() {
        if is_symlink(ancestor) {
            return Err(SourceError::InvalidPath(format!(
                "symbolic link in path: {}",
                ancestor.display()
            )));
        }
    }

    Ok(())
}

pub fn validate_file_size(path: &Path, size: u64, limit: u64) -> Result<(), SourceError> {
    if size > limit {
        return Err(SourceError::InvalidPath(format!(
            "{} is too large: {} bytes exceeds the limit of {} bytes",
            path.display(),
            format_with_separators(size),
            format_with_separators(limit)
        )));
    }
    Ok(())
}

/// Run every check and return the path to open.
pub fn validate_local_path(path: &Path, policy: &PathPolicy) -> Result<PathBuf, SourceError> {
    validate_no_traversal(path)?;

    let metadata = std::fs::metadata(path)
        .map_err(|e| SourceError::from_io(path.display().to_string(), e))?;

    if !metadata.is_file() {
        return Err(SourceError::InvalidPath(format!(
            "{} is not a regular file",
            path.display()
        )));
    }

    if policy.allow_symlinks {
        if is_symlink(path) {
            warn!(path = %path.display(), "following symbolic link");
        }
    } else {
        validate_no_symlinks(path)?;
    }

    validate_file_size(path, metadata.len(), policy.max_file_size)?;

    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_detect_path_traversal() {
        for path in [
            "../../../etc/passwd",
            "../../.ssh/id_rsa",
            "logs/../../../var/log/auth.log",
        ] {
            let err = validate_no_traversal(Path::new(path)).unwrap_err();
            assert!(err.to_string().contains("traversal detected"));
        }
    }

    #[test]
    fn test_allow_plain_paths() {
        for path in ["config.toml", "logs/app.log", "./local_file.txt", "/var/log/app.log"] {
            assert!(validate_no_traversal(Path::new(path)).is_ok());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_symlink_file() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("target.txt");
        std::fs::write(&target, "sensitive content").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let err = validate_local_path(&link, &PathPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("symbolic link"));

        let permissive = PathPolicy {
            allow_symlinks: true,
            ..PathPolicy::default()
        };
        assert!(validate_local_path(&link, &permissive).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_detect_symlink_in_hierarchy() {
        let dir = tempdir().unwrap();
        let real_dir = dir.path().join("real");
        std::fs::create_dir(&real_dir).unwrap();
        let linked_dir = dir.path().join("linked");
        std::os::unix::fs::symlink(&real_dir, &linked_dir).unwrap();
        std::fs::write(real_dir.join("app.log"), "line\n").unwrap();

        assert!(validate_no_symlinks(&linked_dir.join("app.log")).is_err());
        assert!(validate_no_symlinks(&real_dir.join("app.log")).is_ok());
    }

    #[test]
    fn test_file_size_limit_message() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", "x".repeat(2000)).unwrap();
        file.flush().unwrap();

        let policy = PathPolicy {
            max_file_size: 1000,
            ..PathPolicy::default()
        };
        let msg = validate_local_path(file.path(), &policy)
            .unwrap_err()
            .to_string();
        assert!(msg.contains("too large"));
        assert!(msg.contains("2,000"));
        assert!(msg.contains("1,000"));
    }

    #[test]
    fn test_missing_file_and_directory() {
        let err = validate_local_path(Path::new("/non/existent/file.log"), &PathPolicy::default())
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound { .. }));

        let dir = tempdir().unwrap();
        let err = validate_local_path(dir.path(), &PathPolicy::default()).unwrap_err();
        assert!(err.to_string().contains("not a regular file"));
    }
}
