//! Path confinement helpers shared by the file store and the inbox.

use crate::error::FsError;
use std::path::{Component, Path, PathBuf};

/// Normalize a client-supplied path so it stays under `root`.
///
/// `root` must already be canonical. The path is rejected when it:
/// 1. Contains a NUL byte
/// 2. Has parent, root or prefix components
/// 3. On Windows, has a ':' in a component (ADS)
/// 4. Resolves through a symlink to somewhere outside `root`
pub fn normalize_under_root(root: &Path, p: &str) -> Result<PathBuf, FsError> {
    let safe = clean_relative(p)?;
    resolve_existing(root, &root.join(&safe), p)
}

/// Like [`normalize_under_root`], except the final component is not
/// resolved. A symlink at the end of the path names the link itself, which
/// is what delete and rename must act on.
pub fn normalize_entry_under_root(root: &Path, p: &str) -> Result<PathBuf, FsError> {
    let safe = clean_relative(p)?;
    let Some(name) = safe.file_name() else {
        return Ok(root.to_path_buf());
    };
    let parent = safe.parent().unwrap_or_else(|| Path::new(""));
    let mut resolved = resolve_existing(root, &root.join(parent), p)?;
    resolved.push(name);
    Ok(resolved)
}

/// Strip `.` components and reject anything that could climb out
fn clean_relative(p: &str) -> Result<PathBuf, FsError> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.contains('\0') {
        return Err(FsError::escape(p, "path contains NUL byte"));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(p).components() {
        match component {
            CurDir => {}
            Normal(s) => {
                #[cfg(windows)]
                if s.to_string_lossy().contains(':') {
                    return Err(FsError::escape(p, "path component contains colon"));
                }
                safe.push(s);
            }
            ParentDir | RootDir | Prefix(_) => {
                return Err(FsError::escape(
                    p,
                    format!("disallowed component {:?}", component),
                ));
            }
        }
    }
    Ok(safe)
}

/// Canonicalize the deepest ancestor of `joined` that exists (resolving
/// symlinks), re-append the components that do not exist yet, and require
/// the result to stay under `root`.
fn resolve_existing(root: &Path, joined: &Path, p: &str) -> Result<PathBuf, FsError> {
    let mut existing = joined.to_path_buf();
    let mut missing = Vec::new();
    while std::fs::symlink_metadata(&existing).is_err() {
        match (existing.file_name(), existing.parent()) {
            (Some(name), Some(parent)) => {
                missing.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => break,
        }
    }
    let mut final_path = existing
        .canonicalize()
        .map_err(|e| FsError::io(&existing, e))?;
    for name in missing.iter().rev() {
        final_path.push(name);
    }

    if !final_path.starts_with(root) {
        return Err(FsError::escape(p, "resolves outside its root"));
    }

    Ok(final_path)
}

/// Validate a name that must be exactly one normal path component
/// (usernames, rename targets).
pub fn single_component(name: &str) -> Result<&str, FsError> {
    if name.is_empty() || name.contains('\0') || name.contains('/') || name.contains('\\') {
        return Err(FsError::escape(name, "not a single path component"));
    }
    let mut comps = Path::new(name).components();
    match (comps.next(), comps.next()) {
        (Some(Component::Normal(_)), None) => {}
        _ => return Err(FsError::escape(name, "not a single path component")),
    }
    #[cfg(windows)]
    if name.contains(':') {
        return Err(FsError::escape(name, "name contains colon"));
    }
    Ok(name)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<(), FsError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| FsError::io(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn canonical_root(t: &TempDir) -> PathBuf {
        t.path().canonicalize().unwrap()
    }

    #[test]
    fn test_normalize_safe_paths() {
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);

        let result = normalize_under_root(&root, "subdir/file.txt").unwrap();
        assert!(result.starts_with(&root));
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(&root, "./subdir/./file.txt").unwrap();
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(&root, "subdir//file.txt").unwrap();
        assert!(result.ends_with("subdir/file.txt"));
    }

    #[test]
    fn test_normalize_unsafe_paths() {
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);

        for bad in [
            "../etc/passwd",
            "subdir/../../etc/passwd",
            "/etc/passwd",
            "file\0.txt",
            "a/../b",
        ] {
            let err = normalize_under_root(&root, bad).unwrap_err();
            assert!(err.is_escape(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_normalize_existing_file_is_canonical() {
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);
        fs::create_dir(root.join("subdir")).unwrap();
        fs::write(root.join("subdir/file.txt"), "test").unwrap();

        let result = normalize_under_root(&root, "subdir/file.txt").unwrap();
        assert_eq!(result, root.join("subdir/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_out_of_root_rejected() {
        let outside = TempDir::new().unwrap();
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let err = normalize_under_root(&root, "link/secret").unwrap_err();
        assert!(err.is_escape());
        // New file below the escaping link is rejected too
        let err = normalize_under_root(&root, "link/new.txt").unwrap_err();
        assert!(err.is_escape());
        // ...and so is anything under a missing directory below it
        let err = normalize_under_root(&root, "link/missing/deeper.txt").unwrap_err();
        assert!(err.is_escape());
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_keeps_final_symlink() {
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);
        fs::create_dir(root.join("dir")).unwrap();
        fs::write(root.join("dir/real.txt"), "r").unwrap();
        std::os::unix::fs::symlink(root.join("dir/real.txt"), root.join("dir/link")).unwrap();
        std::os::unix::fs::symlink(root.join("gone"), root.join("dir/dangling")).unwrap();

        assert_eq!(
            normalize_entry_under_root(&root, "dir/link").unwrap(),
            root.join("dir/link")
        );
        assert_eq!(
            normalize_under_root(&root, "dir/link").unwrap(),
            root.join("dir/real.txt")
        );
        // A dangling link still resolves to itself
        assert_eq!(
            normalize_entry_under_root(&root, "dir/dangling").unwrap(),
            root.join("dir/dangling")
        );
        assert!(normalize_entry_under_root(&root, "../x").unwrap_err().is_escape());
    }

    #[cfg(unix)]
    #[test]
    fn test_entry_parent_symlink_out_of_root_rejected() {
        let outside = TempDir::new().unwrap();
        let t = TempDir::new().unwrap();
        let root = canonical_root(&t);
        fs::write(outside.path().join("secret"), "s").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let err = normalize_entry_under_root(&root, "link/secret").unwrap_err();
        assert!(err.is_escape());
    }

    #[test]
    fn test_single_component() {
        assert_eq!(single_component("alice").unwrap(), "alice");
        assert_eq!(single_component("report.v2.txt").unwrap(), "report.v2.txt");
        for bad in ["", ".", "..", "a/b", "/abs", "a\\b", "nul\0"] {
            assert!(single_component(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_ensure_dir_exists() {
        let t = TempDir::new().unwrap();
        let new_dir = t.path().join("new").join("nested");
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());
        // Idempotent
        ensure_dir_exists(&new_dir).unwrap();
    }
}
