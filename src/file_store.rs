//! Per-user sandboxed file storage
//!
//! Every user owns one directory directly below the store root. All
//! operations resolve their paths through [`normalize_under_root`] against
//! the owning user's directory before touching the filesystem, so nothing
//! a client sends can reach outside that tree.
//!
//! Client-visible paths (listing output, rename/delete input) are relative
//! to the store root: `<username>/<name>`.

use crate::error::FsError;
use crate::sandbox::{
    ensure_dir_exists, normalize_entry_under_root, normalize_under_root, single_component,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One listing record. Serialized as `{"name","type","path"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
}

fn map_io(path: &Path, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
        _ => FsError::io(path, e),
    }
}

#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the base directory that holds all user roots
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FsError> {
        let root = root.as_ref();
        ensure_dir_exists(root)?;
        let root = root.canonicalize().map_err(|e| FsError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a user's directory; the username must be one path component
    pub fn user_root(&self, username: &str) -> Result<PathBuf, FsError> {
        Ok(self.root.join(single_component(username)?))
    }

    pub fn has_user_root(&self, username: &str) -> bool {
        self.user_root(username).is_ok_and(|p| p.is_dir())
    }

    pub fn ensure_user_root(&self, username: &str) -> Result<PathBuf, FsError> {
        let dir = self.user_root(username)?;
        ensure_dir_exists(&dir)?;
        // Something other than a directory is squatting on the name
        if !dir.is_dir() {
            return Err(FsError::AlreadyExists(dir));
        }
        Ok(dir)
    }

    /// Canonical user directory, which must already exist
    fn existing_user_root(&self, username: &str) -> Result<PathBuf, FsError> {
        let dir = self.user_root(username)?;
        if !dir.is_dir() {
            return Err(FsError::NotFound(dir));
        }
        let canon = dir.canonicalize().map_err(|e| map_io(&dir, e))?;
        // A user directory that is itself a symlink must not lead elsewhere
        if !canon.starts_with(&self.root) {
            return Err(FsError::escape(username, "user directory resolves outside store"));
        }
        Ok(canon)
    }

    /// Resolve `name` strictly below the user's directory
    fn resolve_in_user(&self, user_root: &Path, name: &str) -> Result<PathBuf, FsError> {
        let p = normalize_under_root(user_root, name)?;
        if p == user_root {
            return Err(FsError::escape(name, "refers to the user directory itself"));
        }
        Ok(p)
    }

    /// Resolve a client path of the form `<username>/<rest>`. A symlink at
    /// the end of the path is returned as the link, not its target.
    pub fn resolve_entry(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut comps = Path::new(path)
            .components()
            .filter(|c| !matches!(c, Component::CurDir));
        let username = match comps.next() {
            Some(Component::Normal(u)) => u.to_string_lossy().into_owned(),
            _ => return Err(FsError::escape(path, "path does not start with a username")),
        };
        let rest: PathBuf = comps.collect();
        let rest = rest.to_string_lossy();
        if rest.is_empty() {
            return Err(FsError::escape(path, "refers to the user directory itself"));
        }
        let user_root = self.existing_user_root(&username)?;
        let p = normalize_entry_under_root(&user_root, &rest)?;
        if p == user_root {
            return Err(FsError::escape(path, "refers to the user directory itself"));
        }
        Ok(p)
    }

    /// Top-level entries of the user's directory, in filesystem order
    pub fn list(&self, username: &str) -> Result<Vec<DirectoryEntry>, FsError> {
        let user_root = self.existing_user_root(username)?;
        let rd = fs::read_dir(&user_root).map_err(|e| map_io(&user_root, e))?;
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry.map_err(|e| FsError::io(&user_root, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = match entry.file_type() {
                Ok(ft) if ft.is_symlink() => entry.path().is_dir(),
                Ok(ft) => ft.is_dir(),
                Err(_) => false,
            };
            out.push(DirectoryEntry {
                path: format!("{}/{}", username, name),
                name,
                kind: if is_dir {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                },
            });
        }
        Ok(out)
    }

    /// Resolve an existing regular file for reading
    pub fn file_for_read(&self, username: &str, name: &str) -> Result<PathBuf, FsError> {
        let user_root = self.existing_user_root(username)?;
        let p = self.resolve_in_user(&user_root, name)?;
        if !p.is_file() {
            return Err(FsError::NotFound(p));
        }
        Ok(p)
    }

    pub fn read(&self, username: &str, name: &str) -> Result<Vec<u8>, FsError> {
        let p = self.file_for_read(username, name)?;
        fs::read(&p).map_err(|e| map_io(&p, e))
    }

    /// Resolve a write destination, creating the user's directory lazily
    pub fn file_for_write(&self, username: &str, name: &str) -> Result<PathBuf, FsError> {
        self.ensure_user_root(username)?;
        let user_root = self.existing_user_root(username)?;
        self.resolve_in_user(&user_root, name)
    }

    pub fn write(&self, username: &str, name: &str, bytes: &[u8]) -> Result<PathBuf, FsError> {
        let p = self.file_for_write(username, name)?;
        if let Some(parent) = p.parent() {
            ensure_dir_exists(parent)?;
        }
        fs::write(&p, bytes).map_err(|e| FsError::io(&p, e))?;
        Ok(p)
    }

    /// Rename the entry at `path` (a file or a directory, per `kind`) within
    /// its parent directory
    pub fn rename(&self, path: &str, new_name: &str, kind: EntryKind) -> Result<PathBuf, FsError> {
        let src = self.resolve_entry(path)?;
        let new_name = single_component(new_name)?;
        let md = fs::symlink_metadata(&src).map_err(|e| map_io(&src, e))?;
        let matches_kind = match kind {
            EntryKind::File => md.is_file() || md.file_type().is_symlink(),
            EntryKind::Directory => md.is_dir(),
        };
        if !matches_kind {
            return Err(FsError::NotFound(src));
        }
        let parent = src
            .parent()
            .ok_or_else(|| FsError::escape(path, "entry has no parent"))?;
        let dst = parent.join(new_name);
        if fs::symlink_metadata(&dst).is_ok() {
            return Err(FsError::AlreadyExists(dst));
        }
        fs::rename(&src, &dst).map_err(|e| FsError::io(&src, e))?;
        Ok(dst)
    }

    /// Delete a file or an empty directory
    pub fn delete(&self, path: &str) -> Result<(), FsError> {
        let target = self.resolve_entry(path)?;
        let md = fs::symlink_metadata(&target).map_err(|e| map_io(&target, e))?;
        let res = if md.is_dir() {
            fs::remove_dir(&target)
        } else {
            fs::remove_file(&target)
        };
        res.map_err(|e| FsError::io(&target, e))
    }

    /// Create one directory below the user's directory. The parent of the
    /// new directory must already exist.
    pub fn make_dir(&self, username: &str, name: &str) -> Result<PathBuf, FsError> {
        let user_root = self.existing_user_root(username)?;
        let target = self.resolve_in_user(&user_root, name)?;
        fs::create_dir(&target).map_err(|e| map_io(&target, e))?;
        Ok(target)
    }

    /// Delete a directory and everything below it (deepest entries first)
    pub fn delete_dir_recursive(&self, path: &str) -> Result<(), FsError> {
        let target = self.resolve_entry(path)?;
        let md = fs::symlink_metadata(&target).map_err(|e| map_io(&target, e))?;
        if !md.is_dir() {
            return Err(FsError::NotFound(target));
        }
        for entry in walkdir::WalkDir::new(&target).contents_first(true) {
            let entry = entry.map_err(|e| {
                let p = e.path().unwrap_or(&target).to_path_buf();
                FsError::io(&p, e.into())
            })?;
            let p = entry.path();
            let res = if entry.file_type().is_dir() {
                fs::remove_dir(p)
            } else {
                fs::remove_file(p)
            };
            res.map_err(|e| FsError::io(p, e))?;
        }
        Ok(())
    }
}

/// Flat drop directory for anonymous uploads
#[derive(Debug)]
pub struct Inbox {
    root: PathBuf,
}

impl Inbox {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, FsError> {
        let root = root.as_ref();
        ensure_dir_exists(root)?;
        let root = root.canonicalize().map_err(|e| FsError::io(root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn save(&self, name: &str, bytes: &[u8]) -> Result<PathBuf, FsError> {
        let p = normalize_under_root(&self.root, single_component(name)?)?;
        fs::write(&p, bytes).map_err(|e| FsError::io(&p, e))?;
        Ok(p)
    }
}
