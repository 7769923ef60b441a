//! Local filesystem backend
//!
//! A [`FileRef`] resolves to `root / owner_uid / path`. Symlinks are always
//! relative so a whole run directory can be moved without breaking them.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::trace;
use walkdir::WalkDir;

use super::Backend;
use crate::error::StageError;
use crate::file_ref::FileRef;

/// Backend that maps every task to a directory under `root`
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host path of a reference. An absolute owner replaces the root.
    pub fn resolve(&self, target: &FileRef) -> PathBuf {
        let base = self.root.join(target.owner_uid());
        if target.is_root() {
            base
        } else {
            base.join(target.path())
        }
    }
}

impl Backend for LocalBackend {
    fn exists(&self, target: &FileRef) -> bool {
        fs::symlink_metadata(self.resolve(target)).is_ok()
    }

    fn resolves(&self, target: &FileRef) -> bool {
        let path = self.resolve(target);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => walk_followed(&path).is_ok(),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    fn delete(&self, target: &FileRef) -> Result<(), StageError> {
        let path = self.resolve(target);
        let meta = fs::symlink_metadata(&path).map_err(|e| StageError::backend("delete", target, e))?;
        let result = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            // files and links; a linked directory is unlinked, not traversed
            fs::remove_file(&path)
        };
        result.map_err(|e| StageError::backend("delete", target, e))
    }

    fn copy(&self, src: &FileRef, dest: &FileRef) -> Result<(), StageError> {
        let from = self.resolve(src);
        let to = self.resolve(dest);
        let meta = fs::metadata(&from).map_err(|e| StageError::backend("copy", src, e))?;

        if meta.is_dir() {
            copy_tree(&from, &to).map_err(|e| StageError::backend("copy", dest, e))
        } else {
            fs::copy(&from, &to)
                .map(|_| ())
                .map_err(|e| StageError::backend("copy", dest, e))
        }
    }

    fn link(&self, src: &FileRef, dest: &FileRef, recursive: bool) -> Result<(), StageError> {
        let from = self.resolve(src);
        let to = self.resolve(dest);
        let meta = fs::metadata(&from).map_err(|e| StageError::backend("link", src, e))?;

        if recursive && meta.is_dir() {
            link_leaves(&from, &to).map_err(|e| StageError::backend("link", dest, e))
        } else {
            link_one(&from, &to).map_err(|e| StageError::backend("link", dest, e))
        }
    }

    fn is_dir(&self, target: &FileRef) -> bool {
        self.resolve(target).is_dir()
    }

    fn mkdir(&self, target: &FileRef, parents: bool, exist_ok: bool) -> Result<(), StageError> {
        let path = self.resolve(target);
        if fs::symlink_metadata(&path).is_ok() {
            if exist_ok && path.is_dir() {
                return Ok(());
            }
            return Err(StageError::backend(
                "mkdir",
                target,
                io::Error::new(io::ErrorKind::AlreadyExists, "already exists"),
            ));
        }
        let result = if parents {
            fs::create_dir_all(&path)
        } else {
            fs::create_dir(&path)
        };
        result.map_err(|e| StageError::backend("mkdir", target, e))
    }

    fn write_text(&self, content: &str, target: &FileRef) -> Result<(), StageError> {
        fs::write(self.resolve(target), content).map_err(|e| StageError::backend("write", target, e))
    }

    fn read_text(&self, target: &FileRef) -> Result<String, StageError> {
        fs::read_to_string(self.resolve(target)).map_err(|e| StageError::backend("read", target, e))
    }
}

// ============================================================================
// HOST HELPERS
// ============================================================================

/// Path that leads from the directory `from_dir` to `to`, walking up with
/// `..` where needed. Both inputs must be absolute and canonical.
pub(crate) fn relative_offset(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from_dir.components().collect();
    let dest: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(dest.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for component in &dest[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// One relative symlink at `link` pointing to the real location of `target`
fn link_one(target: &Path, link: &Path) -> io::Result<()> {
    let target = fs::canonicalize(target)?;
    let parent = link.parent().unwrap_or(Path::new("."));
    let parent = fs::canonicalize(parent)?;
    let offset = relative_offset(&parent, &target);
    trace!(link = %link.display(), offset = %offset.display(), "symlink");
    symlink(&offset, link, target.is_dir())
}

/// Everything under `src` with links followed, parents before children.
/// A dangling link or a link loop anywhere fails the whole walk.
fn walk_followed(src: &Path) -> io::Result<Vec<walkdir::DirEntry>> {
    WalkDir::new(src)
        .follow_links(true)
        .min_depth(1)
        .into_iter()
        .map(|entry| entry.map_err(io::Error::from))
        .collect()
}

fn relative_to(entry: &walkdir::DirEntry, src: &Path) -> io::Result<PathBuf> {
    entry
        .path()
        .strip_prefix(src)
        .map(Path::to_path_buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Mirror the directory structure of `src` under `dest` and link every file
fn link_leaves(src: &Path, dest: &Path) -> io::Result<()> {
    let entries = walk_followed(src)?;
    fs::create_dir_all(dest)?;
    for entry in entries {
        let target = dest.join(relative_to(&entry, src)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            link_one(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Recursive copy; links inside `src` are followed and copied as content
fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::symlink_metadata(dest).is_ok() {
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "destination exists"));
    }
    let entries = walk_followed(src)?;
    fs::create_dir_all(dest)?;
    for entry in entries {
        let target = dest.join(relative_to(&entry, src)?);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path, _is_dir: bool) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(windows)]
fn symlink(original: &Path, link: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        std::os::windows::fs::symlink_dir(original, link)
    } else {
        std::os::windows::fs::symlink_file(original, link)
    }
}
