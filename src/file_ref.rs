//! Backend-agnostic file references and staging directives
//!
//! A [`FileRef`] names a file or directory by the task that owns it and a path
//! relative to that task's working directory. Nothing here touches storage;
//! resolving a reference to real bytes is the job of a
//! [`Backend`](crate::backend::Backend).

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StageError;

/// Reference to a file or directory owned by a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawFileRef")]
pub struct FileRef {
    owner_uid: String,
    path: PathBuf,
    is_dir: bool,
}

#[derive(Deserialize)]
struct RawFileRef {
    owner_uid: String,
    path: PathBuf,
    is_dir: bool,
}

impl TryFrom<RawFileRef> for FileRef {
    type Error = StageError;

    fn try_from(raw: RawFileRef) -> Result<Self, Self::Error> {
        FileRef::new(raw.owner_uid, raw.path, raw.is_dir)
    }
}

impl FileRef {
    fn new(
        owner_uid: impl Into<String>,
        path: impl AsRef<Path>,
        is_dir: bool,
    ) -> Result<Self, StageError> {
        let owner_uid = owner_uid.into();
        check_owner(&owner_uid)?;
        Ok(Self {
            owner_uid,
            path: relative_path(path.as_ref())?,
            is_dir,
        })
    }

    /// Reference to a single file
    pub fn file(owner_uid: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StageError> {
        Self::new(owner_uid, path, false)
    }

    /// Reference to a directory
    pub fn dir(owner_uid: impl Into<String>, path: impl AsRef<Path>) -> Result<Self, StageError> {
        Self::new(owner_uid, path, true)
    }

    /// The working directory of a task itself
    pub fn working_dir(uid: impl Into<String>) -> Result<Self, StageError> {
        Self::new(uid, "", true)
    }

    pub fn owner_uid(&self) -> &str {
        &self.owner_uid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    /// True for the owner's working directory (empty relative path)
    pub fn is_root(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    /// Derive a child reference under the same owner
    pub fn join(&self, child: impl AsRef<Path>, is_dir: bool) -> Result<Self, StageError> {
        let child = relative_path(child.as_ref())?;
        Ok(Self {
            owner_uid: self.owner_uid.clone(),
            path: self.path.join(child),
            is_dir,
        })
    }

    /// Reference to the parent directory, `None` for an owner root
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let parent = self.path.parent().unwrap_or(Path::new(""));
        Some(Self {
            owner_uid: self.owner_uid.clone(),
            path: parent.to_path_buf(),
            is_dir: true,
        })
    }

    /// Last path component, if any
    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "{}:.", self.owner_uid)
        } else {
            write!(f, "{}:{}", self.owner_uid, self.path.display())
        }
    }
}

/// A relative owner is one directory name under the root. An absolute owner
/// names an external location and may not contain `..`.
fn check_owner(owner: &str) -> Result<(), StageError> {
    let invalid = |reason: &'static str| -> Result<(), StageError> {
        Err(StageError::InvalidPath {
            path: owner.to_string(),
            reason,
        })
    };
    if owner.is_empty() {
        return invalid("owner uid is empty");
    }
    let path = Path::new(owner);
    if path.is_absolute() {
        if path.components().any(|c| c == Component::ParentDir) {
            return invalid("'..' is not allowed in an owner");
        }
        return Ok(());
    }
    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) if name == owner => Ok(()),
        _ => invalid("relative owner must be a single directory name"),
    }
}

/// Normalize a relative path, rejecting anything that escapes its owner.
///
/// `.` components are dropped; root, prefix and `..` components are errors.
pub(crate) fn relative_path(path: &Path) -> Result<PathBuf, StageError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(StageError::InvalidPath {
                    path: path.display().to_string(),
                    reason: "'..' is not allowed",
                })
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(StageError::InvalidPath {
                    path: path.display().to_string(),
                    reason: "path must be relative",
                })
            }
        }
    }
    Ok(out)
}

// ============================================================================
// LINK SPEC
// ============================================================================

/// How a staged file reaches its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    Symlink,
    Copy,
}

/// Intent to make `source` available as `destination_name` inside the
/// working directory of the task that receives it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawLinkSpec")]
pub struct LinkSpec {
    source: FileRef,
    destination_name: PathBuf,
    mode: LinkMode,
    recursive: bool,
    overwrite: bool,
}

#[derive(Deserialize)]
struct RawLinkSpec {
    source: FileRef,
    destination_name: PathBuf,
    mode: LinkMode,
    #[serde(default)]
    recursive: bool,
    #[serde(default)]
    overwrite: bool,
}

impl TryFrom<RawLinkSpec> for LinkSpec {
    type Error = StageError;

    fn try_from(raw: RawLinkSpec) -> Result<Self, Self::Error> {
        Ok(LinkSpec::new(raw.source, raw.destination_name, raw.mode)?
            .recursive(raw.recursive)
            .overwrite(raw.overwrite))
    }
}

impl LinkSpec {
    pub fn new(
        source: FileRef,
        destination_name: impl AsRef<Path>,
        mode: LinkMode,
    ) -> Result<Self, StageError> {
        let spec = Self {
            source,
            destination_name: relative_path(destination_name.as_ref())?,
            mode,
            recursive: false,
            overwrite: false,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Destination must be a non-empty path that stays inside the receiver
    pub fn validate(&self) -> Result<(), StageError> {
        let normalized = relative_path(&self.destination_name)?;
        if normalized.as_os_str().is_empty() {
            return Err(StageError::InvalidPath {
                path: self.destination_name.display().to_string(),
                reason: "destination name is empty",
            });
        }
        Ok(())
    }

    /// Stage by symbolic link
    pub fn symlink(source: FileRef, destination_name: impl AsRef<Path>) -> Result<Self, StageError> {
        Self::new(source, destination_name, LinkMode::Symlink)
    }

    /// Stage by copy
    pub fn copy(source: FileRef, destination_name: impl AsRef<Path>) -> Result<Self, StageError> {
        Self::new(source, destination_name, LinkMode::Copy)
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn source(&self) -> &FileRef {
        &self.source
    }

    pub fn destination_name(&self) -> &Path {
        &self.destination_name
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_overwrite(&self) -> bool {
        self.overwrite
    }

    /// `recursive` only applies to directory sources
    pub fn effective_recursive(&self) -> bool {
        self.recursive && self.source.is_dir
    }

    /// Destination reference inside the receiving task's working directory
    pub fn destination_for(&self, uid: &str) -> Result<FileRef, StageError> {
        FileRef::new(uid, &self.destination_name, self.source.is_dir)
    }
}
