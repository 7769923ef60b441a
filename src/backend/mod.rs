//! # Storage Backends
//!
//! The capability set every execution environment provides, plus the checked
//! staging operations the engine builds on top of it.
//!
//! ## Overview
//!
//! - [`Backend`] - the eight capabilities plus the `resolves` source check
//! - [`LocalBackend`] - direct filesystem calls under a root directory
//! - [`GraphBackend`] - in-memory tree with a provenance log, no filesystem
//!
//! Both implementations return the same values and the same
//! [`std::io::ErrorKind`]s for the same calls, so the engine and pipelines
//! cannot tell them apart.
//!
//! ## Staging
//!
//! [`stage`], [`stage_copy`] and [`stage_link`] add the existence and
//! overwrite rules on top of the raw `copy` / `link` capabilities:
//!
//! ```rust
//! use stagehand::backend::{stage_link, Backend, GraphBackend};
//! use stagehand::FileRef;
//!
//! let backend = GraphBackend::new();
//! let scf = FileRef::working_dir("01-scf").unwrap();
//! backend.mkdir(&scf, true, true).unwrap();
//! let out = scf.join("espresso.pwo", false).unwrap();
//! backend.write_text("done", &out).unwrap();
//!
//! let nscf = FileRef::working_dir("02-nscf").unwrap();
//! backend.mkdir(&nscf, true, true).unwrap();
//! let dest = nscf.join("prev.pwo", false).unwrap();
//! stage_link(&backend, &out, &dest, false, false).unwrap();
//! assert_eq!(backend.read_text(&dest).unwrap(), "done");
//! ```

mod graph;
mod local;

pub use graph::{GraphBackend, GraphEntry, GraphEntryKind};
pub use local::LocalBackend;

use tracing::debug;

use crate::error::StageError;
use crate::file_ref::{FileRef, LinkMode, LinkSpec};

/// Storage capabilities a concrete execution environment must provide.
///
/// Raw operations: they do not apply overwrite rules. Use the staging
/// functions in this module for that.
pub trait Backend: Send + Sync {
    /// True if something exists at `target`, including a dangling link
    fn exists(&self, target: &FileRef) -> bool;

    /// True if `target` resolves with links followed. For a directory every
    /// entry beneath it must resolve too. Staging checks sources with this.
    fn resolves(&self, target: &FileRef) -> bool;

    /// Remove a file or link, or a directory with everything under it
    fn delete(&self, target: &FileRef) -> Result<(), StageError>;

    /// Copy bytes; directories are copied recursively
    fn copy(&self, src: &FileRef, dest: &FileRef) -> Result<(), StageError>;

    /// Link `dest` to `src`.
    ///
    /// With `recursive` on a directory, `dest` becomes a real directory and
    /// every leaf file gets its own link. Otherwise one link node is created.
    fn link(&self, src: &FileRef, dest: &FileRef, recursive: bool) -> Result<(), StageError>;

    /// True if `target` resolves to a directory (links are followed)
    fn is_dir(&self, target: &FileRef) -> bool;

    /// Create a directory, with `mkdir -p` style flags
    fn mkdir(&self, target: &FileRef, parents: bool, exist_ok: bool) -> Result<(), StageError>;

    /// Write `content` to a file; the parent directory must exist
    fn write_text(&self, content: &str, target: &FileRef) -> Result<(), StageError>;

    /// Read a file as UTF-8 text
    fn read_text(&self, target: &FileRef) -> Result<String, StageError>;
}

/// Existence and overwrite rules shared by every staging operation.
///
/// Fails before any mutation unless `overwrite` allows replacing `dest`.
/// A source that is, or contains, a dangling link counts as missing.
fn prepare(
    backend: &dyn Backend,
    src: &FileRef,
    dest: &FileRef,
    overwrite: bool,
) -> Result<(), StageError> {
    if !backend.resolves(src) {
        return Err(StageError::SourceMissing {
            from: src.to_string(),
        });
    }
    if backend.exists(dest) {
        if !overwrite {
            return Err(StageError::DestinationExists {
                target: dest.to_string(),
            });
        }
        debug!(dest = %dest, "removing existing destination");
        backend.delete(dest)?;
    }
    Ok(())
}

/// Copy `src` to `dest`, replacing `dest` only if `overwrite` is set
pub fn stage_copy(
    backend: &dyn Backend,
    src: &FileRef,
    dest: &FileRef,
    overwrite: bool,
) -> Result<(), StageError> {
    prepare(backend, src, dest, overwrite)?;
    backend.copy(src, dest)
}

/// Link `dest` to `src`, replacing `dest` only if `overwrite` is set
pub fn stage_link(
    backend: &dyn Backend,
    src: &FileRef,
    dest: &FileRef,
    recursive: bool,
    overwrite: bool,
) -> Result<(), StageError> {
    prepare(backend, src, dest, overwrite)?;
    backend.link(src, dest, recursive && src.is_dir())
}

/// Apply a [`LinkSpec`] for the task `uid` and return the staged reference
pub fn stage(backend: &dyn Backend, spec: &LinkSpec, uid: &str) -> Result<FileRef, StageError> {
    let dest = spec.destination_for(uid)?;
    debug!(
        source = %spec.source(),
        dest = %dest,
        mode = ?spec.mode(),
        recursive = spec.effective_recursive(),
        "staging"
    );
    match spec.mode() {
        LinkMode::Symlink => stage_link(
            backend,
            spec.source(),
            &dest,
            spec.effective_recursive(),
            spec.is_overwrite(),
        )?,
        LinkMode::Copy => stage_copy(backend, spec.source(), &dest, spec.is_overwrite())?,
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> GraphBackend {
        let backend = GraphBackend::new();
        let scf = FileRef::working_dir("01-scf").unwrap();
        backend.mkdir(&scf, true, true).unwrap();
        backend
            .mkdir(&scf.join("tmp", true).unwrap(), false, false)
            .unwrap();
        backend
            .write_text("rho", &FileRef::file("01-scf", "tmp/charge.dat").unwrap())
            .unwrap();
        backend
            .mkdir(&FileRef::working_dir("02-nscf").unwrap(), true, true)
            .unwrap();
        backend
    }

    #[test]
    fn missing_source_is_rejected() {
        let backend = seeded();
        let src = FileRef::dir("01-scf", "nope").unwrap();
        let dest = FileRef::dir("02-nscf", "nope").unwrap();
        let err = stage_link(&backend, &src, &dest, true, true).unwrap_err();
        assert!(matches!(err, StageError::SourceMissing { .. }));
        assert!(!backend.exists(&dest));
    }

    #[test]
    fn dangling_source_is_missing_and_destination_kept() {
        let backend = seeded();
        let real = FileRef::file("01-scf", "tmp/real.dat").unwrap();
        let src = FileRef::file("01-scf", "tmp/out.dat").unwrap();
        backend.write_text("gone soon", &real).unwrap();
        backend.link(&real, &src, false).unwrap();
        backend.delete(&real).unwrap();
        assert!(backend.exists(&src));

        let dest = FileRef::file("02-nscf", "out.dat").unwrap();
        backend.write_text("precious", &dest).unwrap();
        let err = stage_link(&backend, &src, &dest, false, true).unwrap_err();
        assert!(matches!(err, StageError::SourceMissing { .. }));
        let err = stage_copy(&backend, &src, &dest, true).unwrap_err();
        assert!(matches!(err, StageError::SourceMissing { .. }));
        assert_eq!(backend.read_text(&dest).unwrap(), "precious");
    }

    #[test]
    fn existing_destination_without_overwrite_is_untouched() {
        let backend = seeded();
        let dest = FileRef::file("02-nscf", "charge.dat").unwrap();
        backend.write_text("mine", &dest).unwrap();

        let src = FileRef::file("01-scf", "tmp/charge.dat").unwrap();
        let err = stage_copy(&backend, &src, &dest, false).unwrap_err();
        assert!(matches!(err, StageError::DestinationExists { .. }));
        assert_eq!(backend.read_text(&dest).unwrap(), "mine");

        stage_copy(&backend, &src, &dest, true).unwrap();
        assert_eq!(backend.read_text(&dest).unwrap(), "rho");
    }

    #[test]
    fn stage_returns_destination_with_source_kind() {
        let backend = seeded();
        let spec = LinkSpec::symlink(FileRef::dir("01-scf", "tmp").unwrap(), "tmp")
            .unwrap()
            .recursive(true)
            .overwrite(true);
        let dest = stage(&backend, &spec, "02-nscf").unwrap();
        assert_eq!(dest, FileRef::dir("02-nscf", "tmp").unwrap());
        assert_eq!(
            backend
                .read_text(&dest.join("charge.dat", false).unwrap())
                .unwrap(),
            "rho"
        );
    }
}
