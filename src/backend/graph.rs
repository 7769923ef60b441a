//! Provenance graph backend
//!
//! No filesystem: the tree lives in memory, keyed by `(owner, path)`, and
//! every mutation is appended to a [`ProvenanceLog`]. Return values and
//! `io::ErrorKind`s match [`LocalBackend`](super::LocalBackend) call for call.
//!
//! Owners that are absolute paths stand for external libraries. They are
//! read-only and can only be seeded with [`GraphBackend::import_text`].

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::trace;

use super::Backend;
use crate::error::StageError;
use crate::file_ref::FileRef;
use crate::provenance::{ProvenanceEvent, ProvenanceKind, ProvenanceLog};

/// Maximum number of links followed while resolving one path
const MAX_HOPS: usize = 40;

// ============================================================================
// TREE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Location {
    owner: Arc<str>,
    path: PathBuf,
}

impl Location {
    fn of(target: &FileRef) -> Self {
        Self {
            owner: Arc::from(target.owner_uid()),
            path: target.path().to_path_buf(),
        }
    }

    fn root(owner: &Arc<str>) -> Self {
        Self {
            owner: owner.clone(),
            path: PathBuf::new(),
        }
    }

    fn child(&self, name: impl AsRef<Path>) -> Self {
        Self {
            owner: self.owner.clone(),
            path: self.path.join(name),
        }
    }

    fn is_external(&self) -> bool {
        Path::new(&*self.owner).is_absolute()
    }

    fn display_path(&self) -> String {
        if self.path.as_os_str().is_empty() {
            ".".to_string()
        } else {
            self.path.display().to_string()
        }
    }

    /// Every location from the owner root down to `self`, inclusive
    fn lineage(&self) -> Vec<Location> {
        let mut out = vec![Location::root(&self.owner)];
        for part in self.path.iter() {
            let next = out[out.len() - 1].child(part);
            out.push(next);
        }
        out
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.owner, self.display_path())
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    File(Arc<str>),
    /// Target is the resolved location of the link source
    Link(Location),
}

/// One entry produced by walking a directory with links followed
enum Walked {
    Dir(PathBuf),
    File {
        rel: PathBuf,
        origin: Location,
        content: Arc<str>,
    },
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such file or directory")
}

fn already_exists() -> io::Error {
    io::Error::new(io::ErrorKind::AlreadyExists, "file exists")
}

fn not_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::NotADirectory, "not a directory")
}

fn is_a_directory() -> io::Error {
    io::Error::new(io::ErrorKind::IsADirectory, "is a directory")
}

fn too_many_links() -> io::Error {
    io::Error::other("too many levels of symbolic links")
}

fn writable(loc: &Location) -> io::Result<()> {
    if loc.is_external() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "external owner is read-only",
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<Location, Node>,
}

impl Tree {
    fn get(&self, loc: &Location) -> Option<&Node> {
        self.nodes.get(loc)
    }

    /// Follow every link and return the node the location ends on
    fn lookup(&self, loc: &Location) -> io::Result<(Location, Node)> {
        let here = self.resolve(loc, true)?;
        let node = self.get(&here).cloned().ok_or_else(not_found)?;
        Ok((here, node))
    }

    /// True if `loc` holds a node, tolerating a missing parent
    fn occupied(&self, loc: &Location) -> bool {
        self.resolve(loc, false)
            .map(|here| self.get(&here).is_some())
            .unwrap_or(false)
    }

    fn expect_dir(&self, loc: &Location) -> io::Result<()> {
        match self.get(loc) {
            Some(Node::Dir) => Ok(()),
            Some(_) => Err(not_a_directory()),
            None => Err(not_found()),
        }
    }

    /// Resolve links in every intermediate component, and in the last one
    /// if `follow_last`. The result need not exist, but its parent does.
    fn resolve(&self, loc: &Location, follow_last: bool) -> io::Result<Location> {
        let mut hops = 0;
        self.resolve_hops(loc, follow_last, &mut hops)
    }

    fn resolve_hops(
        &self,
        loc: &Location,
        follow_last: bool,
        hops: &mut usize,
    ) -> io::Result<Location> {
        let parts: Vec<&OsStr> = loc.path.iter().collect();
        let mut current = Location::root(&loc.owner);
        for (i, part) in parts.iter().enumerate() {
            self.expect_dir(&current)?;
            let next = current.child(part);
            let last = i + 1 == parts.len();
            current = match self.get(&next) {
                Some(Node::Link(target)) if !last || follow_last => {
                    *hops += 1;
                    if *hops > MAX_HOPS {
                        return Err(too_many_links());
                    }
                    self.resolve_hops(target, true, hops)?
                }
                _ => next,
            };
        }
        Ok(current)
    }

    fn children(&self, dir: &Location) -> Vec<(Location, Node)> {
        self.nodes
            .range(dir.clone()..)
            .take_while(|(loc, _)| loc.owner == dir.owner && loc.path.starts_with(&dir.path))
            .filter(|(loc, _)| loc.path.parent() == Some(dir.path.as_path()))
            .map(|(loc, node)| (loc.clone(), node.clone()))
            .collect()
    }

    /// Contents of a directory, links followed, parents before children
    fn walk(&self, dir: &Location) -> io::Result<Vec<Walked>> {
        let mut out = Vec::new();
        self.walk_into(dir, Path::new(""), 0, &mut out)?;
        Ok(out)
    }

    fn walk_into(
        &self,
        dir: &Location,
        rel: &Path,
        depth: usize,
        out: &mut Vec<Walked>,
    ) -> io::Result<()> {
        for (loc, node) in self.children(dir) {
            let name = loc.path.file_name().ok_or_else(not_found)?;
            let rel = rel.join(name);
            let (loc, node, depth) = match node {
                Node::Link(target) => {
                    if depth >= MAX_HOPS {
                        return Err(too_many_links());
                    }
                    let (real, node) = self.lookup(&target)?;
                    (real, node, depth + 1)
                }
                other => (loc, other, depth),
            };
            match node {
                Node::Dir => {
                    out.push(Walked::Dir(rel.clone()));
                    self.walk_into(&loc, &rel, depth, out)?;
                }
                Node::File(content) => out.push(Walked::File {
                    rel,
                    origin: loc,
                    content,
                }),
                Node::Link(_) => return Err(too_many_links()),
            }
        }
        Ok(())
    }

    /// `create_dir_all`: existing directories are fine, anything else in
    /// the way is an error
    fn make_dirs(&mut self, loc: &Location) -> io::Result<Vec<Location>> {
        let lineage = loc.lineage();
        let last = lineage.len() - 1;
        let mut created = Vec::new();
        for (i, step) in lineage.iter().enumerate() {
            let here = self.resolve(step, false)?;
            match self.get(&here).cloned() {
                None => {
                    writable(&here)?;
                    self.nodes.insert(here.clone(), Node::Dir);
                    created.push(here);
                }
                Some(Node::Dir) => {}
                Some(_) => {
                    let real = self.resolve(step, true)?;
                    if !matches!(self.get(&real), Some(Node::Dir)) {
                        return Err(if i == last {
                            already_exists()
                        } else {
                            not_a_directory()
                        });
                    }
                }
            }
        }
        Ok(created)
    }

    fn remove(&mut self, loc: &Location) {
        self.nodes
            .retain(|k, _| !(k.owner == loc.owner && k.path.starts_with(&loc.path)));
    }

    // ------------------------------------------------------------------
    // capabilities, returning what to record
    // ------------------------------------------------------------------

    fn delete(&mut self, loc: &Location) -> io::Result<ProvenanceKind> {
        let here = self.resolve(loc, false)?;
        match self.get(&here).cloned() {
            None => return Err(not_found()),
            Some(Node::Dir) => {
                writable(&here)?;
                self.remove(&here);
            }
            Some(_) => {
                writable(&here)?;
                self.nodes.remove(&here);
            }
        }
        Ok(ProvenanceKind::Deleted {
            owner: here.owner.clone(),
            path: here.display_path(),
        })
    }

    fn mkdir(
        &mut self,
        loc: &Location,
        parents: bool,
        exist_ok: bool,
    ) -> io::Result<Vec<ProvenanceKind>> {
        if let Ok(here) = self.resolve(loc, false) {
            if self.get(&here).is_some() {
                let real = self.resolve(loc, true)?;
                if exist_ok && matches!(self.get(&real), Some(Node::Dir)) {
                    return Ok(Vec::new());
                }
                return Err(already_exists());
            }
        }

        let created = if parents {
            self.make_dirs(loc)?
        } else {
            let here = self.resolve(loc, false)?;
            writable(&here)?;
            self.nodes.insert(here.clone(), Node::Dir);
            vec![here]
        };
        Ok(created
            .into_iter()
            .map(|l| ProvenanceKind::DirCreated {
                owner: l.owner.clone(),
                path: l.display_path(),
            })
            .collect())
    }

    fn write(&mut self, loc: &Location, content: &str) -> io::Result<ProvenanceKind> {
        let here = self.resolve(loc, true)?;
        if matches!(self.get(&here), Some(Node::Dir)) {
            return Err(is_a_directory());
        }
        writable(&here)?;
        self.nodes
            .insert(here.clone(), Node::File(Arc::from(content)));
        Ok(ProvenanceKind::TextWritten {
            owner: here.owner.clone(),
            path: here.display_path(),
            bytes: content.len(),
        })
    }

    fn read(&self, loc: &Location) -> io::Result<String> {
        let here = self.resolve(loc, true)?;
        match self.get(&here) {
            Some(Node::File(content)) => Ok(content.to_string()),
            Some(Node::Dir) => Err(is_a_directory()),
            _ => Err(not_found()),
        }
    }

    fn copy(&mut self, src: &Location, dest: &Location) -> io::Result<ProvenanceKind> {
        let (from, node) = self.lookup(src)?;
        match node {
            Node::File(content) => {
                let to = self.resolve(dest, true)?;
                if matches!(self.get(&to), Some(Node::Dir)) {
                    return Err(is_a_directory());
                }
                writable(&to)?;
                self.nodes.insert(to, Node::File(content));
            }
            _ => {
                if self.occupied(dest) {
                    return Err(already_exists());
                }
                let walked = self.walk(&from)?;
                self.make_dirs(dest)?;
                let to = self.resolve(dest, true)?;
                for entry in walked {
                    match entry {
                        Walked::Dir(rel) => {
                            self.nodes.insert(to.child(rel), Node::Dir);
                        }
                        Walked::File { rel, content, .. } => {
                            self.nodes.insert(to.child(rel), Node::File(content));
                        }
                    }
                }
            }
        }
        Ok(ProvenanceKind::Copied {
            source_owner: src.owner.clone(),
            source: src.display_path(),
            owner: dest.owner.clone(),
            path: dest.display_path(),
        })
    }

    fn link(
        &mut self,
        src: &Location,
        dest: &Location,
        recursive: bool,
    ) -> io::Result<ProvenanceKind> {
        let (from, node) = self.lookup(src)?;
        match node {
            Node::Dir if recursive => {
                let walked = self.walk(&from)?;
                self.make_dirs(dest)?;
                let to = self.resolve(dest, true)?;
                for entry in walked {
                    match entry {
                        Walked::Dir(rel) => {
                            self.make_dirs(&to.child(rel))?;
                        }
                        Walked::File { rel, origin, .. } => {
                            let leaf = self.resolve(&to.child(rel), false)?;
                            if self.get(&leaf).is_some() {
                                return Err(already_exists());
                            }
                            trace!(leaf = %leaf, origin = %origin, "leaf link");
                            self.nodes.insert(leaf, Node::Link(origin));
                        }
                    }
                }
            }
            _ => {
                let to = self.resolve(dest, false)?;
                if self.get(&to).is_some() {
                    return Err(already_exists());
                }
                writable(&to)?;
                self.nodes.insert(to, Node::Link(from));
            }
        }
        Ok(ProvenanceKind::Linked {
            source_owner: src.owner.clone(),
            source: src.display_path(),
            owner: dest.owner.clone(),
            path: dest.display_path(),
            recursive,
        })
    }

    fn entries(&self, owner: &str) -> Vec<GraphEntry> {
        self.nodes
            .iter()
            .filter(|(loc, _)| &*loc.owner == owner)
            .map(|(loc, node)| GraphEntry {
                path: loc.path.clone(),
                node: match node {
                    Node::Dir => GraphEntryKind::Dir,
                    Node::File(content) => GraphEntryKind::File {
                        bytes: content.len(),
                    },
                    Node::Link(target) => GraphEntryKind::Link {
                        target: target.to_string(),
                    },
                },
            })
            .collect()
    }
}

// ============================================================================
// PUBLIC API
// ============================================================================

/// One node of an owner's tree, for inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphEntry {
    pub path: PathBuf,
    pub node: GraphEntryKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEntryKind {
    Dir,
    File { bytes: usize },
    Link { target: String },
}

/// In-memory backend that records where every byte came from
pub struct GraphBackend {
    tree: RwLock<Tree>,
    log: ProvenanceLog,
}

impl GraphBackend {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(Tree::default()),
            log: ProvenanceLog::new(),
        }
    }

    /// Seed a file into an external (absolute) owner, creating directories
    pub fn import_text(&self, content: &str, target: &FileRef) -> Result<(), StageError> {
        let loc = Location::of(target);
        if !loc.is_external() {
            return Err(StageError::InvalidPath {
                path: target.to_string(),
                reason: "imports must target an absolute owner",
            });
        }
        let mut tree = self.tree.write();
        let parent = Location {
            owner: loc.owner.clone(),
            path: loc.path.parent().map(Path::to_path_buf).unwrap_or_default(),
        };
        for step in parent.lineage() {
            tree.nodes.entry(step).or_insert(Node::Dir);
        }
        tree.nodes
            .insert(loc.clone(), Node::File(Arc::from(content)));
        self.log.record(ProvenanceKind::Imported {
            owner: loc.owner.clone(),
            path: loc.display_path(),
            bytes: content.len(),
        });
        Ok(())
    }

    /// Owners whose data was copied or linked into `uid`
    pub fn upstream(&self, uid: &str) -> Vec<String> {
        self.log
            .edges()
            .into_iter()
            .filter(|(_, to)| to == uid)
            .map(|(from, _)| from)
            .collect()
    }

    /// Owners that received data from `uid`
    pub fn downstream(&self, uid: &str) -> Vec<String> {
        self.log
            .edges()
            .into_iter()
            .filter(|(from, _)| from == uid)
            .map(|(_, to)| to)
            .collect()
    }

    /// Every owner that currently has nodes
    pub fn owners(&self) -> Vec<String> {
        let tree = self.tree.read();
        tree.nodes
            .keys()
            .map(|loc| loc.owner.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn entries(&self, owner: &str) -> Vec<GraphEntry> {
        self.tree.read().entries(owner)
    }

    pub fn provenance(&self) -> Vec<ProvenanceEvent> {
        self.log.events()
    }

    /// Snapshot of the tree, the task edges and the full log
    pub fn to_json(&self) -> Value {
        let owners = self.owners();
        let tree: serde_json::Map<String, Value> = owners
            .iter()
            .map(|owner| {
                let entries = serde_json::to_value(self.entries(owner)).unwrap_or(Value::Null);
                (owner.clone(), entries)
            })
            .collect();
        let edges: Vec<Value> = self
            .log
            .edges()
            .into_iter()
            .map(|(from, to)| json!({"from": from, "to": to}))
            .collect();
        json!({
            "owners": owners,
            "tree": tree,
            "edges": edges,
            "events": self.log.to_json(),
        })
    }

    fn record(&self, kind: ProvenanceKind) {
        trace!(owner = kind.owner(), "provenance");
        self.log.record(kind);
    }
}

impl Default for GraphBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GraphBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphBackend")
            .field("nodes", &self.tree.read().nodes.len())
            .field("events", &self.log.len())
            .finish()
    }
}

impl Backend for GraphBackend {
    fn exists(&self, target: &FileRef) -> bool {
        let tree = self.tree.read();
        tree.resolve(&Location::of(target), false)
            .map(|loc| tree.get(&loc).is_some())
            .unwrap_or(false)
    }

    fn resolves(&self, target: &FileRef) -> bool {
        let tree = self.tree.read();
        match tree.lookup(&Location::of(target)) {
            Ok((here, Node::Dir)) => tree.walk(&here).is_ok(),
            Ok(_) => true,
            Err(_) => false,
        }
    }

    fn delete(&self, target: &FileRef) -> Result<(), StageError> {
        let mut tree = self.tree.write();
        let event = tree
            .delete(&Location::of(target))
            .map_err(|e| StageError::backend("delete", target, e))?;
        self.record(event);
        Ok(())
    }

    fn copy(&self, src: &FileRef, dest: &FileRef) -> Result<(), StageError> {
        let mut tree = self.tree.write();
        let from = Location::of(src);
        tree.lookup(&from)
            .map_err(|e| StageError::backend("copy", src, e))?;
        let event = tree
            .copy(&from, &Location::of(dest))
            .map_err(|e| StageError::backend("copy", dest, e))?;
        self.record(event);
        Ok(())
    }

    fn link(&self, src: &FileRef, dest: &FileRef, recursive: bool) -> Result<(), StageError> {
        let mut tree = self.tree.write();
        let from = Location::of(src);
        tree.lookup(&from)
            .map_err(|e| StageError::backend("link", src, e))?;
        let event = tree
            .link(&from, &Location::of(dest), recursive)
            .map_err(|e| StageError::backend("link", dest, e))?;
        self.record(event);
        Ok(())
    }

    fn is_dir(&self, target: &FileRef) -> bool {
        let tree = self.tree.read();
        tree.resolve(&Location::of(target), true)
            .map(|loc| matches!(tree.get(&loc), Some(Node::Dir)))
            .unwrap_or(false)
    }

    fn mkdir(&self, target: &FileRef, parents: bool, exist_ok: bool) -> Result<(), StageError> {
        let mut tree = self.tree.write();
        let events = tree
            .mkdir(&Location::of(target), parents, exist_ok)
            .map_err(|e| StageError::backend("mkdir", target, e))?;
        for event in events {
            self.record(event);
        }
        Ok(())
    }

    fn write_text(&self, content: &str, target: &FileRef) -> Result<(), StageError> {
        let mut tree = self.tree.write();
        let event = tree
            .write(&Location::of(target), content)
            .map_err(|e| StageError::backend("write", target, e))?;
        self.record(event);
        Ok(())
    }

    fn read_text(&self, target: &FileRef) -> Result<String, StageError> {
        self.tree
            .read()
            .read(&Location::of(target))
            .map_err(|e| StageError::backend("read", target, e))
    }
}
