//! In-memory directory graph filled by `create_entry` and consumed once by
//! the image pass.

use std::collections::BTreeMap;
use std::fs::File;

use chrono::{DateTime, Utc};

use crate::error::{ArchiveError, Result};
use crate::types::{ContentSource, DEFAULT_DIRECTORY_PERMISSIONS};

pub type NodeId = usize;

pub const ROOT: NodeId = 0;

/// Longest path component, the Rock Ridge limit.
pub const MAX_COMPONENT_LEN: usize = 255;
/// Directory levels below the root allowed without Rock Ridge.
pub const MAX_PLAIN_DEPTH: usize = 7;
/// Largest single extent.
pub const MAX_FILE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug)]
pub enum FileContent {
    Source(ContentSource),
    /// Written by the caller into a temporary file.
    Spooled(File),
    /// Spool still open.
    Pending,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory { children: BTreeMap<String, NodeId> },
    File { content: FileContent, size: u64 },
}

#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub parent: NodeId,
    pub kind: NodeKind,
    pub last_modified: DateTime<Utc>,
    pub mode: u32,
    /// Directory levels above this node, the root is 0.
    pub depth: usize,
}

impl Node {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    /// Sorted by name, empty for files.
    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        let children = match &self.kind {
            NodeKind::Directory { children } => Some(children.values().copied()),
            NodeKind::File { .. } => None,
        };
        children.into_iter().flatten()
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            NodeKind::File { size, .. } => size,
            NodeKind::Directory { .. } => 0,
        }
    }
}

#[derive(Debug)]
pub struct StagingTree {
    nodes: Vec<Node>,
    limit_depth: bool,
}

impl StagingTree {
    /// `limit_depth` enforces the plain ISO9660 depth of 8 levels.
    pub fn new(created: DateTime<Utc>, limit_depth: bool) -> StagingTree {
        StagingTree {
            nodes: vec![Node {
                name: String::new(),
                parent: ROOT,
                kind: NodeKind::Directory {
                    children: BTreeMap::new(),
                },
                last_modified: created,
                mode: DEFAULT_DIRECTORY_PERMISSIONS,
                depth: 0,
            }],
            limit_depth,
        }
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Path from the root, for messages and progress.
    pub fn path(&self, id: NodeId) -> String {
        let mut components = Vec::new();
        let mut current = id;
        while current != ROOT {
            components.push(self.nodes[current].name.as_str());
            current = self.nodes[current].parent;
        }
        components.reverse();
        components.join("/")
    }

    fn split(path: &str) -> Result<Vec<&str>> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        if components.is_empty() {
            return Err(ArchiveError::invalid_entry(path, "empty entry path"));
        }
        for component in &components {
            if *component == "." || *component == ".." {
                return Err(ArchiveError::invalid_entry(path, "relative path component"));
            }
            if component.len() > MAX_COMPONENT_LEN {
                return Err(ArchiveError::invalid_entry(
                    path,
                    format!("component longer than {MAX_COMPONENT_LEN} bytes"),
                ));
            }
        }
        Ok(components)
    }

    fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        match &self.nodes[parent].kind {
            NodeKind::Directory { children } => children.get(name).copied(),
            NodeKind::File { .. } => None,
        }
    }

    fn attach(&mut self, parent: NodeId, node: Node) -> NodeId {
        let id = self.nodes.len();
        let name = node.name.clone();
        self.nodes.push(node);
        if let NodeKind::Directory { children } = &mut self.nodes[parent].kind {
            children.insert(name, id);
        }
        id
    }

    /// Walks `components`, creating the missing directories with the
    /// timestamp of the entry that needs them.
    fn ensure_directories(
        &mut self,
        path: &str,
        components: &[&str],
        last_modified: DateTime<Utc>,
    ) -> Result<NodeId> {
        let mut current = ROOT;
        for component in components {
            current = match self.child(current, component) {
                Some(existing) if self.nodes[existing].is_directory() => existing,
                Some(_) => {
                    return Err(ArchiveError::invalid_entry(
                        path,
                        format!("'{component}' is already a file"),
                    ))
                }
                None => {
                    let depth = self.nodes[current].depth + 1;
                    if self.limit_depth && depth > MAX_PLAIN_DEPTH {
                        return Err(ArchiveError::invalid_entry(
                            path,
                            "directory hierarchy deeper than 8 levels",
                        ));
                    }
                    self.attach(
                        current,
                        Node {
                            name: (*component).to_owned(),
                            parent: current,
                            kind: NodeKind::Directory {
                                children: BTreeMap::new(),
                            },
                            last_modified,
                            mode: DEFAULT_DIRECTORY_PERMISSIONS,
                            depth,
                        },
                    )
                }
            };
        }
        Ok(current)
    }

    /// Adds a directory, or updates the attributes of an implicit one.
    pub fn insert_directory(
        &mut self,
        path: &str,
        last_modified: DateTime<Utc>,
        mode: u32,
    ) -> Result<NodeId> {
        let components = Self::split(path)?;
        let id = self.ensure_directories(path, &components, last_modified)?;
        let node = &mut self.nodes[id];
        node.last_modified = last_modified;
        node.mode = mode;
        Ok(id)
    }

    pub fn insert_file(
        &mut self,
        path: &str,
        last_modified: DateTime<Utc>,
        mode: u32,
        content: FileContent,
        size: u64,
    ) -> Result<NodeId> {
        if size > MAX_FILE_SIZE {
            return Err(ArchiveError::invalid_entry(
                path,
                "files larger than 4 GiB do not fit one extent",
            ));
        }

        let components = Self::split(path)?;
        let (name, parents) = match components.split_last() {
            Some(split) => split,
            None => return Err(ArchiveError::invalid_entry(path, "empty entry path")),
        };
        let parent = self.ensure_directories(path, parents, last_modified)?;

        if self.child(parent, name).is_some() {
            return Err(ArchiveError::invalid_entry(path, "entry already exists"));
        }

        let depth = self.nodes[parent].depth + 1;
        Ok(self.attach(
            parent,
            Node {
                name: (*name).to_owned(),
                parent,
                kind: NodeKind::File { content, size },
                last_modified,
                mode,
                depth,
            },
        ))
    }

    /// Stores the finished spool of `id`.
    pub fn complete_spool(&mut self, id: NodeId, file: File, size: u64) -> Result<()> {
        if size > MAX_FILE_SIZE {
            return Err(ArchiveError::invalid_entry(
                &self.path(id),
                "files larger than 4 GiB do not fit one extent",
            ));
        }
        match &mut self.nodes[id].kind {
            NodeKind::File {
                content,
                size: stored,
            } => {
                *content = FileContent::Spooled(file);
                *stored = size;
                Ok(())
            }
            NodeKind::Directory { .. } => Err(ArchiveError::InvalidState(
                "spool attached to a directory".to_owned(),
            )),
        }
    }

    pub fn content_mut(&mut self, id: NodeId) -> Option<&mut FileContent> {
        match &mut self.nodes[id].kind {
            NodeKind::File { content, .. } => Some(content),
            NodeKind::Directory { .. } => None,
        }
    }
}
