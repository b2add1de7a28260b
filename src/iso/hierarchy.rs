use std::collections::VecDeque;

use crate::error::{ArchiveError, Result};

use super::names::{joliet_identifiers, primary_identifiers, ucs2_be};
use super::records::path_table_record_len;
use super::tree::{NodeId, StagingTree, ROOT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Primary,
    Joliet,
}

/// The directory structure as seen through one namespace: encoded
/// identifiers, children in record order and path table numbers.
#[derive(Debug)]
pub struct Hierarchy {
    pub namespace: Namespace,
    /// Breadth first, sorted within each parent. Index + 1 is the directory
    /// number used by the path table.
    pub directories: Vec<NodeId>,
    identifiers: Vec<Vec<u8>>,
    children: Vec<Vec<NodeId>>,
    numbers: Vec<u16>,
}

impl Hierarchy {
    pub fn build(tree: &StagingTree, namespace: Namespace) -> Result<Hierarchy> {
        let mut hierarchy = Hierarchy {
            namespace,
            directories: Vec::new(),
            identifiers: vec![Vec::new(); tree.len()],
            children: vec![Vec::new(); tree.len()],
            numbers: vec![0; tree.len()],
        };

        let mut queue = VecDeque::from([ROOT]);
        while let Some(directory) = queue.pop_front() {
            hierarchy.directories.push(directory);
            let number = u16::try_from(hierarchy.directories.len()).map_err(|_| {
                ArchiveError::bad_structure("more than 65535 directories in the image")
            })?;
            hierarchy.numbers[directory] = number;

            let children: Vec<NodeId> = tree.node(directory).children().collect();
            let named = children.iter().map(|id| {
                let node = tree.node(*id);
                (node.name.as_str(), node.is_directory())
            });
            let identifiers = match namespace {
                Namespace::Primary => primary_identifiers(named)
                    .into_iter()
                    .map(String::into_bytes)
                    .collect::<Vec<_>>(),
                Namespace::Joliet => joliet_identifiers(named)
                    .iter()
                    .map(|name| ucs2_be(name))
                    .collect(),
            };
            for (id, identifier) in children.iter().zip(identifiers) {
                hierarchy.identifiers[*id] = identifier;
            }

            let mut ordered = children;
            ordered.sort_by(|a, b| hierarchy.identifiers[*a].cmp(&hierarchy.identifiers[*b]));
            queue.extend(ordered.iter().filter(|id| tree.node(**id).is_directory()));
            hierarchy.children[directory] = ordered;
        }

        Ok(hierarchy)
    }

    pub fn identifier(&self, id: NodeId) -> &[u8] {
        &self.identifiers[id]
    }

    /// Children in directory record order.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.children[id]
    }

    pub fn number(&self, id: NodeId) -> u16 {
        self.numbers[id]
    }

    pub fn path_table_size(&self) -> u32 {
        self.directories
            .iter()
            .map(|id| match *id {
                ROOT => path_table_record_len(1),
                id => path_table_record_len(self.identifiers[id].len()),
            })
            .sum::<usize>() as u32
    }
}

/// Order of the file contents area: the files of a directory, then its
/// subdirectories by name, starting at the root.
pub fn file_order(tree: &StagingTree) -> Vec<NodeId> {
    let mut order = Vec::new();
    let mut stack = vec![ROOT];

    while let Some(directory) = stack.pop() {
        let node = tree.node(directory);
        order.extend(node.children().filter(|id| !tree.node(*id).is_directory()));

        let mut subdirectories: Vec<NodeId> = node
            .children()
            .filter(|id| tree.node(*id).is_directory())
            .collect();
        subdirectories.reverse();
        stack.extend(subdirectories);
    }

    order
}
