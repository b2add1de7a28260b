//! Rock Ridge (RRIP 1.10 over SUSP): POSIX modes, timestamps and the real
//! entry names in the system use area of primary directory records.
//! Entries that do not fit a record move to a continuation area written at
//! the end of the directory records area.

use std::collections::HashMap;

use tracing::trace;

use super::{Area, AreaStage, IsoModel};
use crate::constants::{S_IFDIR, S_IFREG};
use crate::descriptor::ArchiveDescriptor;
use crate::error::Result;
use crate::iso::hierarchy::Hierarchy;
use crate::iso::layout::{ImageLayout, SectorWriter};
use crate::iso::records::{directory_record_len, record_date, MAX_DIRECTORY_RECORD, SECTOR_SIZE};
use crate::iso::tree::{NodeId, StagingTree, ROOT};

pub const SP_LEN: usize = 7;
pub const PX_LEN: usize = 36;
pub const TF_LEN: usize = 12;
pub const CE_LEN: usize = 28;
const NM_HEADER_LEN: usize = 5;
const NM_CHUNK: usize = 250;

pub const NM_CONTINUE: u8 = 0x01;
const TF_MODIFY: u8 = 0x02;

pub const ER_IDENTIFIER: &str = "RRIP_1991A";
const ER_DESCRIPTOR: &str =
    "THE ROCK RIDGE INTERCHANGE PROTOCOL PROVIDES SUPPORT FOR POSIX FILE SYSTEM SEMANTICS";
const ER_SOURCE: &str = "PLEASE CONTACT DISC PUBLISHER FOR SPECIFICATION SOURCE.  \
    SEE PUBLISHER IDENTIFIER IN PRIMARY VOLUME DESCRIPTOR FOR CONTACT INFORMATION.";

/// Which record of a directory extent the system use belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordRole {
    /// The "." record of a directory.
    Current,
    /// The ".." record, describing the parent.
    Parent,
    /// The record naming the node in its parent.
    Named,
}

#[derive(Debug, Default)]
struct SystemUse {
    inline: Vec<u8>,
    /// Byte offset and length inside the continuation area.
    continued: Option<(u32, u32)>,
}

/// System use of every primary directory record, computed before layout so
/// that record lengths are final.
#[derive(Debug, Default)]
pub struct RockRidgePlan {
    records: HashMap<(NodeId, RecordRole), SystemUse>,
    area: Vec<u8>,
}

fn entry_header(descriptor: &mut ArchiveDescriptor, signature: &[u8; 2], len: usize) {
    descriptor.write_bytes(signature);
    descriptor.write_u8(len as u8);
    descriptor.write_u8(1);
}

fn write_sp(descriptor: &mut ArchiveDescriptor) {
    entry_header(descriptor, b"SP", SP_LEN);
    descriptor.write_bytes(&[0xBE, 0xEF, 0]);
}

fn write_px(descriptor: &mut ArchiveDescriptor, tree: &StagingTree, id: NodeId) {
    let node = tree.node(id);
    let (mode, links) = if node.is_directory() {
        let subdirectories = node
            .children()
            .filter(|child| tree.node(*child).is_directory())
            .count() as u32;
        (S_IFDIR | node.mode, 2 + subdirectories)
    } else {
        (S_IFREG | node.mode, 1)
    };

    entry_header(descriptor, b"PX", PX_LEN);
    descriptor.write_u32_both(mode);
    descriptor.write_u32_both(links);
    descriptor.write_u32_both(0); // uid
    descriptor.write_u32_both(0); // gid
}

fn write_tf(descriptor: &mut ArchiveDescriptor, tree: &StagingTree, id: NodeId) {
    entry_header(descriptor, b"TF", TF_LEN);
    descriptor.write_u8(TF_MODIFY);
    descriptor.write_bytes(&record_date(&tree.node(id).last_modified));
}

fn write_nm(descriptor: &mut ArchiveDescriptor, name: &str) {
    let chunks: Vec<&[u8]> = name.as_bytes().chunks(NM_CHUNK).collect();
    for (index, chunk) in chunks.iter().enumerate() {
        entry_header(descriptor, b"NM", NM_HEADER_LEN + chunk.len());
        let last = index + 1 == chunks.len();
        descriptor.write_u8(if last { 0 } else { NM_CONTINUE });
        descriptor.write_bytes(chunk);
    }
}

fn write_er(descriptor: &mut ArchiveDescriptor) {
    let len = 8 + ER_IDENTIFIER.len() + ER_DESCRIPTOR.len() + ER_SOURCE.len();
    entry_header(descriptor, b"ER", len);
    descriptor.write_u8(ER_IDENTIFIER.len() as u8);
    descriptor.write_u8(ER_DESCRIPTOR.len() as u8);
    descriptor.write_u8(ER_SOURCE.len() as u8);
    descriptor.write_u8(1);
    descriptor.write_str(ER_IDENTIFIER);
    descriptor.write_str(ER_DESCRIPTOR);
    descriptor.write_str(ER_SOURCE);
}

pub fn write_ce(descriptor: &mut ArchiveDescriptor, block: u32, offset: u32, len: u32) {
    entry_header(descriptor, b"CE", CE_LEN);
    descriptor.write_u32_both(block);
    descriptor.write_u32_both(offset);
    descriptor.write_u32_both(len);
}

impl RockRidgePlan {
    pub fn build(tree: &StagingTree, primary: &Hierarchy) -> RockRidgePlan {
        let mut plan = RockRidgePlan::default();

        for directory in &primary.directories {
            let directory = *directory;

            let mut current = ArchiveDescriptor::new(128);
            if directory == ROOT {
                write_sp(&mut current);
            }
            write_px(&mut current, tree, directory);
            write_tf(&mut current, tree, directory);
            let continued = if directory == ROOT {
                let mut er = ArchiveDescriptor::new(256);
                write_er(&mut er);
                Some(plan.continue_with(er.buffer()))
            } else {
                None
            };
            plan.records.insert(
                (directory, RecordRole::Current),
                SystemUse {
                    inline: current.finish(),
                    continued,
                },
            );

            let parent = tree.node(directory).parent;
            let mut parent_entries = ArchiveDescriptor::new(64);
            write_px(&mut parent_entries, tree, parent);
            write_tf(&mut parent_entries, tree, parent);
            plan.records.insert(
                (directory, RecordRole::Parent),
                SystemUse {
                    inline: parent_entries.finish(),
                    continued: None,
                },
            );

            for child in primary.children(directory) {
                plan.plan_named(tree, primary, *child);
            }
        }

        plan
    }

    fn plan_named(&mut self, tree: &StagingTree, primary: &Hierarchy, id: NodeId) {
        let mut attributes = ArchiveDescriptor::new(64);
        write_px(&mut attributes, tree, id);
        write_tf(&mut attributes, tree, id);
        let mut name = ArchiveDescriptor::new(NM_HEADER_LEN + 255);
        write_nm(&mut name, &tree.node(id).name);

        let identifier_len = primary.identifier(id).len();
        let fits = directory_record_len(identifier_len, attributes.len() + name.len())
            <= MAX_DIRECTORY_RECORD;

        let system_use = if fits {
            let mut inline = attributes.finish();
            inline.extend_from_slice(name.buffer());
            SystemUse {
                inline,
                continued: None,
            }
        } else {
            SystemUse {
                inline: attributes.finish(),
                continued: Some(self.continue_with(name.buffer())),
            }
        };
        self.records.insert((id, RecordRole::Named), system_use);
    }

    /// Appends `entries` to the continuation area without crossing a sector.
    fn continue_with(&mut self, entries: &[u8]) -> (u32, u32) {
        let in_sector = self.area.len() % SECTOR_SIZE;
        if in_sector + entries.len() > SECTOR_SIZE {
            self.area.resize(self.area.len() + SECTOR_SIZE - in_sector, 0);
        }
        let offset = self.area.len() as u32;
        self.area.extend_from_slice(entries);
        (offset, entries.len() as u32)
    }

    /// Length of the system use field of a record, CE entry included.
    pub fn system_use_len(&self, id: NodeId, role: RecordRole) -> usize {
        match self.records.get(&(id, role)) {
            Some(system_use) => {
                system_use.inline.len() + system_use.continued.map_or(0, |_| CE_LEN)
            }
            None => 0,
        }
    }

    /// System use bytes, with the CE entry pointing into the continuation
    /// area at `continuation_lba`.
    pub fn system_use(&self, id: NodeId, role: RecordRole, continuation_lba: u32) -> Vec<u8> {
        let Some(system_use) = self.records.get(&(id, role)) else {
            return Vec::new();
        };

        let mut descriptor = ArchiveDescriptor::new(system_use.inline.len() + CE_LEN);
        descriptor.write_bytes(&system_use.inline);
        if let Some((offset, len)) = system_use.continued {
            let block = continuation_lba + offset / SECTOR_SIZE as u32;
            write_ce(&mut descriptor, block, offset % SECTOR_SIZE as u32, len);
        }
        descriptor.finish()
    }

    pub fn continuation_area(&self) -> &[u8] {
        &self.area
    }
}

/// Writes the continuation area after the directory records.
pub struct RockRidgeStage;

impl AreaStage for RockRidgeStage {
    fn name(&self) -> &'static str {
        "rock ridge"
    }

    fn plan_start(&self, area: Area, model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        if let (Area::DirectoryRecords, Some(plan)) = (area, &model.rock_ridge) {
            layout.continuation = Some(layout.allocate_extent(plan.continuation_area().len() as u32));
        }
        Ok(())
    }

    fn emit_start(
        &mut self,
        area: Area,
        model: &IsoModel,
        layout: &ImageLayout,
        out: &mut SectorWriter<'_>,
    ) -> Result<()> {
        if let (Area::DirectoryRecords, Some(plan), Some(extent)) =
            (area, &model.rock_ridge, layout.continuation)
        {
            trace!(lba = extent.lba, len = extent.len, "rock ridge continuation area");
            out.write_at(extent.lba, plan.continuation_area(), "continuation area")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::iso::hierarchy::Namespace;
    use crate::iso::tree::FileContent;
    use crate::types::ContentSource;

    fn plan_for(paths: &[&str]) -> (StagingTree, Hierarchy, RockRidgePlan) {
        let mut tree = StagingTree::new(Utc::now(), false);
        for path in paths {
            tree.insert_file(
                path,
                Utc::now(),
                0o600,
                FileContent::Source(ContentSource::from(Vec::new())),
                0,
            )
            .unwrap();
        }
        let primary = Hierarchy::build(&tree, Namespace::Primary).unwrap();
        let plan = RockRidgePlan::build(&tree, &primary);
        (tree, primary, plan)
    }

    #[test]
    fn test_short_names_stay_inline() {
        let (_, primary, plan) = plan_for(&["notes.txt"]);
        let file = primary.children(ROOT)[0];
        let system_use = plan.system_use(file, RecordRole::Named, 40);
        assert_eq!(system_use.len(), PX_LEN + TF_LEN + NM_HEADER_LEN + 9);
        assert_eq!(&system_use[0..2], b"PX");
        // regular file, rw-------
        assert_eq!(
            u32::from_le_bytes(system_use[4..8].try_into().unwrap()),
            0o100600
        );
        assert_eq!(&system_use[48..50], b"NM");
        assert_eq!(&system_use[53..], b"notes.txt");
    }

    #[test]
    fn test_long_names_move_to_continuation() {
        let name = "x".repeat(255);
        let (_, primary, plan) = plan_for(&[name.as_str()]);
        let file = primary.children(ROOT)[0];

        assert_eq!(
            plan.system_use_len(file, RecordRole::Named),
            PX_LEN + TF_LEN + CE_LEN
        );
        let system_use = plan.system_use(file, RecordRole::Named, 40);
        let ce = &system_use[PX_LEN + TF_LEN..];
        assert_eq!(&ce[0..2], b"CE");
        assert_eq!(u32::from_le_bytes(ce[4..8].try_into().unwrap()), 40);
        // two NM entries, the first flagged as continued
        assert_eq!(u32::from_le_bytes(ce[20..24].try_into().unwrap()), 265);
    }

    #[test]
    fn test_root_carries_sp_and_er() {
        let (_, _, plan) = plan_for(&["a"]);
        let root = plan.system_use(ROOT, RecordRole::Current, 30);
        assert_eq!(&root[0..2], b"SP");
        assert_eq!(&root[root.len() - CE_LEN..root.len() - CE_LEN + 2], b"CE");
        assert_eq!(&plan.continuation_area()[0..2], b"ER");
        assert_eq!(&plan.continuation_area()[8..18], ER_IDENTIFIER.as_bytes());
    }
}
