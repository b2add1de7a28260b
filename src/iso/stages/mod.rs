//! Stages of the image pass. Every stage sees every area, in image order;
//! extensions add their structures by reacting to the areas they care
//! about, so the sequencer never needs to know which ones are enabled.

mod contents;
mod el_torito;
mod joliet;
mod primary;
pub mod rock_ridge;

use std::collections::HashMap;

use crate::archiver::ProgressHandle;
use crate::descriptor::ArchiveDescriptor;
use crate::error::Result;

use super::hierarchy::Hierarchy;
use super::layout::{Extent, HierarchyLayout, ImageLayout, PathTables, SectorWriter};
use super::records::{
    write_path_table_record, DirectoryRecord, CURRENT_DIRECTORY, FLAG_DIRECTORY,
    PARENT_DIRECTORY, SECTOR_SIZE,
};
use super::tree::{NodeId, ROOT};
use rock_ridge::RecordRole;

pub use super::image::IsoModel;
pub use contents::FileContentsStage;
pub use el_torito::ElToritoStage;
pub use joliet::JolietStage;
pub use primary::PrimaryStage;
pub use rock_ridge::RockRidgeStage;

/// Regions of the image, in the order they are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    System,
    VolumeDescriptors,
    BootInfo,
    PathTables,
    DirectoryRecords,
    BootData,
    FileContents,
}

impl Area {
    pub const ALL: [Area; 7] = [
        Area::System,
        Area::VolumeDescriptors,
        Area::BootInfo,
        Area::PathTables,
        Area::DirectoryRecords,
        Area::BootData,
        Area::FileContents,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Area::System => "SA",
            Area::VolumeDescriptors => "VDS",
            Area::BootInfo => "BIA",
            Area::PathTables => "PTA",
            Area::DirectoryRecords => "DRA",
            Area::BootData => "BDA",
            Area::FileContents => "FCA",
        }
    }
}

/// One participant of the image pass.
///
/// The sequencer calls `plan_start` on every stage in order and `plan_end`
/// in reverse for each area, then does the same with `emit_start` and
/// `emit_end`. Planning reserves sectors, emitting writes them; a stage
/// must emit exactly what it planned.
pub trait AreaStage {
    fn name(&self) -> &'static str;

    fn plan_start(&self, _area: Area, _model: &IsoModel, _layout: &mut ImageLayout) -> Result<()> {
        Ok(())
    }

    fn plan_end(&self, _area: Area, _model: &IsoModel, _layout: &mut ImageLayout) -> Result<()> {
        Ok(())
    }

    fn emit_start(
        &mut self,
        _area: Area,
        _model: &IsoModel,
        _layout: &ImageLayout,
        _out: &mut SectorWriter<'_>,
    ) -> Result<()> {
        Ok(())
    }

    fn emit_end(
        &mut self,
        _area: Area,
        _model: &IsoModel,
        _layout: &ImageLayout,
        _out: &mut SectorWriter<'_>,
    ) -> Result<()> {
        Ok(())
    }
}

/// The stage chain for the enabled extensions.
pub fn stages_for(model: &IsoModel, progress: ProgressHandle) -> Vec<Box<dyn AreaStage>> {
    let mut stages: Vec<Box<dyn AreaStage>> = vec![Box::new(PrimaryStage)];
    if model.options.el_torito.is_some() {
        stages.push(Box::new(ElToritoStage));
    }
    if model.joliet.is_some() {
        stages.push(Box::new(JolietStage));
    }
    if model.rock_ridge.is_some() {
        stages.push(Box::new(RockRidgeStage));
    }
    stages.push(Box::new(FileContentsStage::new(progress)));
    stages
}

/// Records of one directory extent, packed so that none crosses a sector.
/// Without a layout every extent is zero, which is enough to measure it.
pub(crate) fn directory_extent(
    model: &IsoModel,
    hierarchy: &Hierarchy,
    layout: Option<(&HierarchyLayout, &ImageLayout)>,
    directory: NodeId,
) -> Result<Vec<u8>> {
    let tree = &model.tree;
    let rock_ridge = match hierarchy.namespace {
        super::hierarchy::Namespace::Primary => model.rock_ridge.as_ref(),
        super::hierarchy::Namespace::Joliet => None,
    };
    let continuation_lba = layout
        .and_then(|(_, image)| image.continuation)
        .map_or(0, |extent| extent.lba);

    let extent_of = |id: NodeId| -> Result<Extent> {
        match layout {
            None => Ok(Extent::default()),
            Some((namespace, _)) if tree.node(id).is_directory() => namespace.directory(id),
            Some((_, image)) => image.file(id),
        }
    };

    let parent = tree.node(directory).parent;
    let mut records: Vec<(NodeId, &[u8], NodeId, RecordRole)> = vec![
        (directory, CURRENT_DIRECTORY, directory, RecordRole::Current),
        (parent, PARENT_DIRECTORY, directory, RecordRole::Parent),
    ];
    records.extend(
        hierarchy
            .children(directory)
            .iter()
            .map(|child| (*child, hierarchy.identifier(*child), *child, RecordRole::Named)),
    );

    let mut descriptor = ArchiveDescriptor::new(SECTOR_SIZE);
    for (target, identifier, owner, role) in records {
        let node = tree.node(target);
        let extent = extent_of(target)?;
        let system_use = rock_ridge
            .map(|plan| plan.system_use(owner, role, continuation_lba))
            .unwrap_or_default();

        let record = DirectoryRecord {
            extent: extent.lba,
            data_length: extent.len,
            recorded: &node.last_modified,
            flags: if node.is_directory() { FLAG_DIRECTORY } else { 0 },
            identifier,
            system_use: &system_use,
        };

        let used = descriptor.len() % SECTOR_SIZE;
        if used + record.len() > SECTOR_SIZE {
            descriptor.write_zeros(SECTOR_SIZE - used);
        }
        record.write(&mut descriptor)?;
    }

    let used = descriptor.len() % SECTOR_SIZE;
    if used != 0 {
        descriptor.write_zeros(SECTOR_SIZE - used);
    }
    Ok(descriptor.finish())
}

/// Allocates one extent per directory of `hierarchy`, breadth first.
pub(crate) fn plan_directories(
    model: &IsoModel,
    hierarchy: &Hierarchy,
    layout: &mut ImageLayout,
) -> Result<HashMap<NodeId, Extent>> {
    let mut directories = HashMap::with_capacity(hierarchy.directories.len());
    for directory in &hierarchy.directories {
        let len = directory_extent(model, hierarchy, None, *directory)?.len() as u32;
        directories.insert(*directory, layout.allocate_extent(len));
    }
    Ok(directories)
}

pub(crate) fn plan_path_tables(hierarchy: &Hierarchy, layout: &mut ImageLayout) -> PathTables {
    let size = hierarchy.path_table_size();
    PathTables {
        size,
        l_lba: layout.allocate(size as u64),
        m_lba: layout.allocate(size as u64),
    }
}

pub(crate) fn path_table(
    model: &IsoModel,
    hierarchy: &Hierarchy,
    namespace: &HierarchyLayout,
    big_endian: bool,
) -> Result<Vec<u8>> {
    let mut descriptor = ArchiveDescriptor::new(hierarchy.path_table_size() as usize);
    for directory in &hierarchy.directories {
        let identifier = match *directory {
            ROOT => CURRENT_DIRECTORY,
            id => hierarchy.identifier(id),
        };
        let parent = model.tree.node(*directory).parent;
        write_path_table_record(
            &mut descriptor,
            identifier,
            namespace.directory(*directory)?.lba,
            hierarchy.number(parent),
            big_endian,
        );
    }
    Ok(descriptor.finish())
}

/// Root record embedded in a volume descriptor.
pub(crate) fn root_record(model: &IsoModel, namespace: &HierarchyLayout) -> Result<Vec<u8>> {
    let root = namespace.directory(ROOT)?;
    let mut descriptor = ArchiveDescriptor::new(34);
    DirectoryRecord {
        extent: root.lba,
        data_length: root.len,
        recorded: &model.tree.node(ROOT).last_modified,
        flags: FLAG_DIRECTORY,
        identifier: CURRENT_DIRECTORY,
        system_use: &[],
    }
    .write(&mut descriptor)?;
    Ok(descriptor.finish())
}

/// Writes both path tables and every directory extent of one hierarchy.
pub(crate) fn emit_path_tables(
    model: &IsoModel,
    hierarchy: &Hierarchy,
    namespace: &HierarchyLayout,
    out: &mut SectorWriter<'_>,
) -> Result<()> {
    let tables = &namespace.path_tables;
    out.write_at(
        tables.l_lba,
        &path_table(model, hierarchy, namespace, false)?,
        "little endian path table",
    )?;
    out.write_at(
        tables.m_lba,
        &path_table(model, hierarchy, namespace, true)?,
        "big endian path table",
    )
}

pub(crate) fn emit_directories(
    model: &IsoModel,
    hierarchy: &Hierarchy,
    namespace: &HierarchyLayout,
    layout: &ImageLayout,
    out: &mut SectorWriter<'_>,
) -> Result<()> {
    for directory in &hierarchy.directories {
        let extent = namespace.directory(*directory)?;
        let records = directory_extent(model, hierarchy, Some((namespace, layout)), *directory)?;
        out.write_at(extent.lba, &records, "directory extent")?;
    }
    Ok(())
}
