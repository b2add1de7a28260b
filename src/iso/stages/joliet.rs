use tracing::trace;

use super::{
    emit_directories, emit_path_tables, plan_directories, plan_path_tables, root_record, Area,
    AreaStage, IsoModel,
};
use crate::error::{ArchiveError, Result};
use crate::iso::hierarchy::Hierarchy;
use crate::iso::layout::{HierarchyLayout, ImageLayout, SectorWriter};
use crate::iso::names::ucs2_be;
use crate::iso::records::{VolumeDescriptor, JOLIET_ESCAPE, SECTOR_SIZE, VD_SUPPLEMENTARY};

fn ucs2_field(value: Option<&str>) -> Vec<u8> {
    ucs2_be(value.unwrap_or_default())
}

/// Supplementary volume descriptor and the UCS-2 hierarchy.
pub struct JolietStage;

impl JolietStage {
    fn parts<'m, 'l>(
        model: &'m IsoModel,
        layout: &'l ImageLayout,
    ) -> Result<(&'m Hierarchy, &'l HierarchyLayout)> {
        match (&model.joliet, &layout.joliet) {
            (Some(hierarchy), Some(namespace)) => Ok((hierarchy, namespace)),
            _ => Err(ArchiveError::bad_structure("joliet hierarchy was not planned")),
        }
    }
}

impl AreaStage for JolietStage {
    fn name(&self) -> &'static str {
        "joliet"
    }

    fn plan_start(&self, area: Area, model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        let Some(hierarchy) = &model.joliet else {
            return Ok(());
        };

        match area {
            Area::VolumeDescriptors => {
                let volume_descriptor = layout.allocate(SECTOR_SIZE as u64);
                layout.joliet = Some(HierarchyLayout {
                    volume_descriptor,
                    ..HierarchyLayout::default()
                });
            }
            Area::PathTables => {
                let tables = plan_path_tables(hierarchy, layout);
                if let Some(namespace) = layout.joliet.as_mut() {
                    namespace.path_tables = tables;
                }
            }
            Area::DirectoryRecords => {
                let directories = plan_directories(model, hierarchy, layout)?;
                if let Some(namespace) = layout.joliet.as_mut() {
                    namespace.directories = directories;
                }
            }
            _ => {}
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
        if !matches!(
            area,
            Area::VolumeDescriptors | Area::PathTables | Area::DirectoryRecords
        ) {
            return Ok(());
        }
        let (hierarchy, namespace) = Self::parts(model, layout)?;

        match area {
            Area::VolumeDescriptors => {
                let options = &model.options;
                let descriptor = VolumeDescriptor {
                    kind: VD_SUPPLEMENTARY,
                    escape_sequences: JOLIET_ESCAPE,
                    system_id: ucs2_field(options.system_id.as_deref()),
                    volume_id: ucs2_be(&options.joliet_volume_id()),
                    volume_space_size: layout.volume_sectors,
                    path_table_size: namespace.path_tables.size,
                    l_path_table: namespace.path_tables.l_lba,
                    m_path_table: namespace.path_tables.m_lba,
                    root_record: root_record(model, namespace)?,
                    publisher: ucs2_field(options.publisher.as_deref()),
                    data_preparer: ucs2_field(options.data_preparer.as_deref()),
                    application_id: ucs2_field(options.application_id.as_deref()),
                    created: &model.created,
                    ucs2: true,
                };
                trace!(lba = namespace.volume_descriptor, "joliet volume descriptor");
                out.write_at(
                    namespace.volume_descriptor,
                    &descriptor.to_sector(),
                    "joliet volume descriptor",
                )?;
            }
            Area::PathTables => emit_path_tables(model, hierarchy, namespace, out)?,
            Area::DirectoryRecords => emit_directories(model, hierarchy, namespace, layout, out)?,
            _ => {}
        }
        Ok(())
    }
}
