use tracing::trace;

use super::{
    emit_directories, emit_path_tables, plan_directories, plan_path_tables, root_record, Area,
    AreaStage, IsoModel,
};
use crate::error::Result;
use crate::iso::layout::{ImageLayout, SectorWriter};
use crate::iso::records::{
    terminator, VolumeDescriptor, SECTOR_SIZE, SYSTEM_AREA_SECTORS, VD_PRIMARY,
};

/// Upper case ASCII, anything else becomes `_`.
fn a_characters(value: Option<&str>) -> Vec<u8> {
    value
        .unwrap_or_default()
        .chars()
        .map(|c| match c.to_ascii_uppercase() {
            c @ (' ' | '!' | '"' | '%'..='?' | 'A'..='Z' | '_') => c as u8,
            _ => b'_',
        })
        .collect()
}

/// System area, primary volume descriptor, terminator and the level 1
/// hierarchy.
pub struct PrimaryStage;

impl AreaStage for PrimaryStage {
    fn name(&self) -> &'static str {
        "primary"
    }

    fn plan_start(&self, area: Area, model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        match area {
            Area::System => {
                layout.allocate(SYSTEM_AREA_SECTORS as u64 * SECTOR_SIZE as u64);
            }
            Area::VolumeDescriptors => {
                layout.primary.volume_descriptor = layout.allocate(SECTOR_SIZE as u64);
            }
            Area::PathTables => {
                layout.primary.path_tables = plan_path_tables(&model.primary, layout);
            }
            Area::DirectoryRecords => {
                layout.primary.directories = plan_directories(model, &model.primary, layout)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn plan_end(&self, area: Area, _model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        if area == Area::VolumeDescriptors {
            layout.terminator = layout.allocate(SECTOR_SIZE as u64);
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
        match area {
            Area::System => {
                out.expect_lba(0, "system area")?;
                out.write_zero_sectors(SYSTEM_AREA_SECTORS)?;
            }
            Area::VolumeDescriptors => {
                let options = &model.options;
                let tables = &layout.primary.path_tables;
                let descriptor = VolumeDescriptor {
                    kind: VD_PRIMARY,
                    escape_sequences: &[],
                    system_id: a_characters(options.system_id.as_deref()),
                    volume_id: options.primary_volume_id().into_bytes(),
                    volume_space_size: layout.volume_sectors,
                    path_table_size: tables.size,
                    l_path_table: tables.l_lba,
                    m_path_table: tables.m_lba,
                    root_record: root_record(model, &layout.primary)?,
                    publisher: a_characters(options.publisher.as_deref()),
                    data_preparer: a_characters(options.data_preparer.as_deref()),
                    application_id: a_characters(options.application_id.as_deref()),
                    created: &model.created,
                    ucs2: false,
                };
                trace!(lba = layout.primary.volume_descriptor, "primary volume descriptor");
                out.write_at(
                    layout.primary.volume_descriptor,
                    &descriptor.to_sector(),
                    "primary volume descriptor",
                )?;
            }
            Area::PathTables => {
                emit_path_tables(model, &model.primary, &layout.primary, out)?;
            }
            Area::DirectoryRecords => {
                emit_directories(model, &model.primary, &layout.primary, layout, out)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn emit_end(
        &mut self,
        area: Area,
        _model: &IsoModel,
        layout: &ImageLayout,
        out: &mut SectorWriter<'_>,
    ) -> Result<()> {
        if area == Area::VolumeDescriptors {
            out.write_at(layout.terminator, &terminator(), "descriptor set terminator")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_a_characters() {
        assert_eq!(a_characters(Some("Jane Doe <j@d>")), b"JANE DOE <J_D>");
        assert!(a_characters(None).is_empty());
    }
}
