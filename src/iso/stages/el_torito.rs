//! El Torito boot record, boot catalog and the boot image, no emulation.

use std::io::{self, Read};

use tracing::trace;

use super::{Area, AreaStage, IsoModel};
use crate::descriptor::ArchiveDescriptor;
use crate::error::{ArchiveError, Result};
use crate::iso::layout::{ImageLayout, SectorWriter};
use crate::iso::options::ElToritoOptions;
use crate::iso::records::{descriptor_header, SECTOR_SIZE, VD_BOOT_RECORD};

const BOOT_SYSTEM_ID: &[u8] = b"EL TORITO SPECIFICATION";
const HEADER_ID: u8 = 0x01;
const BOOTABLE: u8 = 0x88;
const NO_EMULATION: u8 = 0x00;
const CATALOG_ENTRY_LEN: usize = 32;

fn boot_record(catalog_lba: u32) -> Vec<u8> {
    let mut descriptor = descriptor_header(VD_BOOT_RECORD);
    descriptor.write_padded(BOOT_SYSTEM_ID, 32, 0);
    descriptor.write_zeros(32); // boot identifier
    descriptor.write_u32(catalog_lba);
    descriptor.write_zeros(SECTOR_SIZE - descriptor.len());
    descriptor.finish()
}

/// Validation entry followed by the default entry. The validation words
/// sum to zero.
pub fn boot_catalog(options: &ElToritoOptions, image_lba: u32) -> Vec<u8> {
    let mut descriptor = ArchiveDescriptor::new(SECTOR_SIZE);
    descriptor.write_u8(HEADER_ID);
    descriptor.write_u8(options.platform_id);
    descriptor.write_u16(0);
    descriptor.write_padded(options.id_string.as_bytes(), 24, 0);
    descriptor.write_u16(0); // checksum
    descriptor.write_u8(0x55);
    descriptor.write_u8(0xAA);

    let sum = descriptor.buffer()[..CATALOG_ENTRY_LEN]
        .chunks_exact(2)
        .fold(0u16, |sum, word| {
            sum.wrapping_add(u16::from_le_bytes([word[0], word[1]]))
        });
    let [low, high] = 0u16.wrapping_sub(sum).to_le_bytes();
    descriptor.patch_u8(28, low);
    descriptor.patch_u8(29, high);

    descriptor.write_u8(BOOTABLE);
    descriptor.write_u8(NO_EMULATION);
    descriptor.write_u16(0); // load segment, 0x7C0 by default
    descriptor.write_u8(0); // system type
    descriptor.write_u8(0);
    descriptor.write_u16(options.load_sectors);
    descriptor.write_u32(image_lba);
    descriptor.write_zeros(CATALOG_ENTRY_LEN - 12);

    descriptor.write_zeros(SECTOR_SIZE - descriptor.len());
    descriptor.finish()
}

pub struct ElToritoStage;

impl ElToritoStage {
    fn options(model: &IsoModel) -> Result<&ElToritoOptions> {
        model
            .options
            .el_torito
            .as_ref()
            .ok_or_else(|| ArchiveError::bad_structure("boot stage without boot options"))
    }

    fn planned(lba: Option<u32>, what: &str) -> Result<u32> {
        lba.ok_or_else(|| ArchiveError::bad_structure(format!("{what} was not planned")))
    }
}

impl AreaStage for ElToritoStage {
    fn name(&self) -> &'static str {
        "el torito"
    }

    fn plan_start(&self, area: Area, model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        match area {
            Area::VolumeDescriptors => layout.boot_record = Some(layout.allocate(SECTOR_SIZE as u64)),
            Area::BootInfo => layout.boot_catalog = Some(layout.allocate(SECTOR_SIZE as u64)),
            Area::BootData => {
                let len = Self::options(model)?.boot_image.len()?;
                let len = u32::try_from(len)
                    .map_err(|_| ArchiveError::InvalidConfig("boot image over 4 GiB".to_owned()))?;
                layout.boot_image = Some(layout.allocate_extent(len));
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
        match area {
            Area::VolumeDescriptors => {
                let lba = Self::planned(layout.boot_record, "boot record")?;
                let catalog = Self::planned(layout.boot_catalog, "boot catalog")?;
                out.write_at(lba, &boot_record(catalog), "boot record")?;
            }
            Area::BootInfo => {
                let lba = Self::planned(layout.boot_catalog, "boot catalog")?;
                let image = layout
                    .boot_image
                    .ok_or_else(|| ArchiveError::bad_structure("boot image was not planned"))?;
                out.write_at(lba, &boot_catalog(Self::options(model)?, image.lba), "boot catalog")?;
            }
            Area::BootData => {
                let image = layout
                    .boot_image
                    .ok_or_else(|| ArchiveError::bad_structure("boot image was not planned"))?;
                out.expect_lba(image.lba, "boot image")?;

                let source = Self::options(model)?.boot_image.open()?;
                let copied = io::copy(&mut source.take(image.len as u64), out)?;
                if copied != image.len as u64 {
                    return Err(ArchiveError::bad_structure(format!(
                        "boot image shrank from {} to {copied} bytes",
                        image.len
                    )));
                }
                out.pad_to_sector()?;
                trace!(lba = image.lba, len = image.len, "boot image written");
            }
            _ => {}
        }
        Ok(())
    }
}
