use std::collections::HashMap;
use std::io::{self, Write};

use crate::archiver::WriteWrapper;
use crate::error::{ArchiveError, Result};

use super::records::{sectors, SECTOR_SIZE};
use super::tree::NodeId;

/// Start sector and byte length of a contiguous region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub lba: u32,
    pub len: u32,
}

#[derive(Debug, Default, Clone)]
pub struct PathTables {
    pub size: u32,
    pub l_lba: u32,
    pub m_lba: u32,
}

/// Where one hierarchy (primary or Joliet) lives in the image.
#[derive(Debug, Default, Clone)]
pub struct HierarchyLayout {
    pub volume_descriptor: u32,
    pub path_tables: PathTables,
    pub directories: HashMap<NodeId, Extent>,
}

impl HierarchyLayout {
    pub fn directory(&self, id: NodeId) -> Result<Extent> {
        self.directories.get(&id).copied().ok_or_else(|| {
            ArchiveError::bad_structure(format!("directory {id} has no extent"))
        })
    }
}

/// Sector allocation computed before any byte is written.
#[derive(Debug, Default)]
pub struct ImageLayout {
    next_lba: u32,
    pub primary: HierarchyLayout,
    pub joliet: Option<HierarchyLayout>,
    pub boot_record: Option<u32>,
    pub terminator: u32,
    pub boot_catalog: Option<u32>,
    pub boot_image: Option<Extent>,
    pub continuation: Option<Extent>,
    pub files: HashMap<NodeId, Extent>,
    pub volume_sectors: u32,
}

impl ImageLayout {
    pub fn new() -> ImageLayout {
        ImageLayout::default()
    }

    pub fn next_lba(&self) -> u32 {
        self.next_lba
    }

    /// Reserves whole sectors for `len` bytes. An empty region gets the
    /// current sector and reserves nothing.
    pub fn allocate(&mut self, len: u64) -> u32 {
        let lba = self.next_lba;
        self.next_lba += sectors(len);
        lba
    }

    pub fn allocate_extent(&mut self, len: u32) -> Extent {
        Extent {
            lba: self.allocate(len as u64),
            len,
        }
    }

    pub fn file(&self, id: NodeId) -> Result<Extent> {
        self.files
            .get(&id)
            .copied()
            .ok_or_else(|| ArchiveError::bad_structure(format!("file {id} has no extent")))
    }

    /// Called once every stage planned its areas.
    pub fn seal(&mut self) {
        self.volume_sectors = self.next_lba;
    }
}

/// Sink of the image pass. Tracks the position so every stage can assert
/// that it writes where the layout says.
pub struct SectorWriter<'a> {
    inner: WriteWrapper<&'a mut dyn Write>,
}

impl<'a> SectorWriter<'a> {
    pub fn new(inner: &'a mut dyn Write) -> SectorWriter<'a> {
        SectorWriter {
            inner: WriteWrapper::new(inner),
        }
    }

    pub fn position(&self) -> u64 {
        self.inner.get_written_bytes_count()
    }

    pub fn lba(&self) -> u32 {
        (self.position() / SECTOR_SIZE as u64) as u32
    }

    pub fn expect_lba(&self, lba: u32, what: &str) -> Result<()> {
        if self.position() != lba as u64 * SECTOR_SIZE as u64 {
            return Err(ArchiveError::bad_structure(format!(
                "{what} planned at sector {lba} but the image is at byte {}",
                self.position()
            )));
        }
        Ok(())
    }

    pub fn pad_to_sector(&mut self) -> io::Result<()> {
        let remainder = (self.position() % SECTOR_SIZE as u64) as usize;
        if remainder != 0 {
            self.inner.write_all(&[0u8; SECTOR_SIZE][remainder..])?;
        }
        Ok(())
    }

    pub fn write_zero_sectors(&mut self, count: u32) -> io::Result<()> {
        let zeros = [0u8; SECTOR_SIZE];
        for _ in 0..count {
            self.inner.write_all(&zeros)?;
        }
        Ok(())
    }

    /// Writes `data` at `lba` and pads to the sector end.
    pub fn write_at(&mut self, lba: u32, data: &[u8], what: &str) -> Result<()> {
        self.expect_lba(lba, what)?;
        self.inner.write_all(data)?;
        self.pad_to_sector()?;
        Ok(())
    }
}

impl Write for SectorWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
