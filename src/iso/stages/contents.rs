use std::io::{self, Read, Seek, SeekFrom, Write};

use tracing::trace;

use super::{Area, AreaStage, IsoModel};
use crate::archiver::ProgressHandle;
use crate::error::{ArchiveError, Result};
use crate::iso::layout::{ImageLayout, SectorWriter};
use crate::iso::tree::{FileContent, NodeKind};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Streams every staged file into its extent. The only stage doing bulk I/O.
pub struct FileContentsStage {
    progress: ProgressHandle,
}

impl FileContentsStage {
    pub fn new(progress: ProgressHandle) -> FileContentsStage {
        FileContentsStage { progress }
    }

    fn copy(&self, mut reader: impl Read, out: &mut SectorWriter<'_>, len: u64) -> io::Result<u64> {
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        while copied < len {
            let wanted = COPY_BUFFER_SIZE.min((len - copied) as usize);
            let read = match reader.read(&mut buffer[..wanted]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buffer[..read])?;
            copied += read as u64;
            self.progress.add_written(read as u64);
        }
        Ok(copied)
    }
}

impl AreaStage for FileContentsStage {
    fn name(&self) -> &'static str {
        "file contents"
    }

    fn plan_start(&self, area: Area, model: &IsoModel, layout: &mut ImageLayout) -> Result<()> {
        if area == Area::FileContents {
            for id in &model.file_order {
                let size = model.tree.node(*id).size() as u32;
                let extent = layout.allocate_extent(size);
                layout.files.insert(*id, extent);
            }
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
        if area != Area::FileContents {
            return Ok(());
        }

        for id in &model.file_order {
            let node = model.tree.node(*id);
            let path = model.tree.path(*id);
            let extent = layout.file(*id)?;
            out.expect_lba(extent.lba, &path)?;

            let NodeKind::File { content, size } = &node.kind else {
                return Err(ArchiveError::bad_structure(format!("'{path}' is not a file")));
            };
            self.progress.start_file(&path, *size);

            let copied = match content {
                FileContent::Source(source) => self.copy(source.open()?, out, *size)?,
                FileContent::Spooled(file) => {
                    let mut spool = file;
                    spool.seek(SeekFrom::Start(0))?;
                    self.copy(spool, out, *size)?
                }
                FileContent::Pending => {
                    return Err(ArchiveError::InvalidState(format!(
                        "'{path}' is still being written"
                    )))
                }
            };
            if copied != *size {
                return Err(ArchiveError::invalid_entry(
                    &path,
                    format!("{copied} bytes available, {size} declared"),
                ));
            }

            out.pad_to_sector()?;
            self.progress.finish_file();
            trace!(path = path.as_str(), lba = extent.lba, size, "file written");
        }
        Ok(())
    }
}
