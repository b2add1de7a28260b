//! Deferred ISO9660 writer. Entries only populate the staging tree; the
//! image is produced by `post_process`.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use chrono::Utc;
use tracing::debug;

use super::{ArchiveBackend, ArchiveOptions, BoxedSink, PreparedEntry, Progress, ProgressHandle};
use crate::error::{ArchiveError, Result};
use crate::iso::{write_image, FileContent, IsoModel, IsoOptions, NodeId, StagingTree};

pub fn factory(sink: BoxedSink, options: &ArchiveOptions) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(IsoArchiver::new(sink, options.iso.clone())?))
}

/// File entry whose bytes the caller is writing.
struct Spool {
    node: NodeId,
    file: File,
}

enum IsoState {
    Staging(StagingTree),
    Written,
    Closed,
}

pub struct IsoArchiver<W: Write> {
    sink: Option<W>,
    options: IsoOptions,
    state: IsoState,
    spool: Option<Spool>,
    progress: ProgressHandle,
}

impl<W: Write> IsoArchiver<W> {
    /// Fails when the options do not describe a valid image.
    pub fn new(sink: W, options: IsoOptions) -> Result<IsoArchiver<W>> {
        options.validate()?;
        let tree = StagingTree::new(Utc::now(), !options.rock_ridge);

        Ok(IsoArchiver {
            sink: Some(sink),
            options,
            state: IsoState::Staging(tree),
            spool: None,
            progress: ProgressHandle::new(),
        })
    }

    fn tree(&mut self) -> Result<&mut StagingTree> {
        match &mut self.state {
            IsoState::Staging(tree) => Ok(tree),
            IsoState::Written | IsoState::Closed => Err(ArchiveError::InvalidState(
                "the image has already been written".to_owned(),
            )),
        }
    }

    fn finish_spool(&mut self) -> Result<()> {
        if let Some(Spool { node, mut file }) = self.spool.take() {
            let size = file.seek(SeekFrom::End(0))?;
            self.tree()?.complete_spool(node, file, size)?;
        }
        Ok(())
    }
}

impl<W: Write + Send> ArchiveBackend for IsoArchiver<W> {
    fn create_entry(&mut self, entry: &PreparedEntry<'_>) -> Result<Option<&mut dyn Write>> {
        self.finish_spool()?;
        let attributes = entry.attributes;

        if entry.is_directory() {
            self.tree()?
                .insert_directory(&entry.path, attributes.last_modified, entry.mode)?;
            return Ok(None);
        }

        if let Some(source) = &attributes.source {
            let size = match attributes.size {
                Some(size) => size,
                None => source.len()?,
            };
            self.tree()?.insert_file(
                &entry.path,
                attributes.last_modified,
                entry.mode,
                FileContent::Source(source.clone()),
                size,
            )?;
            return Ok(None);
        }

        let file = tempfile::tempfile()?;
        let node = self.tree()?.insert_file(
            &entry.path,
            attributes.last_modified,
            entry.mode,
            FileContent::Pending,
            0,
        )?;
        debug!(path = entry.path.as_str(), "spooling iso entry");

        let spool = self.spool.insert(Spool { node, file });
        Ok(Some(&mut spool.file))
    }

    fn post_process(&mut self) -> Result<()> {
        self.finish_spool()?;
        let tree = match std::mem::replace(&mut self.state, IsoState::Written) {
            IsoState::Staging(tree) => tree,
            previous => {
                self.state = previous;
                return Err(ArchiveError::InvalidState(
                    "the image has already been written".to_owned(),
                ));
            }
        };

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| ArchiveError::InvalidState("iso sink released".to_owned()))?;
        let model = IsoModel::new(tree, self.options.clone(), Utc::now())?;
        let layout = write_image(&model, sink, self.progress.clone())?;

        debug!(
            sectors = layout.volume_sectors,
            entries = model.tree.len() - 1,
            "iso image written"
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match self.state {
            IsoState::Staging(_) => self.post_process()?,
            IsoState::Written => {}
            IsoState::Closed => {
                return Err(ArchiveError::InvalidState("archive is closed".to_owned()))
            }
        }
        self.state = IsoState::Closed;

        if let Some(mut sink) = self.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }

    fn progress(&self) -> Progress {
        self.progress.snapshot()
    }

    fn progress_handle(&self) -> Option<ProgressHandle> {
        Some(self.progress.clone())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::iso::SECTOR_SIZE;
    use crate::types::{ContentSource, EntryAttributes};

    #[test]
    fn test_entries_are_deferred() {
        let mut bytes = Vec::new();
        {
            let mut archive = IsoArchiver::new(&mut bytes, IsoOptions::default()).unwrap();
            let attrs = EntryAttributes::directory();
            archive
                .create_entry(&PreparedEntry::new("docs", &attrs).unwrap())
                .unwrap();

            let attrs = EntryAttributes::file(None);
            let writer = archive
                .create_entry(&PreparedEntry::new("docs/a.txt", &attrs).unwrap())
                .unwrap()
                .unwrap();
            writer.write_all(b"spooled").unwrap();

            let attrs = EntryAttributes::file(None).source(ContentSource::from(b"direct".to_vec()));
            assert!(archive
                .create_entry(&PreparedEntry::new("b.txt", &attrs).unwrap())
                .unwrap()
                .is_none());

            archive.post_process().unwrap();
            archive.close().unwrap();
        }

        assert_eq!(bytes.len() % SECTOR_SIZE, 0);
        assert_eq!(&bytes[16 * SECTOR_SIZE + 1..16 * SECTOR_SIZE + 6], b"CD001");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("spooled"));
        assert!(text.contains("direct"));
    }

    #[test]
    fn test_invalid_options_abort_construction() {
        let options = IsoOptions::default().volume_id(&"x".repeat(40));
        assert!(IsoArchiver::new(Vec::new(), options).is_err());
    }

    #[test]
    fn test_no_entries_after_post_process() {
        let mut archive = IsoArchiver::new(Vec::new(), IsoOptions::default()).unwrap();
        archive.post_process().unwrap();
        let attrs = EntryAttributes::directory();
        assert!(archive
            .create_entry(&PreparedEntry::new("late", &attrs).unwrap())
            .is_err());
    }

    #[test]
    fn test_progress_reports_the_last_file() {
        let mut archive = IsoArchiver::new(Vec::new(), IsoOptions::default()).unwrap();
        assert_eq!(archive.progress(), Progress::default());

        let attrs = EntryAttributes::file(None).source(ContentSource::from(vec![1u8; 3000]));
        archive
            .create_entry(&PreparedEntry::new("big.bin", &attrs).unwrap())
            .unwrap();
        archive.post_process().unwrap();

        let progress = archive.progress();
        assert_eq!(progress.current_file.as_deref(), Some("big.bin"));
        assert_eq!(progress.total_written, Some(3000));
        assert_eq!(progress.current_file_length, Some(3000));
    }
}
