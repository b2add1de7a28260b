//! 7-Zip reader. The listing comes from the archive header; entry content is
//! extracted by a worker thread that pushes it through a
//! [`ring_buffer`](super::ring_buffer) the caller reads from.
//!
//! Each entry stream owns one worker and one archive handle. Dropping the
//! stream cancels the extraction.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sevenz_rust::{Archive, BlockDecoder, Password, SevenZArchiveEntry, SevenZReader};
use tracing::{debug, trace};

use super::ring_buffer::{ring_buffer, RingWriter, DEFAULT_CAPACITY};
use super::signature::SignatureCheckedSource;
use super::{ArchiveEntryIterator, ArchiveReader, ArchiveSource, RandomAccess, RecordIterator};
use crate::archiver::normalize_path;
use crate::error::{ArchiveError, Result};
use crate::types::ArchiveEntryRecord;

pub const SIGNATURE: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

pub fn factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(SevenZipReader::new(source)))
}

#[derive(Debug, Clone, Copy)]
pub struct SevenZipHandle {
    /// Position in the archive file list.
    pub index: usize,
    pub has_stream: bool,
}

pub struct SevenZipReader {
    source: Arc<dyn ArchiveSource>,
}

impl SevenZipReader {
    pub fn new(source: Arc<dyn ArchiveSource>) -> SevenZipReader {
        SevenZipReader {
            source: Arc::new(SignatureCheckedSource::new(source, SIGNATURE)),
        }
    }

    /// Name given to entries stored without one.
    fn unnamed_entry(&self) -> String {
        let name = self.source.name();
        Path::new(name)
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "unnamed".to_owned())
    }

    fn record(&self, index: usize, entry: &SevenZArchiveEntry) -> ArchiveEntryRecord {
        let is_directory = entry.is_directory;
        let name = if entry.name.is_empty() {
            self.unnamed_entry()
        } else {
            entry.name.clone()
        };

        let mut record = ArchiveEntryRecord::new(normalize_path(&name, is_directory), is_directory);
        if entry.has_last_modified_date {
            record.last_modified = Some(DateTime::<Utc>::from(SystemTime::from(
                entry.last_modified_date,
            )));
        }
        if !is_directory {
            record.size = Some(entry.size);
        }
        record.with_handle(SevenZipHandle {
            index,
            has_stream: entry.has_stream,
        })
    }
}

fn open(source: &dyn ArchiveSource) -> Result<SevenZReader<Box<dyn RandomAccess>>> {
    let handle = source.open_random()?;
    let len = source.len()?;
    Ok(SevenZReader::new(handle, len, Password::empty())?)
}

/// Pushes entry `index` into `writer`. Only the folder holding the entry is
/// decoded, entries before it in that folder are decoded and dropped.
fn extract_entry(source: &dyn ArchiveSource, index: usize, writer: &mut RingWriter) -> Result<()> {
    let mut handle = source.open_random()?;
    let len = source.len()?;
    let password = Password::empty();
    let archive = Archive::read(&mut handle, len, password.as_ref())?;

    let folder = *archive
        .stream_map
        .file_folder_index
        .get(index)
        .ok_or_else(|| ArchiveError::bad_structure(format!("no 7-Zip entry at index {index}")))?;
    // entries without a folder have no content
    let Some(folder) = folder else {
        return Ok(());
    };

    let mut position = archive.stream_map.folder_first_file_index[folder];
    let mut found = false;
    let mut each = |_entry: &SevenZArchiveEntry,
                    data: &mut dyn Read|
     -> std::result::Result<bool, sevenz_rust::Error> {
        if writer.token().is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "extraction cancelled").into());
        }
        let current = position;
        position += 1;
        if current < index {
            io::copy(data, &mut io::sink())?;
            return Ok(true);
        }
        found = true;
        io::copy(data, &mut *writer)?;
        Ok(false)
    };
    BlockDecoder::new(folder, &archive, password.as_ref(), &mut handle).for_each_entries(&mut each)?;

    if !found {
        return Err(ArchiveError::bad_structure(format!(
            "7-Zip entry {index} is missing from its folder"
        )));
    }
    Ok(())
}

/// Worker body. The archive handle opened by `extract_entry` is released
/// before the pipe closes.
fn run_worker(source: Arc<dyn ArchiveSource>, index: usize, mut writer: RingWriter) {
    match extract_entry(source.as_ref(), index, &mut writer) {
        Ok(()) => trace!(index, "7-Zip entry extracted"),
        Err(_) if writer.token().is_cancelled() => trace!(index, "7-Zip extraction cancelled"),
        Err(error) => {
            debug!(index, %error, "7-Zip extraction failed");
            writer.fail(error.into());
        }
    }
}

impl ArchiveReader for SevenZipReader {
    fn format_name(&self) -> &'static str {
        "7-Zip"
    }

    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>> {
        let archive = open(self.source.as_ref())?;
        let records: Vec<_> = archive
            .archive()
            .files
            .iter()
            .enumerate()
            .map(|(index, entry)| self.record(index, entry))
            .collect();
        debug!(
            name = self.source.name(),
            entries = records.len(),
            "7-Zip header read"
        );
        Ok(Box::new(RecordIterator::new(records, None)))
    }

    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        _iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>> {
        let handle = *record
            .handle::<SevenZipHandle>()
            .ok_or_else(|| ArchiveError::invalid_entry(&record.path, "not a 7-Zip entry"))?;
        if record.is_directory || !handle.has_stream {
            return Ok(Box::new(io::empty()));
        }

        let (writer, mut reader) = ring_buffer(DEFAULT_CAPACITY);
        let source = self.source.clone();
        let worker = thread::Builder::new()
            .name("7z-extract".to_owned())
            .spawn(move || run_worker(source, handle.index, writer))?;
        reader.attach(worker);
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::reader::{FileSource, MemorySource};

    fn fixture(dir: &Path) -> std::path::PathBuf {
        let content = dir.join("content");
        fs::create_dir_all(content.join("docs")).unwrap();
        fs::write(content.join("docs/readme.txt"), "seven zip payload ".repeat(100)).unwrap();
        fs::write(content.join("top.txt"), "top").unwrap();

        let archive = dir.join("fixture.7z");
        sevenz_rust::compress_to_path(&content, &archive).unwrap();
        archive
    }

    #[test]
    fn test_entries_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let reader = SevenZipReader::new(Arc::new(FileSource::new(fixture(dir.path()))));

        let records = reader.entries().unwrap();
        let readme = records
            .iter()
            .find(|r| r.path.ends_with("readme.txt"))
            .unwrap();
        assert_eq!(readme.size, Some(1800));
        assert!(records.iter().any(|r| r.is_directory && r.path.ends_with("docs/")));

        let mut content = String::new();
        reader
            .entry_input_stream(readme, None)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "seven zip payload ".repeat(100));

        let top = records.iter().find(|r| r.path.ends_with("top.txt")).unwrap();
        let mut content = String::new();
        reader
            .entry_input_stream(top, None)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "top");
    }

    #[test]
    fn test_abandoned_stream_does_not_hang() {
        let dir = tempfile::tempdir().unwrap();
        let reader = SevenZipReader::new(Arc::new(FileSource::new(fixture(dir.path()))));
        let records = reader.entries().unwrap();
        let readme = records.iter().find(|r| r.path.ends_with("readme.txt")).unwrap();

        let mut stream = reader.entry_input_stream(readme, None).unwrap();
        let mut first = [0u8; 5];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"seven");
        drop(stream);
    }

    #[test]
    fn test_wrong_signature() {
        let source = MemorySource::new("fake.7z", b"PK\x03\x04 not seven zip".to_vec());
        let reader = SevenZipReader::new(Arc::new(source));
        let err = reader.entry_iterator().err().unwrap();
        let message = err.to_string();
        assert!(message.contains("377abcaf271c"), "{message}");
        assert!(message.contains("504b0304"), "{message}");
    }

    #[test]
    fn test_unnamed_entry_uses_container_stem() {
        let reader = SevenZipReader::new(Arc::new(MemorySource::new("comic.cb7", Vec::new())));
        assert_eq!(reader.unnamed_entry(), "comic");
    }
}
