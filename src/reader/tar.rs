//! Tar reader, plain or under a gzip or bzip2 stream. Headers are walked with
//! the `tar` crate, which resolves GNU long names and PAX paths.

use std::io::{self, BufReader, Read};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, trace};

use super::{
    reuse_or_open, shared, ArchiveEntryIterator, ArchiveReader, ArchiveSource, RecordIterator,
    RegionReader,
};
use crate::archiver::normalize_path;
use crate::compression::StreamCompression;
use crate::error::{ArchiveError, Result};
use crate::types::ArchiveEntryRecord;

pub fn tar_factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(TarReader::new(source, StreamCompression::None)))
}

pub fn tar_gz_factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(TarReader::new(source, StreamCompression::Gzip)))
}

pub fn tar_bz2_factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(TarReader::new(source, StreamCompression::Bzip2)))
}

/// Position of an entry payload inside the decompressed tar stream.
#[derive(Debug, Clone, Copy)]
pub struct TarHandle {
    pub data_offset: u64,
    pub size: u64,
}

pub struct TarReader {
    source: Arc<dyn ArchiveSource>,
    compression: StreamCompression,
}

impl TarReader {
    pub fn new(source: Arc<dyn ArchiveSource>, compression: StreamCompression) -> TarReader {
        TarReader {
            source,
            compression,
        }
    }

    fn decompressed(&self) -> Result<Box<dyn Read + Send>> {
        let handle = self.source.open_random()?;
        Ok(self.compression.decoder(BufReader::new(handle)))
    }

    fn records(&self) -> Result<Vec<ArchiveEntryRecord>> {
        let mut archive = tar::Archive::new(self.decompressed()?);
        let mut records = Vec::new();

        for entry in archive.entries()? {
            let entry = entry?;
            let header = entry.header();
            let kind = header.entry_type();
            let is_directory = kind.is_dir();

            if !is_directory && !kind.is_file() {
                trace!(kind = ?kind, "skipping tar entry");
                continue;
            }

            let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let path = normalize_path(&raw_path, is_directory);
            if path.trim_end_matches('/').is_empty() {
                continue;
            }

            let size = entry.size();
            let mut record = ArchiveEntryRecord::new(path, is_directory);
            record.last_modified = header
                .mtime()
                .ok()
                .and_then(|mtime| DateTime::<Utc>::from_timestamp(mtime as i64, 0));
            if !is_directory {
                record.size = Some(size);
            }
            records.push(record.with_handle(TarHandle {
                data_offset: entry.raw_file_position(),
                size,
            }));
        }
        Ok(records)
    }
}

impl ArchiveReader for TarReader {
    fn format_name(&self) -> &'static str {
        match self.compression {
            StreamCompression::None => "Tar",
            StreamCompression::Gzip => "Tar/Gzip",
            StreamCompression::Bzip2 => "Tar/Bzip2",
        }
    }

    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>> {
        let records = self.records()?;
        debug!(
            name = self.source.name(),
            entries = records.len(),
            "tar headers read"
        );

        // Only a plain tar can be read in place.
        let handle = match self.compression {
            StreamCompression::None => Some(shared(self.source.open_random()?)),
            StreamCompression::Gzip | StreamCompression::Bzip2 => None,
        };
        Ok(Box::new(RecordIterator::new(records, handle)))
    }

    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>> {
        let entry = *record
            .handle::<TarHandle>()
            .ok_or_else(|| ArchiveError::invalid_entry(&record.path, "not a tar entry"))?;
        if record.is_directory {
            return Ok(Box::new(io::empty()));
        }

        match self.compression {
            StreamCompression::None => {
                let handle = reuse_or_open(self.source.as_ref(), iterator)?;
                Ok(Box::new(RegionReader::new(handle, entry.data_offset, entry.size)))
            }
            StreamCompression::Gzip | StreamCompression::Bzip2 => {
                let mut stream = self.decompressed()?;
                let skipped = io::copy(&mut (&mut stream).take(entry.data_offset), &mut io::sink())?;
                if skipped != entry.data_offset {
                    return Err(ArchiveError::bad_structure(format!(
                        "'{}' lies past the end of the stream",
                        record.path
                    )));
                }
                Ok(Box::new(stream.take(entry.size)))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archiver::tar::TarArchiver;
    use crate::archiver::{ArchiveBackend, PreparedEntry};
    use crate::compression::Level;
    use crate::reader::MemorySource;
    use crate::types::EntryAttributes;

    fn build(compression: StreamCompression, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut bytes = Vec::new();
        {
            let mut archive = TarArchiver::new(&mut bytes, compression, Level::Default);
            let attrs = EntryAttributes::directory();
            archive
                .create_entry(&PreparedEntry::new("dir", &attrs).unwrap())
                .unwrap();
            for (path, content) in files {
                let attrs = EntryAttributes::file(Some(content.len() as u64));
                let entry = PreparedEntry::new(path, &attrs).unwrap();
                archive.create_entry(&entry).unwrap().unwrap().write_all(content).unwrap();
            }
            archive.close().unwrap();
        }
        bytes
    }

    fn read_all(reader: &TarReader, record: &ArchiveEntryRecord) -> Vec<u8> {
        let mut content = Vec::new();
        reader
            .entry_input_stream(record, None)
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn test_every_compression_reads_back() {
        let long = format!("dir/{}.txt", "n".repeat(150));
        let files: [(&str, &[u8]); 2] = [
            ("dir/one.txt", &b"first"[..]),
            (long.as_str(), &b"second"[..]),
        ];

        for compression in [
            StreamCompression::None,
            StreamCompression::Gzip,
            StreamCompression::Bzip2,
        ] {
            let source = MemorySource::new("test.tar", build(compression, &files));
            let reader = TarReader::new(Arc::new(source), compression);
            let records = reader.entries().unwrap();

            let paths: Vec<&str> = records.iter().map(|r| r.path.as_str()).collect();
            assert_eq!(paths, vec!["dir/", "dir/one.txt", long.as_str()]);
            assert!(records[0].is_directory);
            assert_eq!(records[2].size, Some(6));
            assert_eq!(read_all(&reader, &records[1]), b"first");
            assert_eq!(read_all(&reader, &records[2]), b"second");
        }
    }

    #[test]
    fn test_plain_tar_reuses_iterator_handle() {
        let source = MemorySource::new("t.tar", build(StreamCompression::None, &[("a.txt", &b"abc"[..])]));
        let reader = TarReader::new(Arc::new(source), StreamCompression::None);

        let mut iterator = reader.entry_iterator().unwrap();
        assert!(iterator.shared_source().is_some());
        let file = iterator.nth(1).unwrap().unwrap();

        let mut stream = reader.entry_input_stream(&file, Some(iterator.as_ref())).unwrap();
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"a");

        iterator.close().unwrap();
        assert!(stream.read(&mut first).is_err());
    }

    #[test]
    fn test_empty_archive_lists_nothing() {
        let mut bytes = Vec::new();
        {
            let mut archive =
                TarArchiver::new(&mut bytes, StreamCompression::Gzip, Level::Default);
            archive.close().unwrap();
        }
        let reader = TarReader::new(
            Arc::new(MemorySource::new("e.tar.gz", bytes)),
            StreamCompression::Gzip,
        );
        assert!(reader.entries().unwrap().is_empty());
    }
}
