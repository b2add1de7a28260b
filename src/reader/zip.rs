//! Zip reader: the central directory gives the listing, local headers are
//! only visited when an entry is opened.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt};
use tracing::debug;

use super::{
    read_at, reuse_or_open, shared, ArchiveEntryIterator, ArchiveReader,
    ArchiveSource, RandomAccess, RecordIterator, RegionReader,
};
use crate::archive_common::{parse_central_directory, CentralDirectoryEnd, ZipFileEntry};
use crate::archiver::normalize_path;
use crate::compression::{decoder, CompressionMethod};
use crate::constants::{
    CENTRAL_DIRECTORY_END_SIGNATURE, END_OF_CENTRAL_DIRECTORY_SIZE, FILE_HEADER_BASE_SIZE,
    LOCAL_FILE_HEADER_SIGNATURE, ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE,
};
use crate::error::{ArchiveError, Result};
use crate::types::ArchiveEntryRecord;

const ZIP64_LOCATOR_SIZE: u64 = 20;
const ZIP64_END_RECORD_SIZE: usize = 56;

pub fn factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(ZipReader::new(source)))
}

/// What an entry stream needs from the central directory.
#[derive(Debug, Clone)]
pub struct ZipHandle {
    pub header_offset: u64,
    pub compressed_size: u64,
    pub compression_method: u16,
    pub encrypted: bool,
}

pub struct ZipReader {
    source: Arc<dyn ArchiveSource>,
}

impl ZipReader {
    pub fn new(source: Arc<dyn ArchiveSource>) -> ZipReader {
        ZipReader { source }
    }

    /// Scans backwards from the end for the end of central directory record.
    fn find_central_directory_end(reader: &mut dyn RandomAccess) -> Result<(u64, CentralDirectoryEnd)> {
        let file_length = reader.seek(SeekFrom::End(0))?;

        let mut position = file_length
            .checked_sub(END_OF_CENTRAL_DIRECTORY_SIZE)
            .ok_or_else(|| ArchiveError::bad_structure("archive too small"))?;
        let lower_bound =
            file_length.saturating_sub(END_OF_CENTRAL_DIRECTORY_SIZE + u16::MAX as u64);

        loop {
            reader.seek(SeekFrom::Start(position))?;
            if reader.read_u32::<LittleEndian>()? == CENTRAL_DIRECTORY_END_SIGNATURE {
                break;
            }
            if position == lower_bound {
                return Err(ArchiveError::bad_structure(
                    "end of central directory signature not found",
                ));
            }
            position -= 1;
        }

        let mut record = Vec::new();
        reader.read_to_end(&mut record)?;
        let mut end = CentralDirectoryEnd::parse(&record)?;

        if let Some(locator) = position.checked_sub(ZIP64_LOCATOR_SIZE) {
            reader.seek(SeekFrom::Start(locator))?;
            if reader.read_u32::<LittleEndian>()? == ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE {
                let _disk = reader.read_u32::<LittleEndian>()?;
                let zip64_offset = reader.read_u64::<LittleEndian>()?;
                reader.seek(SeekFrom::Start(zip64_offset))?;

                let mut zip64_record = vec![0u8; ZIP64_END_RECORD_SIZE];
                reader.read_exact(&mut zip64_record)?;
                end.apply_zip64_record(&zip64_record)?;
            }
        }

        Ok((position, end))
    }

    fn record(entry: &ZipFileEntry) -> ArchiveEntryRecord {
        let is_directory = entry.is_directory();
        let mut record = ArchiveEntryRecord::new(
            normalize_path(&entry.file_name(), is_directory),
            is_directory,
        );
        record.last_modified = entry.last_modified();
        record.size = Some(entry.uncompressed_size);
        record.with_handle(ZipHandle {
            header_offset: entry.offset,
            compressed_size: entry.compressed_size,
            compression_method: entry.compression_method,
            encrypted: entry.is_encrypted(),
        })
    }
}

impl ArchiveReader for ZipReader {
    fn format_name(&self) -> &'static str {
        "Zip"
    }

    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>> {
        let mut handle = self.source.open_random()?;
        let (end_position, end) = Self::find_central_directory_end(handle.as_mut())?;

        let start = end.offset_of_start_of_central_directory;
        if start + end.central_directory_size > end_position {
            return Err(ArchiveError::bad_structure(format!(
                "central directory at {start} overlaps its end record at {end_position}"
            )));
        }
        handle.seek(SeekFrom::Start(start))?;
        let mut central_directory = vec![0u8; end.central_directory_size as usize];
        handle.read_exact(&mut central_directory)?;

        let entries = parse_central_directory(&central_directory, end.total_number_of_entries)?;
        debug!(
            name = self.source.name(),
            entries = entries.len(),
            "zip central directory read"
        );

        let records = entries.iter().map(Self::record).collect();
        Ok(Box::new(RecordIterator::new(records, Some(shared(handle)))))
    }

    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>> {
        let entry = record
            .handle::<ZipHandle>()
            .ok_or_else(|| ArchiveError::invalid_entry(&record.path, "not a zip entry"))?;
        if record.is_directory {
            return Ok(Box::new(io::empty()));
        }
        if entry.encrypted {
            return Err(ArchiveError::UnsupportedFormat(format!(
                "'{}' is encrypted",
                record.path
            )));
        }
        let method = CompressionMethod::from_compression_method(entry.compression_method)?;

        let handle = reuse_or_open(self.source.as_ref(), iterator)?;
        let header = read_at(&handle, entry.header_offset, FILE_HEADER_BASE_SIZE as usize)?;
        let data_start = local_data_offset(&header, entry.header_offset)?;

        let region = RegionReader::new(handle, data_start, entry.compressed_size);
        decoder(method, region)
    }
}

/// Start of the payload following the local header at `offset`.
fn local_data_offset(header: &[u8], offset: u64) -> io::Result<u64> {
    let mut cursor = io::Cursor::new(header);
    if cursor.read_u32::<LittleEndian>()? != LOCAL_FILE_HEADER_SIGNATURE {
        return Err(ArchiveError::bad_structure(format!(
            "no local file header at offset {offset}"
        ))
        .into());
    }
    cursor.set_position(26);
    let name_len = cursor.read_u16::<LittleEndian>()? as u64;
    let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
    Ok(offset + FILE_HEADER_BASE_SIZE + name_len + extra_len)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archiver::zip::ZipArchiver;
    use crate::archiver::{ArchiveBackend, PreparedEntry};
    use crate::compression::Level;
    use crate::reader::MemorySource;
    use crate::types::EntryAttributes;

    fn build_with(
        method: CompressionMethod,
        comment: Option<&str>,
        entries: &[(&str, Option<&[u8]>)],
    ) -> Vec<u8> {
        let mut bytes = Vec::new();
        {
            let mut archive = ZipArchiver::new(&mut bytes, method, Level::Default).unwrap();
            if let Some(comment) = comment {
                archive.set_comment(comment).unwrap();
            }
            for (path, content) in entries {
                match content {
                    None => {
                        let attrs = EntryAttributes::directory();
                        archive
                            .create_entry(&PreparedEntry::new(path, &attrs).unwrap())
                            .unwrap();
                    }
                    Some(content) => {
                        let attrs = EntryAttributes::file(Some(content.len() as u64));
                        let entry = PreparedEntry::new(path, &attrs).unwrap();
                        let stream = archive.create_entry(&entry).unwrap().unwrap();
                        stream.write_all(content).unwrap();
                    }
                }
            }
            archive.close().unwrap();
        }
        bytes
    }

    fn build(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        build_with(CompressionMethod::Deflate(), None, entries)
    }

    fn reader(bytes: Vec<u8>) -> ZipReader {
        ZipReader::new(Arc::new(MemorySource::new("test.zip", bytes)))
    }

    #[test]
    fn test_listing_and_content() {
        let bytes = build(&[("a", None), ("a/b.txt", Some(&b"hello zip"[..]))]);
        let reader = reader(bytes);
        let mut iterator = reader.entry_iterator().unwrap();

        let dir = iterator.next().unwrap().unwrap();
        assert_eq!(dir.path, "a/");
        assert!(dir.is_directory);

        let file = iterator.next().unwrap().unwrap();
        assert_eq!(file.path, "a/b.txt");
        assert_eq!(file.size, Some(9));
        assert!(iterator.next().is_none());

        let mut content = String::new();
        reader
            .entry_input_stream(&file, Some(iterator.as_ref()))
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello zip");

        let mut again = String::new();
        reader
            .entry_input_stream(&file, None)
            .unwrap()
            .read_to_string(&mut again)
            .unwrap();
        assert_eq!(again, "hello zip");
        iterator.close().unwrap();
    }

    #[test]
    fn test_stream_dies_with_iterator() {
        let reader = reader(build(&[("x.bin", Some(&[7u8; 100][..]))]));
        let mut iterator = reader.entry_iterator().unwrap();
        let record = iterator.next().unwrap().unwrap();

        let mut stream = reader
            .entry_input_stream(&record, Some(iterator.as_ref()))
            .unwrap();
        iterator.close().unwrap();

        let mut sink = Vec::new();
        assert!(stream.read_to_end(&mut sink).is_err());
    }

    #[test]
    fn test_empty_archive() {
        let reader = reader(build(&[]));
        assert!(reader.entries().unwrap().is_empty());
    }

    #[test]
    fn test_comment_does_not_hide_end_record() {
        let comment = "c".repeat(300);
        let bytes = build_with(
            CompressionMethod::Deflate(),
            Some(comment.as_str()),
            &[("c.txt", Some(&b"hi"[..]))],
        );
        let entries = reader(bytes).entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "c.txt");
    }

    #[test]
    fn test_every_writable_method_reads_back() {
        let payload = b"abcabcabc".repeat(50);
        for method in [
            CompressionMethod::Store(),
            CompressionMethod::Deflate(),
            CompressionMethod::BZip2(),
            CompressionMethod::Zstd(),
            CompressionMethod::Xz(),
        ] {
            let reader = reader(build_with(method, None, &[("data.txt", Some(payload.as_slice()))]));
            let record = reader.entries().unwrap().remove(0);
            let mut content = Vec::new();
            reader
                .entry_input_stream(&record, None)
                .unwrap()
                .read_to_end(&mut content)
                .unwrap();
            assert_eq!(content, payload, "{method}");
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        let reader = reader(vec![0u8; 64]);
        assert!(matches!(
            reader.entry_iterator().err(),
            Some(ArchiveError::BadArchiveStructure(_))
        ));
    }
}
