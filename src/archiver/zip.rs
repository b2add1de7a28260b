//! Streaming Zip writer. Every file entry is followed by a data descriptor so
//! the sink never needs to seek.

use std::io::{self, Write};

use crc32fast::Hasher;
use tracing::debug;

use super::{ArchiveBackend, ArchiveOptions, BoxedSink, PreparedEntry, WriteWrapper};
use crate::archive_common::{
    build_central_directory_file_header, build_data_descriptor, build_local_file_header,
    CentralDirectoryEnd, ZipFileEntry,
};
use crate::compression::{CompressionMethod, Encoder, Level};
use crate::descriptor::ArchiveDescriptor;
use crate::error::{ArchiveError, Result};

pub fn factory(sink: BoxedSink, options: &ArchiveOptions) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(ZipArchiver::new(
        sink,
        options.compression_method,
        options.compression_level,
    )?))
}

/// Payload stream of the open entry. Owns the sink until the entry is finished.
struct ZipEntryWriter<W: Write> {
    encoder: Encoder<WriteWrapper<W>>,
    hasher: Hasher,
    uncompressed_size: u64,
    data_start: u64,
}

impl<W: Write> Write for ZipEntryWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.encoder.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.uncompressed_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }
}

enum ZipSink<W: Write> {
    Idle(WriteWrapper<W>),
    Entry(ZipEntryWriter<W>),
    Closed,
}

pub struct ZipArchiver<W: Write> {
    sink: ZipSink<W>,
    entries: Vec<ZipFileEntry>,
    central_directory_end: CentralDirectoryEnd,
    compression_method: CompressionMethod,
    compression_level: Level,
}

impl<W: Write> ZipArchiver<W> {
    pub fn new(
        sink: W,
        compression_method: CompressionMethod,
        compression_level: Level,
    ) -> Result<ZipArchiver<W>> {
        if compression_method == CompressionMethod::Lzma() {
            return Err(ArchiveError::UnsupportedCompressionMethod(compression_method));
        }

        Ok(ZipArchiver {
            sink: ZipSink::Idle(WriteWrapper::new(sink)),
            entries: Vec::new(),
            central_directory_end: CentralDirectoryEnd::default(),
            compression_method,
            compression_level,
        })
    }

    /// Method actually written for file entries.
    fn file_method(&self) -> CompressionMethod {
        if self.compression_level == Level::None {
            CompressionMethod::Store()
        } else {
            self.compression_method
        }
    }

    /// Closes the open entry, if any, and takes the sink back.
    fn finish_entry(&mut self) -> Result<WriteWrapper<W>> {
        match std::mem::replace(&mut self.sink, ZipSink::Closed) {
            ZipSink::Idle(sink) => Ok(sink),
            ZipSink::Entry(writer) => {
                let ZipEntryWriter {
                    encoder,
                    hasher,
                    uncompressed_size,
                    data_start,
                } = writer;

                let mut sink = encoder.finish()?;
                let archive_file_entry = self
                    .entries
                    .last_mut()
                    .ok_or_else(|| ArchiveError::InvalidState("no entry to finish".to_owned()))?;

                archive_file_entry.crc32 = hasher.finalize();
                archive_file_entry.uncompressed_size = uncompressed_size;
                archive_file_entry.compressed_size = sink.get_written_bytes_count() - data_start;

                let data_descriptor = build_data_descriptor(archive_file_entry);
                sink.write_all(data_descriptor.buffer())?;
                Ok(sink)
            }
            ZipSink::Closed => Err(ArchiveError::InvalidState(
                "zip archive is closed".to_owned(),
            )),
        }
    }
}

impl<W: Write + Send> ArchiveBackend for ZipArchiver<W> {
    fn create_entry(&mut self, entry: &PreparedEntry<'_>) -> Result<Option<&mut dyn Write>> {
        let mut sink = self.finish_entry()?;
        let file_header_offset = sink.get_written_bytes_count();

        let method = if entry.is_directory() {
            CompressionMethod::Store()
        } else {
            self.file_method()
        };

        let archive_file_entry = ZipFileEntry::new(
            &entry.path,
            entry.is_directory(),
            method,
            entry.mode,
            entry.attributes.last_modified,
            file_header_offset,
        );

        let file_header = build_local_file_header(&archive_file_entry);
        sink.write_all(file_header.buffer())?;
        self.entries.push(archive_file_entry);

        if entry.is_directory() {
            self.sink = ZipSink::Idle(sink);
            return Ok(None);
        }

        let data_start = sink.get_written_bytes_count();
        let encoder = Encoder::new(method, self.compression_level, sink)?;
        self.sink = ZipSink::Entry(ZipEntryWriter {
            encoder,
            hasher: Hasher::new(),
            uncompressed_size: 0,
            data_start,
        });

        match &mut self.sink {
            ZipSink::Entry(writer) => Ok(Some(writer)),
            _ => Err(ArchiveError::InvalidState("entry stream missing".to_owned())),
        }
    }

    fn set_comment(&mut self, comment: &str) -> Result<()> {
        self.central_directory_end.set_archive_comment(comment);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut sink = self.finish_entry()?;

        let central_directory_offset = sink.get_written_bytes_count();
        let mut central_directory_header = ArchiveDescriptor::new(500);

        for file_info in self.entries.iter() {
            build_central_directory_file_header(&mut central_directory_header, file_info);
            sink.write_all(central_directory_header.buffer())?;
            central_directory_header.clear();
        }

        let central_directory_size = sink.get_written_bytes_count() - central_directory_offset;
        self.central_directory_end.total_number_of_entries = self.entries.len() as u64;
        self.central_directory_end.central_directory_size = central_directory_size;
        self.central_directory_end.offset_of_start_of_central_directory = central_directory_offset;

        let mut end_of_central_directory = ArchiveDescriptor::new(100);
        self.central_directory_end.write(&mut end_of_central_directory);
        sink.write_all(end_of_central_directory.buffer())?;
        sink.flush()?;

        debug!(
            entries = self.entries.len(),
            archive_size = sink.get_written_bytes_count(),
            "zip archive finalized"
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::types::EntryAttributes;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_layout_of_a_stored_entry() {
        let buffer = SharedBuffer::default();
        let mut archive =
            ZipArchiver::new(buffer.clone(), CompressionMethod::Store(), Level::Default).unwrap();

        let attrs = EntryAttributes::file(Some(5));
        let entry = PreparedEntry::new("a.txt", &attrs).unwrap();
        archive
            .create_entry(&entry)
            .unwrap()
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        archive.close().unwrap();

        let bytes = buffer.0.lock().unwrap().clone();
        assert_eq!(&bytes[0..4], &[0x50, 0x4b, 0x03, 0x04]);
        // local header 30 + name 5 + timestamp 9, payload, descriptor 16
        let payload_start = 30 + 5 + 9;
        assert_eq!(&bytes[payload_start..payload_start + 5], b"hello");
        let descriptor = &bytes[payload_start + 5..payload_start + 21];
        assert_eq!(&descriptor[0..4], &[0x50, 0x4b, 0x07, 0x08]);
        assert_eq!(
            u32::from_le_bytes(descriptor[4..8].try_into().unwrap()),
            crc32fast::hash(b"hello")
        );
        // EOCD at the very end, no comment
        assert_eq!(&bytes[bytes.len() - 22..bytes.len() - 18], &[0x50, 0x4b, 0x05, 0x06]);
    }

    #[test]
    fn test_lzma_rejected_up_front() {
        assert!(ZipArchiver::new(Vec::new(), CompressionMethod::Lzma(), Level::Default).is_err());
    }

    #[test]
    fn test_closed_archive_rejects_entries() {
        let mut archive =
            ZipArchiver::new(Vec::new(), CompressionMethod::Deflate(), Level::Default).unwrap();
        archive.close().unwrap();

        let attrs = EntryAttributes::directory();
        let entry = PreparedEntry::new("a", &attrs).unwrap();
        assert!(archive.create_entry(&entry).is_err());
    }
}
