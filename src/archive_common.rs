//! Zip records shared by the streaming Zip writer and the Zip reader.

use chrono::{DateTime, Utc};

use crate::compression::CompressionMethod;
use crate::constants::{
    CENTRAL_DIRECTORY_END_SIGNATURE, CENTRAL_DIRECTORY_ENTRY_SIGNATURE, DATA_DESCRIPTOR_SIGNATURE,
    DESCRIPTOR_SIZE, EXTENDED_LOCAL_HEADER_FLAG, LOCAL_FILE_HEADER_SIGNATURE, MS_DOS_DIRECTORY_ATTRIBUTE, S_IFDIR,
    S_IFREG, UTF8_NAME_FLAG, VERSION_MADE_BY, X5455_EXTENDEDTIMESTAMP,
    ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE, ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE,
    ZIP64_DESCRIPTOR_SIZE, ZIP64_EXTRA_FIELD_ID, ZIP64_VERSION_NEEDED,
};
use crate::descriptor::{ArchiveDescriptor, ArchiveDescriptorReader};
use crate::error::{ArchiveError, Result};
use crate::types::DateTimeCS;

const U32_SENTINEL: u64 = u32::MAX as u64;

/// Everything the central directory needs to know about one entry.
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub general_purpose_flags: u16,
    pub compression_method: u16,
    pub last_mod_file_time: u16,
    pub last_mod_file_date: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub file_name_as_bytes: Vec<u8>,
    pub offset: u64,
    pub external_file_attributes: u32,
    pub modify_time: Option<i32>,
    pub file_comment: Option<Vec<u8>>,
}

impl ZipFileEntry {
    pub fn new(
        file_name: &str,
        is_directory: bool,
        method: CompressionMethod,
        mode: u32,
        last_modified: DateTime<Utc>,
        offset: u64,
    ) -> ZipFileEntry {
        let (date, time) = DateTimeCS::from_utc(last_modified).ms_dos();

        let mut general_purpose_flags = UTF8_NAME_FLAG;
        if !is_directory {
            general_purpose_flags |= EXTENDED_LOCAL_HEADER_FLAG;
        }

        let (file_type, dos_attributes) = if is_directory {
            (S_IFDIR, MS_DOS_DIRECTORY_ATTRIBUTE)
        } else {
            (S_IFREG, 0)
        };

        ZipFileEntry {
            version_made_by: VERSION_MADE_BY,
            version_needed: method.zip_version_needed(),
            general_purpose_flags,
            compression_method: method.zip_code(),
            last_mod_file_time: time,
            last_mod_file_date: date,
            crc32: 0,
            compressed_size: 0,
            uncompressed_size: 0,
            file_name_as_bytes: file_name.as_bytes().to_vec(),
            offset,
            external_file_attributes: ((file_type | (mode & 0o7777)) << 16) | dos_attributes,
            modify_time: Some(crate::types::unix_timestamp_i32(&last_modified)),
            file_comment: None,
        }
    }

    pub fn file_name(&self) -> String {
        String::from_utf8_lossy(&self.file_name_as_bytes).into_owned()
    }

    pub fn is_directory(&self) -> bool {
        self.file_name_as_bytes.last() == Some(&b'/')
            || self.external_file_attributes & MS_DOS_DIRECTORY_ATTRIBUTE != 0
    }

    pub fn is_encrypted(&self) -> bool {
        self.general_purpose_flags & 1 != 0
    }

    pub fn unix_mode(&self) -> Option<u32> {
        if self.version_made_by >> 8 == crate::constants::UNIX as u16 {
            Some((self.external_file_attributes >> 16) & 0o7777)
        } else {
            None
        }
    }

    pub fn is_zip64(&self) -> bool {
        self.compressed_size >= U32_SENTINEL
            || self.uncompressed_size >= U32_SENTINEL
            || self.offset >= U32_SENTINEL
    }

    /// Modification time, from the extended timestamp when present.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        match self.modify_time {
            Some(time) => DateTime::<Utc>::from_timestamp(time as i64, 0),
            None => DateTimeCS::from_msdos(self.last_mod_file_date, self.last_mod_file_time).to_utc(),
        }
    }
}

/// Universal time extra field (0x5455). Only the modification time is written.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtraFieldExtendedTimestamp {
    flags: u8,
    modify_time: Option<i32>,
}

impl ExtraFieldExtendedTimestamp {
    pub const HEADER_ID: u16 = X5455_EXTENDEDTIMESTAMP;

    const MODIFY_TIME_BIT: u8 = 1;

    pub fn new(modify_time: Option<i32>) -> Self {
        let flags = if modify_time.is_some() {
            Self::MODIFY_TIME_BIT
        } else {
            0
        };
        Self { flags, modify_time }
    }

    pub fn size(&self) -> u16 {
        match self.modify_time {
            Some(_) => 4 + 5,
            None => 0,
        }
    }

    pub fn write(&self, archive_descriptor: &mut ArchiveDescriptor) {
        if let Some(modify_time) = self.modify_time {
            archive_descriptor.write_u16(Self::HEADER_ID);
            archive_descriptor.write_u16(5);
            archive_descriptor.write_u8(self.flags);
            archive_descriptor.write_i32(modify_time);
        }
    }

    /// Reads the modification time if its flag is set and the data holds it.
    pub fn parse_extra_field(stream: &[u8]) -> Result<Option<i32>> {
        let mut indexer = ArchiveDescriptorReader::new();
        if stream.is_empty() {
            return Ok(None);
        }
        let flags = indexer.read_u8(stream)?;
        if flags & Self::MODIFY_TIME_BIT != 0 && stream.len() >= 5 {
            Ok(Some(indexer.read_i32(stream)?))
        } else {
            Ok(None)
        }
    }
}

/// ZIP64 extended information. A field only appears when the matching
/// classic field holds 0xFFFFFFFF, always in the order uncompressed size,
/// compressed size, header offset.
pub struct ExtraFieldZIP64ExtendedInformation;

impl ExtraFieldZIP64ExtendedInformation {
    pub const HEADER_ID: u16 = ZIP64_EXTRA_FIELD_ID;

    fn data_size(entry: &ZipFileEntry) -> u16 {
        let mut size = 0;
        if entry.uncompressed_size >= U32_SENTINEL {
            size += 8;
        }
        if entry.compressed_size >= U32_SENTINEL {
            size += 8;
        }
        if entry.offset >= U32_SENTINEL {
            size += 8;
        }
        size
    }

    pub fn size(entry: &ZipFileEntry) -> u16 {
        match Self::data_size(entry) {
            0 => 0,
            size => 4 + size,
        }
    }

    pub fn write(archive_descriptor: &mut ArchiveDescriptor, entry: &ZipFileEntry) {
        let data_size = Self::data_size(entry);
        if data_size == 0 {
            return;
        }
        archive_descriptor.write_u16(Self::HEADER_ID);
        archive_descriptor.write_u16(data_size);
        if entry.uncompressed_size >= U32_SENTINEL {
            archive_descriptor.write_u64(entry.uncompressed_size);
        }
        if entry.compressed_size >= U32_SENTINEL {
            archive_descriptor.write_u64(entry.compressed_size);
        }
        if entry.offset >= U32_SENTINEL {
            archive_descriptor.write_u64(entry.offset);
        }
    }

    pub fn parse_extra_field(stream: &[u8], entry: &mut ZipFileEntry) -> Result<()> {
        let mut indexer = ArchiveDescriptorReader::new();
        if entry.uncompressed_size == U32_SENTINEL {
            entry.uncompressed_size = indexer.read_u64(stream)?;
        }
        if entry.compressed_size == U32_SENTINEL {
            entry.compressed_size = indexer.read_u64(stream)?;
        }
        if entry.offset == U32_SENTINEL {
            entry.offset = indexer.read_u64(stream)?;
        }
        Ok(())
    }
}

/// Local header of a streamed entry: crc and sizes are zero and follow the
/// payload in a data descriptor. Directories carry no descriptor.
pub fn build_local_file_header(entry: &ZipFileEntry) -> ArchiveDescriptor {
    let timestamp = ExtraFieldExtendedTimestamp::new(entry.modify_time);
    let mut file_header = ArchiveDescriptor::new(
        crate::constants::FILE_HEADER_BASE_SIZE as usize
            + entry.file_name_as_bytes.len()
            + timestamp.size() as usize,
    );

    file_header.write_u32(LOCAL_FILE_HEADER_SIGNATURE);
    file_header.write_u16(entry.version_needed);
    file_header.write_u16(entry.general_purpose_flags);
    file_header.write_u16(entry.compression_method);
    file_header.write_u16(entry.last_mod_file_time);
    file_header.write_u16(entry.last_mod_file_date);
    file_header.write_u32(0); // crc
    file_header.write_u32(0); // compressed size
    file_header.write_u32(0); // uncompressed size
    file_header.write_u16(entry.file_name_as_bytes.len() as u16);
    file_header.write_u16(timestamp.size());
    file_header.write_bytes(&entry.file_name_as_bytes);
    timestamp.write(&mut file_header);

    file_header
}

pub fn build_data_descriptor(entry: &ZipFileEntry) -> ArchiveDescriptor {
    let zip64 = entry.compressed_size >= U32_SENTINEL || entry.uncompressed_size >= U32_SENTINEL;
    let mut descriptor = ArchiveDescriptor::new(if zip64 {
        ZIP64_DESCRIPTOR_SIZE as usize
    } else {
        DESCRIPTOR_SIZE as usize
    });
    descriptor.write_u32(DATA_DESCRIPTOR_SIGNATURE);
    descriptor.write_u32(entry.crc32);

    if zip64 {
        descriptor.write_u64(entry.compressed_size);
        descriptor.write_u64(entry.uncompressed_size);
    } else {
        descriptor.write_u32(entry.compressed_size as u32);
        descriptor.write_u32(entry.uncompressed_size as u32);
    }
    descriptor
}

pub fn build_central_directory_file_header(
    central_directory_header: &mut ArchiveDescriptor,
    entry: &ZipFileEntry,
) {
    let timestamp = ExtraFieldExtendedTimestamp::new(entry.modify_time);
    let extra_field_length = timestamp.size() + ExtraFieldZIP64ExtendedInformation::size(entry);
    let comment_length = entry.file_comment.as_ref().map_or(0, |c| c.len() as u16);

    let version_needed = if entry.is_zip64() {
        entry.version_needed.max(ZIP64_VERSION_NEEDED)
    } else {
        entry.version_needed
    };

    central_directory_header.write_u32(CENTRAL_DIRECTORY_ENTRY_SIGNATURE);
    central_directory_header.write_u16(entry.version_made_by);
    central_directory_header.write_u16(version_needed);
    central_directory_header.write_u16(entry.general_purpose_flags);
    central_directory_header.write_u16(entry.compression_method);
    central_directory_header.write_u16(entry.last_mod_file_time);
    central_directory_header.write_u16(entry.last_mod_file_date);
    central_directory_header.write_u32(entry.crc32);
    central_directory_header.write_u32(entry.compressed_size.min(U32_SENTINEL) as u32);
    central_directory_header.write_u32(entry.uncompressed_size.min(U32_SENTINEL) as u32);
    central_directory_header.write_u16(entry.file_name_as_bytes.len() as u16);
    central_directory_header.write_u16(extra_field_length);
    central_directory_header.write_u16(comment_length);
    central_directory_header.write_u16(0); // disk number start
    central_directory_header.write_u16(0); // internal attributes
    central_directory_header.write_u32(entry.external_file_attributes);
    central_directory_header.write_u32(entry.offset.min(U32_SENTINEL) as u32);
    central_directory_header.write_bytes(&entry.file_name_as_bytes);
    timestamp.write(central_directory_header);
    ExtraFieldZIP64ExtendedInformation::write(central_directory_header, entry);
    if let Some(comment) = &entry.file_comment {
        central_directory_header.write_bytes(comment);
    }
}

/// Parses `count` central directory headers from `stream`.
pub fn parse_central_directory(stream: &[u8], count: u64) -> Result<Vec<ZipFileEntry>> {
    let mut indexer = ArchiveDescriptorReader::new();
    let mut entries = Vec::with_capacity(count.min(u16::MAX as u64) as usize);

    for _ in 0..count {
        let signature = indexer.read_u32(stream)?;
        if signature != CENTRAL_DIRECTORY_ENTRY_SIGNATURE {
            return Err(ArchiveError::bad_structure(format!(
                "central directory signature not found, got {signature:#010x}"
            )));
        }

        let version_made_by = indexer.read_u16(stream)?;
        let version_needed = indexer.read_u16(stream)?;
        let general_purpose_flags = indexer.read_u16(stream)?;
        let compression_method = indexer.read_u16(stream)?;
        let last_mod_file_time = indexer.read_u16(stream)?;
        let last_mod_file_date = indexer.read_u16(stream)?;
        let crc32 = indexer.read_u32(stream)?;
        let compressed_size = indexer.read_u32(stream)? as u64;
        let uncompressed_size = indexer.read_u32(stream)? as u64;
        let file_name_len = indexer.read_u16(stream)?;
        let extra_field_length = indexer.read_u16(stream)?;
        let file_comment_length = indexer.read_u16(stream)?;
        let _file_disk_number = indexer.read_u16(stream)?;
        let _internal_file_attributes = indexer.read_u16(stream)?;
        let external_file_attributes = indexer.read_u32(stream)?;
        let offset = indexer.read_u32(stream)? as u64;
        let file_name_as_bytes = indexer.read_bytes(stream, file_name_len as usize)?.to_vec();
        let extra_fields = indexer.read_bytes(stream, extra_field_length as usize)?;
        let file_comment = match file_comment_length {
            0 => None,
            len => Some(indexer.read_bytes(stream, len as usize)?.to_vec()),
        };

        let mut entry = ZipFileEntry {
            version_made_by,
            version_needed,
            general_purpose_flags,
            compression_method,
            last_mod_file_time,
            last_mod_file_date,
            crc32,
            compressed_size,
            uncompressed_size,
            file_name_as_bytes,
            offset,
            external_file_attributes,
            modify_time: None,
            file_comment,
        };

        parse_extra_fields(extra_fields, &mut entry)?;
        entries.push(entry);
    }

    Ok(entries)
}

fn parse_extra_fields(stream: &[u8], entry: &mut ZipFileEntry) -> Result<()> {
    let mut indexer = ArchiveDescriptorReader::new();

    while indexer.get_index() + 4 <= stream.len() {
        let header_id = indexer.read_u16(stream)?;
        let data_size = indexer.read_u16(stream)?;
        let data = indexer.read_bytes(stream, data_size as usize)?;

        match header_id {
            ExtraFieldZIP64ExtendedInformation::HEADER_ID => {
                ExtraFieldZIP64ExtendedInformation::parse_extra_field(data, entry)?
            }
            ExtraFieldExtendedTimestamp::HEADER_ID => {
                entry.modify_time = ExtraFieldExtendedTimestamp::parse_extra_field(data)?
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct CentralDirectoryEnd {
    pub total_number_of_entries: u64,
    pub central_directory_size: u64,
    pub offset_of_start_of_central_directory: u64,
    pub archive_comment: Option<Vec<u8>>,
}

impl CentralDirectoryEnd {
    /// Comment is truncated to 0xFFFF bytes.
    pub fn set_archive_comment(&mut self, comment: &str) {
        let bytes = comment.as_bytes();
        let len = std::cmp::min(bytes.len(), u16::MAX as usize);
        self.archive_comment = Some(bytes[0..len].to_owned());
    }

    pub fn needs_zip64_format_extensions(&self) -> bool {
        self.total_number_of_entries >= u16::MAX as u64
            || self.central_directory_size >= U32_SENTINEL
            || self.offset_of_start_of_central_directory >= U32_SENTINEL
    }

    /// ZIP64 record and locator when needed, then the classic record.
    pub fn write(&self, end_of_central_directory: &mut ArchiveDescriptor) {
        if self.needs_zip64_format_extensions() {
            self.create_zip64_end_of_central_directory_record(end_of_central_directory);
            self.create_end_of_central_directory_locator(end_of_central_directory);
        }
        self.create_end_of_central_directory(end_of_central_directory);
    }

    fn create_zip64_end_of_central_directory_record(
        &self,
        end_of_central_directory: &mut ArchiveDescriptor,
    ) {
        const SIZE_OF_THE_EOCD64_MINUS_12: u64 = 44;

        end_of_central_directory.write_u32(ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE);
        end_of_central_directory.write_u64(SIZE_OF_THE_EOCD64_MINUS_12);
        end_of_central_directory.write_u16(VERSION_MADE_BY);
        end_of_central_directory.write_u16(ZIP64_VERSION_NEEDED);
        end_of_central_directory.write_u32(0); // this disk
        end_of_central_directory.write_u32(0); // disk with central directory
        end_of_central_directory.write_u64(self.total_number_of_entries);
        end_of_central_directory.write_u64(self.total_number_of_entries);
        end_of_central_directory.write_u64(self.central_directory_size);
        end_of_central_directory.write_u64(self.offset_of_start_of_central_directory);
    }

    fn create_end_of_central_directory_locator(
        &self,
        end_of_central_directory: &mut ArchiveDescriptor,
    ) {
        end_of_central_directory.write_u32(ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE);
        end_of_central_directory.write_u32(0);
        end_of_central_directory
            .write_u64(self.offset_of_start_of_central_directory + self.central_directory_size);
        end_of_central_directory.write_u32(1); // total number of disks
    }

    fn create_end_of_central_directory(&self, end_of_central_directory: &mut ArchiveDescriptor) {
        let entries = self.total_number_of_entries.min(u16::MAX as u64) as u16;

        end_of_central_directory.write_u32(CENTRAL_DIRECTORY_END_SIGNATURE);
        end_of_central_directory.write_u16(0);
        end_of_central_directory.write_u16(0);
        end_of_central_directory.write_u16(entries);
        end_of_central_directory.write_u16(entries);
        end_of_central_directory.write_u32(self.central_directory_size.min(U32_SENTINEL) as u32);
        end_of_central_directory
            .write_u32(self.offset_of_start_of_central_directory.min(U32_SENTINEL) as u32);

        if let Some(comment) = &self.archive_comment {
            end_of_central_directory.write_u16(comment.len() as u16);
            end_of_central_directory.write_bytes(comment);
        } else {
            end_of_central_directory.write_u16(0);
        };
    }

    /// Parses the classic record, `stream` starting right after its signature.
    pub fn parse(stream: &[u8]) -> Result<CentralDirectoryEnd> {
        let mut indexer = ArchiveDescriptorReader::new();

        let _disk_number = indexer.read_u16(stream)?;
        let _disk_with_central_directory = indexer.read_u16(stream)?;
        let _entries_on_this_disk = indexer.read_u16(stream)?;
        let total_number_of_entries = indexer.read_u16(stream)? as u64;
        let central_directory_size = indexer.read_u32(stream)? as u64;
        let offset_of_start_of_central_directory = indexer.read_u32(stream)? as u64;
        let zip_file_comment_length = indexer.read_u16(stream)?;
        let available = stream.len().saturating_sub(indexer.get_index());
        let comment = indexer.read_bytes(stream, (zip_file_comment_length as usize).min(available))?;

        Ok(CentralDirectoryEnd {
            total_number_of_entries,
            central_directory_size,
            offset_of_start_of_central_directory,
            archive_comment: if comment.is_empty() {
                None
            } else {
                Some(comment.to_vec())
            },
        })
    }

    /// Replaces the counters with the ZIP64 record values, `stream` starting
    /// at the ZIP64 record signature.
    pub fn apply_zip64_record(&mut self, stream: &[u8]) -> Result<()> {
        let mut indexer = ArchiveDescriptorReader::new();
        if indexer.read_u32(stream)? != ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE {
            return Err(ArchiveError::bad_structure("ZIP64 end of central directory not found"));
        }
        indexer.skip(8 + 2 + 2 + 4 + 4);
        let _entries_on_this_disk = indexer.read_u64(stream)?;
        self.total_number_of_entries = indexer.read_u64(stream)?;
        self.central_directory_size = indexer.read_u64(stream)?;
        self.offset_of_start_of_central_directory = indexer.read_u64(stream)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    fn sample_entry() -> ZipFileEntry {
        let date = Utc.with_ymd_and_hms(2021, 6, 1, 12, 30, 10).unwrap();
        ZipFileEntry::new("a/b.txt", false, CompressionMethod::Deflate(), 0o644, date, 0)
    }

    #[test]
    fn test_central_header_round_trip() {
        let mut entry = sample_entry();
        entry.crc32 = 0xdeadbeef;
        entry.compressed_size = 10;
        entry.uncompressed_size = 20;

        let mut central = ArchiveDescriptor::new(100);
        build_central_directory_file_header(&mut central, &entry);
        let parsed = parse_central_directory(central.buffer(), 1).unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].file_name(), "a/b.txt");
        assert_eq!(parsed[0].crc32, 0xdeadbeef);
        assert_eq!(parsed[0].uncompressed_size, 20);
        assert_eq!(parsed[0].unix_mode(), Some(0o644));
        assert_eq!(parsed[0].modify_time, entry.modify_time);
        assert!(!parsed[0].is_directory());
    }

    #[test]
    fn test_zip64_extra_field_only_when_needed() {
        let mut entry = sample_entry();
        assert_eq!(ExtraFieldZIP64ExtendedInformation::size(&entry), 0);

        entry.uncompressed_size = u32::MAX as u64 + 10;
        entry.compressed_size = 12;
        assert_eq!(ExtraFieldZIP64ExtendedInformation::size(&entry), 12);

        let mut central = ArchiveDescriptor::new(100);
        build_central_directory_file_header(&mut central, &entry);
        let parsed = parse_central_directory(central.buffer(), 1).unwrap();
        assert_eq!(parsed[0].uncompressed_size, u32::MAX as u64 + 10);
        assert_eq!(parsed[0].compressed_size, 12);
        assert!(parsed[0].version_needed >= ZIP64_VERSION_NEEDED);
    }

    #[test]
    fn test_directory_attributes() {
        let entry = ZipFileEntry::new(
            "dir/",
            true,
            CompressionMethod::Store(),
            0o755,
            Utc::now(),
            0,
        );
        assert!(entry.is_directory());
        assert_eq!(entry.general_purpose_flags & EXTENDED_LOCAL_HEADER_FLAG, 0);
        assert_eq!(entry.external_file_attributes >> 16, S_IFDIR | 0o755);
    }

    #[test]
    fn test_comment_truncated() {
        let mut end = CentralDirectoryEnd::default();
        end.set_archive_comment(&"x".repeat(70_000));
        assert_eq!(end.archive_comment.as_ref().unwrap().len(), u16::MAX as usize);
    }

    #[test]
    fn test_end_record_round_trip() {
        let mut end = CentralDirectoryEnd {
            total_number_of_entries: 3,
            central_directory_size: 150,
            offset_of_start_of_central_directory: 1000,
            archive_comment: None,
        };
        end.set_archive_comment("hello");

        let mut buffer = ArchiveDescriptor::new(64);
        end.write(&mut buffer);
        let parsed = CentralDirectoryEnd::parse(&buffer.buffer()[4..]).unwrap();
        assert_eq!(parsed.total_number_of_entries, 3);
        assert_eq!(parsed.central_directory_size, 150);
        assert_eq!(parsed.offset_of_start_of_central_directory, 1000);
        assert_eq!(parsed.archive_comment.as_deref(), Some(&b"hello"[..]));
    }
}
