//! Byte layouts shared by the writer stages and the reader: volume
//! descriptors, directory records, path table records and dates.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};

use crate::descriptor::{ArchiveDescriptor, ArchiveDescriptorReader};
use crate::error::{ArchiveError, Result};

pub const SECTOR_SIZE: usize = 2048;
pub const SYSTEM_AREA_SECTORS: u32 = 16;
pub const STANDARD_ID: &[u8; 5] = b"CD001";

pub const VD_BOOT_RECORD: u8 = 0;
pub const VD_PRIMARY: u8 = 1;
pub const VD_SUPPLEMENTARY: u8 = 2;
pub const VD_TERMINATOR: u8 = 255;

/// UCS-2 level 3.
pub const JOLIET_ESCAPE: &[u8; 3] = b"%/E";

pub const FLAG_DIRECTORY: u8 = 0x02;
pub const FLAG_MULTI_EXTENT: u8 = 0x80;

/// Fixed part of a directory record, before the identifier.
pub const DIRECTORY_RECORD_BASE: usize = 33;
pub const MAX_DIRECTORY_RECORD: usize = 255;
/// Root record embedded in a volume descriptor.
pub const ROOT_RECORD_LEN: usize = 34;

pub const CURRENT_DIRECTORY: &[u8] = &[0];
pub const PARENT_DIRECTORY: &[u8] = &[1];

pub fn sectors(len: u64) -> u32 {
    len.div_ceil(SECTOR_SIZE as u64) as u32
}

/// "YYYYMMDDHHMMSScc" followed by the offset from GMT in 15 minute units.
pub fn volume_date(datetime: Option<&DateTime<Utc>>) -> [u8; 17] {
    let mut date = [b'0'; 17];
    date[16] = 0;
    if let Some(datetime) = datetime {
        let text = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
            datetime.year().clamp(1, 9999),
            datetime.month(),
            datetime.day(),
            datetime.hour(),
            datetime.minute(),
            datetime.second(),
            datetime.timestamp_subsec_millis() / 10
        );
        date[..16].copy_from_slice(text.as_bytes());
    }
    date
}

/// Years since 1900, month, day, hour, minute, second, GMT offset.
pub fn record_date(datetime: &DateTime<Utc>) -> [u8; 7] {
    [
        (datetime.year() - 1900).clamp(0, 255) as u8,
        datetime.month() as u8,
        datetime.day() as u8,
        datetime.hour() as u8,
        datetime.minute() as u8,
        datetime.second() as u8,
        0,
    ]
}

pub fn parse_record_date(bytes: &[u8]) -> Option<DateTime<Utc>> {
    if bytes.len() < 7 || bytes[..6].iter().all(|b| *b == 0) {
        return None;
    }
    let offset = FixedOffset::east_opt(bytes[6] as i8 as i32 * 15 * 60)?;
    let naive = NaiveDate::from_ymd_opt(1900 + bytes[0] as i32, bytes[1] as u32, bytes[2] as u32)?
        .and_hms_opt(bytes[3] as u32, bytes[4] as u32, bytes[5] as u32)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|datetime| datetime.with_timezone(&Utc))
}

fn identifier_padding(identifier_len: usize) -> usize {
    usize::from(identifier_len % 2 == 0)
}

/// Full length of a directory record; system use is kept even.
pub fn directory_record_len(identifier_len: usize, system_use_len: usize) -> usize {
    DIRECTORY_RECORD_BASE
        + identifier_len
        + identifier_padding(identifier_len)
        + system_use_len
        + system_use_len % 2
}

pub struct DirectoryRecord<'a> {
    pub extent: u32,
    pub data_length: u32,
    pub recorded: &'a DateTime<Utc>,
    pub flags: u8,
    pub identifier: &'a [u8],
    pub system_use: &'a [u8],
}

impl DirectoryRecord<'_> {
    pub fn len(&self) -> usize {
        directory_record_len(self.identifier.len(), self.system_use.len())
    }

    pub fn write(&self, descriptor: &mut ArchiveDescriptor) -> Result<()> {
        let len = self.len();
        if len > MAX_DIRECTORY_RECORD {
            return Err(ArchiveError::bad_structure(format!(
                "directory record of {len} bytes"
            )));
        }

        descriptor.write_u8(len as u8);
        descriptor.write_u8(0); // extended attribute record
        descriptor.write_u32_both(self.extent);
        descriptor.write_u32_both(self.data_length);
        descriptor.write_bytes(&record_date(self.recorded));
        descriptor.write_u8(self.flags);
        descriptor.write_u8(0); // file unit size
        descriptor.write_u8(0); // interleave gap
        descriptor.write_u16_both(1); // volume sequence number
        descriptor.write_u8(self.identifier.len() as u8);
        descriptor.write_bytes(self.identifier);
        descriptor.write_zeros(identifier_padding(self.identifier.len()));
        descriptor.write_bytes(self.system_use);
        descriptor.write_zeros(self.system_use.len() % 2);
        Ok(())
    }
}

/// Directory record as found on disk.
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub extent: u32,
    pub data_length: u32,
    pub recorded: Option<DateTime<Utc>>,
    pub flags: u8,
    pub identifier: Vec<u8>,
    pub system_use: Vec<u8>,
}

impl ParsedRecord {
    pub fn is_directory(&self) -> bool {
        self.flags & FLAG_DIRECTORY != 0
    }

    pub fn is_self_or_parent(&self) -> bool {
        self.identifier == CURRENT_DIRECTORY || self.identifier == PARENT_DIRECTORY
    }

    /// Parses the record starting at the beginning of `stream`.
    pub fn parse(stream: &[u8]) -> Result<ParsedRecord> {
        let mut reader = ArchiveDescriptorReader::new();
        let len = reader.read_u8(stream)? as usize;
        if len < DIRECTORY_RECORD_BASE || len > stream.len() {
            return Err(ArchiveError::bad_structure(format!(
                "directory record length {len}"
            )));
        }
        let record = &stream[..len];

        reader.skip(1);
        let extent = reader.read_u32_both(record)?;
        let data_length = reader.read_u32_both(record)?;
        let recorded = parse_record_date(reader.read_bytes(record, 7)?);
        let flags = reader.read_u8(record)?;
        reader.skip(6);
        let identifier_len = reader.read_u8(record)? as usize;
        let identifier = reader.read_bytes(record, identifier_len)?.to_vec();
        reader.skip(identifier_padding(identifier_len));
        let system_use = record.get(reader.get_index()..).unwrap_or_default().to_vec();

        Ok(ParsedRecord {
            extent,
            data_length,
            recorded,
            flags,
            identifier,
            system_use,
        })
    }
}

/// Appends one path table record in little or big endian order.
pub fn write_path_table_record(
    descriptor: &mut ArchiveDescriptor,
    identifier: &[u8],
    extent: u32,
    parent_number: u16,
    big_endian: bool,
) {
    descriptor.write_u8(identifier.len() as u8);
    descriptor.write_u8(0);
    if big_endian {
        descriptor.write_u32_be(extent);
        descriptor.write_u16_be(parent_number);
    } else {
        descriptor.write_u32(extent);
        descriptor.write_u16(parent_number);
    }
    descriptor.write_bytes(identifier);
    descriptor.write_zeros(identifier.len() % 2);
}

pub fn path_table_record_len(identifier_len: usize) -> usize {
    8 + identifier_len + identifier_len % 2
}

/// Fields of a primary or supplementary volume descriptor. Text fields are
/// already encoded, a-/d-characters for the primary and UCS-2 for Joliet.
pub struct VolumeDescriptor<'a> {
    pub kind: u8,
    pub escape_sequences: &'a [u8],
    pub system_id: Vec<u8>,
    pub volume_id: Vec<u8>,
    pub volume_space_size: u32,
    pub path_table_size: u32,
    pub l_path_table: u32,
    pub m_path_table: u32,
    pub root_record: Vec<u8>,
    pub publisher: Vec<u8>,
    pub data_preparer: Vec<u8>,
    pub application_id: Vec<u8>,
    pub created: &'a DateTime<Utc>,
    /// Fill of the text fields.
    pub ucs2: bool,
}

impl VolumeDescriptor<'_> {
    fn write_text(&self, descriptor: &mut ArchiveDescriptor, value: &[u8], len: usize) {
        if self.ucs2 {
            let mut padded = value[..value.len().min(len) & !1].to_vec();
            while padded.len() + 2 <= len {
                padded.extend_from_slice(&[0x00, 0x20]);
            }
            descriptor.write_padded(&padded, len, 0);
        } else {
            descriptor.write_padded(value, len, b' ');
        }
    }

    pub fn to_sector(&self) -> Vec<u8> {
        let mut descriptor = ArchiveDescriptor::new(SECTOR_SIZE);
        descriptor.write_u8(self.kind);
        descriptor.write_bytes(STANDARD_ID);
        descriptor.write_u8(1);
        descriptor.write_u8(0);
        self.write_text(&mut descriptor, &self.system_id, 32);
        self.write_text(&mut descriptor, &self.volume_id, 32);
        descriptor.write_zeros(8);
        descriptor.write_u32_both(self.volume_space_size);
        descriptor.write_padded(self.escape_sequences, 32, 0);
        descriptor.write_u16_both(1); // volume set size
        descriptor.write_u16_both(1); // volume sequence number
        descriptor.write_u16_both(SECTOR_SIZE as u16);
        descriptor.write_u32_both(self.path_table_size);
        descriptor.write_u32(self.l_path_table);
        descriptor.write_u32(0);
        descriptor.write_u32_be(self.m_path_table);
        descriptor.write_u32_be(0);
        descriptor.write_padded(&self.root_record, ROOT_RECORD_LEN, 0);
        self.write_text(&mut descriptor, &[], 128); // volume set
        self.write_text(&mut descriptor, &self.publisher, 128);
        self.write_text(&mut descriptor, &self.data_preparer, 128);
        self.write_text(&mut descriptor, &self.application_id, 128);
        self.write_text(&mut descriptor, &[], 37); // copyright file
        self.write_text(&mut descriptor, &[], 37); // abstract file
        self.write_text(&mut descriptor, &[], 37); // bibliographic file
        descriptor.write_bytes(&volume_date(Some(self.created)));
        descriptor.write_bytes(&volume_date(Some(self.created)));
        descriptor.write_bytes(&volume_date(None));
        descriptor.write_bytes(&volume_date(Some(self.created)));
        descriptor.write_u8(1); // file structure version
        descriptor.write_zeros(SECTOR_SIZE - descriptor.len());
        descriptor.finish()
    }
}

/// Boot record, terminator and other descriptors with only a header.
pub fn descriptor_header(kind: u8) -> ArchiveDescriptor {
    let mut descriptor = ArchiveDescriptor::new(SECTOR_SIZE);
    descriptor.write_u8(kind);
    descriptor.write_bytes(STANDARD_ID);
    descriptor.write_u8(1);
    descriptor
}

pub fn terminator() -> Vec<u8> {
    let mut descriptor = descriptor_header(VD_TERMINATOR);
    descriptor.write_zeros(SECTOR_SIZE - descriptor.len());
    descriptor.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_length_padding() {
        // odd identifier, no padding byte
        assert_eq!(directory_record_len(1, 0), 34);
        assert_eq!(directory_record_len(12, 0), 46);
        assert_eq!(directory_record_len(11, 7), 33 + 11 + 8);
    }

    #[test]
    fn test_directory_record_round_trip() {
        let recorded = Utc.with_ymd_and_hms(2021, 3, 4, 5, 6, 7).unwrap();
        let record = DirectoryRecord {
            extent: 20,
            data_length: 5,
            recorded: &recorded,
            flags: 0,
            identifier: b"HELLO.TXT;1",
            system_use: b"PX",
        };
        let mut descriptor = ArchiveDescriptor::new(64);
        record.write(&mut descriptor).unwrap();
        assert_eq!(descriptor.len(), record.len());
        assert_eq!(descriptor.buffer()[0] as usize, record.len());

        let parsed = ParsedRecord::parse(descriptor.buffer()).unwrap();
        assert_eq!(parsed.extent, 20);
        assert_eq!(parsed.data_length, 5);
        assert_eq!(parsed.identifier, b"HELLO.TXT;1");
        assert_eq!(parsed.system_use, b"PX");
        assert_eq!(parsed.recorded, Some(recorded));
        assert!(!parsed.is_directory());
    }

    #[test]
    fn test_volume_descriptor_layout() {
        let created = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let sector = VolumeDescriptor {
            kind: VD_PRIMARY,
            escape_sequences: &[],
            system_id: Vec::new(),
            volume_id: b"TEST".to_vec(),
            volume_space_size: 30,
            path_table_size: 10,
            l_path_table: 18,
            m_path_table: 19,
            root_record: vec![34],
            publisher: Vec::new(),
            data_preparer: Vec::new(),
            application_id: Vec::new(),
            created: &created,
            ucs2: false,
        }
        .to_sector();

        assert_eq!(sector.len(), SECTOR_SIZE);
        assert_eq!(&sector[1..6], b"CD001");
        assert_eq!(&sector[40..44], b"TEST");
        assert_eq!(sector[44], b' ');
        assert_eq!(u32::from_le_bytes(sector[80..84].try_into().unwrap()), 30);
        assert_eq!(u32::from_be_bytes(sector[84..88].try_into().unwrap()), 30);
        assert_eq!(sector[156], 34);
        assert_eq!(&sector[813..821], b"20200101");
        assert_eq!(sector[881], 1);
    }

    #[test]
    fn test_ucs2_fields_are_space_filled() {
        let created = Utc::now();
        let sector = VolumeDescriptor {
            kind: VD_SUPPLEMENTARY,
            escape_sequences: JOLIET_ESCAPE,
            system_id: Vec::new(),
            volume_id: vec![0x00, b'A'],
            volume_space_size: 0,
            path_table_size: 0,
            l_path_table: 0,
            m_path_table: 0,
            root_record: Vec::new(),
            publisher: Vec::new(),
            data_preparer: Vec::new(),
            application_id: Vec::new(),
            created: &created,
            ucs2: true,
        }
        .to_sector();
        assert_eq!(&sector[40..44], &[0x00, b'A', 0x00, 0x20]);
        assert_eq!(&sector[88..91], b"%/E");
    }
}
