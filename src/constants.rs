use std::mem::size_of;

pub const FILE_HEADER_BASE_SIZE: u64 = 7 * size_of::<u16>() as u64 + 4 * size_of::<u32>() as u64;
pub const DESCRIPTOR_SIZE: u64 = 4 * size_of::<u32>() as u64;
pub const ZIP64_DESCRIPTOR_SIZE: u64 = 2 * size_of::<u32>() as u64 + 2 * size_of::<u64>() as u64;
pub const END_OF_CENTRAL_DIRECTORY_SIZE: u64 =
    5 * size_of::<u16>() as u64 + 3 * size_of::<u32>() as u64;

pub const LOCAL_FILE_HEADER_SIGNATURE: u32 = 0x04034b50;
pub const DATA_DESCRIPTOR_SIGNATURE: u32 = 0x08074b50;
pub const CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06054b50;
pub const CENTRAL_DIRECTORY_ENTRY_SIGNATURE: u32 = 0x02014b50;
pub const ZIP64_CENTRAL_DIRECTORY_END_SIGNATURE: u32 = 0x06064b50;
pub const ZIP64_END_OF_CENTRAL_DIR_LOCATOR_SIGNATURE: u32 = 0x07064b50;

pub const X5455_EXTENDEDTIMESTAMP: u16 = 0x5455;
pub const ZIP64_EXTRA_FIELD_ID: u16 = 0x0001;

/// Bit 3: crc and sizes follow the payload in a data descriptor.
pub const EXTENDED_LOCAL_HEADER_FLAG: u16 = 1 << 3;
/// Bit 11: file name is UTF-8.
pub const UTF8_NAME_FLAG: u16 = 1 << 11;

pub const DEFAULT_VERSION: u8 = 46;
pub const UNIX: u8 = 3;
pub const VERSION_MADE_BY: u16 = (UNIX as u16) << 8 | DEFAULT_VERSION as u16;
pub const ZIP64_VERSION_NEEDED: u16 = 45;

pub const MS_DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
