use core::fmt;
use std::any::Any;
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone, Timelike, Utc};

pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
pub const DEFAULT_DIRECTORY_PERMISSIONS: u32 = 0o755;

/// Unix permission bits together with the mask of bits that are actually
/// known. Unknown bits are filled from the file or directory default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub value: u32,
    pub mask: u32,
}

impl Permissions {
    /// All nine permission bits are known.
    pub fn new(mode: u32) -> Permissions {
        Permissions {
            value: mode & 0o777,
            mask: 0o777,
        }
    }

    pub fn with_mask(value: u32, mask: u32) -> Permissions {
        Permissions {
            value: value & 0o777,
            mask: mask & 0o777,
        }
    }

    /// No bit is known.
    pub fn unknown() -> Permissions {
        Permissions { value: 0, mask: 0 }
    }

    /// Known bits are kept, unknown ones come from the default for the entry kind.
    pub fn pad(&self, is_directory: bool) -> u32 {
        let default = if is_directory {
            DEFAULT_DIRECTORY_PERMISSIONS
        } else {
            DEFAULT_FILE_PERMISSIONS
        };
        (self.value & self.mask) | (default & !self.mask & 0o777)
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::unknown()
    }
}

/// Where the bytes of an entry come from when the backend pulls them
/// itself instead of receiving them through the returned writer.
#[derive(Debug, Clone)]
pub enum ContentSource {
    File(PathBuf),
    Memory(Arc<[u8]>),
}

impl ContentSource {
    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match self {
            ContentSource::File(path) => Ok(Box::new(File::open(path)?)),
            ContentSource::Memory(data) => Ok(Box::new(io::Cursor::new(data.clone()))),
        }
    }

    pub fn len(&self) -> io::Result<u64> {
        match self {
            ContentSource::File(path) => Ok(std::fs::metadata(path)?.len()),
            ContentSource::Memory(data) => Ok(data.len() as u64),
        }
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl From<Vec<u8>> for ContentSource {
    fn from(value: Vec<u8>) -> Self {
        ContentSource::Memory(value.into())
    }
}

impl From<PathBuf> for ContentSource {
    fn from(value: PathBuf) -> Self {
        ContentSource::File(value)
    }
}

/// Attributes supplied by the caller for every entry. The engine never
/// mutates them.
#[derive(Debug, Clone)]
pub struct EntryAttributes {
    pub is_directory: bool,

    /// Payload length, `None` when unknown.
    pub size: Option<u64>,

    pub last_modified: DateTime<Utc>,

    pub permissions: Permissions,

    /// Optional content the backend may read on its own (ISO images).
    pub source: Option<ContentSource>,
}

impl EntryAttributes {
    pub fn directory() -> EntryAttributes {
        EntryAttributes {
            is_directory: true,
            size: None,
            last_modified: Utc::now(),
            permissions: Permissions::unknown(),
            source: None,
        }
    }

    pub fn file(size: Option<u64>) -> EntryAttributes {
        EntryAttributes {
            is_directory: false,
            size,
            last_modified: Utc::now(),
            permissions: Permissions::unknown(),
            source: None,
        }
    }

    pub fn last_modified(mut self, last_modified: DateTime<Utc>) -> EntryAttributes {
        self.last_modified = last_modified;
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> EntryAttributes {
        self.permissions = permissions;
        self
    }

    /// Attach a content source. The size is taken from it when not already known.
    pub fn source(mut self, source: ContentSource) -> EntryAttributes {
        if self.size.is_none() {
            self.size = source.len().ok();
        }
        self.source = Some(source);
        self
    }

    /// Size to declare in the container, directories never carry one.
    pub fn declared_size(&self) -> Option<u64> {
        if self.is_directory {
            None
        } else {
            self.size
        }
    }
}

/// One member of an archive as reported by a reader.
#[derive(Clone)]
pub struct ArchiveEntryRecord {
    /// Separator is always `/`, directories end with `/`.
    pub path: String,
    pub is_directory: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    /// `false` when the size is an estimate.
    pub exact: bool,
    pub handle: Option<Arc<dyn Any + Send + Sync>>,
}

impl ArchiveEntryRecord {
    pub fn new(path: String, is_directory: bool) -> ArchiveEntryRecord {
        ArchiveEntryRecord {
            path,
            is_directory,
            last_modified: None,
            size: None,
            exact: true,
            handle: None,
        }
    }

    pub fn with_handle<T: Any + Send + Sync>(mut self, handle: T) -> ArchiveEntryRecord {
        self.handle = Some(Arc::new(handle));
        self
    }

    /// The backend specific handle, if it is of type `T`.
    pub fn handle<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.handle.as_ref().and_then(|h| h.downcast_ref::<T>())
    }

    /// Last path component, without the trailing slash of directories.
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }
}

impl fmt::Debug for ArchiveEntryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveEntryRecord")
            .field("path", &self.path)
            .field("is_directory", &self.is_directory)
            .field("last_modified", &self.last_modified)
            .field("size", &self.size)
            .field("exact", &self.exact)
            .field("has_handle", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct DateTimeCS {
    year: u16,
    month: u16,
    day: u16,
    hour: u16,
    minute: u16,
    second: u16,
}

impl Default for DateTimeCS {
    fn default() -> Self {
        Self {
            year: 1980,
            month: 1,
            day: 1,
            hour: 0,
            minute: 0,
            second: 0,
        }
    }
}

impl DateTimeCS {
    pub fn from_chrono_datetime<Tz: TimeZone>(datetime: DateTime<Tz>) -> Self {
        Self {
            year: datetime.year().clamp(1980, 2107) as u16,
            month: datetime.month() as u16,
            day: datetime.day() as u16,
            hour: datetime.hour() as u16,
            minute: datetime.minute() as u16,
            second: datetime.second() as u16,
        }
    }

    /// MS-DOS fields are local time.
    pub fn from_utc(datetime: DateTime<Utc>) -> Self {
        Self::from_chrono_datetime(datetime.with_timezone(&Local))
    }

    pub fn from_msdos(datepart: u16, timepart: u16) -> Self {
        let seconds = (timepart & 0b0000000000011111) << 1;
        let minutes = (timepart & 0b0000011111100000) >> 5;
        let hours = (timepart & 0b1111100000000000) >> 11;
        let days = datepart & 0b0000000000011111;
        let months = (datepart & 0b0000000111100000) >> 5;
        let years = (datepart & 0b1111111000000000) >> 9;

        Self {
            year: years + 1980,
            month: months,
            day: days,
            hour: hours,
            minute: minutes,
            second: seconds,
        }
    }

    pub fn to_time(&self) -> chrono::NaiveDateTime {
        let date = NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.day as u32)
            .unwrap_or_default();

        date.and_hms_opt(self.hour as u32, self.minute as u32, self.second as u32)
            .unwrap_or_default()
    }

    /// Interprets the fields as local time.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        Local
            .from_local_datetime(&self.to_time())
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }

    pub fn ms_dos(&self) -> (u16, u16) {
        let date = self.day | (self.month << 5) | self.year.saturating_sub(1980) << 9;
        let time = (self.second / 2) | (self.minute << 5) | self.hour << 11;
        (date, time)
    }
}

impl fmt::Display for DateTimeCS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:}", self.to_time())
    }
}

/// Seconds since the epoch clamped to the signed 32 bit range of the
/// extended timestamp field.
pub fn unix_timestamp_i32(datetime: &DateTime<Utc>) -> i32 {
    datetime.timestamp().clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
