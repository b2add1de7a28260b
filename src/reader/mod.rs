//! The read side: an [`ArchiveReader`] lists the entries of a container and
//! opens a byte stream over any one of them.
//!
//! Readers that keep a random access handle open while iterating expose it
//! through [`ArchiveEntryIterator::shared_source`]; entry streams opened with
//! that iterator reuse the handle instead of reopening the container. Closing
//! the iterator releases the handle, and streams still holding it fail from
//! then on.
//!
//!```no_run
//! use arcengine::reader::ReaderRegistry;
//! use std::io::Read;
//!
//! # fn main() -> Result<(), arcengine::error::ArchiveError> {
//! let reader = ReaderRegistry::default().open("photos.zip")?;
//! let mut entries = reader.entry_iterator()?;
//! while let Some(record) = entries.next() {
//!     let record = record?;
//!     if !record.is_directory {
//!         let mut content = Vec::new();
//!         reader
//!             .entry_input_stream(&record, Some(entries.as_ref()))?
//!             .read_to_end(&mut content)?;
//!     }
//! }
//! entries.close()?;
//! # Ok(())
//! # }
//!```

pub mod iso;
pub mod ring_buffer;
pub mod sevenzip;
pub mod signature;
pub mod single;
pub mod tar;
pub mod zip;

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::compression::StreamCompression;
use crate::error::{ArchiveError, Result};
use crate::types::ArchiveEntryRecord;

/// A seekable byte source.
pub trait RandomAccess: Read + Seek + Send {}

impl<T: Read + Seek + Send> RandomAccess for T {}

/// The container a reader works on. Every call to `open_random` yields an
/// independent handle.
pub trait ArchiveSource: Send + Sync {
    /// File name of the container, used for extension dispatch and for the
    /// names of single entry formats.
    fn name(&self) -> &str;

    fn len(&self) -> io::Result<u64>;

    fn open_random(&self) -> io::Result<Box<dyn RandomAccess>>;

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    name: String,
}

impl FileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> FileSource {
        let path = path.as_ref().to_path_buf();
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        FileSource { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ArchiveSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn open_random(&self) -> io::Result<Box<dyn RandomAccess>> {
        Ok(Box::new(File::open(&self.path)?))
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        let modified = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        Some(DateTime::<Utc>::from(modified))
    }
}

/// An in-memory container.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Arc<[u8]>,
    last_modified: Option<DateTime<Utc>>,
}

impl MemorySource {
    pub fn new(name: &str, data: impl Into<Arc<[u8]>>) -> MemorySource {
        MemorySource {
            name: name.to_owned(),
            data: data.into(),
            last_modified: None,
        }
    }

    pub fn modified_at(mut self, last_modified: DateTime<Utc>) -> MemorySource {
        self.last_modified = Some(last_modified);
        self
    }
}

impl ArchiveSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn open_random(&self) -> io::Result<Box<dyn RandomAccess>> {
        Ok(Box::new(io::Cursor::new(self.data.clone())))
    }

    fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }
}

/// Random access handle shared by an iterator and the entry streams opened
/// through it. `None` once the iterator is closed.
pub type SharedSource = Arc<Mutex<Option<Box<dyn RandomAccess>>>>;

pub fn shared(handle: Box<dyn RandomAccess>) -> SharedSource {
    Arc::new(Mutex::new(Some(handle)))
}

/// Runs `f` on the shared handle, failing once it has been released.
pub fn with_handle<T>(
    source: &SharedSource,
    f: impl FnOnce(&mut dyn RandomAccess) -> io::Result<T>,
) -> io::Result<T> {
    let mut guard = source
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "archive handle lock poisoned"))?;
    match guard.as_mut() {
        Some(handle) => f(handle.as_mut()),
        None => Err(io::Error::new(
            io::ErrorKind::Other,
            "the entry iterator owning this stream is closed",
        )),
    }
}

/// Reads `len` bytes starting at `offset` of a shared handle.
pub fn read_at(source: &SharedSource, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    with_handle(source, |handle| {
        handle.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        handle.read_exact(&mut buffer)?;
        Ok(buffer)
    })
}

/// The handle of `iterator` when it has one, a fresh handle otherwise.
pub(crate) fn reuse_or_open(
    source: &dyn ArchiveSource,
    iterator: Option<&dyn ArchiveEntryIterator>,
) -> Result<SharedSource> {
    match iterator.and_then(|iterator| iterator.shared_source()) {
        Some(handle) => Ok(handle),
        None => Ok(shared(source.open_random()?)),
    }
}

/// A window of a shared handle, read with a seek before every read so that
/// several windows can interleave.
pub struct RegionReader {
    source: SharedSource,
    start: u64,
    len: u64,
    position: u64,
}

impl RegionReader {
    pub fn new(source: SharedSource, start: u64, len: u64) -> RegionReader {
        RegionReader {
            source,
            start,
            len,
            position: 0,
        }
    }
}

impl Read for RegionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.len - self.position;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let wanted = (buf.len() as u64).min(remaining) as usize;
        let offset = self.start + self.position;

        let read = with_handle(&self.source, |handle| {
            handle.seek(SeekFrom::Start(offset))?;
            handle.read(&mut buf[..wanted])
        })?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("archive truncated at offset {offset}"),
            ));
        }
        self.position += read as u64;
        Ok(read)
    }
}

/// Entries of one container, in archive order. Not restartable.
pub trait ArchiveEntryIterator: Iterator<Item = Result<ArchiveEntryRecord>> + Send {
    /// Releases the random access handle. Entry streams still using it fail
    /// afterwards.
    fn close(&mut self) -> Result<()>;

    /// The handle entry streams may reuse.
    fn shared_source(&self) -> Option<SharedSource> {
        None
    }
}

/// Iterator over records parsed up front.
pub struct RecordIterator {
    records: std::vec::IntoIter<ArchiveEntryRecord>,
    handle: Option<SharedSource>,
}

impl RecordIterator {
    pub fn new(records: Vec<ArchiveEntryRecord>, handle: Option<SharedSource>) -> RecordIterator {
        RecordIterator {
            records: records.into_iter(),
            handle,
        }
    }
}

impl Iterator for RecordIterator {
    type Item = Result<ArchiveEntryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next().map(Ok)
    }
}

impl ArchiveEntryIterator for RecordIterator {
    fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            let mut guard = handle
                .lock()
                .map_err(|_| ArchiveError::InvalidState("archive handle lock poisoned".to_owned()))?;
            guard.take();
        }
        Ok(())
    }

    fn shared_source(&self) -> Option<SharedSource> {
        self.handle.clone()
    }
}

/// One container format on the read side.
pub trait ArchiveReader: Send + Sync {
    fn format_name(&self) -> &'static str;

    /// Parses the container and lists its entries.
    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>>;

    /// Content of `record`, which must come from this reader. The handle of
    /// `iterator` is reused when it has one.
    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>>;

    /// Every entry, with the iterator closed.
    fn entries(&self) -> Result<Vec<ArchiveEntryRecord>> {
        let mut iterator = self.entry_iterator()?;
        let records = iterator.by_ref().collect::<Result<Vec<_>>>();
        iterator.close()?;
        records
    }
}

/// Builds the reader of one format over a source.
pub type ReaderFactory = fn(Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>>;

const SEVEN_ZIP_MAGIC: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];
const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const BZIP2_MAGIC: &[u8] = b"BZh";
const ZIP_MAGICS: [&[u8]; 2] = [b"PK\x03\x04", b"PK\x05\x06"];
const USTAR_OFFSET: usize = 257;
const USTAR_MAGIC: &[u8] = b"ustar";
const ISO_MAGIC_OFFSET: u64 = 16 * 2048 + 1;
const ISO_MAGIC: &[u8] = b"CD001";

/// Maps file name extensions to reader factories, with signature sniffing
/// for names no extension matches.
pub struct ReaderRegistry {
    factories: Vec<(String, ReaderFactory)>,
}

impl ReaderRegistry {
    pub fn empty() -> ReaderRegistry {
        ReaderRegistry {
            factories: Vec::new(),
        }
    }

    /// Registers `factory` for names ending with `extension` (given with its
    /// leading dot). Later registrations win over earlier ones.
    pub fn register(&mut self, extension: &str, factory: ReaderFactory) {
        let extension = extension.to_ascii_lowercase();
        self.factories.retain(|(known, _)| *known != extension);
        self.factories.push((extension, factory));
    }

    /// The factory of the longest extension ending `name`.
    pub fn factory_for_name(&self, name: &str) -> Option<ReaderFactory> {
        let name = name.to_ascii_lowercase();
        self.factories
            .iter()
            .filter(|(extension, _)| name.len() > extension.len() && name.ends_with(extension.as_str()))
            .max_by_key(|(extension, _)| extension.len())
            .map(|(_, factory)| *factory)
    }

    pub fn reader_for(&self, source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
        if let Some(factory) = self.factory_for_name(source.name()) {
            return factory(source);
        }

        let factory = sniff(source.as_ref())?;
        debug!(name = source.name(), "format detected from signature");
        factory(source)
    }

    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Box<dyn ArchiveReader>> {
        self.reader_for(Arc::new(FileSource::new(path)))
    }
}

impl Default for ReaderRegistry {
    fn default() -> Self {
        let mut registry = ReaderRegistry::empty();
        registry.register(".zip", zip::factory);
        registry.register(".tar", tar::tar_factory);
        registry.register(".tar.gz", tar::tar_gz_factory);
        registry.register(".tgz", tar::tar_gz_factory);
        registry.register(".tar.bz2", tar::tar_bz2_factory);
        registry.register(".tbz2", tar::tar_bz2_factory);
        registry.register(".gz", single::gzip_factory);
        registry.register(".bz2", single::bzip2_factory);
        registry.register(".iso", iso::factory);
        registry.register(".nrg", iso::factory);
        registry.register(".7z", sevenzip::factory);
        registry.register(".cb7", sevenzip::factory);
        registry
    }
}

fn read_prefix(handle: &mut dyn RandomAccess, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    handle.seek(SeekFrom::Start(offset))?;
    let mut buffer = Vec::with_capacity(len);
    handle.take(len as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

fn is_ustar(header: &[u8]) -> bool {
    header.get(USTAR_OFFSET..USTAR_OFFSET + USTAR_MAGIC.len()) == Some(USTAR_MAGIC)
}

/// Whether the decompressed stream starts with a tar header.
fn compressed_tar(source: &dyn ArchiveSource, compression: StreamCompression) -> bool {
    let Ok(handle) = source.open_random() else {
        return false;
    };
    let mut header = Vec::with_capacity(512);
    let read = compression
        .decoder(handle)
        .take(512)
        .read_to_end(&mut header);
    read.is_ok() && is_ustar(&header)
}

/// Picks a factory from the leading bytes of the source.
pub fn sniff(source: &dyn ArchiveSource) -> Result<ReaderFactory> {
    let mut handle = source.open_random()?;
    let head = read_prefix(handle.as_mut(), 0, 512)?;

    if ZIP_MAGICS.iter().any(|magic| head.starts_with(magic)) {
        return Ok(zip::factory);
    }
    if head.starts_with(SEVEN_ZIP_MAGIC) {
        return Ok(sevenzip::factory);
    }
    if head.starts_with(GZIP_MAGIC) {
        return Ok(if compressed_tar(source, StreamCompression::Gzip) {
            tar::tar_gz_factory
        } else {
            single::gzip_factory
        });
    }
    if head.starts_with(BZIP2_MAGIC) {
        return Ok(if compressed_tar(source, StreamCompression::Bzip2) {
            tar::tar_bz2_factory
        } else {
            single::bzip2_factory
        });
    }
    if is_ustar(&head) {
        return Ok(tar::tar_factory);
    }
    if read_prefix(handle.as_mut(), ISO_MAGIC_OFFSET, ISO_MAGIC.len())? == ISO_MAGIC {
        return Ok(iso::factory);
    }

    Err(ArchiveError::UnsupportedFormat(format!(
        "'{}' matches no known extension or signature",
        source.name()
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    fn memory(name: &str, data: &[u8]) -> Arc<dyn ArchiveSource> {
        Arc::new(MemorySource::new(name, data.to_vec()))
    }

    #[test]
    fn test_region_reader_fails_after_close() {
        let handle = shared(Box::new(io::Cursor::new(b"0123456789".to_vec())));
        let mut iterator = RecordIterator::new(Vec::new(), Some(handle.clone()));

        let mut region = RegionReader::new(handle, 2, 4);
        let mut first = [0u8; 2];
        region.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"23");

        iterator.close().unwrap();
        iterator.close().unwrap();
        assert!(region.read(&mut first).is_err());
    }

    #[test]
    fn test_region_reader_stops_at_window_end() {
        let handle = shared(Box::new(io::Cursor::new(b"0123456789".to_vec())));
        let mut content = String::new();
        RegionReader::new(handle, 7, 3).read_to_string(&mut content).unwrap();
        assert_eq!(content, "789");
    }

    fn sniffed(data: &[u8]) -> Result<&'static str> {
        let source = memory("unnamed", data);
        let factory = sniff(source.as_ref())?;
        Ok(factory(source)?.format_name())
    }

    #[test]
    fn test_longest_extension_wins() {
        let registry = ReaderRegistry::default();
        let source = memory("backup.TAR.GZ", b"");
        let factory = registry.factory_for_name(source.name()).unwrap();
        assert_eq!(factory(source).unwrap().format_name(), "Tar/Gzip");

        let source = memory("notes.txt.gz", b"");
        let factory = registry.factory_for_name(source.name()).unwrap();
        assert_eq!(factory(source).unwrap().format_name(), "Gzip");

        assert!(registry.factory_for_name(".zip").is_none());
        assert!(registry.factory_for_name("plain.txt").is_none());
    }

    #[test]
    fn test_sniffing() {
        let empty_zip = b"PK\x05\x06\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";
        assert_eq!(sniffed(empty_zip).unwrap(), "Zip");
        assert_eq!(sniffed(b"7z\xBC\xAF\x27\x1C\0\x04").unwrap(), "7-Zip");

        let mut header = vec![0u8; 512];
        header[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniffed(&header).unwrap(), "Tar");

        assert!(sniffed(b"plain text").is_err());
    }

    #[test]
    fn test_sniffing_tells_tar_gz_from_gz() {
        let mut header = vec![0u8; 1024];
        header[257..262].copy_from_slice(b"ustar");
        let mut encoder = StreamCompression::Gzip.encoder(Vec::new(), Default::default());
        io::Write::write_all(&mut encoder, &header).unwrap();
        assert_eq!(sniffed(&encoder.finish().unwrap()).unwrap(), "Tar/Gzip");

        let mut encoder = StreamCompression::Gzip.encoder(Vec::new(), Default::default());
        io::Write::write_all(&mut encoder, b"just text").unwrap();
        assert_eq!(sniffed(&encoder.finish().unwrap()).unwrap(), "Gzip");
    }
}
