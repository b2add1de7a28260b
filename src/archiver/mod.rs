//! The write side: one [`Archiver`] per destination, driving a format backend
//! through the "create entry, write bytes, next entry or close" protocol.
//!
//!```no_run
//! use arcengine::archiver::Archiver;
//! use arcengine::format::ArchiveFormat;
//! use arcengine::types::EntryAttributes;
//! use std::io::Write;
//!
//! # fn main() -> Result<(), arcengine::error::ArchiveError> {
//! let mut archiver = Archiver::create("out.tar.gz", ArchiveFormat::TAR_GZ)?;
//! archiver.create_entry("dir/", &EntryAttributes::directory())?;
//! if let Some(stream) = archiver.create_entry("dir/file.txt", &EntryAttributes::file(Some(5)))? {
//!     stream.write_all(b"hello")?;
//! }
//! archiver.close()?;
//! # Ok(())
//! # }
//!```

pub mod iso;
mod progress;
pub mod single;
pub mod tar;
mod write_wrapper;
pub mod zip;

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::compression::{CompressionMethod, Level};
use crate::error::{ArchiveError, Result};
use crate::format::ArchiveFormat;
use crate::iso::IsoOptions;
use crate::types::EntryAttributes;

pub use progress::{Progress, ProgressHandle};
pub use write_wrapper::WriteWrapper;

/// Destination every backend writes into.
pub type BoxedSink = Box<dyn Write + Send>;

/// Builds the backend of one format.
pub type ArchiverFactory = fn(BoxedSink, &ArchiveOptions) -> Result<Box<dyn ArchiveBackend>>;

/// Longest volume label derived from a destination file name.
const DERIVED_VOLUME_ID_LEN: usize = 31;

/// Options shared by every backend; each one reads the part it understands.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Zip entry method.
    pub compression_method: CompressionMethod,

    /// Level for Zip entries and for the gzip/bzip2 streams.
    pub compression_level: Level,

    pub iso: IsoOptions,
}

impl ArchiveOptions {
    pub fn compression_method(mut self, method: CompressionMethod) -> ArchiveOptions {
        self.compression_method = method;
        self
    }

    pub fn compression_level(mut self, level: Level) -> ArchiveOptions {
        self.compression_level = level;
        self
    }

    pub fn iso(mut self, iso: IsoOptions) -> ArchiveOptions {
        self.iso = iso;
        self
    }
}

/// An entry after path normalization and permission padding, as handed to
/// a backend.
#[derive(Debug)]
pub struct PreparedEntry<'a> {
    pub path: String,
    pub attributes: &'a EntryAttributes,
    /// Permission bits padded with the file or directory default.
    pub mode: u32,
}

impl<'a> PreparedEntry<'a> {
    pub fn new(path: &str, attributes: &'a EntryAttributes) -> Result<PreparedEntry<'a>> {
        let normalized = normalize_path(path, attributes.is_directory);

        if normalized.trim_end_matches('/').is_empty() {
            return Err(ArchiveError::invalid_entry(path, "empty entry path"));
        }
        if !attributes.is_directory && normalized.ends_with('/') {
            return Err(ArchiveError::invalid_entry(
                path,
                "file entry path ends with a separator",
            ));
        }

        Ok(PreparedEntry {
            path: normalized,
            attributes,
            mode: attributes.permissions.pad(attributes.is_directory),
        })
    }

    pub fn is_directory(&self) -> bool {
        self.attributes.is_directory
    }
}

/// Backslashes become slashes, leading slashes go away and directories end
/// with exactly one slash.
pub fn normalize_path(path: &str, is_directory: bool) -> String {
    let replaced = path.replace('\\', "/");
    let relative = replaced.trim_start_matches('/');

    if is_directory {
        let mut directory = relative.trim_end_matches('/').to_owned();
        directory.push('/');
        directory
    } else {
        relative.to_owned()
    }
}

/// One container format driver.
///
/// The engine guarantees that the calls arrive in a legal order; backends
/// only enforce what is specific to their format.
pub trait ArchiveBackend: Send {
    /// Registers an entry. Returns the stream to write the payload into, if
    /// the entry takes one.
    fn create_entry(&mut self, entry: &PreparedEntry<'_>) -> Result<Option<&mut dyn Write>>;

    fn set_comment(&mut self, _comment: &str) -> Result<()> {
        Ok(())
    }

    fn post_process(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finalizes the open entry and releases the sink.
    fn close(&mut self) -> Result<()>;

    fn progress(&self) -> Progress {
        Progress::default()
    }

    fn progress_handle(&self) -> Option<ProgressHandle> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverState {
    /// Accepting entries, none open.
    Ready,
    /// The last created entry has a live stream.
    EntryOpen,
    /// `post_process` ran, only `close` is allowed.
    Finalized,
    Closed,
}

/// Maps formats to backend factories.
pub struct ArchiverRegistry {
    factories: HashMap<ArchiveFormat, ArchiverFactory>,
}

impl ArchiverRegistry {
    pub fn empty() -> ArchiverRegistry {
        ArchiverRegistry {
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` for `format`, returning the one it replaces.
    pub fn register(
        &mut self,
        format: ArchiveFormat,
        factory: ArchiverFactory,
    ) -> Option<ArchiverFactory> {
        self.factories.insert(format, factory)
    }

    pub fn supports(&self, format: &ArchiveFormat) -> bool {
        self.factories.contains_key(format)
    }

    pub fn archiver<W: Write + Send + 'static>(
        &self,
        sink: W,
        format: ArchiveFormat,
        options: &ArchiveOptions,
    ) -> Result<Archiver> {
        let factory = self
            .factories
            .get(&format)
            .ok_or_else(|| ArchiveError::UnsupportedFormat(format.name().to_owned()))?;

        debug!(format = format.name(), "creating archiver");
        let backend = factory(Box::new(sink), options)?;

        Ok(Archiver {
            format,
            backend,
            state: ArchiverState::Ready,
        })
    }
}

impl Default for ArchiverRegistry {
    fn default() -> Self {
        let mut registry = ArchiverRegistry::empty();
        registry.register(ArchiveFormat::ZIP, zip::factory);
        registry.register(ArchiveFormat::GZ, single::gzip_factory);
        registry.register(ArchiveFormat::BZ2, single::bzip2_factory);
        registry.register(ArchiveFormat::TAR, tar::tar_factory);
        registry.register(ArchiveFormat::TAR_GZ, tar::tar_gz_factory);
        registry.register(ArchiveFormat::TAR_BZ2, tar::tar_bz2_factory);
        registry.register(ArchiveFormat::ISO, iso::factory);
        registry
    }
}

/// Write engine for one destination and one format.
pub struct Archiver {
    format: ArchiveFormat,
    backend: Box<dyn ArchiveBackend>,
    state: ArchiverState,
}

impl Archiver {
    /// Archiver writing `format` into `sink` with default options.
    pub fn new<W: Write + Send + 'static>(sink: W, format: ArchiveFormat) -> Result<Archiver> {
        Self::with_options(sink, format, &ArchiveOptions::default())
    }

    pub fn with_options<W: Write + Send + 'static>(
        sink: W,
        format: ArchiveFormat,
        options: &ArchiveOptions,
    ) -> Result<Archiver> {
        ArchiverRegistry::default().archiver(sink, format, options)
    }

    /// Creates the destination file. An ISO image without an explicit volume
    /// label is named after the file.
    pub fn create<P: AsRef<Path>>(path: P, format: ArchiveFormat) -> Result<Archiver> {
        Self::create_with_options(path, format, ArchiveOptions::default())
    }

    pub fn create_with_options<P: AsRef<Path>>(
        path: P,
        format: ArchiveFormat,
        mut options: ArchiveOptions,
    ) -> Result<Archiver> {
        let path = path.as_ref();

        if format == ArchiveFormat::ISO && options.iso.volume_id.is_none() {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().chars().take(DERIVED_VOLUME_ID_LEN).collect::<String>());
            options.iso.volume_id = stem.filter(|s| !s.is_empty());
        }

        let file = File::create(path)?;
        Self::with_options(BufWriter::new(file), format, &options)
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    pub fn state(&self) -> ArchiverState {
        self.state
    }

    /// Adds an entry. Directories, and files whose content the backend reads
    /// from [`EntryAttributes::source`], return `None`. The returned stream is
    /// only valid until the next call on the archiver.
    pub fn create_entry(
        &mut self,
        path: &str,
        attributes: &EntryAttributes,
    ) -> Result<Option<&mut dyn Write>> {
        match self.state {
            ArchiverState::Finalized | ArchiverState::Closed => {
                return Err(ArchiveError::InvalidState(format!(
                    "cannot add '{path}', the archive is {:?}",
                    self.state
                )))
            }
            ArchiverState::Ready | ArchiverState::EntryOpen => {}
        }

        let entry = PreparedEntry::new(path, attributes)?;
        debug!(
            path = entry.path.as_str(),
            directory = attributes.is_directory,
            size = attributes.size,
            "create entry"
        );

        let stream = self.backend.create_entry(&entry)?;
        self.state = if stream.is_some() {
            ArchiverState::EntryOpen
        } else {
            ArchiverState::Ready
        };
        Ok(stream)
    }

    /// Ignored unless the format stores a comment.
    pub fn set_comment(&mut self, comment: &str) -> Result<()> {
        if !self.format.supports_comment() {
            warn!(format = self.format.name(), "format does not store a comment");
            return Ok(());
        }
        if self.state == ArchiverState::Closed {
            return Err(ArchiveError::InvalidState("archive is closed".to_owned()));
        }
        self.backend.set_comment(comment)
    }

    /// Runs the batch pass of deferred formats. Called once, after the last
    /// entry; `close` runs it if the caller did not.
    pub fn post_process(&mut self) -> Result<()> {
        match self.state {
            ArchiverState::Ready | ArchiverState::EntryOpen => {
                self.state = ArchiverState::Finalized;
                self.backend.post_process()
            }
            ArchiverState::Finalized | ArchiverState::Closed => Err(ArchiveError::InvalidState(
                format!("post processing twice, the archive is {:?}", self.state),
            )),
        }
    }

    /// Finalizes the archive and releases the sink. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ArchiverState::Closed => return Ok(()),
            ArchiverState::Ready | ArchiverState::EntryOpen => self.post_process()?,
            ArchiverState::Finalized => {}
        }
        self.state = ArchiverState::Closed;
        debug!(format = self.format.name(), "closing archiver");
        self.backend.close()
    }

    /// Best effort counters, unknown values are `None`.
    pub fn progress(&self) -> Progress {
        self.backend.progress()
    }

    /// Shareable view of the progress counters, for backends that track them.
    pub fn progress_handle(&self) -> Option<ProgressHandle> {
        self.backend.progress_handle()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("a\\b", true), "a/b/");
        assert_eq!(normalize_path("a\\b\\", true), "a/b/");
        assert_eq!(normalize_path("a//", true), "a/");
        assert_eq!(normalize_path("/a/b.txt", false), "a/b.txt");
        assert_eq!(normalize_path("a\\b.txt", false), "a/b.txt");
    }

    #[test]
    fn test_prepared_entry_rejects_empty_path() {
        let attrs = EntryAttributes::directory();
        assert!(PreparedEntry::new("/", &attrs).is_err());
        assert!(PreparedEntry::new("", &EntryAttributes::file(None)).is_err());
        assert!(PreparedEntry::new("a/", &EntryAttributes::file(None)).is_err());
    }

    #[test]
    fn test_prepared_entry_pads_mode() {
        let attrs = EntryAttributes::directory();
        let entry = PreparedEntry::new("x", &attrs).unwrap();
        assert_eq!(entry.path, "x/");
        assert_eq!(entry.mode, 0o755);
    }

    #[test]
    fn test_state_machine_rejects_entries_after_close() {
        let mut archiver = Archiver::new(Vec::new(), ArchiveFormat::TAR).unwrap();
        assert_eq!(archiver.state(), ArchiverState::Ready);

        archiver.create_entry("a/", &EntryAttributes::directory()).unwrap();
        archiver.close().unwrap();
        assert_eq!(archiver.state(), ArchiverState::Closed);

        let err = archiver
            .create_entry("b/", &EntryAttributes::directory())
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::InvalidState(_)));

        // second close is harmless
        archiver.close().unwrap();
    }

    #[test]
    fn test_post_process_twice_fails() {
        let mut archiver = Archiver::new(Vec::new(), ArchiveFormat::ZIP).unwrap();
        archiver.post_process().unwrap();
        assert!(archiver.post_process().is_err());
        assert!(archiver
            .create_entry("a/", &EntryAttributes::directory())
            .is_err());
        archiver.close().unwrap();
    }

    #[test]
    fn test_unregistered_format() {
        let registry = ArchiverRegistry::empty();
        assert!(!registry.supports(&ArchiveFormat::ZIP));
        let err = registry
            .archiver(Vec::new(), ArchiveFormat::ZIP, &ArchiveOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, ArchiveError::UnsupportedFormat(_)));
    }
}
