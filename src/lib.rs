//! Entry oriented writing and reading of archive containers.
//!
//! The write side is the [`archiver::Archiver`]: one destination, one
//! [`format::ArchiveFormat`], and a "create entry, write bytes, next entry or
//! close" protocol shared by every backend.
//!
//! Format | Entries | Writer | Reader
//! -------|---------|--------|-------
//! Zip    | many    | yes    | yes
//! Tar, Tar/Gzip, Tar/Bzip2 | many | yes | yes
//! ISO9660 (Joliet, Rock Ridge, El Torito) | many | yes | yes, NRG too
//! Gzip, Bzip2 | one | yes | yes
//! 7-Zip  | many    | no     | yes
//!
//! The read side is [`reader::ArchiveReader`], picked by file extension or by
//! the leading signature through [`reader::ReaderRegistry`].
//!
//! ## Example
//!
//!```rust
//! use arcengine::archiver::Archiver;
//! use arcengine::format::ArchiveFormat;
//! use arcengine::reader::ReaderRegistry;
//! use arcengine::types::EntryAttributes;
//! use std::io::{Read, Write};
//!
//! # fn main() -> Result<(), arcengine::error::ArchiveError> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("notes.zip");
//!
//! let mut archiver = Archiver::create(&path, ArchiveFormat::ZIP)?;
//! archiver.create_entry("notes/", &EntryAttributes::directory())?;
//! if let Some(stream) = archiver.create_entry("notes/todo.txt", &EntryAttributes::file(Some(4)))? {
//!     stream.write_all(b"milk")?;
//! }
//! archiver.close()?;
//!
//! let reader = ReaderRegistry::default().open(&path)?;
//! let records = reader.entries()?;
//! assert_eq!(records.len(), 2);
//!
//! let mut content = String::new();
//! reader.entry_input_stream(&records[1], None)?.read_to_string(&mut content)?;
//! assert_eq!(content, "milk");
//! # Ok(())
//! # }
//!```

mod constants;

pub(crate) mod archive_common;
pub mod archiver;
pub mod compression;
pub mod descriptor;
pub mod error;
pub mod format;
pub mod iso;
pub mod reader;
pub mod types;
