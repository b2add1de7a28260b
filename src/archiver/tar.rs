//! Tar writer, optionally wrapped in gzip or bzip2.
//!
//! Paths longer than the 100 byte name field are preceded by a GNU
//! `././@LongLink` entry. A file with a known size is streamed straight to
//! the sink and must match that size; a file of unknown size is spooled to
//! a temporary file until the next entry so its header can carry the size.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tar::{EntryType, Header};
use tracing::debug;

use super::{ArchiveBackend, ArchiveOptions, BoxedSink, PreparedEntry};
use crate::compression::{Level, StreamCompression, StreamEncoder};
use crate::error::{ArchiveError, Result};

const BLOCK_SIZE: u64 = 512;
const NAME_FIELD_LEN: usize = 100;
const GNU_LONG_LINK: &[u8] = b"././@LongLink";

pub fn tar_factory(sink: BoxedSink, options: &ArchiveOptions) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(TarArchiver::new(
        sink,
        StreamCompression::None,
        options.compression_level,
    )))
}

pub fn tar_gz_factory(
    sink: BoxedSink,
    options: &ArchiveOptions,
) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(TarArchiver::new(
        sink,
        StreamCompression::Gzip,
        options.compression_level,
    )))
}

pub fn tar_bz2_factory(
    sink: BoxedSink,
    options: &ArchiveOptions,
) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(TarArchiver::new(
        sink,
        StreamCompression::Bzip2,
        options.compression_level,
    )))
}

fn padding(len: u64) -> usize {
    ((BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE) as usize
}

/// Header blocks for one entry, GNU long name block included when needed.
fn build_headers(entry: &PreparedEntry<'_>, size: u64) -> io::Result<Vec<u8>> {
    let name = entry.path.as_bytes();
    let mut blocks = Vec::with_capacity(3 * BLOCK_SIZE as usize);

    if name.len() > NAME_FIELD_LEN {
        let mut long_link = Header::new_gnu();
        long_link.as_old_mut().name[..GNU_LONG_LINK.len()].copy_from_slice(GNU_LONG_LINK);
        long_link.set_entry_type(EntryType::GNULongName);
        long_link.set_mode(0o644);
        long_link.set_mtime(0);
        long_link.set_size(name.len() as u64 + 1);
        long_link.set_cksum();

        blocks.extend_from_slice(long_link.as_bytes());
        blocks.extend_from_slice(name);
        blocks.push(0);
        blocks.resize(blocks.len() + padding(name.len() as u64 + 1), 0);
    }

    let mut header = Header::new_gnu();
    let kept = name.len().min(NAME_FIELD_LEN);
    header.as_old_mut().name[..kept].copy_from_slice(&name[..kept]);
    header.set_entry_type(if entry.is_directory() {
        EntryType::Directory
    } else {
        EntryType::Regular
    });
    header.set_mode(entry.mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_size(size);
    header.set_mtime(entry.attributes.last_modified.timestamp().max(0) as u64);
    header.set_cksum();
    blocks.extend_from_slice(header.as_bytes());

    Ok(blocks)
}

/// File entry with a declared size, written through to the sink.
struct SizedEntry<W: Write> {
    sink: StreamEncoder<W>,
    path: String,
    declared: u64,
    written: u64,
}

impl<W: Write> Write for SizedEntry<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.declared - self.written;
        if buf.len() as u64 > remaining {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                ArchiveError::invalid_entry(
                    &self.path,
                    format!("more than the declared {} bytes written", self.declared),
                ),
            ));
        }
        let written = self.sink.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// File entry of unknown size, buffered in a temporary file.
struct SpooledEntry<W: Write> {
    sink: StreamEncoder<W>,
    spool: File,
    headers_template: Box<dyn Fn(u64) -> io::Result<Vec<u8>> + Send>,
}

impl<W: Write> Write for SpooledEntry<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.spool.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.spool.flush()
    }
}

enum TarSink<W: Write> {
    Idle(StreamEncoder<W>),
    Sized(SizedEntry<W>),
    Spooled(SpooledEntry<W>),
    Closed,
}

pub struct TarArchiver<W: Write> {
    sink: TarSink<W>,
    entries: u64,
}

impl<W: Write> TarArchiver<W> {
    pub fn new(sink: W, compression: StreamCompression, level: Level) -> TarArchiver<W> {
        TarArchiver {
            sink: TarSink::Idle(compression.encoder(sink, level)),
            entries: 0,
        }
    }

    /// End of archive blocks, then the compressor trailer.
    fn finalize(&self, mut sink: StreamEncoder<W>) -> Result<()> {
        sink.write_all(&[0u8; 2 * BLOCK_SIZE as usize])?;
        let mut inner = sink.finish()?;
        inner.flush()?;

        debug!(entries = self.entries, "tar archive finalized");
        Ok(())
    }

    /// Completes the open entry. A short sized entry is zero filled and
    /// reported, the sink stays idle for the next call.
    fn finish_entry(&mut self) -> Result<StreamEncoder<W>> {
        match std::mem::replace(&mut self.sink, TarSink::Closed) {
            TarSink::Idle(sink) => Ok(sink),
            TarSink::Sized(entry) => {
                let SizedEntry {
                    mut sink,
                    path,
                    declared,
                    written,
                } = entry;
                if written != declared {
                    // the header already promised `declared` bytes, zero fill
                    // so the archive stays readable
                    io::copy(&mut io::repeat(0).take(declared - written), &mut sink)?;
                    sink.write_all(&[0u8; BLOCK_SIZE as usize][..padding(declared)])?;
                    self.sink = TarSink::Idle(sink);
                    return Err(ArchiveError::invalid_entry(
                        &path,
                        format!("{written} bytes written, {declared} declared"),
                    ));
                }
                sink.write_all(&[0u8; BLOCK_SIZE as usize][..padding(written)])?;
                Ok(sink)
            }
            TarSink::Spooled(entry) => {
                let SpooledEntry {
                    mut sink,
                    mut spool,
                    headers_template,
                } = entry;
                let size = spool.seek(SeekFrom::End(0))?;
                spool.seek(SeekFrom::Start(0))?;

                sink.write_all(&headers_template(size)?)?;
                let copied = io::copy(&mut spool, &mut sink)?;
                sink.write_all(&[0u8; BLOCK_SIZE as usize][..padding(copied)])?;
                Ok(sink)
            }
            TarSink::Closed => Err(ArchiveError::InvalidState("tar archive is closed".to_owned())),
        }
    }
}

impl<W: Write + Send> ArchiveBackend for TarArchiver<W> {
    fn create_entry(&mut self, entry: &PreparedEntry<'_>) -> Result<Option<&mut dyn Write>> {
        let mut sink = self.finish_entry()?;
        self.entries += 1;

        match entry.attributes.declared_size() {
            _ if entry.is_directory() => {
                sink.write_all(&build_headers(entry, 0)?)?;
                self.sink = TarSink::Idle(sink);
                return Ok(None);
            }
            Some(declared) => {
                sink.write_all(&build_headers(entry, declared)?)?;
                self.sink = TarSink::Sized(SizedEntry {
                    sink,
                    path: entry.path.clone(),
                    declared,
                    written: 0,
                });
            }
            None => {
                let spool = match tempfile::tempfile() {
                    Ok(spool) => spool,
                    Err(e) => {
                        self.sink = TarSink::Idle(sink);
                        return Err(e.into());
                    }
                };
                let headers = build_headers(entry, 0)?;
                self.sink = TarSink::Spooled(SpooledEntry {
                    sink,
                    spool,
                    headers_template: Box::new(move |size| {
                        let mut headers = headers.clone();
                        resize_last_header(&mut headers, size);
                        Ok(headers)
                    }),
                });
            }
        }

        match &mut self.sink {
            TarSink::Sized(writer) => Ok(Some(writer)),
            TarSink::Spooled(writer) => Ok(Some(writer)),
            _ => Err(ArchiveError::InvalidState("entry stream missing".to_owned())),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.finish_entry() {
            Ok(sink) => self.finalize(sink),
            Err(error) => {
                // a short entry leaves the sink usable, the trailer is still due
                if let TarSink::Idle(sink) = std::mem::replace(&mut self.sink, TarSink::Closed) {
                    self.finalize(sink)?;
                }
                Err(error)
            }
        }
    }
}

/// Rewrites the size of the last header block and its checksum.
fn resize_last_header(blocks: &mut [u8], size: u64) {
    let start = blocks.len() - BLOCK_SIZE as usize;
    let mut header = Header::new_old();
    header.as_mut_bytes().copy_from_slice(&blocks[start..]);
    header.set_size(size);
    header.set_cksum();
    blocks[start..].copy_from_slice(header.as_bytes());
}
