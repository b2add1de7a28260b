use std::fmt::Display;
use std::io::{self, Read, Write};

use bzip2::read::MultiBzDecoder;
use bzip2::write::BzEncoder;
use flate2::read::{DeflateDecoder, MultiGzDecoder};
use flate2::write::{DeflateEncoder, GzEncoder};
use flate2::GzBuilder;
use xz2::read::XzDecoder;
use xz2::write::XzEncoder;

use crate::error::{ArchiveError, Result};

pub const STORE: u16 = 0;
pub const DEFALTE: u16 = 8;
pub const BZIP2: u16 = 12;
pub const LZMA: u16 = 14;
pub const ZSTD: u16 = 93;
pub const XZ: u16 = 95;

/// Zip entry compression methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Store(),
    Deflate(),
    BZip2(),
    Lzma(),
    Zstd(),
    Xz(),
}

impl CompressionMethod {
    pub fn zip_code(&self) -> u16 {
        match self {
            CompressionMethod::Store() => STORE,
            CompressionMethod::Deflate() => DEFALTE,
            CompressionMethod::BZip2() => BZIP2,
            CompressionMethod::Lzma() => LZMA,
            CompressionMethod::Zstd() => ZSTD,
            CompressionMethod::Xz() => XZ,
        }
    }

    pub fn zip_version_needed(&self) -> u16 {
        // higher versions matched first
        match self {
            CompressionMethod::Lzma() | CompressionMethod::Zstd() | CompressionMethod::Xz() => 63,
            CompressionMethod::BZip2() => 46,
            _ => 20,
        }
    }

    pub fn from_compression_method(compression_method: u16) -> Result<CompressionMethod> {
        match compression_method {
            STORE => Ok(CompressionMethod::Store()),
            DEFALTE => Ok(CompressionMethod::Deflate()),
            BZIP2 => Ok(CompressionMethod::BZip2()),
            LZMA => Ok(CompressionMethod::Lzma()),
            ZSTD => Ok(CompressionMethod::Zstd()),
            XZ => Ok(CompressionMethod::Xz()),
            _ => Err(ArchiveError::UnsupportedCompressionMethodCode(
                compression_method,
            )),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            CompressionMethod::Store() => "store",
            CompressionMethod::Deflate() => "deflate",
            CompressionMethod::BZip2() => "bzip2",
            CompressionMethod::Lzma() => "lzma",
            CompressionMethod::Zstd() => "zstd",
            CompressionMethod::Xz() => "xz",
        }
    }
}

impl Default for CompressionMethod {
    fn default() -> Self {
        CompressionMethod::Deflate()
    }
}

impl Display for CompressionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Level {
    Fastest,
    Best,
    #[default]
    Default,
    Precise(i32),
    None,
}

impl From<Level> for flate2::Compression {
    fn from(level: Level) -> Self {
        match level {
            Level::Fastest => flate2::Compression::fast(),
            Level::Best => flate2::Compression::best(),
            Level::Default => flate2::Compression::default(),
            Level::Precise(val) => flate2::Compression::new(val.clamp(0, 9) as u32),
            Level::None => flate2::Compression::none(),
        }
    }
}

impl From<Level> for bzip2::Compression {
    fn from(level: Level) -> Self {
        match level {
            Level::Fastest => bzip2::Compression::fast(),
            Level::Best => bzip2::Compression::best(),
            Level::Default => bzip2::Compression::default(),
            Level::Precise(val) => bzip2::Compression::new(val.clamp(1, 9) as u32),
            Level::None => bzip2::Compression::fast(),
        }
    }
}

impl From<Level> for u32 {
    fn from(level: Level) -> Self {
        match level {
            Level::Fastest => 1,
            Level::Best => 9,
            Level::Default => 6,
            Level::Precise(val) => val.clamp(0, 9) as u32,
            Level::None => 0,
        }
    }
}

impl Level {
    fn zstd_level(&self) -> i32 {
        match self {
            Level::Fastest => 1,
            Level::Best => 22,
            Level::Default => zstd::DEFAULT_COMPRESSION_LEVEL,
            Level::None => 0,
            Level::Precise(val) => *val,
        }
    }
}

/// A compressing writer that hands its inner sink back on [`Encoder::finish`].
pub enum Encoder<W: Write> {
    Store(W),
    Deflate(DeflateEncoder<W>),
    BZip2(BzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Xz(XzEncoder<W>),
}

impl<W: Write> Encoder<W> {
    pub fn new(method: CompressionMethod, level: Level, writer: W) -> Result<Encoder<W>> {
        // Level::None downgrades any method to store
        let method = if level == Level::None {
            CompressionMethod::Store()
        } else {
            method
        };

        let encoder = match method {
            CompressionMethod::Store() => Encoder::Store(writer),
            CompressionMethod::Deflate() => Encoder::Deflate(DeflateEncoder::new(writer, level.into())),
            CompressionMethod::BZip2() => Encoder::BZip2(BzEncoder::new(writer, level.into())),
            CompressionMethod::Zstd() => {
                Encoder::Zstd(zstd::stream::write::Encoder::new(writer, level.zstd_level())?)
            }
            CompressionMethod::Xz() => Encoder::Xz(XzEncoder::new(writer, level.into())),
            CompressionMethod::Lzma() => {
                return Err(ArchiveError::UnsupportedCompressionMethod(method))
            }
        };
        Ok(encoder)
    }

    /// The method actually applied, after the `Level::None` downgrade.
    pub fn method(&self) -> CompressionMethod {
        match self {
            Encoder::Store(_) => CompressionMethod::Store(),
            Encoder::Deflate(_) => CompressionMethod::Deflate(),
            Encoder::BZip2(_) => CompressionMethod::BZip2(),
            Encoder::Zstd(_) => CompressionMethod::Zstd(),
            Encoder::Xz(_) => CompressionMethod::Xz(),
        }
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            Encoder::Store(mut w) => {
                w.flush()?;
                Ok(w)
            }
            Encoder::Deflate(e) => e.finish(),
            Encoder::BZip2(e) => e.finish(),
            Encoder::Zstd(e) => e.finish(),
            Encoder::Xz(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Encoder::Store(w) => w.write(buf),
            Encoder::Deflate(e) => e.write(buf),
            Encoder::BZip2(e) => e.write(buf),
            Encoder::Zstd(e) => e.write(buf),
            Encoder::Xz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Encoder::Store(w) => w.flush(),
            Encoder::Deflate(e) => e.flush(),
            Encoder::BZip2(e) => e.flush(),
            Encoder::Zstd(e) => e.flush(),
            Encoder::Xz(e) => e.flush(),
        }
    }
}

/// Compression applied to a whole container stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCompression {
    None,
    Gzip,
    Bzip2,
}

impl StreamCompression {
    pub fn encoder<W: Write>(&self, writer: W, level: Level) -> StreamEncoder<W> {
        match self {
            StreamCompression::None => StreamEncoder::Identity(writer),
            StreamCompression::Gzip => StreamEncoder::gzip(writer, level),
            StreamCompression::Bzip2 => StreamEncoder::bzip2(writer, level),
        }
    }

    /// Concatenated gzip members and bzip2 streams are read as one.
    pub fn decoder<'a, R: Read + Send + 'a>(&self, reader: R) -> Box<dyn Read + Send + 'a> {
        match self {
            StreamCompression::None => Box::new(reader),
            StreamCompression::Gzip => Box::new(MultiGzDecoder::new(reader)),
            StreamCompression::Bzip2 => Box::new(MultiBzDecoder::new(reader)),
        }
    }
}

/// Whole-stream compression layered under Tar or used alone for the single
/// entry formats.
pub enum StreamEncoder<W: Write> {
    Identity(W),
    Gzip(GzEncoder<W>),
    Bzip2(BzEncoder<W>),
}

impl<W: Write> StreamEncoder<W> {
    pub fn gzip(writer: W, level: Level) -> StreamEncoder<W> {
        StreamEncoder::Gzip(GzEncoder::new(writer, level.into()))
    }

    /// Gzip member carrying the original file name and modification time.
    pub fn gzip_named(writer: W, level: Level, file_name: &str, mtime: u32) -> StreamEncoder<W> {
        let builder = GzBuilder::new().filename(file_name.as_bytes()).mtime(mtime);
        StreamEncoder::Gzip(builder.write(writer, level.into()))
    }

    pub fn bzip2(writer: W, level: Level) -> StreamEncoder<W> {
        StreamEncoder::Bzip2(BzEncoder::new(writer, level.into()))
    }

    pub fn finish(self) -> io::Result<W> {
        match self {
            StreamEncoder::Identity(mut w) => {
                w.flush()?;
                Ok(w)
            }
            StreamEncoder::Gzip(e) => e.finish(),
            StreamEncoder::Bzip2(e) => e.finish(),
        }
    }
}

impl<W: Write> Write for StreamEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamEncoder::Identity(w) => w.write(buf),
            StreamEncoder::Gzip(e) => e.write(buf),
            StreamEncoder::Bzip2(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamEncoder::Identity(w) => w.flush(),
            StreamEncoder::Gzip(e) => e.flush(),
            StreamEncoder::Bzip2(e) => e.flush(),
        }
    }
}

/// Wraps `reader` into the decompressor matching `method`.
pub fn decoder<'a, R>(method: CompressionMethod, reader: R) -> Result<Box<dyn Read + Send + 'a>>
where
    R: Read + Send + 'a,
{
    let decoder: Box<dyn Read + Send + 'a> = match method {
        CompressionMethod::Store() => Box::new(reader),
        CompressionMethod::Deflate() => Box::new(DeflateDecoder::new(reader)),
        CompressionMethod::BZip2() => Box::new(MultiBzDecoder::new(reader)),
        CompressionMethod::Zstd() => Box::new(zstd::stream::read::Decoder::new(reader)?),
        CompressionMethod::Xz() => Box::new(XzDecoder::new(reader)),
        CompressionMethod::Lzma() => return Err(ArchiveError::UnsupportedCompressionMethod(method)),
    };
    Ok(decoder)
}
