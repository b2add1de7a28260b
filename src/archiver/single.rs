//! Gzip and Bzip2 hold exactly one unnamed payload: the first entry gets the
//! compressed sink, every later one is refused.

use std::io::Write;

use tracing::debug;

use super::{ArchiveBackend, ArchiveOptions, BoxedSink, PreparedEntry};
use crate::compression::{Level, StreamCompression, StreamEncoder};
use crate::error::{ArchiveError, Result};
use crate::types::unix_timestamp_i32;

pub fn gzip_factory(sink: BoxedSink, options: &ArchiveOptions) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(SingleEntryArchiver::new(
        sink,
        StreamCompression::Gzip,
        options.compression_level,
    )))
}

pub fn bzip2_factory(
    sink: BoxedSink,
    options: &ArchiveOptions,
) -> Result<Box<dyn ArchiveBackend>> {
    Ok(Box::new(SingleEntryArchiver::new(
        sink,
        StreamCompression::Bzip2,
        options.compression_level,
    )))
}

enum SingleSink<W: Write> {
    Fresh(W),
    Open(StreamEncoder<W>),
    Closed,
}

pub struct SingleEntryArchiver<W: Write> {
    sink: SingleSink<W>,
    compression: StreamCompression,
    level: Level,
}

impl<W: Write> SingleEntryArchiver<W> {
    pub fn new(sink: W, compression: StreamCompression, level: Level) -> SingleEntryArchiver<W> {
        SingleEntryArchiver {
            sink: SingleSink::Fresh(sink),
            compression,
            level,
        }
    }

    fn encoder(&self, sink: W, entry: Option<&PreparedEntry<'_>>) -> StreamEncoder<W> {
        match (self.compression, entry) {
            (StreamCompression::Gzip, Some(entry)) => {
                // the header field is NUL terminated
                let name: String = entry
                    .path
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .filter(|c| *c != '\0')
                    .collect();
                let mtime = unix_timestamp_i32(&entry.attributes.last_modified).max(0) as u32;
                StreamEncoder::gzip_named(sink, self.level, &name, mtime)
            }
            (compression, _) => compression.encoder(sink, self.level),
        }
    }
}

impl<W: Write + Send> ArchiveBackend for SingleEntryArchiver<W> {
    fn create_entry(&mut self, entry: &PreparedEntry<'_>) -> Result<Option<&mut dyn Write>> {
        let sink = match std::mem::replace(&mut self.sink, SingleSink::Closed) {
            SingleSink::Fresh(sink) => sink,
            previous => {
                self.sink = previous;
                return Err(ArchiveError::InvalidState(format!(
                    "cannot add '{}', the container holds a single entry",
                    entry.path
                )));
            }
        };

        debug!(path = entry.path.as_str(), "single entry opened");
        self.sink = SingleSink::Open(self.encoder(sink, Some(entry)));
        match &mut self.sink {
            SingleSink::Open(encoder) => Ok(Some(encoder)),
            _ => Err(ArchiveError::InvalidState("entry stream missing".to_owned())),
        }
    }

    fn close(&mut self) -> Result<()> {
        let encoder = match std::mem::replace(&mut self.sink, SingleSink::Closed) {
            SingleSink::Fresh(sink) => self.encoder(sink, None),
            SingleSink::Open(encoder) => encoder,
            SingleSink::Closed => {
                return Err(ArchiveError::InvalidState("archive is closed".to_owned()))
            }
        };

        let mut inner = encoder.finish()?;
        inner.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::types::EntryAttributes;

    #[test]
    fn test_second_entry_fails_even_unwritten() {
        let mut archive = SingleEntryArchiver::new(Vec::new(), StreamCompression::Gzip, Level::Default);
        let attrs = EntryAttributes::file(None);

        let first = PreparedEntry::new("a.txt", &attrs).unwrap();
        assert!(archive.create_entry(&first).unwrap().is_some());

        let second = PreparedEntry::new("b.txt", &attrs).unwrap();
        assert!(archive.create_entry(&second).is_err());
        let dir = EntryAttributes::directory();
        let third = PreparedEntry::new("c", &dir).unwrap();
        assert!(archive.create_entry(&third).is_err());
    }

    #[test]
    fn test_gzip_carries_file_name() {
        let mut bytes = Vec::new();
        {
            let mut archive =
                SingleEntryArchiver::new(&mut bytes, StreamCompression::Gzip, Level::Best);
            let attrs = EntryAttributes::file(Some(5));
            let entry = PreparedEntry::new("dir/notes.txt", &attrs).unwrap();
            archive
                .create_entry(&entry)
                .unwrap()
                .unwrap()
                .write_all(b"hello")
                .unwrap();
            archive.close().unwrap();
        }

        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut content = String::new();
        decoder.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");
        assert_eq!(
            decoder.header().and_then(|h| h.filename()),
            Some(&b"notes.txt"[..])
        );
    }

    #[test]
    fn test_close_without_entry_writes_empty_stream() {
        let mut bytes = Vec::new();
        {
            let mut archive =
                SingleEntryArchiver::new(&mut bytes, StreamCompression::Bzip2, Level::Default);
            archive.close().unwrap();
        }
        assert_eq!(&bytes[0..3], b"BZh");

        let mut content = Vec::new();
        bzip2::read::BzDecoder::new(bytes.as_slice())
            .read_to_end(&mut content)
            .unwrap();
        assert!(content.is_empty());
    }
}
