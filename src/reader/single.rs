//! Gzip and Bzip2 files seen as a container of exactly one entry.

use std::io::{BufReader, Read};
use std::sync::Arc;

use super::{ArchiveEntryIterator, ArchiveReader, ArchiveSource, RecordIterator};
use crate::compression::StreamCompression;
use crate::error::{ArchiveError, Result};
use crate::types::ArchiveEntryRecord;

pub fn gzip_factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(SingleEntryReader::new(source, StreamCompression::Gzip)))
}

pub fn bzip2_factory(source: Arc<dyn ArchiveSource>) -> Result<Box<dyn ArchiveReader>> {
    Ok(Box::new(SingleEntryReader::new(source, StreamCompression::Bzip2)))
}

pub struct SingleEntryReader {
    source: Arc<dyn ArchiveSource>,
    compression: StreamCompression,
}

impl SingleEntryReader {
    pub fn new(source: Arc<dyn ArchiveSource>, compression: StreamCompression) -> SingleEntryReader {
        SingleEntryReader {
            source,
            compression,
        }
    }

    /// Suffixes removed from the container name, and what replaces them.
    fn renames(&self) -> &'static [(&'static str, &'static str)] {
        match self.compression {
            StreamCompression::Gzip => &[(".tgz", ".tar"), (".gz", "")],
            StreamCompression::Bzip2 => &[(".tbz2", ".tar"), (".tbz", ".tar"), (".bz2", "")],
            StreamCompression::None => &[],
        }
    }

    /// The container name without its compression extension.
    pub fn entry_name(&self) -> String {
        let name = self.source.name();
        let lower = name.to_ascii_lowercase();

        for (suffix, replacement) in self.renames() {
            if lower.len() > suffix.len() && lower.ends_with(suffix) {
                return format!("{}{replacement}", &name[..name.len() - suffix.len()]);
            }
        }
        name.to_owned()
    }
}

impl ArchiveReader for SingleEntryReader {
    fn format_name(&self) -> &'static str {
        match self.compression {
            StreamCompression::Gzip => "Gzip",
            StreamCompression::Bzip2 => "Bzip2",
            StreamCompression::None => "Raw",
        }
    }

    fn entry_iterator(&self) -> Result<Box<dyn ArchiveEntryIterator>> {
        let mut record = ArchiveEntryRecord::new(self.entry_name(), false);
        record.last_modified = self.source.last_modified();
        record.exact = false;
        Ok(Box::new(RecordIterator::new(vec![record], None)))
    }

    fn entry_input_stream(
        &self,
        record: &ArchiveEntryRecord,
        _iterator: Option<&dyn ArchiveEntryIterator>,
    ) -> Result<Box<dyn Read + Send>> {
        if record.is_directory {
            return Err(ArchiveError::invalid_entry(
                &record.path,
                "single entry containers hold no directory",
            ));
        }
        let handle = self.source.open_random()?;
        Ok(self.compression.decoder(BufReader::new(handle)))
    }
}
