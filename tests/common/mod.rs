#![allow(dead_code)]

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use arcengine::archiver::{ArchiveOptions, Archiver};
use arcengine::format::ArchiveFormat;
use arcengine::reader::{ArchiveReader, ReaderRegistry};
use arcengine::types::{ArchiveEntryRecord, EntryAttributes};
use tempfile::TempDir;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A scratch directory and a destination path inside it named after the
/// format's canonical extension.
pub fn destination(stem: &str, format: ArchiveFormat) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap_or_else(|error| {
        panic!("creating scratch dir failed, because {:?}", error);
    });
    let path = dir.path().join(format!("{stem}.{}", format.extension()));
    (dir, path)
}

/// Entry to write: a directory when `content` is `None`.
pub struct Sample<'a> {
    pub path: &'a str,
    pub content: Option<&'a [u8]>,
}

pub fn dir(path: &str) -> Sample<'_> {
    Sample {
        path,
        content: None,
    }
}

pub fn file<'a>(path: &'a str, content: &'a [u8]) -> Sample<'a> {
    Sample {
        path,
        content: Some(content),
    }
}

pub fn write_archive(path: &Path, format: ArchiveFormat, options: ArchiveOptions, samples: &[Sample<'_>]) {
    let mut archiver = Archiver::create_with_options(path, format, options).unwrap();
    for sample in samples {
        match sample.content {
            None => {
                let stream = archiver
                    .create_entry(sample.path, &EntryAttributes::directory())
                    .unwrap();
                assert!(stream.is_none());
            }
            Some(content) => {
                let attributes = EntryAttributes::file(Some(content.len() as u64));
                let stream = archiver.create_entry(sample.path, &attributes).unwrap();
                stream
                    .expect("file entries take their bytes from the caller")
                    .write_all(content)
                    .unwrap();
            }
        }
    }
    archiver.close().unwrap();
}

pub fn open(path: &Path) -> Box<dyn ArchiveReader> {
    ReaderRegistry::default().open(path).unwrap()
}

pub fn content_of(reader: &dyn ArchiveReader, record: &ArchiveEntryRecord) -> Vec<u8> {
    let mut content = Vec::new();
    reader
        .entry_input_stream(record, None)
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    content
}

/// Every record with its content, read through the iterator's own handle.
pub fn read_back(path: &Path) -> Vec<(ArchiveEntryRecord, Vec<u8>)> {
    let reader = open(path);
    let mut iterator = reader.entry_iterator().unwrap();
    let mut entries = Vec::new();
    while let Some(record) = iterator.next() {
        let record = record.unwrap();
        let mut content = Vec::new();
        reader
            .entry_input_stream(&record, Some(iterator.as_ref()))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        entries.push((record, content));
    }
    iterator.close().unwrap();
    entries
}
