use std::fs::File;
use std::io::{Read, Write};

use arcengine::archiver::{ArchiveOptions, Archiver};
use arcengine::error::ArchiveError;
use arcengine::format::{get_formats, ArchiveFormat};
use arcengine::types::EntryAttributes;

mod common;
use common::{destination, dir, file, init_tracing, read_back, write_archive};

#[test]
fn many_entry_formats_round_trip() {
    init_tracing();
    let content = b"content of b, long enough to be worth compressing";

    for format in get_formats(true) {
        let (_dir, path) = destination("round_trip", format);
        write_archive(
            &path,
            format,
            ArchiveOptions::default(),
            &[dir("a/"), file("a/b.txt", content)],
        );

        let entries = read_back(&path);
        assert_eq!(entries.len(), 2, "{format}");

        let (directory, _) = &entries[0];
        assert_eq!(directory.path, "a/", "{format}");
        assert!(directory.is_directory, "{format}");

        let (record, read) = &entries[1];
        assert_eq!(record.path, "a/b.txt", "{format}");
        assert!(!record.is_directory, "{format}");
        assert_eq!(record.size, Some(content.len() as u64), "{format}");
        assert_eq!(read.as_slice(), content.as_slice(), "{format}");
    }
}

#[test]
fn backslash_directories_are_normalized() {
    for format in get_formats(true) {
        let (_dir, path) = destination("normalized", format);
        write_archive(&path, format, ArchiveOptions::default(), &[dir("a\\b")]);

        let paths: Vec<String> = read_back(&path)
            .into_iter()
            .map(|(record, _)| record.path)
            .collect();
        let last = paths.last().unwrap();
        assert_eq!(last, "a/b/", "{format}");
        assert!(paths.iter().all(|p| !p.contains('\\')), "{format}");
    }
}

#[test]
fn empty_archives_read_back_empty() {
    for format in get_formats(true) {
        let (_dir, path) = destination("empty", format);
        write_archive(&path, format, ArchiveOptions::default(), &[]);
        assert!(read_back(&path).is_empty(), "{format}");
    }
}

#[test]
fn single_entry_formats_refuse_a_second_entry() {
    for format in [ArchiveFormat::GZ, ArchiveFormat::BZ2] {
        let mut archiver = Archiver::new(Vec::new(), format).unwrap();
        // the first stream is never written to
        assert!(archiver
            .create_entry("one.txt", &EntryAttributes::file(None))
            .unwrap()
            .is_some());

        for (path, attributes) in [
            ("two.txt", EntryAttributes::file(Some(3))),
            ("dir/", EntryAttributes::directory()),
        ] {
            let err = archiver.create_entry(path, &attributes).err().unwrap();
            assert!(matches!(err, ArchiveError::InvalidState(_)), "{format}");
        }
        archiver.close().unwrap();
    }
}

#[test]
fn single_entry_formats_read_back() {
    for format in [ArchiveFormat::GZ, ArchiveFormat::BZ2] {
        let (_dir, path) = destination("report.txt", format);
        write_archive(&path, format, ArchiveOptions::default(), &[file("ignored", b"lines")]);

        let entries = read_back(&path);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0.path, "report.txt");
        assert!(!entries[0].0.exact);
        assert_eq!(entries[0].1, b"lines");
    }
}

#[test]
fn format_listing() {
    let all = get_formats(false);
    let many = get_formats(true);
    assert!(many.len() < all.len());
    assert!(many.iter().all(|format| all.contains(format) && format.supports_multiple_entries()));
    assert_eq!(all.iter().filter(|format| format.supports_comment()).count(), 1);
}

#[test]
fn tar_gz_hello_scenario() {
    let (_dir, path) = destination("hello", ArchiveFormat::TAR_GZ);
    let mut archiver = Archiver::create(&path, ArchiveFormat::TAR_GZ).unwrap();
    archiver.create_entry("dir/", &EntryAttributes::directory()).unwrap();
    archiver
        .create_entry("dir/file.txt", &EntryAttributes::file(Some(5)))
        .unwrap()
        .unwrap()
        .write_all(b"hello")
        .unwrap();
    archiver.close().unwrap();

    // decoded with the gzip and tar crates directly
    let decoder = flate2::read::GzDecoder::new(File::open(&path).unwrap());
    let mut archive = tar::Archive::new(decoder);
    let mut seen = Vec::new();
    for entry in archive.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().into_owned();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        seen.push((name, entry.header().entry_type().is_dir(), content));
    }
    assert_eq!(
        seen,
        vec![
            ("dir/".to_owned(), true, String::new()),
            ("dir/file.txt".to_owned(), false, "hello".to_owned()),
        ]
    );
}

#[test]
fn tar_declared_size_is_enforced() {
    let mut archiver = Archiver::new(Vec::new(), ArchiveFormat::TAR).unwrap();
    let stream = archiver
        .create_entry("short.txt", &EntryAttributes::file(Some(10)))
        .unwrap()
        .unwrap();
    stream.write_all(b"abc").unwrap();
    assert!(archiver.close().is_err());
}

#[test]
fn short_tar_entry_still_yields_a_complete_archive() {
    let (_dir, path) = destination("short", ArchiveFormat::TAR_GZ);
    let mut archiver = Archiver::create(&path, ArchiveFormat::TAR_GZ).unwrap();
    archiver
        .create_entry("short.txt", &EntryAttributes::file(Some(4)))
        .unwrap()
        .unwrap()
        .write_all(b"ab")
        .unwrap();
    assert!(archiver.close().is_err());

    let decoder = flate2::read::GzDecoder::new(File::open(&path).unwrap());
    let mut archive = tar::Archive::new(decoder);
    let mut entries = archive.entries().unwrap();
    let mut entry = entries.next().unwrap().unwrap();
    let mut content = Vec::new();
    entry.read_to_end(&mut content).unwrap();
    assert_eq!(content, b"ab\0\0");
    drop(entry);
    assert!(entries.next().is_none());
}

#[test]
fn comment_is_ignored_by_formats_without_one() {
    let mut archiver = Archiver::new(Vec::new(), ArchiveFormat::TAR).unwrap();
    archiver.set_comment("nobody stores this").unwrap();
    archiver.close().unwrap();

    let err = Archiver::new(Vec::new(), ArchiveFormat::ISO)
        .and_then(|mut archiver| {
            archiver.close()?;
            archiver.post_process()
        })
        .unwrap_err();
    assert!(matches!(err, ArchiveError::InvalidState(_)));
}
