use std::fs::File;
use std::io::{Read, Write};

use arcengine::archiver::{ArchiveOptions, Archiver};
use arcengine::compression::CompressionMethod;
use arcengine::format::ArchiveFormat;
use arcengine::types::{EntryAttributes, Permissions};

mod common;
use common::{destination, dir, file, read_back, write_archive};

const CONTENT: &[u8] = b"Lorem ipsum dolor sit amet, consectetur adipiscing elit. \
    Lorem ipsum dolor sit amet, consectetur adipiscing elit.";

fn check_with_zip_crate(method: CompressionMethod) {
    let (_dir, path) = destination(&format!("interop_{}", method.label()), ArchiveFormat::ZIP);
    write_archive(
        &path,
        ArchiveFormat::ZIP,
        ArchiveOptions::default().compression_method(method),
        &[dir("docs"), file("docs\\file1.txt", CONTENT), file("empty.txt", b"")],
    );

    let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(archive.len(), 3);

    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.contains(&"docs/"));
    assert!(names.contains(&"docs/file1.txt"));

    let mut entry = archive.by_name("docs/file1.txt").unwrap();
    let mut content = Vec::new();
    entry.read_to_end(&mut content).unwrap();
    assert_eq!(content, CONTENT, "{}", method.label());
    assert_eq!(entry.size(), CONTENT.len() as u64);
}

#[test]
fn zip_crate_reads_store() {
    check_with_zip_crate(CompressionMethod::Store());
}

#[test]
fn zip_crate_reads_deflate() {
    check_with_zip_crate(CompressionMethod::Deflate());
}

#[test]
fn zip_crate_reads_bzip2() {
    check_with_zip_crate(CompressionMethod::BZip2());
}

#[test]
fn zip_crate_reads_zstd() {
    check_with_zip_crate(CompressionMethod::Zstd());
}

#[test]
fn every_method_reads_back_through_the_engine() {
    for method in [
        CompressionMethod::Store(),
        CompressionMethod::Deflate(),
        CompressionMethod::BZip2(),
        CompressionMethod::Zstd(),
        CompressionMethod::Xz(),
    ] {
        let (_dir, path) = destination("engine", ArchiveFormat::ZIP);
        write_archive(
            &path,
            ArchiveFormat::ZIP,
            ArchiveOptions::default().compression_method(method),
            &[file("a.txt", CONTENT)],
        );
        let entries = read_back(&path);
        assert_eq!(entries[0].1, CONTENT, "{}", method.label());
    }
}

#[test]
fn comment_and_permissions_reach_the_zip_crate() {
    let (_dir, path) = destination("comment", ArchiveFormat::ZIP);
    let mut archiver = Archiver::create(&path, ArchiveFormat::ZIP).unwrap();
    archiver.set_comment("built by the tests").unwrap();

    let attributes = EntryAttributes::file(Some(2)).permissions(Permissions::new(0o600));
    archiver
        .create_entry("secret.txt", &attributes)
        .unwrap()
        .unwrap()
        .write_all(b"ok")
        .unwrap();
    archiver.close().unwrap();

    let mut archive = zip::ZipArchive::new(File::open(&path).unwrap()).unwrap();
    assert_eq!(archive.comment(), b"built by the tests");
    let entry = archive.by_name("secret.txt").unwrap();
    assert_eq!(entry.unix_mode().map(|mode| mode & 0o777), Some(0o600));
}
