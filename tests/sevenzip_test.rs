use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use arcengine::reader::ReaderRegistry;
use sevenz_rust::{SevenZArchiveEntry, SevenZWriter};

mod common;
use common::{content_of, init_tracing, open};

/// Payload larger than the pipe so the producer has to block.
fn big_payload() -> Vec<u8> {
    (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect()
}

fn fixture(dir: &Path, name: &str) -> PathBuf {
    let content = dir.join("content");
    fs::create_dir_all(content.join("pages")).unwrap();
    fs::write(content.join("pages/big.bin"), big_payload()).unwrap();
    fs::write(content.join("pages/small.txt"), "small page").unwrap();
    fs::write(content.join("cover.txt"), "cover").unwrap();

    let archive = dir.join(name);
    sevenz_rust::compress_to_path(&content, &archive).unwrap();
    archive
}

#[test]
fn every_entry_reads_to_the_end() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path(), "pages.7z");

    let reader = open(&path);
    assert_eq!(reader.format_name(), "7-Zip");
    let records = reader.entries().unwrap();

    for record in records.iter().filter(|record| !record.is_directory) {
        let content = content_of(reader.as_ref(), record);
        assert_eq!(Some(content.len() as u64), record.size, "{}", record.path);
        if record.path.ends_with("big.bin") {
            assert_eq!(content, big_payload());
        }
    }
    assert!(records.iter().any(|record| record.path.ends_with("small.txt")));
}

#[test]
fn comic_book_extension_is_seven_zip() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path(), "issue.CB7");

    let reader = ReaderRegistry::default().open(&path).unwrap();
    assert_eq!(reader.format_name(), "7-Zip");
    let records = reader.entries().unwrap();
    let cover = records.iter().find(|r| r.path.ends_with("cover.txt")).unwrap();
    assert_eq!(content_of(reader.as_ref(), cover), b"cover");
}

#[test]
fn abandoning_a_stream_stops_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path(), "abandoned.7z");
    let reader = open(&path);
    let records = reader.entries().unwrap();
    let big = records.iter().find(|r| r.path.ends_with("big.bin")).unwrap();

    for _ in 0..4 {
        let mut stream = reader.entry_input_stream(big, None).unwrap();
        let mut head = [0u8; 16];
        stream.read_exact(&mut head).unwrap();
        // dropping joins the worker, a blocked producer would hang here
        drop(stream);
    }
}

#[test]
fn corrupted_archive_surfaces_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = fixture(dir.path(), "corrupt.7z");

    // packed streams lie between the 32 byte start header and the header
    // block, entry data first
    let mut bytes = fs::read(&path).unwrap();
    let next_header_offset = u64::from_le_bytes(bytes[12..20].try_into().unwrap()) as usize;
    for byte in &mut bytes[32..32 + next_header_offset / 2] {
        *byte = 0xFF;
    }
    fs::write(&path, &bytes).unwrap();

    let reader = open(&path);
    let records = match reader.entries() {
        Ok(records) => records,
        // the header itself may be packed
        Err(_) => return,
    };

    let mut failures = 0;
    for record in records.iter().filter(|record| !record.is_directory) {
        let mut content = Vec::new();
        let result = reader
            .entry_input_stream(record, None)
            .map_err(std::io::Error::from)
            .and_then(|mut stream| stream.read_to_end(&mut content));
        match result {
            Err(_) => failures += 1,
            Ok(_) if record.path.ends_with("big.bin") => assert_ne!(content, big_payload()),
            Ok(_) => {}
        }
    }
    assert!(failures > 0);
}

#[test]
fn wrong_magic_reports_both_signatures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fake.7z");
    fs::write(&path, b"PK\x03\x04 this is a zip").unwrap();

    let err = open(&path).entry_iterator().err().unwrap();
    let message = err.to_string();
    assert!(message.contains("377abcaf271c"), "{message}");
    assert!(message.contains("504b03042074"), "{message}");
}

/// Bytes that do not compress, so the packed stream stays large.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

#[test]
fn corrupt_neighbour_folder_does_not_affect_an_entry() {
    let dir = tempfile::tempdir().unwrap();
    let small_path = dir.path().join("small.txt");
    let big_path = dir.path().join("big.bin");
    fs::write(&small_path, "nineteen bytes here").unwrap();
    fs::write(&big_path, noise(2 * 1024 * 1024)).unwrap();

    // one folder per pushed entry, packed in push order after the start header
    let path = dir.path().join("neighbours.7z");
    let mut writer = SevenZWriter::create(&path).unwrap();
    let small_packed = writer
        .push_archive_entry(
            SevenZArchiveEntry::from_path(&small_path, "small.txt".to_owned()),
            Some(fs::File::open(&small_path).unwrap()),
        )
        .unwrap()
        .compressed_size as usize;
    let big_packed = writer
        .push_archive_entry(
            SevenZArchiveEntry::from_path(&big_path, "big.bin".to_owned()),
            Some(fs::File::open(&big_path).unwrap()),
        )
        .unwrap()
        .compressed_size as usize;
    writer.finish().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let big_start = 32 + small_packed;
    for byte in &mut bytes[big_start + big_packed / 4..big_start + big_packed / 2] {
        *byte = !*byte;
    }
    fs::write(&path, &bytes).unwrap();

    let reader = open(&path);
    let records = reader.entries().unwrap();
    let small = records.iter().find(|r| r.path == "small.txt").unwrap();
    assert_eq!(content_of(reader.as_ref(), small), b"nineteen bytes here");

    let big = records.iter().find(|r| r.path == "big.bin").unwrap();
    let mut content = Vec::new();
    let result = reader
        .entry_input_stream(big, None)
        .unwrap()
        .read_to_end(&mut content);
    assert!(result.is_err() || content != noise(2 * 1024 * 1024));
}
