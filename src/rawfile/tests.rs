use super::*;
use crate::codec::FrameReader;
use std::fs::File;
use tempfile::TempDir;

const MAX: u32 = 64 * 1024;

fn record(bucket: &[u8], value: &[u8], timestamp: u64) -> Record {
    Record {
        bucket: bucket.to_vec(),
        value: value.to_vec(),
        timestamp,
        props: Vec::new(),
    }
}

#[test]
fn empty_buffer_produces_no_file() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let result = flush(&layout, &[], 4096, MAX).unwrap();
    assert!(result.is_none());
    assert!(layout.scan_rawfiles().unwrap().is_empty());
}

#[test]
fn flushed_records_read_back_in_insertion_order() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let records = vec![
        record(b"b", b"v2", 2),
        record(b"a", b"v1", 1),
        record(b"b", b"v0", 3),
    ];
    let path = flush(&layout, &records, 4096, MAX).unwrap().unwrap();

    let file = File::open(&path).unwrap();
    let read: Vec<Record> = FrameReader::strict(file, MAX)
        .map(|p| Record::decode_payload(&p.unwrap()).unwrap())
        .collect();
    assert_eq!(read, records);
}

#[test]
fn each_flush_creates_a_distinct_rawfile() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let one = vec![record(b"a", b"v1", 1)];
    let two = vec![record(b"a", b"v2", 2)];
    let p1 = flush(&layout, &one, 4096, MAX).unwrap().unwrap();
    let p2 = flush(&layout, &two, 4096, MAX).unwrap().unwrap();

    assert_ne!(p1, p2);
    assert_eq!(layout.scan_rawfiles().unwrap().len(), 2);
}
