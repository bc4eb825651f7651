use super::*;
use crate::layout::RootLayout;
use crate::rawfile;
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

/// Writes one rawfile per record batch and returns the paths.
fn write_rawfiles(layout: &RootLayout, batches: &[Vec<Record>]) -> Vec<PathBuf> {
    batches
        .iter()
        .map(|batch| rawfile::flush(layout, batch, 4096, MAX).unwrap().unwrap())
        .collect()
}

fn read_sorted(path: &Path) -> Vec<Record> {
    let file = File::open(path).unwrap();
    FrameReader::strict(BufReader::new(file), MAX)
        .map(|p| Record::decode_payload(&p.unwrap()).unwrap())
        .collect()
}

#[test]
fn sort_produces_total_order_across_inputs() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let inputs = write_rawfiles(
        &layout,
        &[
            vec![record(b"b", b"v2", 4), record(b"a", b"v9", 1)],
            vec![record(b"a", b"v1", 2), record(b"b", b"v1", 3)],
            vec![record(b"a", b"v5", 5)],
        ],
    );
    let output = dir.path().join("idx.rawmerged");
    let count = sort(&inputs, &output, MAX, 4096).unwrap();
    assert_eq!(count, 5);

    let sorted = read_sorted(&output);
    let mut expected = sorted.clone();
    expected.sort_unstable();
    assert_eq!(sorted, expected);
    assert_eq!(sorted[0].bucket, b"a");
    assert_eq!(sorted[4].bucket, b"b");
}

#[test]
fn sort_tolerates_truncated_rawfile_tail() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let inputs = write_rawfiles(
        &layout,
        &[vec![record(b"a", b"v1", 1), record(b"a", b"v2", 2)]],
    );
    // Chop into the last frame, as a crashed flush would.
    let bytes = std::fs::read(&inputs[0]).unwrap();
    std::fs::write(&inputs[0], &bytes[..bytes.len() - 3]).unwrap();

    let output = dir.path().join("idx.rawmerged");
    let count = sort(&inputs, &output, MAX, 4096).unwrap();
    assert_eq!(count, 1);
    assert_eq!(read_sorted(&output)[0].value, b"v1");
}

#[test]
fn empty_input_set_yields_empty_output() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("idx.rawmerged");

    let count = sort(&[], &output, MAX, 4096).unwrap();
    assert_eq!(count, 0);
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);
}

#[test]
fn merge_stream_interleaves_sorted_files() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    // Two pre-sorted files with interleaving keys.
    let first = vec![
        record(b"a", b"v1", 1),
        record(b"b", b"v1", 2),
        record(b"d", b"v1", 3),
    ];
    let second = vec![record(b"a", b"v2", 4), record(b"c", b"v1", 5)];

    let f1 = layout.fresh_rawfile();
    let f2 = layout.fresh_rawfile();
    for (path, records) in [(&f1, &first), (&f2, &second)] {
        let mut sorted = records.to_vec();
        sorted.sort_unstable();
        let tmp = rawfile::flush(&layout, &sorted, 4096, MAX).unwrap().unwrap();
        std::fs::rename(tmp, path).unwrap();
    }

    let merged: Vec<Record> = MergeStream::open(&[f1, f2], MAX)
        .unwrap()
        .map(|item| item.unwrap().0)
        .collect();

    let buckets: Vec<&[u8]> = merged.iter().map(|r| r.bucket.as_slice()).collect();
    assert_eq!(
        buckets,
        vec![b"a".as_slice(), b"a", b"b", b"c", b"d"]
    );

    let mut expected = merged.clone();
    expected.sort_unstable();
    assert_eq!(merged, expected);
}

#[test]
fn merge_stream_payloads_match_records() {
    let dir = TempDir::new().unwrap();
    let layout = RootLayout::new(dir.path().join("idx")).unwrap();

    let mut records = vec![record(b"b", b"v1", 1), record(b"a", b"v1", 2)];
    records.sort_unstable();
    let path = rawfile::flush(&layout, &records, 4096, MAX).unwrap().unwrap();

    for item in MergeStream::open(&[path], MAX).unwrap() {
        let (record, payload) = item.unwrap();
        assert_eq!(record.encode_payload().unwrap(), payload);
    }
}

#[test]
fn merge_stream_of_nothing_is_empty() {
    let stream = MergeStream::open(&[], MAX).unwrap();
    assert_eq!(stream.count(), 0);
}
