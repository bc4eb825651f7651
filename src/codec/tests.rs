use super::*;

const MAX: u32 = 1024;

fn record(bucket: &[u8], value: &[u8], timestamp: u64) -> Record {
    Record {
        bucket: bucket.to_vec(),
        value: value.to_vec(),
        timestamp,
        props: Vec::new(),
    }
}

#[test]
fn payload_round_trip() {
    let original = Record {
        bucket: b"idx/field/term".to_vec(),
        value: b"doc-42".to_vec(),
        timestamp: 1_234_567_890,
        props: b"\x01\x02\x03".to_vec(),
    };

    let payload = original.encode_payload().unwrap();
    let decoded = Record::decode_payload(&payload).unwrap();
    assert_eq!(decoded, original);
}

#[test]
fn frame_round_trip() {
    let payloads: Vec<Vec<u8>> = vec![
        b"a".to_vec(),
        b"hello world".to_vec(),
        vec![0xFF; MAX as usize],
    ];

    let mut buf = Vec::new();
    for p in &payloads {
        let written = write_frame(&mut buf, p, MAX).unwrap();
        assert_eq!(written, (FRAME_PREFIX_SIZE + p.len()) as u64);
    }

    let read: Vec<Vec<u8>> = FrameReader::strict(buf.as_slice(), MAX)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read, payloads);
}

#[test]
fn frame_prefix_is_big_endian() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"abc", MAX).unwrap();
    assert_eq!(&buf[..FRAME_PREFIX_SIZE], &[0, 0, 0, 3]);
    assert_eq!(&buf[FRAME_PREFIX_SIZE..], b"abc");
}

#[test]
fn empty_payload_rejected_on_write() {
    let mut buf = Vec::new();
    assert!(matches!(
        write_frame(&mut buf, b"", MAX),
        Err(CodecError::EmptyFrame)
    ));
}

#[test]
fn zero_size_frame_rejected_on_read() {
    let buf = vec![0, 0, 0, 0];
    let mut reader = FrameReader::strict(buf.as_slice(), MAX);
    assert!(matches!(reader.next(), Some(Err(CodecError::EmptyFrame))));
    assert!(reader.next().is_none());
}

#[test]
fn oversized_frame_rejected_both_ways() {
    let mut buf = Vec::new();
    assert!(matches!(
        write_frame(&mut buf, &vec![0u8; (MAX + 1) as usize], MAX),
        Err(CodecError::FrameTooLarge { .. })
    ));

    // A declared size above the limit is rejected before allocation.
    let mut raw = (MAX + 1).to_be_bytes().to_vec();
    raw.extend_from_slice(&[0u8; 8]);
    let mut reader = FrameReader::tolerant(raw.as_slice(), MAX);
    assert!(matches!(
        reader.next(),
        Some(Err(CodecError::FrameTooLarge { .. }))
    ));
}

#[test]
fn truncated_tail_tolerant_ends_stream() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"complete", MAX).unwrap();
    write_frame(&mut buf, b"cut-short", MAX).unwrap();
    buf.truncate(buf.len() - 4); // cut into the second payload

    let read: Vec<Vec<u8>> = FrameReader::tolerant(buf.as_slice(), MAX)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(read, vec![b"complete".to_vec()]);
}

#[test]
fn truncated_tail_strict_is_corruption() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"complete", MAX).unwrap();
    write_frame(&mut buf, b"cut-short", MAX).unwrap();
    buf.truncate(buf.len() - 4);

    let results: Vec<_> = FrameReader::strict(buf.as_slice(), MAX).collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().unwrap(), &b"complete".to_vec());
    assert!(matches!(results[1], Err(CodecError::TruncatedFrame)));
}

#[test]
fn truncated_prefix_follows_mode() {
    let mut buf = Vec::new();
    write_frame(&mut buf, b"ok", MAX).unwrap();
    buf.extend_from_slice(&[0, 0]); // half a length prefix

    let tolerant: Vec<Vec<u8>> = FrameReader::tolerant(buf.as_slice(), MAX)
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(tolerant, vec![b"ok".to_vec()]);

    let strict: Vec<_> = FrameReader::strict(buf.as_slice(), MAX).collect();
    assert!(matches!(strict[1], Err(CodecError::TruncatedFrame)));
}

#[test]
fn order_groups_buckets_then_values() {
    let mut records = vec![
        record(b"b", b"v1", 5),
        record(b"a", b"v2", 1),
        record(b"b", b"v0", 9),
        record(b"a", b"v2", 0),
        record(b"a", b"v1", 3),
    ];
    records.sort_unstable();

    let keys: Vec<(&[u8], &[u8], u64)> = records
        .iter()
        .map(|r| (r.bucket.as_slice(), r.value.as_slice(), r.timestamp))
        .collect();
    assert_eq!(
        keys,
        vec![
            (b"a".as_slice(), b"v1".as_slice(), 3),
            (b"a".as_slice(), b"v2".as_slice(), 0),
            (b"a".as_slice(), b"v2".as_slice(), 1),
            (b"b".as_slice(), b"v0".as_slice(), 9),
            (b"b".as_slice(), b"v1".as_slice(), 5),
        ]
    );
}
