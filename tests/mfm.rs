mod common;

use std::time::Duration;

use fluxtap::{
    protocol::mfm,
    sink::RecordKind,
    CancelToken,
    MemoryCapture,
    MemorySink,
    MfmAnalyzer,
    MfmGeometry,
    Protocol,
    SliceSource,
    MFM_SECTOR_LEN,
};

use crate::common::random_payload;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_session(stream: Vec<u8>) -> MemorySink {
    let mut source = SliceSource::new(stream);
    let mut capture = MemoryCapture::new();
    let mut sink = MemorySink::new(Protocol::Mfm);
    let mut analyzer = MfmAnalyzer::new(
        &mut source,
        &mut capture,
        &mut sink,
        CancelToken::new(),
        Duration::from_millis(1),
    );
    analyzer.run().unwrap();
    sink
}

#[test]
fn test_crc_is_deterministic_and_bit_sensitive() {
    init();
    let geometry = MfmGeometry {
        track: 17,
        side: 1,
        sector: 8,
        size_code: 2,
    };
    let record = mfm::encode_address_mark(geometry);
    assert!(mfm::crc_ok(&record));
    assert_eq!(mfm::encode_address_mark(geometry), record);

    // Any single flipped bit must leave a nonzero CRC register.
    for byte in 0..record.len() {
        for bit in 0..8 {
            let mut corrupt = record.clone();
            corrupt[byte] ^= 1 << bit;
            assert!(!mfm::crc_ok(&corrupt), "byte {} bit {}", byte, bit);
        }
    }
}

#[test]
fn test_end_to_end_track_read() {
    init();
    let geometry = MfmGeometry {
        track: 5,
        side: 0,
        sector: 3,
        size_code: 2,
    };
    let payload = random_payload(MFM_SECTOR_LEN, 11);

    // Gap filler, an index mark, the sector header, then the sector itself.
    let mut stream = vec![0x4E; 40];
    stream.extend(mfm::INDEX_MARK);
    stream.extend(vec![0x4E; 22]);
    stream.extend(mfm::encode_address_mark(geometry));
    stream.extend(vec![0x4E; 12]);
    stream.extend(mfm::encode_data_mark(&payload).unwrap());
    stream.extend(vec![0x4E; 30]);

    let sink = run_session(stream);

    assert_eq!(sink.count_events("IM"), 1);
    assert_eq!(sink.count_events("AM  tk 005  side 0  sec 003  size 512"), 1);
    assert_eq!(sink.records.len(), 1);
    assert_eq!(sink.records[0].kind, RecordKind::MfmSector(geometry));
    assert_eq!(sink.records[0].data, payload);
    assert_eq!(sink.records[0].data.len(), MFM_SECTOR_LEN);
}

#[test]
fn test_corrupt_data_mark_does_not_eat_the_next_sector() {
    init();
    let geometry = MfmGeometry {
        track: 0,
        side: 0,
        sector: 1,
        size_code: 2,
    };
    let good = random_payload(MFM_SECTOR_LEN, 13);
    let mut bad_mark = mfm::encode_data_mark(&good).unwrap();
    bad_mark[100] ^= 0x01;

    let mut stream = mfm::encode_address_mark(geometry);
    stream.extend(bad_mark);
    stream.extend(mfm::encode_data_mark(&good).unwrap());

    let sink = run_session(stream);

    assert_eq!(sink.count_events("DM  BAD CRC"), 1);
    assert_eq!(sink.records.len(), 1);
    assert_eq!(sink.records[0].data, good);
}
