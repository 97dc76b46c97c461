mod common;

use std::time::Duration;

use fluxtap::{
    protocol::dcd::{self, FeedOutcome, MacToDcd},
    sink::RecordKind,
    CancelToken,
    DcdAnalyzer,
    Direction,
    MemoryCapture,
    MemorySink,
    Protocol,
    SliceSource,
    DCD_GROUP_LEN,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_session(source: &mut SliceSource) -> MemorySink {
    let mut capture = MemoryCapture::new();
    let mut sink = MemorySink::new(Protocol::Dcd);
    let mut analyzer = DcdAnalyzer::new(
        source,
        &mut capture,
        &mut sink,
        CancelToken::new(),
        Duration::from_millis(1),
    );
    analyzer.run().unwrap();
    sink
}

/// A host command of `out_groups` groups, flag bit clear, checksum balanced.
fn command_payload(out_groups: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..out_groups * DCD_GROUP_LEN)
        .map(|i| (i as u8).wrapping_mul(29).wrapping_add(3) & 0x7F)
        .collect();
    dcd::balance_checksum(&mut payload);
    payload
}

/// A device reply of `in_groups` groups, flag bit set, checksum balanced.
fn reply_payload(in_groups: usize) -> Vec<u8> {
    let mut payload: Vec<u8> = (0..in_groups * DCD_GROUP_LEN)
        .map(|i| (i as u8).wrapping_mul(17).wrapping_add(1))
        .collect();
    payload[0] |= 0x80;
    dcd::balance_checksum(&mut payload);
    payload
}

#[test]
fn test_frame_reconstruction() {
    init();
    // Two outbound groups: 14 payload bytes, the last one balancing the
    // checksum; the reply is declared as one group.
    let payload = command_payload(2);
    let wire = dcd::encode_host_frame(&payload, 1).unwrap();

    let mut decoder = MacToDcd::new();
    let mut outcomes: Vec<FeedOutcome> = wire.iter().map(|b| decoder.feed(*b).outcome).collect();
    assert_eq!(outcomes.pop(), Some(FeedOutcome::Complete { valid: true }));
    assert!(outcomes.iter().all(|o| *o == FeedOutcome::Hopeful));

    let (in_groups, data) = decoder.result();
    assert_eq!(in_groups, 1);
    assert_eq!(data.len(), 14);
    assert_eq!(data, &payload[..]);
}

#[test]
fn test_frame_reconstruction_detects_single_bit_corruption() {
    init();
    let payload = command_payload(2);
    let mut wire = dcd::encode_host_frame(&payload, 1).unwrap();
    // One bit of one body byte.
    wire[7] ^= 0x02;

    let mut decoder = MacToDcd::new();
    let last = wire.iter().map(|b| decoder.feed(*b).outcome).last().unwrap();
    assert_eq!(last, FeedOutcome::Complete { valid: false });
}

#[test]
fn test_command_reply_session() {
    init();
    let command = command_payload(2);
    let reply = reply_payload(1);

    let mut stream = dcd::encode_host_frame(&command, 1).unwrap();
    stream.extend(dcd::encode_drive_frame(&reply).unwrap());
    let gap = stream.len();
    // A second command in a fresh transaction after the bus goes idle.
    stream.extend(dcd::encode_host_frame(&command, 1).unwrap());

    let mut source = SliceSource::with_idle_gaps(stream, &[gap]);
    let sink = run_session(&mut source);

    assert_eq!(sink.records.len(), 3);
    assert_eq!(sink.records[0].kind, RecordKind::LinkFrame(Direction::Host));
    assert_eq!(sink.records[0].data, command);
    assert_eq!(sink.records[1].kind, RecordKind::LinkFrame(Direction::Device));
    assert_eq!(sink.records[1].data, reply);
    assert_eq!(sink.records[2].provenance.transaction, 1);

    assert_eq!(sink.count_events("00000000 end of transaction"), 1);
    assert_eq!(sink.count_events("DESYNCHRONIZED"), 0);
}

#[test]
fn test_reply_without_command_is_ignored() {
    init();
    // The device decoder is only armed by a completed command declaring the
    // reply length; a bare reply burst desynchronizes the transaction.
    let reply = reply_payload(1);
    let stream = dcd::encode_drive_frame(&reply).unwrap();

    let mut source = SliceSource::new(stream);
    let sink = run_session(&mut source);

    assert!(sink.records.is_empty());
}
