use peer::{packet, Harness, ISS, REMOTE};
use toe_core::{AppNotification, Ipv4Address};

mod peer;

/// A segment as large as the buffer takes is placed so that it wraps after
/// each possible number of bytes in turn, then read back across the same
/// wrap.
#[test]
fn data_survives_every_wrap_point() {
    const BUFFER: u32 = 64;
    // Largest segment an empty buffer accepts
    const SEGMENT: u32 = BUFFER - 2;

    let mut harness = Harness::new(peer::config().buffer_size(BUFFER));
    let session = harness.accept(40000, 100);
    let mut seq = 101u32;
    for head in 1..SEGMENT {
        // Move the pointer to `head` bytes before the end of the buffer
        let mut gap = (2 * BUFFER - head - seq % BUFFER) % BUFFER;
        while gap > 0 {
            let filler = gap.min(BUFFER / 2);
            harness.deliver(packet(40000, 80, seq, &vec![0xee; filler as usize], |tcp| {
                tcp.ack(ISS + 1)
            }));
            assert_eq!(harness.engine.pop_notification().map(|n| n.length), Some(filler));
            assert_eq!(harness.read(session, filler), vec![0xee; filler as usize]);
            seq += filler;
            gap -= filler;
        }
        assert_eq!(BUFFER - seq % BUFFER, head);

        let payload: Vec<u8> = (0..SEGMENT).map(|i| (head * 3 + i) as u8).collect();
        harness.deliver(packet(40000, 80, seq, &payload, |tcp| tcp.ack(ISS + 1)));
        assert_eq!(
            harness.engine.pop_notification().map(|n| n.length),
            Some(SEGMENT),
            "head {head}"
        );
        assert_eq!(harness.read(session, SEGMENT), payload, "head {head}");
        seq += SEGMENT;
    }
    let window = harness.engine.rx_window(session).unwrap();
    assert_eq!(window.recvd, seq);
    assert_eq!(window.app_read, seq);
}

/// Chunks of a length coprime to the buffer size start at every offset of
/// the buffer in turn, none of them lined up with the words.
#[test]
fn small_chunks_go_round_the_buffer() {
    const BUFFER: u32 = 64;
    const CHUNK: u32 = 7;

    let mut harness = Harness::new(peer::config().buffer_size(BUFFER));
    let session = harness.accept(40000, 100);
    let mut seq = 101u32;
    for round in 0..BUFFER {
        let payload: Vec<u8> = (0..CHUNK).map(|i| (round * CHUNK + i) as u8).collect();
        harness.deliver(packet(40000, 80, seq, &payload, |tcp| tcp.ack(ISS + 1)));
        assert_eq!(
            harness.engine.pop_notification(),
            Some(AppNotification::data(
                session,
                CHUNK,
                Ipv4Address::new(REMOTE),
                80
            )),
            "round {round}"
        );
        assert_eq!(harness.read(session, CHUNK), payload, "round {round}");
        seq += CHUNK;
    }
    let window = harness.engine.rx_window(session).unwrap();
    assert_eq!(window.recvd, seq);
    assert_eq!(window.app_read, seq);
}

#[test]
fn reads_can_span_several_segments() {
    let mut harness = Harness::new(peer::config().buffer_size(64));
    let session = harness.accept(40000, 100);
    let data: Vec<u8> = (0..60).collect();
    let mut seq = 101u32;
    for chunk in data.chunks(20) {
        harness.deliver(packet(40000, 80, seq, chunk, |tcp| tcp.ack(ISS + 1)));
        seq += chunk.len() as u32;
    }
    let lengths: Vec<u32> = std::iter::from_fn(|| harness.engine.pop_notification())
        .map(|notification| notification.length)
        .collect();
    assert_eq!(lengths, vec![20, 20, 20]);

    // Starts at offset 37 of the buffer and wraps
    assert_eq!(harness.read(session, 50), &data[..50]);
    harness.deliver(packet(40000, 80, seq, &[0xaa; 30], |tcp| tcp.ack(ISS + 1)));
    let mut expected = data[50..].to_vec();
    expected.extend_from_slice(&[0xaa; 30]);
    assert_eq!(harness.read(session, 40), expected);
}

#[test]
fn full_buffer_drops_the_segment() {
    let mut harness = Harness::new(peer::config().buffer_size(64));
    let session = harness.accept(40000, 100);
    harness.deliver(packet(40000, 80, 101, &[1; 40], |tcp| tcp.ack(ISS + 1)));
    harness.engine.pop_notification();

    // 23 bytes are free, a segment must fit with room to spare
    harness.deliver(packet(40000, 80, 141, &[2; 23], |tcp| tcp.ack(ISS + 1)));
    assert!(harness.engine.pop_notification().is_none());
    assert_eq!(harness.engine.rx_window(session).unwrap().recvd, 141);

    harness.deliver(packet(40000, 80, 141, &[3; 22], |tcp| tcp.ack(ISS + 1)));
    assert_eq!(harness.engine.pop_notification().map(|n| n.length), Some(22));
    assert_eq!(harness.engine.rx_window(session).unwrap().recvd, 163);
}
