use super::header::*;
use super::*;

/// Deterministic drop decider so loss patterns are reproducible.
struct LossPattern {
    state: u64,
    /// Drop probability in percent.
    rate: u64,
}

impl LossPattern {
    fn new(seed: u64, rate: u64) -> Self {
        Self { state: seed, rate }
    }

    fn drop(&mut self) -> bool {
        // Numerical Recipes LCG.
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (self.state >> 33) % 100 < self.rate
    }
}

/// Shuttles segments between the two sockets until both egress queues are
/// empty, applying the loss pattern in both directions.
fn exchange(a: &mut PseudoTcp, b: &mut PseudoTcp, loss: &mut LossPattern) {
    loop {
        let mut progressed = false;
        while let Some(segment) = a.poll_transmit() {
            progressed = true;
            if !loss.drop() {
                b.notify_packet(&segment).unwrap();
            }
        }
        while let Some(segment) = b.poll_transmit() {
            progressed = true;
            if !loss.drop() {
                a.notify_packet(&segment).unwrap();
            }
        }
        if !progressed {
            return;
        }
    }
}

fn connect_pair(a: &mut PseudoTcp, b: &mut PseudoTcp) {
    a.connect(0).unwrap();
    let mut no_loss = LossPattern::new(1, 0);
    exchange(a, b, &mut no_loss);
    assert_eq!(a.state(), PtcpState::Established);
    assert_eq!(b.state(), PtcpState::Established);
}

fn drain_events(socket: &mut PseudoTcp) -> Vec<PtcpEvent> {
    let mut events = vec![];
    while let Some(event) = socket.poll_event() {
        events.push(event);
    }
    events
}

/// Runs a one-directional transfer under the given loss pattern and returns
/// the bytes the receiver saw, in order.
fn run_transfer(data: &[u8], loss_rate: u64, seed: u64) -> Vec<u8> {
    let mut a = PseudoTcp::new(1, PtcpConfig::default());
    let mut b = PseudoTcp::new(1, PtcpConfig::default());
    connect_pair(&mut a, &mut b);

    let mut loss = LossPattern::new(seed, loss_rate);
    let mut sent = 0;
    let mut received = vec![];
    let mut buf = vec![0_u8; 4096];

    let mut now: u64 = 0;
    // 10 simulated minutes; far beyond what recovery needs.
    for _ in 0..60_000 {
        now += 10;
        a.notify_clock(now);
        b.notify_clock(now);

        if sent < data.len() {
            match a.send(&data[sent..]) {
                Ok(n) => sent += n,
                Err(Error::ErrWouldBlock) => {}
                Err(err) => panic!("send failed: {err}"),
            }
        }

        exchange(&mut a, &mut b, &mut loss);

        loop {
            match b.recv(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(Error::ErrWouldBlock) => break,
                Err(err) => panic!("recv failed: {err}"),
            }
        }
        exchange(&mut a, &mut b, &mut loss);

        if received.len() == data.len() {
            break;
        }
    }

    received
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_segment_header_roundtrip() -> Result<()> {
    let hdr = SegmentHeader {
        conv: 7,
        seq: 0x01020304,
        ack: 0x0a0b0c0d,
        flags: FLAG_ACK | FLAG_SACK,
        wnd: 8192,
        ts: 123456,
        tsack: 654321,
    };
    let raw = hdr.marshal(b"hello");
    assert_eq!(raw.len(), HEADER_SIZE + 5);

    let (parsed, payload) = SegmentHeader::unmarshal(&raw)?;
    assert_eq!(parsed, hdr);
    assert_eq!(&payload[..], b"hello");

    assert!(SegmentHeader::unmarshal(&raw[..HEADER_SIZE - 1]).is_err());

    Ok(())
}

#[test]
fn test_handshake() {
    let mut a = PseudoTcp::new(42, PtcpConfig::default());
    let mut b = PseudoTcp::new(42, PtcpConfig::default());

    connect_pair(&mut a, &mut b);

    assert!(drain_events(&mut a).contains(&PtcpEvent::Opened));
    assert!(drain_events(&mut b).contains(&PtcpEvent::Opened));
}

#[test]
fn test_handshake_survives_syn_loss() {
    let mut a = PseudoTcp::new(42, PtcpConfig::default());
    let mut b = PseudoTcp::new(42, PtcpConfig::default());

    a.connect(0).unwrap();
    // The SYN evaporates.
    while a.poll_transmit().is_some() {}
    assert_eq!(a.state(), PtcpState::SynSent);

    // The retransmission timer recovers the handshake.
    let mut now = 0;
    let mut no_loss = LossPattern::new(1, 0);
    for _ in 0..2_000 {
        now += 10;
        a.notify_clock(now);
        b.notify_clock(now);
        exchange(&mut a, &mut b, &mut no_loss);
        if a.state() == PtcpState::Established && b.state() == PtcpState::Established {
            return;
        }
    }
    panic!("handshake did not recover from SYN loss");
}

#[test]
fn test_conversation_mismatch_ignored() {
    let mut a = PseudoTcp::new(1, PtcpConfig::default());
    let mut b = PseudoTcp::new(2, PtcpConfig::default());

    a.connect(0).unwrap();
    let syn = a.poll_transmit().unwrap();
    b.notify_packet(&syn).unwrap();

    assert_eq!(b.state(), PtcpState::Listen);
    assert!(b.poll_transmit().is_none());
}

#[test]
fn test_transfer_in_order_no_loss() {
    let data = test_payload(256 * 1024);
    let received = run_transfer(&data, 0, 1);
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);
}

#[test]
fn test_transfer_in_order_30_percent_loss() {
    let data = test_payload(64 * 1024);
    let received = run_transfer(&data, 30, 0xfeed);
    assert_eq!(received.len(), data.len());
    assert_eq!(received, data);
}

#[test]
fn test_transfer_various_seeds_with_loss() {
    let data = test_payload(16 * 1024);
    for seed in [3, 17, 99] {
        let received = run_transfer(&data, 20, seed);
        assert_eq!(received, data, "seed {seed}");
    }
}

#[test]
fn test_delayed_ack() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);
    drain_events(&mut a);
    drain_events(&mut b);

    a.notify_clock(1000);
    b.notify_clock(1000);

    a.send(b"ping").unwrap();
    let segment = a.poll_transmit().unwrap();
    b.notify_packet(&segment).unwrap();

    // A single in-order segment is acked lazily.
    assert!(b.poll_transmit().is_none(), "ack was not delayed");

    b.notify_clock(1000 + ACK_DELAY);
    assert!(b.poll_transmit().is_some(), "delayed ack never fired");
}

#[test]
fn test_every_other_segment_acks_immediately() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);

    a.notify_clock(1000);
    b.notify_clock(1000);

    a.send(b"first").unwrap();
    let first = a.poll_transmit().unwrap();
    a.send(b"second").unwrap();
    let second = a.poll_transmit().unwrap();

    b.notify_packet(&first).unwrap();
    assert!(b.poll_transmit().is_none());
    b.notify_packet(&second).unwrap();
    assert!(b.poll_transmit().is_some(), "second segment must force an ack");
}

#[test]
fn test_rto_retransmission() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);

    a.notify_clock(1000);
    a.send(b"lost segment").unwrap();
    let _lost = a.poll_transmit().unwrap();
    assert!(a.poll_transmit().is_none());

    // Nothing before the initial RTO...
    a.notify_clock(1000 + rto::RTO_INITIAL - 1);
    assert!(a.poll_transmit().is_none());

    // ...and a retransmission after it.
    a.notify_clock(1000 + rto::RTO_INITIAL + 1);
    let rtx = a.poll_transmit().expect("expected retransmission");
    let (hdr, payload) = SegmentHeader::unmarshal(&rtx).unwrap();
    assert_eq!(&payload[..], b"lost segment");
    assert_eq!(hdr.seq, 1); // first byte after the SYN

    b.notify_packet(&rtx).unwrap();
    let mut buf = [0_u8; 64];
    // recv is allowed to be lazy about acks; data must still be there.
    let n = b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"lost segment");
}

#[test]
fn test_fast_retransmit_on_triple_dup_ack() {
    // A small MTU keeps several segments inside the initial window.
    let config = PtcpConfig {
        mtu: HEADER_SIZE + 100,
        ..Default::default()
    };
    let mut a = PseudoTcp::new(9, config.clone());
    let mut b = PseudoTcp::new(9, config);
    connect_pair(&mut a, &mut b);

    a.notify_clock(1000);
    b.notify_clock(1000);

    a.send(&test_payload(400)).unwrap();
    let s1 = a.poll_transmit().unwrap();
    let s2 = a.poll_transmit().unwrap();
    let s3 = a.poll_transmit().unwrap();
    let s4 = a.poll_transmit().unwrap();
    assert!(a.poll_transmit().is_none());
    drop(s1); // first segment is lost

    // Each out-of-order arrival produces an immediate SACK dup-ack.
    for segment in [s2, s3, s4] {
        b.notify_packet(&segment).unwrap();
    }
    let mut dup_acks = vec![];
    while let Some(ack) = b.poll_transmit() {
        dup_acks.push(ack);
    }
    assert_eq!(dup_acks.len(), 3);

    for ack in dup_acks {
        a.notify_packet(&ack).unwrap();
    }

    // The third dup-ack triggers fast retransmit well before the RTO.
    let rtx = a.poll_transmit().expect("expected fast retransmission");
    let (hdr, payload) = SegmentHeader::unmarshal(&rtx).unwrap();
    assert_eq!(hdr.seq, 1);
    assert_eq!(payload.len(), 100);

    b.notify_packet(&rtx).unwrap();
    let mut buf = vec![0_u8; 1024];
    let mut received = vec![];
    loop {
        match b.recv(&mut buf) {
            Ok(n) if n > 0 => received.extend_from_slice(&buf[..n]),
            _ => break,
        }
    }
    assert_eq!(received, test_payload(400));
}

#[test]
fn test_graceful_close_delivers_eof() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);
    drain_events(&mut a);
    drain_events(&mut b);

    a.send(b"goodbye").unwrap();
    a.close(false);

    let mut no_loss = LossPattern::new(1, 0);
    exchange(&mut a, &mut b, &mut no_loss);

    let mut buf = [0_u8; 64];
    let n = b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"goodbye");
    assert_eq!(b.recv(&mut buf).unwrap(), 0, "expected EOF after FIN");

    b.close(false);
    exchange(&mut a, &mut b, &mut no_loss);

    assert_eq!(a.state(), PtcpState::Closed);
    assert_eq!(b.state(), PtcpState::Closed);
    assert!(drain_events(&mut a).contains(&PtcpEvent::Closed));
    assert!(drain_events(&mut b).contains(&PtcpEvent::Closed));
}

#[test]
fn test_forced_close_sends_rst() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);

    a.close(true);
    assert_eq!(a.state(), PtcpState::Closed);

    let rst = a.poll_transmit().unwrap();
    let (hdr, _) = SegmentHeader::unmarshal(&rst).unwrap();
    assert!(hdr.has(FLAG_RST));

    b.notify_packet(&rst).unwrap();
    assert_eq!(b.state(), PtcpState::Closed);
}

#[test]
fn test_send_after_close_fails() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);

    a.close(false);
    assert_eq!(a.send(b"too late"), Err(Error::ErrPseudoTcpClosed));
}

#[test]
fn test_next_clock_contract() {
    let mut a = PseudoTcp::new(9, PtcpConfig::default());

    // Live socket always wants another tick.
    assert!(a.next_clock(0).is_some());

    a.close(true);
    assert_eq!(a.next_clock(0), None);
}

#[test]
fn test_send_buffer_backpressure() {
    let config = PtcpConfig {
        snd_buf_size: 2048,
        ..Default::default()
    };
    let mut a = PseudoTcp::new(9, config);
    let mut b = PseudoTcp::new(9, PtcpConfig::default());
    connect_pair(&mut a, &mut b);
    drain_events(&mut a);

    // Stuff the queue without letting anything out on the wire.
    let big = test_payload(64 * 1024);
    let mut total = 0;
    loop {
        match a.send(&big[total..]) {
            Ok(n) => total += n,
            Err(Error::ErrWouldBlock) => break,
            Err(err) => panic!("unexpected error: {err}"),
        }
        if total == big.len() {
            panic!("send buffer never filled");
        }
    }

    // Deliver everything; acks drain the queue and Writable fires.
    let mut no_loss = LossPattern::new(1, 0);
    let mut now = 0;
    let mut buf = vec![0_u8; 4096];
    for _ in 0..1_000 {
        now += 10;
        a.notify_clock(now);
        b.notify_clock(now);
        exchange(&mut a, &mut b, &mut no_loss);
        while matches!(b.recv(&mut buf), Ok(n) if n > 0) {}
        if drain_events(&mut a).contains(&PtcpEvent::Writable) {
            return;
        }
    }
    panic!("Writable event never fired");
}
