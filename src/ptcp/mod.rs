#[cfg(test)]
mod ptcp_test;

pub(crate) mod header;
pub(crate) mod rto;

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;

use crate::error::*;
use header::*;
use rto::*;

/// Segments never exceed this on the wire, header included.
pub(crate) const PTCP_MTU: usize = 1400;
pub(crate) const DEFAULT_MSS: usize = PTCP_MTU - HEADER_SIZE;

pub(crate) const DEFAULT_SND_BUF_SIZE: usize = 1024 * 1024;
// The advertised window is a u16, so a larger receive buffer buys nothing.
pub(crate) const DEFAULT_RCV_BUF_SIZE: usize = 65535;

/// Delayed-ACK holdoff.
pub(crate) const ACK_DELAY: u64 = 200; // msec
/// An ACK is forced every this many in-order segments.
const ACK_EVERY_N_SEGMENTS: u32 = 2;

/// Consecutive retransmission failures before the socket gives up.
const MAX_RTX_FAILURES: u32 = 30;

/// Clock requested when nothing else is pending; keeps the driving timer
/// registered without busy ticking.
const IDLE_CLOCK: u64 = 4000; // msec

fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

fn seq_lte(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// The lifecycle of the socket.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PtcpState {
    /// Waiting for the peer's SYN.
    Listen,
    /// Our SYN is in flight.
    SynSent,
    /// The peer's SYN arrived, our SYN|ACK is in flight.
    SynReceived,
    /// Both directions are open.
    Established,
    /// Our FIN was sent, draining acknowledgments.
    FinWait,
    /// Terminal.
    Closed,
}

/// Edge-triggered notifications for the orchestrator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PtcpEvent {
    Opened,
    Readable,
    Writable,
    Closed,
}

/// Knobs for a pseudo-TCP socket. The defaults match the wire contract.
#[derive(Debug, Clone)]
pub struct PtcpConfig {
    pub mtu: usize,
    pub snd_buf_size: usize,
    pub rcv_buf_size: usize,
    /// Nagle aggregation of sub-MSS segments. Off by default; interactive
    /// traffic dominates the use case.
    pub nagle: bool,
}

impl Default for PtcpConfig {
    fn default() -> Self {
        Self {
            mtu: PTCP_MTU,
            snd_buf_size: DEFAULT_SND_BUF_SIZE,
            rcv_buf_size: DEFAULT_RCV_BUF_SIZE,
            nagle: false,
        }
    }
}

struct InflightSegment {
    seq: u32,
    data: Bytes,
    n_rtx: u32,
    sacked: bool,
}

impl InflightSegment {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32)
    }
}

/// A user-space TCP equivalent carried in UDP datagrams.
///
/// The object is purely reactive: `notify_packet` ingests a received
/// segment, `notify_clock` advances timers, `send`/`recv` move application
/// bytes, and everything the socket wants to put on the wire comes out of
/// `poll_transmit`. It never touches a socket or a clock itself, which is
/// what makes loss-pattern tests deterministic.
pub struct PseudoTcp {
    conv: u32,
    state: PtcpState,
    config: PtcpConfig,
    mss: usize,

    now: u64,

    // send side
    snd_una: u32,
    snd_nxt: u32,
    snd_queue: VecDeque<u8>,
    inflight: VecDeque<InflightSegment>,
    peer_wnd: u32,
    fin_pending: bool,
    fin_sent: bool,

    // congestion control
    cwnd: u32,
    ssthresh: u32,
    partial_bytes_acked: u32,
    in_fast_recovery: bool,
    fast_recover_exit_point: u32,
    dup_ack_count: u32,

    // retransmission
    rto_mgr: RtoManager,
    rtx_deadline: Option<u64>,
    consecutive_rtx: u32,

    // receive side
    rcv_nxt: u32,
    rcv_buf: VecDeque<u8>,
    ooo: BTreeMap<u32, Bytes>,
    ooo_bytes: usize,
    fin_received: bool,
    ack_pending: u32,
    ack_deadline: Option<u64>,
    last_ts_received: u32,
    low_window_signaled: bool,

    // egress
    transmit_queue: VecDeque<Bytes>,
    events: VecDeque<PtcpEvent>,
    send_was_full: bool,
    opened_signaled: bool,
    closed_signaled: bool,
}

impl PseudoTcp {
    pub fn new(conv: u32, config: PtcpConfig) -> Self {
        let mss = config.mtu.saturating_sub(HEADER_SIZE).max(64);
        // RFC 4960 style initial window, in whole segments.
        let cwnd = std::cmp::min(4 * mss as u32, std::cmp::max(2 * mss as u32, 4380));
        Self {
            conv,
            state: PtcpState::Listen,
            mss,
            now: 0,

            snd_una: 0,
            snd_nxt: 0,
            snd_queue: VecDeque::new(),
            inflight: VecDeque::new(),
            peer_wnd: config.rcv_buf_size as u32,
            fin_pending: false,
            fin_sent: false,

            cwnd,
            ssthresh: u32::MAX / 2,
            partial_bytes_acked: 0,
            in_fast_recovery: false,
            fast_recover_exit_point: 0,
            dup_ack_count: 0,

            rto_mgr: RtoManager::new(),
            rtx_deadline: None,
            consecutive_rtx: 0,

            rcv_nxt: 0,
            rcv_buf: VecDeque::new(),
            ooo: BTreeMap::new(),
            ooo_bytes: 0,
            fin_received: false,
            ack_pending: 0,
            ack_deadline: None,
            last_ts_received: 0,
            low_window_signaled: false,

            transmit_queue: VecDeque::new(),
            events: VecDeque::new(),
            send_was_full: false,
            opened_signaled: false,
            closed_signaled: false,

            config,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn state(&self) -> PtcpState {
        self.state
    }

    /// Initiates the handshake. Call on the side that chose the pair.
    pub fn connect(&mut self, now: u64) -> Result<()> {
        if self.state != PtcpState::Listen {
            return Err(Error::Other("connect on non-listening socket".to_owned()));
        }
        self.now = now;
        self.state = PtcpState::SynSent;
        self.snd_nxt = self.snd_una.wrapping_add(1);
        self.emit(FLAG_SYN, self.snd_una, Bytes::new());
        self.arm_rtx();
        Ok(())
    }

    /// Queues application bytes. Returns how many were accepted.
    pub fn send(&mut self, data: &[u8]) -> Result<usize> {
        if self.state == PtcpState::Closed || self.fin_pending || self.fin_sent {
            return Err(Error::ErrPseudoTcpClosed);
        }

        let space = self.config.snd_buf_size.saturating_sub(self.snd_queue.len());
        if space == 0 {
            self.send_was_full = true;
            return Err(Error::ErrWouldBlock);
        }

        let n = std::cmp::min(space, data.len());
        self.snd_queue.extend(&data[..n]);
        if n < data.len() {
            self.send_was_full = true;
        }
        self.pump_output();
        Ok(n)
    }

    /// Dequeues received bytes. `Ok(0)` signals a clean end of stream.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.rcv_buf.is_empty() {
            if self.fin_received {
                return Ok(0);
            }
            if self.state == PtcpState::Closed {
                return Err(Error::ErrPseudoTcpClosed);
            }
            return Err(Error::ErrWouldBlock);
        }

        let n = std::cmp::min(buf.len(), self.rcv_buf.len());
        for (i, b) in self.rcv_buf.drain(..n).enumerate() {
            buf[i] = b;
        }

        // Reopen the window towards the peer once the application has made
        // real room, otherwise a zero-window sender stays stuck.
        if self.low_window_signaled && self.recv_window() as usize >= self.mss {
            self.low_window_signaled = false;
            self.send_ack();
        }

        Ok(n)
    }

    /// Begins teardown. `force` aborts with RST; otherwise a FIN is sent
    /// once queued data has been flushed.
    pub fn close(&mut self, force: bool) {
        if self.state == PtcpState::Closed {
            return;
        }
        if force {
            self.emit(FLAG_RST, self.snd_nxt, Bytes::new());
            self.enter_closed();
            return;
        }
        self.fin_pending = true;
        self.pump_output();
    }

    /// Ingests one received datagram payload.
    pub fn notify_packet(&mut self, raw: &[u8]) -> Result<()> {
        if self.state == PtcpState::Closed {
            return Err(Error::ErrPseudoTcpClosed);
        }

        let (hdr, payload) = SegmentHeader::unmarshal(raw)?;
        if hdr.conv != self.conv {
            log::debug!(
                "ptcp: dropping segment with conversation {} != {}",
                hdr.conv,
                self.conv
            );
            return Ok(());
        }

        self.last_ts_received = hdr.ts;
        if hdr.has(FLAG_RST) {
            self.enter_closed();
            return Ok(());
        }

        self.peer_wnd = u32::from(hdr.wnd);

        match self.state {
            PtcpState::Listen => {
                if hdr.has(FLAG_SYN) {
                    self.rcv_nxt = hdr.seq.wrapping_add(1);
                    self.state = PtcpState::SynReceived;
                    self.snd_nxt = self.snd_una.wrapping_add(1);
                    self.emit(FLAG_SYN | FLAG_ACK, self.snd_una, Bytes::new());
                    self.arm_rtx();
                }
                return Ok(());
            }
            PtcpState::SynSent => {
                if hdr.has(FLAG_SYN) && hdr.has(FLAG_ACK) && hdr.ack == self.snd_nxt {
                    self.snd_una = hdr.ack;
                    self.rcv_nxt = hdr.seq.wrapping_add(1);
                    self.rtx_deadline = None;
                    self.consecutive_rtx = 0;
                    self.enter_established();
                    self.send_ack();
                    // Data queued while the handshake ran goes out now.
                    self.pump_output();
                }
                return Ok(());
            }
            PtcpState::SynReceived => {
                if hdr.has(FLAG_ACK) && hdr.ack == self.snd_nxt {
                    self.snd_una = hdr.ack;
                    self.rtx_deadline = None;
                    self.consecutive_rtx = 0;
                    self.enter_established();
                    // fall through: the promoting segment may carry data
                } else {
                    return Ok(());
                }
            }
            PtcpState::Established | PtcpState::FinWait => {
                if hdr.has(FLAG_SYN) {
                    // A retransmitted SYN|ACK means our handshake ack was
                    // lost; repeat it.
                    self.send_ack();
                    return Ok(());
                }
            }
            PtcpState::Closed => return Ok(()),
        }

        if hdr.has(FLAG_ACK) {
            // A SACK segment is a pure ack as far as stream data goes.
            let no_stream_data = payload.is_empty() || hdr.has(FLAG_SACK);
            self.process_ack(&hdr, no_stream_data);
        }
        if hdr.has(FLAG_SACK) && !payload.is_empty() {
            if let Ok(blocks) = unmarshal_sack_blocks(&payload) {
                self.process_sack(&blocks);
            }
            self.pump_output();
            self.maybe_close();
            return Ok(());
        }

        if !payload.is_empty() {
            self.process_payload(hdr.seq, payload);
        }

        if hdr.has(FLAG_FIN) {
            let fin_seq = hdr.seq.wrapping_add(
                if hdr.has(FLAG_SACK) { 0 } else { raw.len() as u32 - HEADER_SIZE as u32 },
            );
            if fin_seq == self.rcv_nxt {
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
                self.fin_received = true;
                self.send_ack();
                // EOF is observable through recv; wake the reader.
                self.events.push_back(PtcpEvent::Readable);
            } else if seq_lt(fin_seq, self.rcv_nxt) {
                // Retransmitted FIN; our ack was lost.
                self.send_ack();
            }
        }

        // Acks may have opened the window.
        self.pump_output();
        self.maybe_close();
        Ok(())
    }

    /// Advances the timers to `now` (monotonic milliseconds).
    pub fn notify_clock(&mut self, now: u64) {
        if self.state == PtcpState::Closed {
            return;
        }
        self.now = now;

        if let Some(deadline) = self.rtx_deadline {
            if deadline <= now {
                self.handle_rtx_timeout();
            }
        }

        if let Some(deadline) = self.ack_deadline {
            if deadline <= now {
                self.send_ack();
            }
        }

        self.pump_output();
    }

    /// When the engine next needs `notify_clock`. `None` means the socket is
    /// closed and the driving timer should be torn down.
    pub fn next_clock(&self, now: u64) -> Option<u64> {
        if self.state == PtcpState::Closed {
            return None;
        }

        let mut deadline = now + IDLE_CLOCK;
        if let Some(d) = self.rtx_deadline {
            deadline = std::cmp::min(deadline, d);
        }
        if let Some(d) = self.ack_deadline {
            deadline = std::cmp::min(deadline, d);
        }
        Some(std::cmp::max(deadline, now))
    }

    /// Pops the next segment to put on the wire.
    pub fn poll_transmit(&mut self) -> Option<Bytes> {
        self.transmit_queue.pop_front()
    }

    /// Pops the next edge-triggered notification.
    pub fn poll_event(&mut self) -> Option<PtcpEvent> {
        self.events.pop_front()
    }

    /// Bytes accepted by `send` but not yet acknowledged.
    pub fn buffered_amount(&self) -> usize {
        self.snd_queue.len()
            + self
                .inflight
                .iter()
                .map(|segment| segment.data.len())
                .sum::<usize>()
    }

    fn enter_established(&mut self) {
        self.state = PtcpState::Established;
        if !self.opened_signaled {
            self.opened_signaled = true;
            self.events.push_back(PtcpEvent::Opened);
            self.events.push_back(PtcpEvent::Writable);
        }
    }

    fn enter_closed(&mut self) {
        self.state = PtcpState::Closed;
        self.rtx_deadline = None;
        self.ack_deadline = None;
        self.snd_queue.clear();
        self.inflight.clear();
        if !self.closed_signaled {
            self.closed_signaled = true;
            self.events.push_back(PtcpEvent::Closed);
        }
    }

    fn flight_size(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    fn recv_window(&self) -> u32 {
        let used = self.rcv_buf.len() + self.ooo_bytes;
        let avail = self.config.rcv_buf_size.saturating_sub(used);
        std::cmp::min(avail, u16::MAX as usize) as u32
    }

    fn arm_rtx(&mut self) {
        if self.rtx_deadline.is_none() {
            self.rtx_deadline = Some(self.now + self.rto_mgr.get_rto());
        }
    }

    /// Moves queued bytes into flight as far as the congestion and peer
    /// windows allow, then flushes a pending FIN.
    fn pump_output(&mut self) {
        if !matches!(self.state, PtcpState::Established | PtcpState::FinWait) {
            return;
        }

        let effective_wnd = std::cmp::min(self.cwnd, self.peer_wnd);

        while !self.snd_queue.is_empty() {
            let flight = self.flight_size();
            if flight >= effective_wnd {
                break;
            }
            let budget = (effective_wnd - flight) as usize;
            let len = std::cmp::min(std::cmp::min(self.mss, budget), self.snd_queue.len());
            if len == 0 {
                break;
            }
            // Nagle: hold back a sub-MSS segment while data is in flight.
            if self.config.nagle && len < self.mss && !self.inflight.is_empty() {
                break;
            }

            let chunk: Vec<u8> = self.snd_queue.drain(..len).collect();
            let data = Bytes::from(chunk);

            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
            self.emit(FLAG_ACK, seq, data.clone());
            self.inflight.push_back(InflightSegment {
                seq,
                data,
                n_rtx: 0,
                sacked: false,
            });
            // Data segments carry the ack, nothing left to delay.
            self.ack_pending = 0;
            self.ack_deadline = None;
            self.arm_rtx();
        }

        if self.peer_wnd == 0
            && (!self.snd_queue.is_empty() || self.fin_pending)
            && self.inflight.is_empty()
        {
            // Zero-window probe; the pure ACK solicits a window update.
            self.arm_rtx();
        }

        if self.fin_pending && self.snd_queue.is_empty() && !self.fin_sent {
            let seq = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_pending = false;
            self.fin_sent = true;
            self.emit(FLAG_FIN | FLAG_ACK, seq, Bytes::new());
            self.state = PtcpState::FinWait;
            self.arm_rtx();
        }
    }

    fn process_ack(&mut self, hdr: &SegmentHeader, payload_empty: bool) {
        let ack = hdr.ack;

        if seq_lt(self.snd_una, ack) && seq_lte(ack, self.snd_nxt) {
            let bytes_acked = ack.wrapping_sub(self.snd_una);
            self.snd_una = ack;
            self.dup_ack_count = 0;
            self.consecutive_rtx = 0;

            let mut saw_retransmitted = false;
            while let Some(front) = self.inflight.front() {
                if seq_lte(front.end(), ack) {
                    if front.n_rtx > 0 {
                        saw_retransmitted = true;
                    }
                    self.inflight.pop_front();
                } else {
                    break;
                }
            }

            // Karn: never sample RTT off a retransmitted segment.
            if !saw_retransmitted && hdr.tsack != 0 {
                let rtt = (self.now as u32).wrapping_sub(hdr.tsack);
                if (rtt as i32) >= 0 {
                    self.rto_mgr.set_new_rtt(u64::from(rtt));
                }
            }

            if self.in_fast_recovery && seq_lte(self.fast_recover_exit_point, ack) {
                self.in_fast_recovery = false;
            }
            self.on_cumulative_ack_advanced(bytes_acked);

            self.rtx_deadline = if self.inflight.is_empty() {
                None
            } else {
                Some(self.now + self.rto_mgr.get_rto())
            };

            if self.send_was_full && self.snd_queue.len() < self.config.snd_buf_size {
                self.send_was_full = false;
                self.events.push_back(PtcpEvent::Writable);
            }
        } else if ack == self.snd_una
            && payload_empty
            && !self.inflight.is_empty()
            && !hdr.has(FLAG_SYN)
            && !hdr.has(FLAG_FIN)
        {
            self.dup_ack_count += 1;
            if self.dup_ack_count == 3 {
                self.fast_retransmit();
            }
        }
    }

    fn on_cumulative_ack_advanced(&mut self, bytes_acked: u32) {
        let has_pending = !self.snd_queue.is_empty() || !self.inflight.is_empty();

        if self.cwnd <= self.ssthresh {
            // Slow start, TCP-style increase.
            if !self.in_fast_recovery && has_pending {
                self.cwnd += std::cmp::min(bytes_acked, self.cwnd);
            }
        } else {
            // Congestion avoidance with partial-bytes-acked accounting.
            self.partial_bytes_acked += bytes_acked;
            if self.partial_bytes_acked >= self.cwnd && has_pending {
                self.partial_bytes_acked -= self.cwnd;
                self.cwnd += self.mss as u32;
            }
        }
    }

    fn process_sack(&mut self, blocks: &[(u32, u32)]) {
        for segment in self.inflight.iter_mut() {
            if segment.sacked {
                continue;
            }
            for &(start, end) in blocks {
                if seq_lte(start, segment.seq) && seq_lte(segment.end(), end) {
                    segment.sacked = true;
                    break;
                }
            }
        }
    }

    fn fast_retransmit(&mut self) {
        if !self.in_fast_recovery {
            self.in_fast_recovery = true;
            self.fast_recover_exit_point = self.snd_nxt;
            self.ssthresh = std::cmp::max(self.cwnd / 2, 4 * self.mss as u32);
            self.cwnd = self.ssthresh;
            self.partial_bytes_acked = 0;
        }

        let ack = self.rcv_nxt;
        let wnd = self.recv_window() as u16;
        let now = self.now as u32;
        let tsack = self.last_ts_received;

        if let Some(segment) = self.inflight.iter_mut().find(|segment| !segment.sacked) {
            segment.n_rtx += 1;
            let hdr = SegmentHeader {
                conv: self.conv,
                seq: segment.seq,
                ack,
                flags: FLAG_ACK,
                wnd,
                ts: now,
                tsack,
            };
            let data = segment.data.clone();
            self.transmit_queue.push_back(hdr.marshal(&data));
        }

        self.rtx_deadline = Some(self.now + self.rto_mgr.get_rto());
    }

    fn handle_rtx_timeout(&mut self) {
        self.consecutive_rtx += 1;
        if self.consecutive_rtx > MAX_RTX_FAILURES {
            log::warn!("ptcp conv={}: giving up after {} rtx", self.conv, MAX_RTX_FAILURES);
            self.enter_closed();
            return;
        }

        let backoff = backed_off_rto(self.rto_mgr.get_rto(), self.consecutive_rtx);
        self.rtx_deadline = Some(self.now + backoff);

        match self.state {
            PtcpState::SynSent => {
                self.emit_bare(FLAG_SYN, self.snd_una);
                return;
            }
            PtcpState::SynReceived => {
                self.emit_bare(FLAG_SYN | FLAG_ACK, self.snd_una);
                return;
            }
            _ => {}
        }

        if self.inflight.is_empty() {
            if self.fin_sent && seq_lt(self.snd_una, self.snd_nxt) {
                // Unacknowledged FIN.
                self.emit_bare(FLAG_FIN | FLAG_ACK, self.snd_nxt.wrapping_sub(1));
            } else if !self.snd_queue.is_empty() {
                // Zero-window probe: one byte past the window forces the
                // peer to answer with its current window.
                let chunk: Vec<u8> = self.snd_queue.drain(..1).collect();
                let data = Bytes::from(chunk);
                let seq = self.snd_nxt;
                self.snd_nxt = self.snd_nxt.wrapping_add(1);
                self.emit(FLAG_ACK, seq, data.clone());
                self.inflight.push_back(InflightSegment {
                    seq,
                    data,
                    n_rtx: 0,
                    sacked: false,
                });
            } else {
                self.send_ack();
            }
            return;
        }

        // Timeout collapses the window.
        self.ssthresh = std::cmp::max(self.cwnd / 2, 4 * self.mss as u32);
        self.cwnd = self.mss as u32;
        self.partial_bytes_acked = 0;
        self.in_fast_recovery = false;

        let ack = self.rcv_nxt;
        let wnd = self.recv_window() as u16;
        let now = self.now as u32;
        let tsack = self.last_ts_received;
        if let Some(segment) = self.inflight.iter_mut().find(|segment| !segment.sacked) {
            segment.n_rtx += 1;
            let hdr = SegmentHeader {
                conv: self.conv,
                seq: segment.seq,
                ack,
                flags: FLAG_ACK,
                wnd,
                ts: now,
                tsack,
            };
            let data = segment.data.clone();
            self.transmit_queue.push_back(hdr.marshal(&data));
        }
    }

    fn process_payload(&mut self, seq: u32, payload: Bytes) {
        if !seq_lt(seq, self.rcv_nxt.wrapping_add(self.recv_window()).wrapping_add(1))
            && seq != self.rcv_nxt
        {
            // Beyond what we advertised; drop.
            self.send_ack();
            return;
        }

        let end = seq.wrapping_add(payload.len() as u32);

        if seq_lte(end, self.rcv_nxt) {
            // Entirely duplicate; re-ack so the peer advances.
            self.send_ack();
            return;
        }

        if seq_lte(seq, self.rcv_nxt) {
            // In order (possibly with a duplicated prefix).
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            let was_empty = self.rcv_buf.is_empty();
            self.rcv_buf.extend(&payload[skip..]);
            self.rcv_nxt = end;

            self.drain_out_of_order();

            if was_empty && !self.rcv_buf.is_empty() {
                self.events.push_back(PtcpEvent::Readable);
            }

            if (self.recv_window() as usize) < self.mss {
                self.low_window_signaled = true;
            }

            self.ack_pending += 1;
            if self.ack_pending >= ACK_EVERY_N_SEGMENTS {
                self.send_ack();
            } else if self.ack_deadline.is_none() {
                self.ack_deadline = Some(self.now + ACK_DELAY);
            }
        } else {
            // Future segment; hold and tell the sender what we have.
            if self.ooo_bytes + payload.len() <= self.config.rcv_buf_size
                && !self.ooo.contains_key(&seq)
            {
                self.ooo_bytes += payload.len();
                self.ooo.insert(seq, payload);
            }
            self.send_ack();
        }
    }

    fn drain_out_of_order(&mut self) {
        loop {
            let key = match self.ooo.keys().next().copied() {
                Some(k) => k,
                None => break,
            };
            if !seq_lte(key, self.rcv_nxt) {
                break;
            }
            let data = match self.ooo.remove(&key) {
                Some(d) => d,
                None => break,
            };
            self.ooo_bytes -= data.len();

            let end = key.wrapping_add(data.len() as u32);
            if seq_lt(self.rcv_nxt, end) {
                let skip = self.rcv_nxt.wrapping_sub(key) as usize;
                self.rcv_buf.extend(&data[skip..]);
                self.rcv_nxt = end;
            }
        }
    }

    /// Current out-of-order ranges, for SACK generation.
    fn sack_blocks(&self) -> Vec<(u32, u32)> {
        let mut blocks: Vec<(u32, u32)> = vec![];
        for (&seq, data) in &self.ooo {
            let end = seq.wrapping_add(data.len() as u32);
            if let Some(last) = blocks.last_mut() {
                if last.1 == seq {
                    last.1 = end;
                    continue;
                }
            }
            blocks.push((seq, end));
        }
        blocks.truncate(MAX_SACK_BLOCKS);
        blocks
    }

    fn send_ack(&mut self) {
        self.ack_pending = 0;
        self.ack_deadline = None;

        let blocks = self.sack_blocks();
        if blocks.is_empty() {
            self.emit_bare(FLAG_ACK, self.snd_nxt);
        } else {
            let payload = marshal_sack_blocks(&blocks);
            let hdr = SegmentHeader {
                conv: self.conv,
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                flags: FLAG_ACK | FLAG_SACK,
                wnd: self.recv_window() as u16,
                ts: self.now as u32,
                tsack: self.last_ts_received,
            };
            self.transmit_queue.push_back(hdr.marshal(&payload));
        }
    }

    fn emit_bare(&mut self, flags: u8, seq: u32) {
        self.emit(flags, seq, Bytes::new());
    }

    fn emit(&mut self, flags: u8, seq: u32, payload: Bytes) {
        let hdr = SegmentHeader {
            conv: self.conv,
            seq,
            ack: self.rcv_nxt,
            flags,
            wnd: self.recv_window() as u16,
            ts: self.now as u32,
            tsack: self.last_ts_received,
        };
        self.transmit_queue.push_back(hdr.marshal(&payload));
    }

    fn maybe_close(&mut self) {
        if self.state == PtcpState::Closed {
            return;
        }
        if self.fin_sent && self.snd_una == self.snd_nxt && self.fin_received {
            self.enter_closed();
        }
    }
}
