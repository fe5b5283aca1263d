use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::*;

/// Size of the segment header on the wire.
pub(crate) const HEADER_SIZE: usize = 24;

pub(crate) const FLAG_SYN: u8 = 0x01;
pub(crate) const FLAG_ACK: u8 = 0x02;
pub(crate) const FLAG_FIN: u8 = 0x04;
pub(crate) const FLAG_RST: u8 = 0x08;
pub(crate) const FLAG_SACK: u8 = 0x10;

/// The fixed 24-byte segment header:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                          conversation                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        sequence number                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                     acknowledgment number                     |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     flags     |    reserved   |            window             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                        timestamp echo                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct SegmentHeader {
    pub(crate) conv: u32,
    pub(crate) seq: u32,
    pub(crate) ack: u32,
    pub(crate) flags: u8,
    pub(crate) wnd: u16,
    pub(crate) ts: u32,
    pub(crate) tsack: u32,
}

impl SegmentHeader {
    pub(crate) fn marshal(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        buf.put_u32(self.conv);
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u8(self.flags);
        buf.put_u8(0); // reserved
        buf.put_u16(self.wnd);
        buf.put_u32(self.ts);
        buf.put_u32(self.tsack);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub(crate) fn unmarshal(raw: &[u8]) -> Result<(Self, Bytes)> {
        if raw.len() < HEADER_SIZE {
            return Err(Error::Other(format!(
                "segment too short: {} < {}",
                raw.len(),
                HEADER_SIZE
            )));
        }

        let mut buf = raw;
        let conv = buf.get_u32();
        let seq = buf.get_u32();
        let ack = buf.get_u32();
        let flags = buf.get_u8();
        let _reserved = buf.get_u8();
        let wnd = buf.get_u16();
        let ts = buf.get_u32();
        let tsack = buf.get_u32();

        Ok((
            Self {
                conv,
                seq,
                ack,
                flags,
                wnd,
                ts,
                tsack,
            },
            Bytes::copy_from_slice(buf),
        ))
    }

    pub(crate) fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// SACK blocks ride in the payload of a SACK-flagged pure ACK:
/// a count byte followed by `(start, end)` sequence pairs, end exclusive.
pub(crate) const MAX_SACK_BLOCKS: usize = 4;

pub(crate) fn marshal_sack_blocks(blocks: &[(u32, u32)]) -> Bytes {
    let n = std::cmp::min(blocks.len(), MAX_SACK_BLOCKS);
    let mut buf = BytesMut::with_capacity(1 + n * 8);
    buf.put_u8(n as u8);
    for &(start, end) in blocks.iter().take(n) {
        buf.put_u32(start);
        buf.put_u32(end);
    }
    buf.freeze()
}

pub(crate) fn unmarshal_sack_blocks(raw: &[u8]) -> Result<Vec<(u32, u32)>> {
    if raw.is_empty() {
        return Err(Error::Other("empty sack payload".to_owned()));
    }

    let mut buf = raw;
    let n = buf.get_u8() as usize;
    if n > MAX_SACK_BLOCKS || buf.remaining() < n * 8 {
        return Err(Error::Other("malformed sack payload".to_owned()));
    }

    let mut blocks = Vec::with_capacity(n);
    for _ in 0..n {
        let start = buf.get_u32();
        let end = buf.get_u32();
        blocks.push((start, end));
    }
    Ok(blocks)
}
