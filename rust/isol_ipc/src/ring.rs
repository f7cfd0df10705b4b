// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The ring proper: private cursors over a shared marker-encoded region.
//!
//! The writer and the reader each own one descriptor referring to the
//! same region. All indexes and in-buffer counts are private to their
//! side; the bytes are the only shared state. Sharing a descriptor
//! between threads breaks the mechanism.

use crate::region::SharedRegion;
use crate::req::ReqType;
use crate::req::BLOCK_BYTES;
use crate::req::BLOCK_PAYLOAD;
use crate::req::HEADER_BYTES;
use std::fmt;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    /// Not enough free blocks to hold the request.
    WouldBlock,
    /// No complete request is available.
    Empty,
    /// The caller's buffer cannot hold the request payload.
    BufferTooSmall { need: usize },
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::WouldBlock => write!(f, "channel full"),
            ChannelError::Empty => write!(f, "channel empty"),
            ChannelError::BufferTooSmall { need } => {
                write!(f, "receive buffer too small, {need} bytes required")
            }
        }
    }
}

impl std::error::Error for ChannelError {}

/// Encode 7 payload bytes as 8 marked bytes. The low bit of every output
/// byte is the "full" marker; the 56 payload bits fill the high bits.
fn encode_block(src: &[u8; BLOCK_PAYLOAD]) -> [u8; BLOCK_BYTES] {
    [
        (src[0] << 1) | 1,
        ((src[0] & 0x80) >> 6) | (src[1] << 2) | 1,
        ((src[1] & 0xc0) >> 5) | (src[2] << 3) | 1,
        ((src[2] & 0xe0) >> 4) | (src[3] << 4) | 1,
        ((src[3] & 0xf0) >> 3) | (src[4] << 5) | 1,
        ((src[4] & 0xf8) >> 2) | (src[5] << 6) | 1,
        ((src[5] & 0xfc) >> 1) | (src[6] << 7) | 1,
        src[6] | 1,
    ]
}

fn decode_block(enc: &[u8; BLOCK_BYTES]) -> [u8; BLOCK_PAYLOAD] {
    [
        enc[0] >> 1 | ((enc[1] << 6) & 0x80),
        enc[1] >> 2 | ((enc[2] << 5) & 0xc0),
        enc[2] >> 3 | ((enc[3] << 4) & 0xe0),
        enc[3] >> 4 | ((enc[4] << 3) & 0xf0),
        enc[4] >> 5 | ((enc[5] << 2) & 0xf8),
        enc[5] >> 6 | ((enc[6] << 1) & 0xfc),
        enc[6] >> 7 | (enc[7] & 0xfe),
    ]
}

/// The 7 source bytes for linear block `idx` of a request. Block 0 carries
/// the header and up to two payload bytes, later blocks 7 payload bytes
/// each.
fn block_source(ty: ReqType, total: u32, payload: &[u8], idx: usize) -> [u8; BLOCK_PAYLOAD] {
    let mut out = [0u8; BLOCK_PAYLOAD];
    if idx == 0 {
        out[0] = ty as u8;
        out[1..HEADER_BYTES].copy_from_slice(&total.to_le_bytes());
        let n = payload.len().min(BLOCK_PAYLOAD - HEADER_BYTES);
        out[HEADER_BYTES..HEADER_BYTES + n].copy_from_slice(&payload[..n]);
    } else {
        let start = idx * BLOCK_PAYLOAD - HEADER_BYTES;
        let n = payload.len().saturating_sub(start).min(BLOCK_PAYLOAD);
        out[..n].copy_from_slice(&payload[start..start + n]);
    }
    out
}

/// Load one block; `None` while any of its marker bits is still clear or
/// the markers have not propagated to this core yet.
fn load_block(bytes: &[AtomicU8], at: usize) -> Option<[u8; BLOCK_PAYLOAD]> {
    fence(Ordering::SeqCst);
    let mut enc = [0u8; BLOCK_BYTES];
    let mut and = 1u8;
    for (i, slot) in bytes[at..at + BLOCK_BYTES].iter().enumerate() {
        enc[i] = slot.load(Ordering::Relaxed);
        and &= enc[i];
    }
    if and & 1 != 1 {
        return None;
    }
    let out = decode_block(&enc);
    fence(Ordering::SeqCst);
    Some(out)
}

fn store_block(bytes: &[AtomicU8], at: usize, src: [u8; BLOCK_PAYLOAD]) {
    for (slot, v) in bytes[at..at + BLOCK_BYTES].iter().zip(encode_block(&src)) {
        slot.store(v, Ordering::Relaxed);
    }
}

fn block_is_empty(bytes: &[AtomicU8], at: usize) -> bool {
    bytes[at..at + BLOCK_BYTES]
        .iter()
        .all(|b| b.load(Ordering::Relaxed) & 1 == 0)
}

/// Clear consumed bytes one store at a time; a bulk memset may write the
/// same location more than once.
fn clear_bytes(bytes: &[AtomicU8], at: usize, len: usize) {
    for b in &bytes[at..at + len] {
        b.store(0, Ordering::Relaxed);
    }
}

/// Producer end of one channel direction.
pub struct RingWriter {
    region: SharedRegion,
    wpos: usize,
    rpos: usize,
    inbuffer: usize,
}

impl RingWriter {
    pub fn new(region: SharedRegion) -> RingWriter {
        debug_assert_eq!(region.len() % BLOCK_BYTES, 0);
        RingWriter {
            region,
            wpos: 0,
            rpos: 0,
            inbuffer: 0,
        }
    }

    /// Create a request in the region. Fails with `WouldBlock` when fewer
    /// blocks are free than the request needs; nothing is published in
    /// that case. Blocks are emitted in reverse order within each
    /// contiguous run so the reader can never observe the header block
    /// full before the trailing blocks.
    pub fn add_req(&mut self, ty: ReqType, payload: &[u8]) -> Result<(), ChannelError> {
        let bytes = self.region.bytes();
        let size = bytes.len();

        fence(Ordering::SeqCst);
        // Reclaim space the reader has zeroed since the last pass.
        while self.inbuffer > 0 && bytes[self.rpos].load(Ordering::Relaxed) & 1 == 0 {
            self.rpos += 1;
            if self.rpos >= size {
                self.rpos = 0;
            }
            self.inbuffer -= 1;
        }
        if self.inbuffer == size {
            return Err(ChannelError::WouldBlock);
        }

        let total = payload.len() + HEADER_BYTES;
        let blocks = total.div_ceil(BLOCK_PAYLOAD);
        let (avail1, avail2) = if self.wpos < self.rpos {
            ((self.rpos - self.wpos) / BLOCK_BYTES, 0)
        } else {
            ((size - self.wpos) / BLOCK_BYTES, self.rpos / BLOCK_BYTES)
        };
        if blocks > avail1 + avail2 {
            return Err(ChannelError::WouldBlock);
        }

        // Destination of linear block i: the first `head` blocks at the
        // write cursor, the rest wrapped to the start of the region.
        let head = blocks.min(avail1);
        let dest = |i: usize| {
            if i < head {
                self.wpos + i * BLOCK_BYTES
            } else {
                (i - head) * BLOCK_BYTES
            }
        };

        // All destinations must be clear before anything is published, so
        // a transient failure leaves no markers behind.
        for i in 0..blocks {
            if !block_is_empty(bytes, dest(i)) {
                return Err(ChannelError::WouldBlock);
            }
        }

        let total32 = total as u32;
        for i in (head..blocks).rev() {
            store_block(bytes, dest(i), block_source(ty, total32, payload, i));
            fence(Ordering::SeqCst);
        }
        for i in (0..head).rev() {
            store_block(bytes, dest(i), block_source(ty, total32, payload, i));
            fence(Ordering::SeqCst);
        }

        self.wpos = if blocks > head {
            (blocks - head) * BLOCK_BYTES
        } else {
            let next = self.wpos + blocks * BLOCK_BYTES;
            if next >= size {
                0
            } else {
                next
            }
        };
        self.inbuffer += blocks * BLOCK_BYTES;
        fence(Ordering::SeqCst);
        Ok(())
    }
}

/// Consumer end of one channel direction.
pub struct RingReader {
    region: SharedRegion,
    wpos: usize,
    rpos: usize,
    inbuffer: usize,
}

impl RingReader {
    pub fn new(region: SharedRegion) -> RingReader {
        debug_assert_eq!(region.len() % BLOCK_BYTES, 0);
        RingReader {
            region,
            wpos: 0,
            rpos: 0,
            inbuffer: 0,
        }
    }

    /// Single-byte probe at the read cursor. This is the only load the
    /// worker's suspension check performs on its fast path.
    #[inline]
    pub fn data_ready(&self) -> bool {
        self.region.bytes()[self.rpos].load(Ordering::Relaxed) & 1 == 1
    }

    /// Get one request from the region into `buf`. Consumed blocks are
    /// zeroed, which is what releases their space to the producer.
    pub fn get_req(&mut self, buf: &mut [u8]) -> Result<(ReqType, usize), ChannelError> {
        let bytes = self.region.bytes();
        let size = bytes.len();

        // Discover newly written bytes.
        while self.inbuffer < size && bytes[self.wpos].load(Ordering::Relaxed) & 1 == 1 {
            self.wpos += 1;
            if self.wpos >= size {
                self.wpos = 0;
            }
            self.inbuffer += 1;
        }
        if self.inbuffer < BLOCK_BYTES {
            return Err(ChannelError::Empty);
        }

        let first = load_block(bytes, self.rpos).ok_or(ChannelError::Empty)?;
        let ty = ReqType::from_u8(first[0]);
        let total =
            u32::from_le_bytes([first[1], first[2], first[3], first[4]]) as usize;
        let payload_len = total.saturating_sub(HEADER_BYTES);
        if payload_len > buf.len() {
            return Err(ChannelError::BufferTooSmall { need: payload_len });
        }
        let n = payload_len.min(BLOCK_PAYLOAD - HEADER_BYTES);
        buf[..n].copy_from_slice(&first[HEADER_BYTES..HEADER_BYTES + n]);

        if total <= BLOCK_PAYLOAD {
            fence(Ordering::SeqCst);
            clear_bytes(bytes, self.rpos, BLOCK_BYTES);
            fence(Ordering::SeqCst);
            self.rpos += BLOCK_BYTES;
            if self.rpos >= size {
                self.rpos = 0;
            }
            self.inbuffer -= BLOCK_BYTES;
            return Ok((ty, payload_len));
        }

        let blocks = total.div_ceil(BLOCK_PAYLOAD);
        if self.inbuffer < blocks * BLOCK_BYTES {
            return Err(ChannelError::Empty);
        }
        let head = blocks.min((size - self.rpos) / BLOCK_BYTES);
        let tail = blocks - head;

        for i in 1..head {
            let data = load_block(bytes, self.rpos + i * BLOCK_BYTES).ok_or(ChannelError::Empty)?;
            copy_payload(buf, payload_len, i, &data);
        }
        for j in 0..tail {
            let data = load_block(bytes, j * BLOCK_BYTES).ok_or(ChannelError::Empty)?;
            copy_payload(buf, payload_len, head + j, &data);
        }

        fence(Ordering::SeqCst);
        if tail > 0 {
            clear_bytes(bytes, 0, tail * BLOCK_BYTES);
        }
        clear_bytes(bytes, self.rpos, head * BLOCK_BYTES);
        fence(Ordering::SeqCst);

        self.rpos = if tail > 0 {
            tail * BLOCK_BYTES
        } else {
            let next = self.rpos + head * BLOCK_BYTES;
            if next >= size {
                0
            } else {
                next
            }
        };
        self.inbuffer -= blocks * BLOCK_BYTES;
        Ok((ty, payload_len))
    }
}

/// Place the decoded bytes of linear block `idx` (> 0) at their payload
/// offset.
fn copy_payload(buf: &mut [u8], payload_len: usize, idx: usize, data: &[u8; BLOCK_PAYLOAD]) {
    let start = idx * BLOCK_PAYLOAD - HEADER_BYTES;
    let n = payload_len.saturating_sub(start).min(BLOCK_PAYLOAD);
    buf[start..start + n].copy_from_slice(&data[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::AREA_SIZE;

    fn channel(size: usize) -> (RingWriter, RingReader) {
        let region = SharedRegion::private(size);
        (RingWriter::new(region.clone()), RingReader::new(region))
    }

    fn snapshot(region: &SharedRegion) -> Vec<u8> {
        region
            .bytes()
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect()
    }

    #[test]
    fn test_block_codec_bijective() {
        let src = [0x00, 0xff, 0x5a, 0xa5, 0x01, 0x80, 0x7e];
        let enc = encode_block(&src);
        assert!(enc.iter().all(|b| b & 1 == 1));
        assert_eq!(decode_block(&enc), src);
    }

    #[test]
    fn test_round_trip_various_sizes() {
        let (mut tx, mut rx) = channel(AREA_SIZE);
        let mut buf = [0u8; AREA_SIZE];
        for len in [0usize, 1, 2, 3, 7, 20, 100, 1000] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 + len) as u8).collect();
            tx.add_req(ReqType::Print, &payload).unwrap();
            let (ty, got) = rx.get_req(&mut buf).unwrap();
            assert_eq!(ty, ReqType::Print);
            assert_eq!(&buf[..got], &payload[..]);
        }
        assert_eq!(rx.get_req(&mut buf), Err(ChannelError::Empty));
    }

    #[test]
    fn test_empty_and_ready_probe() {
        let (mut tx, mut rx) = channel(64);
        let mut buf = [0u8; 64];
        assert!(!rx.data_ready());
        assert_eq!(rx.get_req(&mut buf), Err(ChannelError::Empty));
        tx.add_req(ReqType::Ping, &[]).unwrap();
        assert!(rx.data_ready());
        assert_eq!(rx.get_req(&mut buf).unwrap(), (ReqType::Ping, 0));
        assert!(!rx.data_ready());
    }

    #[test]
    fn test_wraparound_many_cycles() {
        // 64 bytes = 8 blocks; odd-sized requests force the cursors
        // through every alignment relative to the region boundary.
        let (mut tx, mut rx) = channel(64);
        let mut buf = [0u8; 64];
        for round in 0..200usize {
            let len = round % 17;
            let payload: Vec<u8> = (0..len).map(|i| (round + i) as u8).collect();
            tx.add_req(ReqType::Cmd, &payload).unwrap();
            let (ty, got) = rx.get_req(&mut buf).unwrap();
            assert_eq!(ty, ReqType::Cmd);
            assert_eq!(&buf[..got], &payload[..]);
        }
    }

    #[test]
    fn test_would_block_publishes_nothing() {
        let region = SharedRegion::private(64);
        let mut tx = RingWriter::new(region.clone());
        let mut rx = RingReader::new(region.clone());

        // 8 blocks capacity; each empty request takes one block.
        for i in 0..8 {
            tx.add_req(ReqType::Ping, &[i]).unwrap();
        }
        let before = snapshot(&region);
        assert_eq!(tx.add_req(ReqType::Ping, &[0xff]), Err(ChannelError::WouldBlock));
        assert_eq!(snapshot(&region), before);

        let mut buf = [0u8; 16];
        for i in 0..8 {
            let (ty, got) = rx.get_req(&mut buf).unwrap();
            assert_eq!(ty, ReqType::Ping);
            assert_eq!(&buf[..got], &[i]);
        }
        assert_eq!(rx.get_req(&mut buf), Err(ChannelError::Empty));
    }

    #[test]
    fn test_oversized_request_rejected() {
        let (mut tx, _rx) = channel(64);
        let payload = [0u8; 60];
        assert_eq!(
            tx.add_req(ReqType::Print, &payload),
            Err(ChannelError::WouldBlock)
        );
    }

    #[test]
    fn test_consumed_blocks_are_zeroed() {
        let region = SharedRegion::private(64);
        let mut tx = RingWriter::new(region.clone());
        let mut rx = RingReader::new(region.clone());
        let mut buf = [0u8; 64];

        tx.add_req(ReqType::Print, &[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        rx.get_req(&mut buf).unwrap();
        assert!(snapshot(&region).iter().all(|b| *b == 0));

        // The freed space is reusable at full capacity.
        for i in 0..8 {
            tx.add_req(ReqType::Ping, &[i]).unwrap();
        }
    }

    #[test]
    fn test_buffer_too_small_leaves_request_intact() {
        let (mut tx, mut rx) = channel(AREA_SIZE);
        let payload: Vec<u8> = (0..100u8).collect();
        tx.add_req(ReqType::Print, &payload).unwrap();

        let mut small = [0u8; 10];
        assert_eq!(
            rx.get_req(&mut small),
            Err(ChannelError::BufferTooSmall { need: 100 })
        );

        let mut big = [0u8; 128];
        let (ty, got) = rx.get_req(&mut big).unwrap();
        assert_eq!(ty, ReqType::Print);
        assert_eq!(&big[..got], &payload[..]);
    }

    #[test]
    fn test_threaded_ordered_delivery() {
        let region = SharedRegion::private(AREA_SIZE);
        let mut tx = RingWriter::new(region.clone());
        let mut rx = RingReader::new(region);
        const COUNT: usize = 2000;

        let producer = std::thread::spawn(move || {
            for i in 0..COUNT {
                let len = i % 43;
                let mut payload = vec![0u8; len + 4];
                payload[..4].copy_from_slice(&(i as u32).to_le_bytes());
                for (k, b) in payload[4..].iter_mut().enumerate() {
                    *b = (i + k) as u8;
                }
                while tx.add_req(ReqType::Print, &payload).is_err() {
                    std::hint::spin_loop();
                }
            }
        });

        let mut buf = [0u8; AREA_SIZE];
        for i in 0..COUNT {
            let (ty, got) = loop {
                match rx.get_req(&mut buf) {
                    Ok(v) => break v,
                    Err(ChannelError::Empty) => std::hint::spin_loop(),
                    Err(e) => panic!("unexpected channel error: {e}"),
                }
            };
            assert_eq!(ty, ReqType::Print);
            let seq = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            assert_eq!(seq, i);
            assert_eq!(got, i % 43 + 4);
            for (k, b) in buf[4..got].iter().enumerate() {
                assert_eq!(*b, (i + k) as u8);
            }
        }
        producer.join().unwrap();
    }
}
