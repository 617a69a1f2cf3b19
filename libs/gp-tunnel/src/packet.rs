//! Packet buffers and their reuse.
//!
//! Every packet lives in one contiguous buffer: 16 bytes of frame header
//! followed by the payload. Buffers move by ownership between the pool, the
//! hand-off queues and the main loop's current-transmit slot; nothing is
//! shared. The DPD probe is a static frame referenced by tag so the release
//! path never touches it.

use gp_proto::frame::{self, FrameKind, HEADER_LEN};

/// The DPD/keepalive probe frame: a bare header, zero payload.
pub static DPD_FRAME: [u8; HEADER_LEN] = frame::encode_header(FrameKind::Dpd, 0);

/// An owned tunnel packet: 16-byte header prefix plus payload.
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    /// Builds an outbound packet around an IPv4 datagram, using `storage`
    /// for the buffer. The header is stamped when the packet is selected for
    /// transmission.
    pub(crate) fn from_payload(mut storage: Vec<u8>, payload: &[u8]) -> Self {
        storage.clear();
        storage.resize(HEADER_LEN, 0);
        storage.extend_from_slice(payload);

        Self { buf: storage }
    }

    /// Wraps a received frame; `buf` must already be truncated to
    /// `16 + payload_len`.
    pub(crate) fn from_frame(buf: Vec<u8>) -> Self {
        debug_assert!(buf.len() >= HEADER_LEN);

        Self { buf }
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LEN..]
    }

    pub(crate) fn payload_len(&self) -> u16 {
        (self.buf.len() - HEADER_LEN) as u16
    }

    /// Writes the data-frame header for the current payload.
    pub(crate) fn stamp_header(&mut self) {
        let header = frame::encode_header(FrameKind::Ipv4, self.payload_len());
        self.buf[..HEADER_LEN].copy_from_slice(&header);
    }

    /// The full frame as it goes on the wire.
    pub(crate) fn frame_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn into_storage(self) -> Vec<u8> {
        self.buf
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("payload_len", &self.payload_len())
            .finish_non_exhaustive()
    }
}

/// How many spare buffers the pool holds on to.
const MAX_POOLED: usize = 64;

/// A free-list of packet buffers.
///
/// Receive buffers are large (`16 + max(2048, mtu + 256)`) and churn once per
/// frame, so completed packets hand their storage back here instead of the
/// allocator. Buffers from an older, smaller capacity are discarded on
/// acquire.
pub(crate) struct PacketPool {
    free: Vec<Vec<u8>>,
    capacity: usize,
}

impl PacketPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            free: Vec::new(),
            capacity,
        }
    }

    /// Adjusts the buffer capacity, e.g. after a renegotiation changed the
    /// MTU. Pooled buffers of the wrong size are dropped lazily.
    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn acquire(&mut self) -> Vec<u8> {
        while let Some(buf) = self.free.pop() {
            if buf.capacity() >= self.capacity {
                return buf;
            }
        }

        Vec::with_capacity(self.capacity)
    }

    pub(crate) fn release(&mut self, buf: Vec<u8>) {
        if self.free.len() < MAX_POOLED {
            self.free.push(buf);
        }
    }
}
