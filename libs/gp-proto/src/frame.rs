//! Framing of packets on the SSL tunnel byte stream.
//!
//! Every packet is prefixed with a 16-byte header:
//!
//! ```text
//! 0000: Magic "\x1a\x2b\x3c\x4d"
//! 0004: Big-endian EtherType (0x0800 for IPv4, 0x0000 for DPD/keepalive)
//! 0006: Big-endian 16-bit payload length (not including the header)
//! 0008: Little-endian 32-bit flag (1 for data, 0 for DPD)
//! 000c: Little-endian 32-bit zero
//! ```
//!
//! A valid frame always occupies exactly `16 + payload length` bytes on the
//! stream.

/// Size of the tunnel frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Magic number at the start of every tunnel frame.
pub const MAGIC: u32 = 0x1a2b_3c4d;

const ETHERTYPE_DPD: u16 = 0x0000;
const ETHERTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Dead-peer-detection / keepalive probe; zero payload in practice.
    Dpd,
    /// An encapsulated IPv4 datagram.
    Ipv4,
}

impl FrameKind {
    const fn ethertype(self) -> u16 {
        match self {
            FrameKind::Dpd => ETHERTYPE_DPD,
            FrameKind::Ipv4 => ETHERTYPE_IPV4,
        }
    }

    const fn flag(self) -> u32 {
        match self {
            FrameKind::Dpd => 0,
            FrameKind::Ipv4 => 1,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("short frame: received {len} bytes, header is {HEADER_LEN}")]
    ShortFrame { len: usize },
    #[error("bad frame magic {magic:#010x}")]
    MalformedFrame { magic: u32 },
    #[error("length mismatch: read {read} bytes but header claims {HEADER_LEN} + {payload_len}")]
    LengthMismatch { read: usize, payload_len: u16 },
}

/// The decoded 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub ethertype: u16,
    pub payload_len: u16,
    pub flag: u32,
    pub zero: u32,
}

impl Header {
    /// Parses the header at the start of `buf`.
    ///
    /// Only the magic is validated here; gateways are known to drift on the
    /// trailing words, so those are surfaced via [`Header::trailer_is_anomalous`]
    /// instead of failing the parse.
    pub fn parse(buf: &[u8]) -> Result<Self, FrameError> {
        let Some((header, _)) = buf.split_first_chunk::<HEADER_LEN>() else {
            return Err(FrameError::ShortFrame { len: buf.len() });
        };

        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

        if magic != MAGIC {
            return Err(FrameError::MalformedFrame { magic });
        }

        Ok(Self {
            ethertype: u16::from_be_bytes([header[4], header[5]]),
            payload_len: u16::from_be_bytes([header[6], header[7]]),
            flag: u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
            zero: u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
        })
    }

    /// The frame kind, or `None` for an ethertype outside the protocol.
    pub fn kind(&self) -> Option<FrameKind> {
        match self.ethertype {
            ETHERTYPE_DPD => Some(FrameKind::Dpd),
            ETHERTYPE_IPV4 => Some(FrameKind::Ipv4),
            _ => None,
        }
    }

    /// Whether the trailing flag/zero words deviate from the expected pattern
    /// for this frame's ethertype.
    pub fn trailer_is_anomalous(&self) -> bool {
        match self.kind() {
            Some(kind) => self.flag != kind.flag() || self.zero != 0,
            None => false,
        }
    }

    /// Total frame size on the stream claimed by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + usize::from(self.payload_len)
    }
}

/// A decoded frame borrowing its payload from the receive buffer.
#[derive(Debug, PartialEq, Eq)]
pub struct Frame<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    pub fn kind(&self) -> Option<FrameKind> {
        self.header.kind()
    }
}

/// Builds the 16-byte frame header for `kind` and `payload_len`.
pub const fn encode_header(kind: FrameKind, payload_len: u16) -> [u8; HEADER_LEN] {
    let ethertype = kind.ethertype().to_be_bytes();
    let len = payload_len.to_be_bytes();
    let flag = kind.flag().to_le_bytes();

    [
        0x1a, 0x2b, 0x3c, 0x4d, // magic
        ethertype[0],
        ethertype[1],
        len[0],
        len[1],
        flag[0],
        flag[1],
        flag[2],
        flag[3],
        0, 0, 0, 0, // little-endian zero word
    ]
}

/// Encodes a complete frame: header plus payload.
pub fn encode(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= usize::from(u16::MAX));

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&encode_header(kind, payload.len() as u16));
    frame.extend_from_slice(payload);

    frame
}

/// Decodes a complete frame received from the stream.
///
/// `buf` must hold exactly one frame: the length invariant
/// `buf.len() == 16 + payload_len` is enforced here. Ethertype dispatch is
/// left to the caller via [`Frame::kind`].
pub fn decode(buf: &[u8]) -> Result<Frame<'_>, FrameError> {
    let header = Header::parse(buf)?;

    if buf.len() != header.frame_len() {
        return Err(FrameError::LengthMismatch {
            read: buf.len(),
            payload_len: header.payload_len,
        });
    }

    if header.trailer_is_anomalous() {
        tracing::debug!(
            trailer = %hex::encode(&buf[8..HEADER_LEN]),
            "Unexpected trailing words in frame header"
        );
    }

    Ok(Frame {
        header,
        payload: &buf[HEADER_LEN..],
    })
}
