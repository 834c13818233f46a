//! Frame format of the block service RPC protocol.
//!
//! Every message is a fixed 24-byte big-endian header followed by the payload:
//!
//! ```text
//! magic:4 | version:1 | flags:1 | opcode:2 | request_id:8 | payload_length:4 | crc32:4
//! ```

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 24;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x5646_5301;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted on the wire (64 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Operations understood by the block service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Liveness probe; the payload is echoed back.
    Heartbeat = 0x0001,
    /// Authenticate the connection for a user.
    EstablishSession = 0x0101,
    /// Fetch a block's ciphertext and server key half.
    GetBlock = 0x0201,
    /// Store a block.
    PutBlock = 0x0202,
    /// Add a counted reference to a block.
    IncBlockReference = 0x0203,
    /// Drop a counted reference to a block.
    DecBlockReference = 0x0204,
}

impl Opcode {
    /// Raw wire value.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = TransportError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Opcode::Heartbeat),
            0x0101 => Ok(Opcode::EstablishSession),
            0x0201 => Ok(Opcode::GetBlock),
            0x0202 => Ok(Opcode::PutBlock),
            0x0203 => Ok(Opcode::IncBlockReference),
            0x0204 => Ok(Opcode::DecBlockReference),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

/// Frame control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Frame is a response to a request with the same id.
    pub const RESPONSE: FrameFlags = FrameFlags(0x01);
    /// Response payload is an encoded `RemoteError`.
    pub const ERROR: FrameFlags = FrameFlags(0x02);
    /// Request expects no response.
    pub const ONE_WAY: FrameFlags = FrameFlags(0x04);

    /// No flags set.
    pub fn empty() -> Self {
        FrameFlags(0)
    }

    /// Raw byte representation.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Build from the raw byte, rejecting unknown bits.
    pub fn from_bits(bits: u8) -> Result<Self> {
        if bits & !0x07 != 0 {
            return Err(TransportError::InvalidFrame {
                reason: format!("unknown flag bits 0x{bits:02X}"),
            });
        }
        Ok(FrameFlags(bits))
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: FrameFlags) -> FrameFlags {
        FrameFlags(self.0 | rhs.0)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Control flags.
    pub flags: FrameFlags,
    /// Operation code.
    pub opcode: Opcode,
    /// Request id used to match responses to calls.
    pub request_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
    /// CRC32 of the payload.
    pub checksum: u32,
}

impl FrameHeader {
    /// Serialize to the fixed-size wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.flags.bits();
        buf[6..8].copy_from_slice(&self.opcode.as_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.request_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.payload_length.to_be_bytes());
        buf[20..24].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    /// Parse and validate the fixed-size wire form.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: buf[4],
            });
        }
        let flags = FrameFlags::from_bits(buf[5])?;
        let opcode = Opcode::try_from(u16::from_be_bytes([buf[6], buf[7]]))?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[8..16]);
        let payload_length = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: u64::from(payload_length),
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            flags,
            opcode,
            request_id: u64::from_be_bytes(id),
            payload_length,
            checksum: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
        })
    }
}

/// Reject a payload the frame length field cannot carry.
pub fn check_payload_size(len: usize) -> Result<()> {
    let size = len as u64;
    if size > u64::from(MAX_PAYLOAD_SIZE) {
        return Err(TransportError::PayloadTooLarge {
            size,
            max_size: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(())
}

/// A single frame in the RPC protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload data.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame, computing length and checksum.
    pub fn new(opcode: Opcode, request_id: u64, payload: Vec<u8>) -> Self {
        Self::with_flags(opcode, request_id, payload, FrameFlags::empty())
    }

    /// Build a frame with explicit flags.
    pub fn with_flags(opcode: Opcode, request_id: u64, payload: Vec<u8>, flags: FrameFlags) -> Self {
        let header = FrameHeader {
            flags,
            opcode,
            request_id,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Build the successful response to this request.
    pub fn make_response(&self, payload: Vec<u8>) -> Frame {
        Frame::with_flags(
            self.header.opcode,
            self.header.request_id,
            payload,
            FrameFlags::RESPONSE,
        )
    }

    /// Build an error response to this request; `payload` is an encoded
    /// `RemoteError`.
    pub fn make_error_response(&self, payload: Vec<u8>) -> Frame {
        Frame::with_flags(
            self.header.opcode,
            self.header.request_id,
            payload,
            FrameFlags::RESPONSE | FrameFlags::ERROR,
        )
    }

    /// Operation code.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Request id.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// True for response frames.
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESPONSE)
    }

    /// True for error responses.
    pub fn is_error(&self) -> bool {
        self.header.flags.contains(FrameFlags::ERROR)
    }

    /// Verify the payload against the header.
    pub fn validate(&self) -> Result<()> {
        if self.payload.len() != self.header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    self.payload.len(),
                    self.header.payload_length
                ),
            });
        }
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete frame from a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("short frame: {} bytes", buf.len()),
            });
        }
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        header_buf.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::decode(&header_buf)?;
        let frame = Frame {
            header,
            payload: buf[FRAME_HEADER_SIZE..].to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }
}
