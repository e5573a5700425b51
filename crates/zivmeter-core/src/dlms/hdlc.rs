//! HDLC framing (IEC 62056-46)
//!
//! Frame layout, flags excluded:
//! - 2 bytes: format type 3 (`0xA_`), segmentation bit, 11-bit length
//! - 1-4 bytes: destination address
//! - 1-4 bytes: source address
//! - 1 byte: control
//! - 2 bytes: HCS (only when an information field follows)
//! - N bytes: information field
//! - 2 bytes: FCS
//!
//! HCS and FCS are CRC-16/X.25, sent least significant byte first.

use crc::{Crc, CRC_16_IBM_SDLC};
use thiserror::Error;

/// Opening and closing flag
pub const FLAG: u8 = 0x7E;

/// Largest value of the 11-bit length field
pub const MAX_FRAME_LEN: usize = 0x7FF;

const FCS16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// Control field values of the unnumbered frames used here (poll/final set)
pub mod control {
    /// Set normal response mode
    pub const SNRM: u8 = 0x93;
    /// Unnumbered acknowledge
    pub const UA: u8 = 0x73;
    /// Disconnect
    pub const DISC: u8 = 0x53;
    /// Disconnected mode
    pub const DM: u8 = 0x1F;
}

/// LLC header in front of every client APDU
pub const LLC_REQUEST: [u8; 3] = [0xE6, 0xE6, 0x00];

/// LLC header in front of every server APDU
pub const LLC_RESPONSE: [u8; 3] = [0xE6, 0xE7, 0x00];

/// Reasons a frame body is rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than the smallest frame
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),

    /// Format field is not type 3
    #[error("unknown frame format {0:#04x}")]
    BadFormat(u8),

    /// Length field disagrees with the bytes given
    #[error("length field says {declared} bytes, frame has {actual}")]
    LengthMismatch {
        /// Length in the format field
        declared: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// No address byte with the extension bit set
    #[error("address field not terminated")]
    BadAddress,

    /// Header check sequence is wrong
    #[error("header check sequence mismatch")]
    HcsMismatch,

    /// Frame check sequence is wrong
    #[error("frame check sequence mismatch: expected {expected:#06x}, got {actual:#06x}")]
    FcsMismatch {
        /// Computed over the frame
        expected: u16,
        /// Carried in the frame
        actual: u16,
    },

    /// Information field exceeds the length field
    #[error("information field too long ({0} bytes)")]
    TooLong(usize),
}

/// Encode a client address (one byte)
pub fn client_address(address: u8) -> Vec<u8> {
    vec![(address << 1) | 1]
}

/// Encode a server address in one, two or four bytes
///
/// Two-byte addresses carry the logical device in the upper seven bits and
/// the physical device in the lower seven.
pub fn server_address(address: u32) -> Vec<u8> {
    let group = |value: u32| ((value & 0x7F) << 1) as u8;
    if address < 0x80 {
        vec![group(address) | 1]
    } else if address < 0x4000 {
        vec![group(address >> 7), group(address) | 1]
    } else {
        let upper = address >> 14;
        let lower = address & 0x3FFF;
        vec![
            group(upper >> 7),
            group(upper),
            group(lower >> 7),
            group(lower) | 1,
        ]
    }
}

/// Total frame length (flags excluded) from the two format bytes
pub fn frame_length(format_hi: u8, format_lo: u8) -> usize {
    (usize::from(format_hi & 0x07) << 8) | usize::from(format_lo)
}

/// Whether a byte can start the format field
pub fn is_format_byte(b: u8) -> bool {
    b & 0xF0 == 0xA0
}

/// One HDLC frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination address bytes
    pub dest: Vec<u8>,
    /// Source address bytes
    pub src: Vec<u8>,
    /// Control field
    pub control: u8,
    /// More frames of the same message follow
    pub segmented: bool,
    /// Information field, without HCS and FCS
    pub info: Vec<u8>,
}

impl Frame {
    /// Frame without information field
    pub fn command(dest: Vec<u8>, src: Vec<u8>, control: u8) -> Self {
        Self {
            dest,
            src,
            control,
            segmented: false,
            info: Vec::new(),
        }
    }

    /// Information (I) frame control byte for the given sequence numbers
    pub fn i_control(send_seq: u8, recv_seq: u8) -> u8 {
        ((recv_seq & 0x07) << 5) | 0x10 | ((send_seq & 0x07) << 1)
    }

    /// True for I-frames
    pub fn is_information(&self) -> bool {
        self.control & 0x01 == 0
    }

    /// True for RR supervisory frames
    pub fn is_receive_ready(&self) -> bool {
        self.control & 0x0F == 0x01
    }

    /// N(S) of an I-frame
    pub fn send_sequence(&self) -> u8 {
        (self.control >> 1) & 0x07
    }

    /// N(R) of an I-frame or supervisory frame
    pub fn recv_sequence(&self) -> u8 {
        (self.control >> 5) & 0x07
    }

    /// Encode with flags, HCS and FCS
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let header = 2 + self.dest.len() + self.src.len() + 1;
        let len = if self.info.is_empty() {
            header + 2
        } else {
            header + 2 + self.info.len() + 2
        };
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLong(self.info.len()));
        }

        let mut out = Vec::with_capacity(len + 2);
        out.push(FLAG);
        let segmentation = if self.segmented { 0x08 } else { 0x00 };
        out.push(0xA0 | segmentation | ((len >> 8) as u8 & 0x07));
        out.push((len & 0xFF) as u8);
        out.extend_from_slice(&self.dest);
        out.extend_from_slice(&self.src);
        out.push(self.control);
        if !self.info.is_empty() {
            let hcs = FCS16.checksum(&out[1..]);
            out.extend_from_slice(&hcs.to_le_bytes());
            out.extend_from_slice(&self.info);
        }
        let fcs = FCS16.checksum(&out[1..]);
        out.extend_from_slice(&fcs.to_le_bytes());
        out.push(FLAG);
        Ok(out)
    }

    /// Decode the bytes between the flags
    pub fn decode(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 7 {
            return Err(FrameError::TooShort(body.len()));
        }
        if !is_format_byte(body[0]) {
            return Err(FrameError::BadFormat(body[0]));
        }
        let declared = frame_length(body[0], body[1]);
        if declared != body.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }

        let fcs_at = body.len() - 2;
        let expected = FCS16.checksum(&body[..fcs_at]);
        let actual = u16::from_le_bytes([body[fcs_at], body[fcs_at + 1]]);
        if expected != actual {
            return Err(FrameError::FcsMismatch { expected, actual });
        }

        let mut i = 2;
        let dest = read_address(&body[..fcs_at], &mut i)?;
        let src = read_address(&body[..fcs_at], &mut i)?;
        if i >= fcs_at {
            return Err(FrameError::TooShort(body.len()));
        }
        let control = body[i];
        i += 1;

        let info = if i == fcs_at {
            Vec::new()
        } else {
            if i + 2 > fcs_at {
                return Err(FrameError::TooShort(body.len()));
            }
            let hcs = u16::from_le_bytes([body[i], body[i + 1]]);
            if FCS16.checksum(&body[..i]) != hcs {
                return Err(FrameError::HcsMismatch);
            }
            body[i + 2..fcs_at].to_vec()
        };

        Ok(Self {
            dest,
            src,
            control,
            segmented: body[0] & 0x08 != 0,
            info,
        })
    }
}

/// Read an address field: up to four bytes, the last one has bit 0 set
fn read_address(bytes: &[u8], i: &mut usize) -> Result<Vec<u8>, FrameError> {
    let start = *i;
    while *i < bytes.len() && *i - start < 4 {
        let b = bytes[*i];
        *i += 1;
        if b & 0x01 == 1 {
            return Ok(bytes[start..*i].to_vec());
        }
    }
    Err(FrameError::BadAddress)
}
