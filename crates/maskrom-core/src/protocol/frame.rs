//! Wire framing for the maskrom bulk command protocol.
//!
//! Every exchange starts with a 31-byte request frame on the OUT endpoint
//! and ends with a 13-byte response frame on the IN endpoint. The outer
//! header fields are big-endian; the embedded operation descriptor keeps
//! the host's native byte order. The mix is a hardware contract — the ROM
//! parses the descriptor as a packed in-memory struct.

use byteorder::{BigEndian, NativeEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use thiserror::Error;

/// Request frame signature, "USBC".
pub const REQUEST_SIGNATURE: &[u8; 4] = b"USBC";
/// Response frame signature, "USBS".
pub const RESPONSE_SIGNATURE: &[u8; 4] = b"USBS";

/// Total request frame size on the wire.
pub const REQUEST_SIZE: usize = 31;
/// Total response frame size on the wire.
pub const RESPONSE_SIZE: usize = 13;
/// Operation descriptor size inside the request frame.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Response status: command completed.
pub const STATUS_OK: u8 = 0;
/// Response status: command failed.
pub const STATUS_FAIL: u8 = 1;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    ShortFrame { expected: usize, actual: usize },

    #[error("bad signature {actual:02X?}, expected {expected:02X?}")]
    BadSignature { expected: [u8; 4], actual: [u8; 4] },

    /// The response does not belong to the outstanding request. This is a
    /// desynchronization, not a retryable failure.
    #[error("tag mismatch: response carries {actual:#010X}, request sent {expected:#010X}")]
    TagMismatch { expected: u32, actual: u32 },
}

/// Transfer direction as encoded in the request's flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Host to device.
    Out = 0x00,
    /// Device to host.
    In = 0x80,
}

/// The 16-byte command block carried inside a request frame.
///
/// Multi-byte fields are native-endian (see module docs). Seven reserved
/// trailing bytes pad the block to its fixed size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationDescriptor {
    pub code: u8,
    pub subcode: u8,
    pub address: u32,
    pub length: u16,
}

impl OperationDescriptor {
    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.write_u8(self.code).unwrap();
        buf.write_u8(self.subcode).unwrap();
        buf.write_u32::<NativeEndian>(self.address).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<NativeEndian>(self.length).unwrap();
        buf.extend_from_slice(&[0u8; 7]);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        let code = cursor.read_u8()?;
        let subcode = cursor.read_u8()?;
        let address = cursor.read_u32::<NativeEndian>()?;
        let _reserved = cursor.read_u8()?;
        let length = cursor.read_u16::<NativeEndian>()?;
        cursor.set_position(cursor.position() + 7);
        Ok(Self {
            code,
            subcode,
            address,
            length,
        })
    }
}

/// A 31-byte command request frame.
#[derive(Debug, Clone, Copy)]
pub struct RequestFrame {
    /// Correlation tag echoed by the device's response.
    pub tag: u32,
    /// Data-stage length in bytes, 0 if the command carries no data.
    pub length: u32,
    pub direction: Direction,
    pub lun: u8,
    /// Valid command-block length: 6 for the bare descriptor form, 10 for
    /// the addressed form.
    pub cblen: u8,
    pub op: OperationDescriptor,
}

impl RequestFrame {
    /// Build a frame with a fresh random tag.
    pub fn new(op: OperationDescriptor, direction: Direction, cblen: u8, length: u32) -> Self {
        Self {
            tag: rand::random(),
            length,
            direction,
            lun: 0,
            cblen,
            op,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_SIZE);
        buf.extend_from_slice(REQUEST_SIGNATURE);
        buf.write_u32::<BigEndian>(self.tag).unwrap();
        buf.write_u32::<BigEndian>(self.length).unwrap();
        buf.write_u8(self.direction as u8).unwrap();
        buf.write_u8(self.lun).unwrap();
        buf.write_u8(self.cblen).unwrap();
        self.op.write_to(&mut buf);
        debug_assert_eq!(buf.len(), REQUEST_SIZE);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < REQUEST_SIZE {
            return Err(ProtocolError::ShortFrame {
                expected: REQUEST_SIZE,
                actual: data.len(),
            });
        }
        if &data[..4] != REQUEST_SIGNATURE {
            return Err(ProtocolError::BadSignature {
                expected: *REQUEST_SIGNATURE,
                actual: [data[0], data[1], data[2], data[3]],
            });
        }
        let mut cursor = Cursor::new(&data[4..]);
        let tag = cursor.read_u32::<BigEndian>().unwrap();
        let length = cursor.read_u32::<BigEndian>().unwrap();
        let flag = cursor.read_u8().unwrap();
        let lun = cursor.read_u8().unwrap();
        let cblen = cursor.read_u8().unwrap();
        let op = OperationDescriptor::read_from(&mut cursor).unwrap();
        let direction = if flag & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        };
        Ok(Self {
            tag,
            length,
            direction,
            lun,
            cblen,
            op,
        })
    }
}

/// A 13-byte command status frame.
#[derive(Debug, Clone, Copy)]
pub struct ResponseFrame {
    /// Echo of the request's tag.
    pub tag: u32,
    /// Bytes the device did not transfer out of the announced data length.
    pub residue: u32,
    pub status: u8,
}

impl ResponseFrame {
    /// Decode a status frame, validating length and signature. Tag matching
    /// is the caller's job — only the caller knows the outstanding request.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < RESPONSE_SIZE {
            return Err(ProtocolError::ShortFrame {
                expected: RESPONSE_SIZE,
                actual: data.len(),
            });
        }
        if &data[..4] != RESPONSE_SIGNATURE {
            return Err(ProtocolError::BadSignature {
                expected: *RESPONSE_SIGNATURE,
                actual: [data[0], data[1], data[2], data[3]],
            });
        }
        let mut cursor = Cursor::new(&data[4..]);
        let tag = cursor.read_u32::<BigEndian>().unwrap();
        let residue = cursor.read_u32::<BigEndian>().unwrap();
        let status = cursor.read_u8().unwrap();
        Ok(Self {
            tag,
            residue,
            status,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RESPONSE_SIZE);
        buf.extend_from_slice(RESPONSE_SIGNATURE);
        buf.write_u32::<BigEndian>(self.tag).unwrap();
        buf.write_u32::<BigEndian>(self.residue).unwrap();
        buf.write_u8(self.status).unwrap();
        buf
    }

    /// Validate that this response answers the request carrying `tag`.
    pub fn expect_tag(&self, tag: u32) -> Result<(), ProtocolError> {
        if self.tag != tag {
            return Err(ProtocolError::TagMismatch {
                expected: tag,
                actual: self.tag,
            });
        }
        Ok(())
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let op = OperationDescriptor {
            code: 20,
            subcode: 1,
            address: 0xDEAD_BEEF,
            length: 128,
        };
        let req = RequestFrame::new(op, Direction::In, 10, 128 * 512);
        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), REQUEST_SIZE);

        let parsed = RequestFrame::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.tag, req.tag);
        assert_eq!(parsed.length, 128 * 512);
        assert_eq!(parsed.direction, Direction::In);
        assert_eq!(parsed.op, op);
    }

    #[test]
    fn request_layout() {
        let op = OperationDescriptor {
            code: 0x1B,
            subcode: 0,
            address: 0,
            length: 0,
        };
        let mut req = RequestFrame::new(op, Direction::In, 6, 16);
        req.tag = 0x0102_0304;
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..4], b"USBC");
        // outer header is big-endian
        assert_eq!(&bytes[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 16]);
        assert_eq!(bytes[12], 0x80);
        assert_eq!(bytes[14], 6);
        assert_eq!(bytes[15], 0x1B);
    }

    #[test]
    fn response_roundtrip() {
        let resp = ResponseFrame {
            tag: 0xCAFE_F00D,
            residue: 3,
            status: STATUS_FAIL,
        };
        let parsed = ResponseFrame::from_bytes(&resp.to_bytes()).unwrap();
        assert_eq!(parsed.tag, 0xCAFE_F00D);
        assert_eq!(parsed.residue, 3);
        assert!(!parsed.is_ok());
    }

    #[test]
    fn response_bad_signature() {
        let mut bytes = ResponseFrame {
            tag: 1,
            residue: 0,
            status: STATUS_OK,
        }
        .to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            ResponseFrame::from_bytes(&bytes),
            Err(ProtocolError::BadSignature { .. })
        ));
    }

    #[test]
    fn response_short_frame() {
        assert!(matches!(
            ResponseFrame::from_bytes(b"USBS\x00\x00"),
            Err(ProtocolError::ShortFrame { .. })
        ));
    }

    #[test]
    fn tag_validation() {
        let resp = ResponseFrame {
            tag: 7,
            residue: 0,
            status: STATUS_OK,
        };
        assert!(resp.expect_tag(7).is_ok());
        assert!(matches!(
            resp.expect_tag(8),
            Err(ProtocolError::TagMismatch {
                expected: 8,
                actual: 7
            })
        ));
    }
}
