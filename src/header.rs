//! Message header codec.
//!
//! ## Wire format
//!
//! Every frame begins with a fixed 16-byte header, all fields in
//! network byte order:
//!
//! ```text
//! command:       u16  (2)
//! payload_size:  u16  (2)
//! data_type:     u16  (2)
//! element_count: u16  (2)
//! param1:        u32  (4)
//! param2:        u32  (4)
//! ```
//!
//! When the payload size or element count does not fit 16 bits
//! (protocol v4.9+), the size slot carries the sentinel `0xFFFF`, the
//! count slot carries `0`, and the true values follow as `u32` + `u32`
//! ("large payload" form, 24 bytes total). Both forms must be accepted
//! from the peer regardless of the locally negotiated revision.

use bytes::{Buf, BufMut};

use crate::error::CircuitError;
use crate::proto::{EXTENSION_BYTES, HEADER_BYTES, PAYLOAD_SIZE_SENTINEL};

/// A decoded (or to-be-encoded) message header.
///
/// `payload_size` and `element_count` are held widened to `u32` so one
/// struct serves both the compact and extended wire forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub element_count: u32,
    pub param1: u32,
    pub param2: u32,
}

impl MsgHeader {
    pub fn new(
        command: u16,
        payload_size: u32,
        data_type: u16,
        element_count: u32,
        param1: u32,
        param2: u32,
    ) -> Self {
        Self {
            command,
            payload_size,
            data_type,
            element_count,
            param1,
            param2,
        }
    }

    /// True when this header cannot be expressed in the compact form.
    pub fn needs_extension(&self) -> bool {
        self.payload_size >= PAYLOAD_SIZE_SENTINEL as u32
            || self.element_count > u16::MAX as u32
    }

    /// Bytes this header occupies on the wire.
    pub fn wire_len(&self) -> usize {
        if self.needs_extension() {
            HEADER_BYTES + EXTENSION_BYTES
        } else {
            HEADER_BYTES
        }
    }

    /// Encode into `dst`, choosing the compact or extended form.
    ///
    /// The extended form is only legal on v4.9+ circuits; callers gate
    /// on that before staging (`CircuitError::UnsupportedByService`).
    pub fn encode_into(&self, dst: &mut impl BufMut) {
        dst.put_u16(self.command);
        if self.needs_extension() {
            dst.put_u16(PAYLOAD_SIZE_SENTINEL);
            dst.put_u16(self.data_type);
            dst.put_u16(0);
            dst.put_u32(self.param1);
            dst.put_u32(self.param2);
            dst.put_u32(self.payload_size);
            dst.put_u32(self.element_count);
        } else {
            dst.put_u16(self.payload_size as u16);
            dst.put_u16(self.data_type);
            dst.put_u16(self.element_count as u16);
            dst.put_u32(self.param1);
            dst.put_u32(self.param2);
        }
    }

    /// Encode to a standalone byte vector (tests, single-shot frames).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        self.encode_into(&mut out);
        out
    }

    /// Decode the compact 16-byte form from `src`.
    ///
    /// The caller must have verified that 16 bytes are available. If the
    /// returned header's size slot holds the sentinel, the true payload
    /// size and element count follow on the wire as two `u32`s and must
    /// be patched in via [`MsgHeader::apply_extension`].
    pub fn decode(src: &mut impl Buf) -> Result<Self, CircuitError> {
        if src.remaining() < HEADER_BYTES {
            return Err(CircuitError::ProtocolViolation("truncated message header"));
        }
        Ok(Self {
            command: src.get_u16(),
            payload_size: src.get_u16() as u32,
            data_type: src.get_u16(),
            element_count: src.get_u16() as u32,
            param1: src.get_u32(),
            param2: src.get_u32(),
        })
    }

    /// True when the decoded compact form announces the extension.
    pub fn has_extension_sentinel(&self) -> bool {
        self.payload_size == PAYLOAD_SIZE_SENTINEL as u32
    }

    /// Patch in the extended payload size and element count.
    pub fn apply_extension(&mut self, payload_size: u32, element_count: u32) {
        self.payload_size = payload_size;
        self.element_count = element_count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_roundtrip() {
        let hdr = MsgHeader::new(15, 64, 6, 8, 0xCAFE_F00D, 0x1234_5678);
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_BYTES);

        let mut src = &bytes[..];
        let decoded = MsgHeader::decode(&mut src).unwrap();
        assert_eq!(decoded, hdr);
        assert!(!decoded.has_extension_sentinel());
    }

    #[test]
    fn extended_roundtrip() {
        let hdr = MsgHeader::new(4, 0x10000, 6, 0x2_0000, 7, 9);
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_BYTES + EXTENSION_BYTES);

        let mut src = &bytes[..];
        let mut decoded = MsgHeader::decode(&mut src).unwrap();
        assert!(decoded.has_extension_sentinel());
        assert_eq!(decoded.element_count, 0);

        let size = src.get_u32();
        let count = src.get_u32();
        decoded.apply_extension(size, count);
        assert_eq!(decoded, hdr);
    }

    #[test]
    fn sentinel_boundary() {
        // One byte below the sentinel stays compact.
        let hdr = MsgHeader::new(4, 0xFFFE, 0, 1, 0, 0);
        assert!(!hdr.needs_extension());
        assert_eq!(hdr.encode().len(), HEADER_BYTES);

        // A payload of exactly 0xFFFF must take the extended form: the
        // slot value is reserved for the sentinel itself.
        let hdr = MsgHeader::new(4, 0xFFFF, 0, 1, 0, 0);
        assert!(hdr.needs_extension());
        let bytes = hdr.encode();
        assert_eq!(bytes.len(), HEADER_BYTES + EXTENSION_BYTES);
        // size slot = sentinel, extension carries the true size.
        assert_eq!(&bytes[2..4], &[0xFF, 0xFF]);
        assert_eq!(&bytes[16..20], &[0x00, 0x00, 0xFF, 0xFF]);
        assert_eq!(&bytes[20..24], &1u32.to_be_bytes());
    }

    #[test]
    fn element_count_overflow_forces_extension() {
        let hdr = MsgHeader::new(1, 8, 5, 0x1_0000, 0, 0);
        assert!(hdr.needs_extension());
    }

    #[test]
    fn network_byte_order() {
        let hdr = MsgHeader::new(0x0102, 0x0304, 0x0506, 0x0708, 0x090A0B0C, 0x0D0E0F10);
        let bytes = hdr.encode();
        assert_eq!(
            bytes,
            vec![
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
                0x0E, 0x0F, 0x10
            ]
        );
    }

    #[test]
    fn truncated_decode_rejected() {
        let short = [0u8; 10];
        let mut src = &short[..];
        assert!(MsgHeader::decode(&mut src).is_err());
    }
}
