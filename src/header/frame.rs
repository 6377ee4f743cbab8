use super::{check_crc, seal, sha256, HeaderError};
use crate::bits::Bits;

pub const FRAME_HEADER_BITS: usize = 352;

/// Leads the content of every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Content bits in this frame (setup-header tail plus payload), unpadded.
    pub payload_bit_len: u32,
    /// 1-based.
    pub frame_number:    u32,
    /// SHA-256 of the content bits as rendered, padding included.
    pub frame_sha256:    [u8; 32],
}

impl FrameHeader {
    pub fn new(frame_number: u32, payload_bit_len: u32, rendered_content: &Bits) -> Self {
        Self { payload_bit_len, frame_number, frame_sha256: content_hash(rendered_content) }
    }

    pub fn encode(&self) -> Bits {
        let mut bits = Bits::with_capacity(FRAME_HEADER_BITS);
        bits.push_uint(self.payload_bit_len as u64, 32);
        bits.push_uint(self.frame_number as u64, 32);
        bits.push_bytes(&self.frame_sha256);
        seal(bits)
    }

    pub fn decode(bits: &Bits) -> Result<Self, HeaderError> {
        check_crc(bits, FRAME_HEADER_BITS, HeaderError::FrameHeaderCorrupt)?;
        let mut cur = bits.cursor();
        Ok(Self {
            payload_bit_len: cur.read_uint(32)? as u32,
            frame_number:    cur.read_uint(32)? as u32,
            frame_sha256:    cur.read_array::<32>()?,
        })
    }

    pub fn matches(&self, rendered_content: &Bits) -> bool {
        content_hash(rendered_content) == self.frame_sha256
    }
}

/// Hash of a frame's content bits.
pub fn content_hash(bits: &Bits) -> [u8; 32] {
    sha256(bits.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_and_content_check() {
        let content = Bits::from_bytes(b"payload bits");
        let fh = FrameHeader::new(3, 96, &content);
        let bits = fh.encode();
        assert_eq!(bits.len(), FRAME_HEADER_BITS);
        let back = FrameHeader::decode(&bits).unwrap();
        assert_eq!(back, fh);
        assert!(back.matches(&content));
        assert!(!back.matches(&Bits::from_bytes(b"payload bitz")));
    }
}
