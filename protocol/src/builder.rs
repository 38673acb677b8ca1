//! Encodes a `CCObj` onto the wire (§3, §6): `size:u32 | tag:u32 | [pow:48]
//! | body`. `size` counts everything from the tag onward, matching the
//! receiver's view in [`crate::convert`] which reads the header before it
//! knows how much more to read.

use crate::tags::has_pow;

pub const SIZE_LEN: usize = 4;
pub const TAG_LEN: usize = 4;
pub const HEADER_LEN: usize = SIZE_LEN + TAG_LEN;
pub const NONCE_COUNT: usize = 5;
pub const POW_BLOCK_LEN: usize = 8 + NONCE_COUNT * 8;

/// The proof-of-work block carried between the tag and the body of any
/// non-block object (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowBlock {
    pub timestamp: u64,
    pub nonces: [u64; NONCE_COUNT],
}

impl PowBlock {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        for n in &self.nonces {
            out.extend_from_slice(&n.to_le_bytes());
        }
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < POW_BLOCK_LEN {
            return None;
        }
        let timestamp = u64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let mut nonces = [0u64; NONCE_COUNT];
        for (i, n) in nonces.iter_mut().enumerate() {
            let off = 8 + i * 8;
            *n = u64::from_le_bytes(bytes[off..off + 8].try_into().ok()?);
        }
        Some(PowBlock { timestamp, nonces })
    }
}

/// Builds a complete wire message for `tag` carrying `body`. `pow` must be
/// `Some` exactly when [`has_pow`] says the tag requires it; callers that
/// get this wrong get a debug assertion rather than a silently malformed
/// message, since both sides of this boundary are local code.
pub fn encode_object(tag: u32, pow: Option<&PowBlock>, body: &[u8]) -> Vec<u8> {
    debug_assert_eq!(has_pow(tag), pow.is_some(), "pow presence must match tag");

    let pow_len = pow.map_or(0, |_| POW_BLOCK_LEN);
    let size = (TAG_LEN + pow_len + body.len()) as u32;

    let mut out = Vec::with_capacity(SIZE_LEN + size as usize);
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&tag.to_le_bytes());
    if let Some(pow) = pow {
        pow.encode(&mut out);
    }
    out.extend_from_slice(body);
    out
}

/// Encodes just the fixed 8-byte command/message header used to wrap a
/// `CC_CMD_*`/`CC_MSG_*` verb around a payload that is otherwise framed the
/// same way as an object.
pub fn encode_header(size: u32, tag: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0..4].copy_from_slice(&size.to_le_bytes());
    out[4..8].copy_from_slice(&tag.to_le_bytes());
    out
}
