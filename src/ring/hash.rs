use serde::{Deserialize, Serialize};
use std::fmt;

/// Digest used to place nodes and keys on the ring.
///
/// The choice is part of the cluster contract: every member must hash with
/// the same algorithm or the ring topologies diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RingDigest {
    /// 128-bit MD5, compared lexicographically as bytes.
    Md5,
    /// 32-bit MurmurHash3 (x86 variant, fixed seed), compared as unsigned.
    Murmur3,
}

/// A position on the hash ring.
///
/// Always 16 bytes so positions from either digest share one total order.
/// The 32-bit murmur value is stored big-endian in the leading bytes, which
/// makes the lexicographic comparison identical to unsigned comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingPosition([u8; 16]);

impl RingDigest {
    pub fn position(self, data: &[u8]) -> RingPosition {
        match self {
            RingDigest::Md5 => {
                use md5::Digest;
                RingPosition(md5::Md5::digest(data).into())
            }
            RingDigest::Murmur3 => {
                let mut out = [0u8; 16];
                out[..4].copy_from_slice(&murmur3_32(data, 0).to_be_bytes());
                RingPosition(out)
            }
        }
    }
}

impl fmt::Debug for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingPosition({})", hex::encode(self.0))
    }
}

impl fmt::Display for RingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// MurmurHash3 x86 32-bit.
fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h = (h ^ k).rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, &b) in tail.iter().enumerate() {
            k |= (b as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
