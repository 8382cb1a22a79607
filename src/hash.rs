//! Double SHA-256 over 80-byte block headers.
//!
//! Work data is kept as 128 bytes: the header in wire order followed by the
//! SHA-256 padding for an 80-byte message, so the second 64-byte block can be
//! compressed straight from a cached midstate. Hashes and targets are 256-bit
//! little-endian numbers.

use sha2::digest::generic_array::GenericArray;
use sha2::{Digest, Sha256};

pub const DATA_LEN: usize = 128;
pub const HEADER_LEN: usize = 80;

pub const PREV_HASH_OFFSET: usize = 4;
pub const NTIME_OFFSET: usize = 68;
pub const NBITS_OFFSET: usize = 72;
pub const NONCE_OFFSET: usize = 76;

/// Nonce position inside the second compression block.
pub const TAIL_NONCE_OFFSET: usize = NONCE_OFFSET - 64;

/// Difficulty-1 share target (`0x00000000ffff0000...`).
pub const DIFF1_TARGET: [u8; 32] = {
    let mut t = [0u8; 32];
    t[26] = 0xff;
    t[27] = 0xff;
    t
};

const SHA256_IV: [u32; 8] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

fn compress(state: &mut [u32; 8], block: &[u8]) {
    let block = GenericArray::clone_from_slice(block);
    sha2::compress256(state, std::slice::from_ref(&block));
}

fn state_to_bytes(state: &[u32; 8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (chunk, word) in out.chunks_exact_mut(4).zip(state) {
        chunk.copy_from_slice(&word.to_be_bytes());
    }
    out
}

/// Appends SHA-256 padding for an 80-byte message.
pub fn pad_header(header: &[u8; HEADER_LEN]) -> [u8; DATA_LEN] {
    let mut data = [0u8; DATA_LEN];
    data[..HEADER_LEN].copy_from_slice(header);
    data[HEADER_LEN] = 0x80;
    // 640 bits
    data[126] = 0x02;
    data[127] = 0x80;
    data
}

/// SHA-256 state after the first 64 bytes of `data`.
pub fn midstate(data: &[u8; DATA_LEN]) -> [u32; 8] {
    let mut state = SHA256_IV;
    compress(&mut state, &data[..64]);
    state
}

/// Finishes the double hash from a midstate and the padded second block.
pub fn hash_from_midstate(midstate: &[u32; 8], tail: &[u8; 64]) -> [u8; 32] {
    let mut state = *midstate;
    compress(&mut state, tail);

    let mut block = [0u8; 64];
    block[..32].copy_from_slice(&state_to_bytes(&state));
    block[32] = 0x80;
    // 256 bits
    block[62] = 0x01;

    let mut state = SHA256_IV;
    compress(&mut state, &block);
    state_to_bytes(&state)
}

/// Plain double SHA-256 of an arbitrary message.
pub fn sha256d(message: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(message);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// Exact 256-bit comparison: `hash <= target`, both little-endian.
pub fn meets_target(hash: &[u8; 32], target: &[u8; 32]) -> bool {
    for i in (0..32).rev() {
        if hash[i] != target[i] {
            return hash[i] < target[i];
        }
    }
    true
}

/// Expands a compact `nbits` value into a little-endian 256-bit target.
pub fn target_from_nbits(nbits: u32) -> [u8; 32] {
    let exponent = (nbits >> 24) as usize;
    let mut mantissa = nbits & 0x007f_ffff;
    let mut target = [0u8; 32];
    if exponent <= 3 {
        mantissa >>= 8 * (3 - exponent);
        target[..3].copy_from_slice(&mantissa.to_le_bytes()[..3]);
    } else {
        let shift = exponent - 3;
        for (i, b) in mantissa.to_le_bytes()[..3].iter().enumerate() {
            if shift + i < 32 {
                target[shift + i] = *b;
            }
        }
    }
    target
}

pub fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

pub fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS_HEADER: &str = concat!(
        "01000000",
        "0000000000000000000000000000000000000000000000000000000000000000",
        "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
        "29ab5f49",
        "ffff001d",
        "1dac2b7c",
    );

    fn genesis() -> [u8; HEADER_LEN] {
        hex::decode(GENESIS_HEADER).unwrap().try_into().unwrap()
    }

    #[test]
    fn genesis_hash_matches_known_value() {
        let mut hash = sha256d(&genesis());
        hash.reverse();
        assert_eq!(
            hex::encode(hash),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn midstate_path_equals_plain_double_hash() {
        let data = pad_header(&genesis());
        let mid = midstate(&data);
        let tail: [u8; 64] = data[64..].try_into().unwrap();
        assert_eq!(hash_from_midstate(&mid, &tail), sha256d(&data[..HEADER_LEN]));

        let mut other = data;
        write_u32_le(&mut other, NONCE_OFFSET, 12345);
        let tail: [u8; 64] = other[64..].try_into().unwrap();
        assert_eq!(hash_from_midstate(&mid, &tail), sha256d(&other[..HEADER_LEN]));
    }

    #[test]
    fn genesis_meets_its_own_block_target() {
        let header = genesis();
        let hash = sha256d(&header);
        let nbits = read_u32_le(&header, NBITS_OFFSET);
        assert_eq!(nbits, 0x1d00ffff);
        assert_eq!(target_from_nbits(nbits), DIFF1_TARGET);
        assert!(meets_target(&hash, &DIFF1_TARGET));
    }

    #[test]
    fn target_comparison_is_exact() {
        let target = DIFF1_TARGET;
        assert!(meets_target(&target, &target));

        let mut above = target;
        above[0] = 1;
        assert!(!meets_target(&above, &target));

        let mut below = target;
        below[27] = 0xfe;
        below[0] = 0xff;
        assert!(meets_target(&below, &target));

        assert!(!meets_target(&[0xff; 32], &[0u8; 32]));
        assert!(meets_target(&[0u8; 32], &[0u8; 32]));
    }

    #[test]
    fn small_exponent_shifts_mantissa_down() {
        let target = target_from_nbits(0x0200_8000);
        assert_eq!(target[0], 0x80);
        assert!(target[1..].iter().all(|b| *b == 0));
    }
}
