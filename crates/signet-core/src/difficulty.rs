//! Compact difficulty encoding.
//!
//! A 256-bit target is stored in four bytes: a one-byte exponent (the
//! target's length in bytes) and a three-byte mantissa, so that
//! `target = mantissa * 2^(8 * (exponent - 3))`. Bit 23 of the mantissa is a
//! sign bit; a set sign bit with a non-zero mantissa is a negative (invalid)
//! target.
//!
//! # Rounding
//!
//! [`target_to_nbits`] rounds **up**: when the target has significant bits
//! below the mantissa, the mantissa is incremented, so the encoded target is
//! never smaller (harder) than the one requested.

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use primitive_types::U256;

use crate::error::DifficultyError;

const SIGN_BIT: u32 = 0x0080_0000;
const MANTISSA_MASK: u32 = 0x007f_ffff;

/// Decode a compact target into its 256-bit value.
pub fn nbits_to_target(bits: u32) -> Result<U256, DifficultyError> {
    let exponent = (bits >> 24) as usize;
    let mantissa = bits & MANTISSA_MASK;

    if bits & SIGN_BIT != 0 && mantissa != 0 {
        return Err(DifficultyError::Negative(bits));
    }
    if mantissa == 0 {
        return Ok(U256::zero());
    }
    if exponent <= 3 {
        return Ok(U256::from(mantissa >> (8 * (3 - exponent))));
    }

    let shift = 8 * (exponent - 3);
    let mantissa_bits = 32 - mantissa.leading_zeros() as usize;
    if mantissa_bits + shift > 256 {
        return Err(DifficultyError::Overflow(bits));
    }
    Ok(U256::from(mantissa) << shift)
}

/// Encode a target as a compact value, rounding up.
///
/// Returns 0 for a zero target.
pub fn target_to_nbits(target: U256) -> u32 {
    if target.is_zero() {
        return 0;
    }

    let mut size = target.bits().div_ceil(8).max(3);
    // Keep the top mantissa byte below 0x80 so the sign bit stays clear.
    if target.bit(8 * size - 1) {
        size += 1;
    }

    let shift = 8 * (size - 3);
    let mut mantissa = (target >> shift).low_u32();
    if shift > 0 {
        let below = target & ((U256::one() << shift) - U256::one());
        if !below.is_zero() {
            mantissa += 1;
        }
    }

    // Rounding up can carry into the sign bit: 0x7fffff + 1 = 0x800000.
    // Dropping the low (zero) byte keeps the value exact.
    if mantissa & SIGN_BIT != 0 {
        mantissa >>= 8;
        size += 1;
    }

    ((size as u32) << 24) | mantissa
}

/// Encode a target as a compact value, rounding up, and require that the
/// result decodes.
///
/// Targets close to `2^256` round up past the largest representable compact
/// value and are rejected with [`DifficultyError::Overflow`].
pub fn target_to_nbits_checked(target: U256) -> Result<u32, DifficultyError> {
    let bits = target_to_nbits(target);
    nbits_to_target(bits)?;
    Ok(bits)
}

/// Compact target as a float, `mantissa * 2^(8 * (exponent - 3))`.
///
/// Used where only target ratios matter (scheduling, calibration).
pub fn nbits_to_f64(bits: u32) -> f64 {
    let exponent = (bits >> 24) as i32;
    let mantissa = (bits & 0x00ff_ffff) as f64;
    mantissa * 2f64.powi(8 * (exponent - 3))
}

/// Convert a 256-bit value to the nearest float.
pub fn target_to_f64(target: U256) -> f64 {
    target
        .0
        .iter()
        .enumerate()
        .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}

/// Truncate a non-negative float to a 256-bit integer, saturating at `U256::MAX`.
pub fn target_from_f64(value: f64) -> U256 {
    if value.is_nan() || value < 1.0 {
        return U256::zero();
    }
    if value.is_infinite() {
        return U256::MAX;
    }

    let raw = value.to_bits();
    let exponent = ((raw >> 52) & 0x7ff) as i32 - 1075;
    let mantissa = (raw & ((1u64 << 52) - 1)) | (1u64 << 52);

    if exponent >= 0 {
        if exponent as usize + 53 > 256 {
            return U256::MAX;
        }
        U256::from(mantissa) << exponent as usize
    } else {
        U256::from(mantissa >> (-exponent) as u32)
    }
}

/// Whether the header hash, read as a little-endian integer, meets its target.
pub fn check_pow(header: &Header) -> Result<bool, DifficultyError> {
    let target = nbits_to_target(header.bits.to_consensus())?;
    if target.is_zero() {
        return Err(DifficultyError::Zero);
    }
    let hash = U256::from_little_endian(header.block_hash().as_byte_array());
    Ok(hash <= target)
}
