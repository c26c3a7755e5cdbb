// Embedding quantization, similarity, and content hashing
//
// *Le Codec* (The Codec) - Int8/float16 vector compression and SHA-256 fingerprints

use sha2::{Digest, Sha256};

use crate::error::{MemoryError, Result};

/// Quantize one component to int8: `clamp(round(v * 127), -128, 127)`.
#[inline]
pub fn quantize_i8(v: f32) -> i8 {
    (v * 127.0).round().clamp(-128.0, 127.0) as i8
}

/// Dequantize one int8 component back to float32.
#[inline]
pub fn dequantize_i8(v: i8) -> f32 {
    v as f32 / 127.0
}

/// Quantize a vector to int8 for COLD-tier storage.
pub fn quantize_vec_i8(vector: &[f32]) -> Vec<i8> {
    vector.iter().copied().map(quantize_i8).collect()
}

/// Dequantize an int8 vector back to float32.
pub fn dequantize_vec_i8(vector: &[i8]) -> Vec<f32> {
    vector.iter().copied().map(dequantize_i8).collect()
}

/// Convert a float32 to IEEE-754 binary16 bits (1 sign / 5 exponent / 10 mantissa).
///
/// Rounds to nearest even. Subnormals, ±∞, and NaN all map to their
/// half-precision bit patterns.
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mant = bits & 0x007f_ffff;

    if exp == 0xff {
        if mant == 0 {
            return sign | 0x7c00; // ±∞
        }
        // NaN: carry the payload's top bits, quieting if they truncate away
        let payload = (mant >> 13) as u16 & 0x03ff;
        return sign | 0x7c00 | if payload == 0 { 0x0200 } else { payload };
    }

    let half_exp = exp - 127 + 15;
    if half_exp >= 31 {
        return sign | 0x7c00; // overflow to ±∞
    }

    if half_exp <= 0 {
        if half_exp < -10 {
            return sign; // underflow to ±0
        }
        // Subnormal half: shift the full 24-bit significand into 10 bits
        let full = mant | 0x0080_0000;
        let shift = (14 - half_exp) as u32;
        let half_mant = (full >> shift) as u16;
        let round_bit = 1u32 << (shift - 1);
        if (full & round_bit) != 0 && ((full & (round_bit - 1)) != 0 || (half_mant & 1) == 1) {
            return sign | (half_mant + 1);
        }
        return sign | half_mant;
    }

    let half_mant = (mant >> 13) as u16;
    let out = sign | ((half_exp as u16) << 10) | half_mant;
    // Round to nearest even on the 13 dropped bits; a mantissa carry
    // rolls into the exponent with the correct result
    let round_bit = 1u32 << 12;
    if (mant & round_bit) != 0 && ((mant & (round_bit - 1)) != 0 || (half_mant & 1) == 1) {
        out + 1
    } else {
        out
    }
}

/// Convert IEEE-754 binary16 bits back to float32.
pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exp = ((bits >> 10) & 0x1f) as u32;
    let mant = (bits & 0x03ff) as u32;

    if exp == 0 {
        if mant == 0 {
            return f32::from_bits(sign); // ±0
        }
        // Subnormal half: renormalize into the float32 exponent range
        let mut exp32: u32 = 127 - 15 + 1;
        let mut m = mant;
        while m & 0x0400 == 0 {
            m <<= 1;
            exp32 -= 1;
        }
        return f32::from_bits(sign | (exp32 << 23) | ((m & 0x03ff) << 13));
    }

    if exp == 31 {
        return f32::from_bits(sign | 0x7f80_0000 | (mant << 13)); // ±∞ / NaN
    }

    f32::from_bits(sign | ((exp + 127 - 15) << 23) | (mant << 13))
}

/// Quantize a vector to float16 bit patterns for WARM-tier storage.
pub fn quantize_vec_f16(vector: &[f32]) -> Vec<u16> {
    vector.iter().copied().map(f32_to_f16_bits).collect()
}

/// Decode float16 bit patterns back to float32.
pub fn dequantize_vec_f16(vector: &[u16]) -> Vec<f32> {
    vector.iter().copied().map(f16_bits_to_f32).collect()
}

/// Calculate cosine similarity between two vectors.
///
/// Dimension mismatch is a hard error; a denominator below 1e-9 yields 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(MemoryError::DimensionMismatch {
            expected: a.len(),
            got: b.len(),
        });
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for i in 0..a.len() {
        dot += a[i] as f64 * b[i] as f64;
        norm_a += a[i] as f64 * a[i] as f64;
        norm_b += b[i] as f64 * b[i] as f64;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-9 {
        return Ok(0.0);
    }
    Ok((dot / denom) as f32)
}

/// SHA-256 content hash of `text ‖ salt`, hex encoded.
pub fn content_hash(text: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 fingerprint of an embedding.
///
/// Components are formatted to 8 decimal digits before hashing so the
/// fingerprint is stable across platforms.
pub fn embedding_fingerprint(vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for v in vector {
        hasher.update(format!("{v:.8}").as_bytes());
    }
    hex::encode(hasher.finalize())
}
