//! The compression primitive.
//!
//! One try/decompress pair over LZ4 block compression. Callers treat
//! compression failure (incompressible data, or no room to win) as a
//! non-error and store the payload plain.

use strata_common::error::{StrataError, StrataResult};

/// Tries to compress `src` into at most `dst_capacity` bytes.
///
/// Returns `None` when the result would not fit in `dst_capacity` or
/// would not be smaller than the input.
#[must_use]
pub fn try_compress(src: &[u8], dst_capacity: usize) -> Option<Vec<u8>> {
    if src.is_empty() || dst_capacity == 0 {
        return None;
    }
    let mut dst = vec![0u8; dst_capacity];
    match lz4_flex::block::compress_into(src, &mut dst) {
        Ok(written) if written < src.len() => {
            dst.truncate(written);
            Some(dst)
        }
        _ => None,
    }
}

/// Decompresses `src` into a buffer of exactly `uncompressed_len` bytes.
pub fn decompress(src: &[u8], uncompressed_len: usize) -> StrataResult<Vec<u8>> {
    let mut dst = vec![0u8; uncompressed_len];
    let written = lz4_flex::block::decompress_into(src, &mut dst)
        .map_err(|e| StrataError::corruption(format!("decompression failed: {e}")))?;
    if written != uncompressed_len {
        return Err(StrataError::corruption(format!(
            "decompressed {written} bytes, expected {uncompressed_len}"
        )));
    }
    Ok(dst)
}
