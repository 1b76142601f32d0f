//! Decompression of directories and metadata.
//!
//! Tiles are returned as stored, callers decompress them according to
//! [`Header::tile_compression`][crate::Header::tile_compression] if needed.
use std::borrow::Cow;

use crate::{
    error::{ErrorInner, Result},
    header::Compression,
};

/// Decompress `raw` with `method`, refusing to produce more than `limit` bytes.
///
/// [`Compression::NONE`] borrows the input as-is.
pub fn decompress(raw: &[u8], method: Compression, limit: usize) -> Result<Cow<'_, [u8]>> {
    match method {
        Compression::NONE => {
            if raw.len() > limit {
                bail!(ErrorInner::BlockTooLarge {
                    limit,
                    got: raw.len() as u64,
                });
            }
            Ok(Cow::Borrowed(raw))
        }
        #[cfg(feature = "gzip")]
        Compression::GZIP => {
            use std::io::Read;

            let mut out = Vec::new();
            flate2::read::GzDecoder::new(raw)
                .take((limit as u64).saturating_add(1))
                .read_to_end(&mut out)
                .map_err(ErrorInner::Decompress)?;
            if out.len() > limit {
                bail!(ErrorInner::BlockTooLarge {
                    limit,
                    got: out.len() as u64,
                });
            }
            Ok(Cow::Owned(out))
        }
        #[cfg(feature = "zstd")]
        Compression::ZSTD => {
            let size = match zstd_safe::get_frame_content_size(raw) {
                Ok(Some(size)) => size,
                Ok(None) | Err(_) => bail!(ErrorInner::Decompress(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "zstd frame without a valid content size",
                ))),
            };
            if size > limit as u64 {
                bail!(ErrorInner::BlockTooLarge { limit, got: size });
            }
            let mut out = Vec::with_capacity(size as usize);
            zstd_safe::decompress(&mut out, raw).map_err(|code| {
                ErrorInner::Decompress(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    zstd_safe::get_error_name(code),
                ))
            })?;
            Ok(Cow::Owned(out))
        }
        // Not supported: BROTLI, UNKNOWN, and anything disabled by features.
        method => Err(ErrorInner::UnsupportedCompression(method).into()),
    }
}
