//! Byte-level compression codecs.
//!
//! Each supported [`Compression`] maps to one battle-tested codec crate.
//! Everything here is whole-buffer: objects in the warehouse are small enough
//! (one partition each) that streaming would buy nothing, and whole-buffer
//! keeps the corrupt-framing error surface in one place.

use std::io::{Read, Write};

use crate::codec::Compression;
use crate::error::{Error, FormatSnafu, Result};

fn framing_error(codec: &str, err: impl std::fmt::Display) -> Error {
    FormatSnafu {
        message: format!("corrupt {codec} framing: {err}"),
    }
    .build()
}

/// Compress `data` with the given codec at its default level.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::Gz => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| framing_error("gzip", e))
        }
        Compression::Bz2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| framing_error("bzip2", e))
        }
        Compression::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder
                .write_all(data)
                .map_err(|e| framing_error("lz4", e))?;
            encoder.finish().map_err(|e| framing_error("lz4", e))
        }
        Compression::Zst => zstd::stream::encode_all(data, 0).map_err(|e| framing_error("zstd", e)),
    }
}

/// Decompress `data`, failing with a format error on corrupt framing.
pub fn decompress(data: &[u8], compression: Compression) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match compression {
        Compression::Gz => flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| framing_error("gzip", e))?,
        Compression::Bz2 => bzip2::read::BzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| framing_error("bzip2", e))?,
        Compression::Lz4 => lz4_flex::frame::FrameDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| framing_error("lz4", e))?,
        Compression::Zst => zstd::stream::Decoder::new(data)
            .and_then(|mut dec| dec.read_to_end(&mut out))
            .map_err(|e| framing_error("zstd", e))?,
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_codecs_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog".repeat(100);
        for codec in [
            Compression::Gz,
            Compression::Bz2,
            Compression::Lz4,
            Compression::Zst,
        ] {
            let packed = compress(&payload, codec).expect("compress");
            assert_ne!(packed, payload);
            let unpacked = decompress(&packed, codec).expect("decompress");
            assert_eq!(unpacked, payload);
        }
    }

    #[test]
    fn corrupt_framing_is_a_format_error() {
        for codec in [
            Compression::Gz,
            Compression::Bz2,
            Compression::Lz4,
            Compression::Zst,
        ] {
            let err = decompress(b"definitely not compressed", codec).expect_err("corrupt");
            assert!(matches!(err, Error::Format { .. }), "{codec:?}: {err}");
        }
    }
}
