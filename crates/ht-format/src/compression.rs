//! The closed set of block compressors, dispatched as a sum type: there is a fixed, small set
//! of formats, so a trait object would only add an indirection with nothing to show for it.

use bijective_enum_map::injective_enum_map;

use crate::error::BlockError;


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionType {
    None,
    Bmz,
    Zlib,
    Lzo,
    Quicklz,
    Snappy,
}

injective_enum_map! {
    CompressionType, u8,
    None    <=> 0,
    Bmz     <=> 1,
    Zlib    <=> 2,
    Lzo     <=> 3,
    Quicklz <=> 4,
    Snappy  <=> 5,
}

impl CompressionType {
    #[must_use]
    pub fn from_byte(byte: u8) -> Result<Self, BlockError> {
        Self::try_from(byte).map_err(|()| BlockError::UnsupportedType(byte))
    }
}

/// Compresses `payload`. The caller (see [`crate::block::deflate`]) is responsible for falling
/// back to [`CompressionType::None`] when the result is not actually smaller.
pub fn compress(payload: &[u8], compression: CompressionType) -> Result<Vec<u8>, BlockError> {
    match compression {
        CompressionType::None    => Ok(payload.to_vec()),
        CompressionType::Zlib    => compress_zlib(payload),
        CompressionType::Snappy  => Ok(snap::raw::Encoder::new().compress_vec(payload)
            .map_err(|_err| BlockError::InflateError)?),
        CompressionType::Bmz     => Ok(bmz::compress(payload)),
        CompressionType::Lzo     => Err(BlockError::UnsupportedType(u8::from(CompressionType::Lzo))),
        CompressionType::Quicklz => Err(BlockError::UnsupportedType(u8::from(CompressionType::Quicklz))),
    }
}

/// Decompresses `payload`, which is known to have inflated to `uncompressed_len` bytes.
pub fn decompress(
    payload:         &[u8],
    compression:     CompressionType,
    uncompressed_len: usize,
) -> Result<Vec<u8>, BlockError> {
    match compression {
        CompressionType::None => Ok(payload.to_vec()),
        CompressionType::Zlib => decompress_zlib(payload, uncompressed_len),
        CompressionType::Snappy => {
            let mut decoder = snap::raw::Decoder::new();
            decoder.decompress_vec(payload).map_err(|_err| BlockError::InflateError)
        }
        CompressionType::Bmz => bmz::decompress(payload, uncompressed_len),
        CompressionType::Lzo => Err(BlockError::UnsupportedType(u8::from(CompressionType::Lzo))),
        CompressionType::Quicklz => {
            Err(BlockError::UnsupportedType(u8::from(CompressionType::Quicklz)))
        }
    }
}

fn compress_zlib(payload: &[u8]) -> Result<Vec<u8>, BlockError> {
    let bound = zlib_rs::deflate::compress_bound(payload.len());
    let mut output = vec![0_u8; bound];

    let config = zlib_rs::deflate::DeflateConfig::default();
    let (written, status) = zlib_rs::deflate::compress_slice(&mut output, payload, config);

    if status != zlib_rs::ReturnCode::Ok {
        return Err(BlockError::InflateError);
    }
    output.truncate(written.len());
    Ok(output)
}

fn decompress_zlib(payload: &[u8], uncompressed_len: usize) -> Result<Vec<u8>, BlockError> {
    let mut output = vec![0_u8; uncompressed_len];
    let config = zlib_rs::inflate::InflateConfig::default();
    let (written, status) = zlib_rs::inflate::uncompress_slice(&mut output, payload, config);

    if status != zlib_rs::ReturnCode::Ok {
        return Err(BlockError::InflateError);
    }
    output.truncate(written.len());
    Ok(output)
}

/// A small run-length block codec used for the `Bmz` compression type.
///
/// Hypertable's own `BMZ` codec is a custom LZ variant with an undocumented wire format; this
/// module implements an independent, self-consistent run-length scheme under the same
/// compression-type tag rather than attempting byte-for-byte compatibility with it. See
/// `DESIGN.md` for the rationale.
mod bmz {
    const MIN_RUN: usize = 4;
    const TAG_LITERAL: u8 = 0;
    const TAG_RUN:     u8 = 1;

    pub(super) fn compress(payload: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(payload.len());
        let mut literal_start = 0;
        let mut i = 0;

        while i < payload.len() {
            let byte = payload[i];
            let mut run_len = 1;
            while i + run_len < payload.len() && payload[i + run_len] == byte {
                run_len += 1;
            }

            if run_len >= MIN_RUN {
                if literal_start < i {
                    write_literal(&mut output, &payload[literal_start..i]);
                }
                write_run(&mut output, byte, run_len);
                i += run_len;
                literal_start = i;
            } else {
                i += run_len;
            }
        }

        if literal_start < payload.len() {
            write_literal(&mut output, &payload[literal_start..]);
        }

        output
    }

    pub(super) fn decompress(
        mut input:        &[u8],
        uncompressed_len: usize,
    ) -> Result<Vec<u8>, super::BlockError> {
        use integer_encoding::VarInt as _;

        let mut output = Vec::with_capacity(uncompressed_len);
        while !input.is_empty() {
            let (tag, rest) = input.split_first().ok_or(super::BlockError::InflateError)?;
            let (len, len_size) = usize::decode_var(rest).ok_or(super::BlockError::InflateError)?;
            let rest = rest.get(len_size..).ok_or(super::BlockError::InflateError)?;

            match *tag {
                TAG_LITERAL => {
                    let (literal, rest) = split_at_checked(rest, len)?;
                    output.extend_from_slice(literal);
                    input = rest;
                }
                TAG_RUN => {
                    let (byte_slice, rest) = split_at_checked(rest, 1)?;
                    output.resize(output.len() + len, byte_slice[0]);
                    input = rest;
                }
                _ => return Err(super::BlockError::InflateError),
            }
        }

        if output.len() != uncompressed_len {
            return Err(super::BlockError::InflateError);
        }
        Ok(output)
    }

    fn split_at_checked(data: &[u8], at: usize) -> Result<(&[u8], &[u8]), super::BlockError> {
        if at > data.len() {
            Err(super::BlockError::InflateError)
        } else {
            Ok(data.split_at(at))
        }
    }

    fn write_literal(output: &mut Vec<u8>, literal: &[u8]) {
        use integer_encoding::VarIntWriter as _;
        output.push(TAG_LITERAL);
        let _ = output.write_varint(literal.len());
        output.extend_from_slice(literal);
    }

    fn write_run(output: &mut Vec<u8>, byte: u8, run_len: usize) {
        use integer_encoding::VarIntWriter as _;
        output.push(TAG_RUN);
        let _ = output.write_varint(run_len);
        output.push(byte);
    }

    #[cfg(test)]
    mod tests {
        use super::{compress, decompress};

        #[test]
        fn round_trips_runs_and_literals() {
            let data = b"aaaaaaaahello world!!!!!!!!!!!!bbbbbbbbbbb".to_vec();
            let compressed = compress(&data);
            let decompressed = decompress(&compressed, data.len()).unwrap();
            assert_eq!(decompressed, data);
        }

        #[test]
        fn round_trips_empty() {
            let compressed = compress(&[]);
            let decompressed = decompress(&compressed, 0).unwrap();
            assert!(decompressed.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CompressionType, compress, decompress};

    #[test]
    fn none_round_trips() {
        let data = b"unchanged payload".to_vec();
        let compressed = compress(&data, CompressionType::None).unwrap();
        assert_eq!(compressed, data);
        let decompressed = decompress(&compressed, CompressionType::None, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn zlib_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog, repeatedly repeatedly"
            .repeat(8);
        let compressed = compress(&data, CompressionType::Zlib).unwrap();
        let decompressed = decompress(&compressed, CompressionType::Zlib, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn snappy_round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog, repeatedly repeatedly"
            .repeat(8);
        let compressed = compress(&data, CompressionType::Snappy).unwrap();
        let decompressed = decompress(&compressed, CompressionType::Snappy, data.len()).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn lzo_is_unsupported() {
        assert!(compress(b"x", CompressionType::Lzo).is_err());
    }
}
