//! The commit log's only on-disk unit: a framed block (see `ht_format`, §4.1) whose payload is
//! either a packed series of `(table_identifier, mutations)` sections (a data block) or a single
//! filesystem path (a link block pointing at another log directory). A fragment file is simply a
//! back-to-back sequence of these blocks; there is no secondary record-splitting layer underneath.

use std::io::Read;

use integer_encoding::{VarInt as _, VarIntWriter as _};

use ht_format::{CompressionType, inflate_with_extra};

use crate::error::LogReadError;

/// Commit-log data block magic: carries `(table_identifier, mutations)` sections.
pub const DATA_MAGIC: [u8; 10] = *b"HTCommitLD";
/// Commit-log link block magic: carries a single filesystem path to another log directory.
pub const LINK_MAGIC: [u8; 10] = *b"HTCommitLL";

/// Length, in bytes, of the extra header field every commit-log block carries: the block's
/// maximum revision.
const EXTRA_HEADER_LEN: usize = 8;

/// Length of a commit-log block's framing prefix (base header, revision, header checksum) that
/// must be read before the compressed payload's length is known.
const PREFIX_LEN: usize = ht_format::BASE_HEADER_LEN + EXTRA_HEADER_LEN + ht_format::HEADER_CHECKSUM_LEN;

/// Builds a framed data block whose payload is `sections`, each a `(table_identifier,
/// mutations)` pair, with the block header's revision set to `revision` (the block's maximum
/// observed revision, per the group-commit writer).
pub fn build_data_block(
    sections:    &[(&str, &[u8])],
    revision:    i64,
    compression: CompressionType,
) -> Result<Vec<u8>, ht_format::BlockError> {
    let mut payload = Vec::new();
    let _ = payload.write_varint(sections.len());
    for (table_identifier, mutations) in sections {
        let id_bytes = table_identifier.as_bytes();
        let _ = payload.write_varint(id_bytes.len());
        payload.extend_from_slice(id_bytes);
        let _ = payload.write_varint(mutations.len());
        payload.extend_from_slice(mutations);
    }

    ht_format::deflate(DATA_MAGIC, &payload, compression, &revision.to_be_bytes())
}

/// Builds a framed link block pointing at `target_dir`, another log directory to recurse into
/// during replay.
pub fn build_link_block(
    target_dir:  &str,
    revision:    i64,
    compression: CompressionType,
) -> Result<Vec<u8>, ht_format::BlockError> {
    ht_format::deflate(LINK_MAGIC, target_dir.as_bytes(), compression, &revision.to_be_bytes())
}

/// A parsed commit-log block: either data sections to replay, or a link to another directory.
#[derive(Debug, Clone)]
pub enum ParsedBlock {
    Data { revision: i64, sections: Vec<(String, Vec<u8>)> },
    Link { revision: i64, target_dir: String },
}

/// Parses a framed commit-log block, dispatching on its magic.
pub fn parse_block(block: &[u8]) -> Result<ParsedBlock, LogReadError> {
    if block.len() < ht_format::MAGIC_LEN {
        return Err(LogReadError::Block(ht_format::BlockError::BadHeader));
    }
    let magic: [u8; 10] = block[..ht_format::MAGIC_LEN].try_into().unwrap();

    if magic == DATA_MAGIC {
        let (header, extra, payload) = inflate_with_extra(block, DATA_MAGIC, EXTRA_HEADER_LEN)?;
        let _ = header;
        let revision = i64::from_be_bytes(extra.try_into().unwrap());
        let sections = decode_data_payload(&payload)?;
        Ok(ParsedBlock::Data { revision, sections })
    } else if magic == LINK_MAGIC {
        let (header, extra, payload) = inflate_with_extra(block, LINK_MAGIC, EXTRA_HEADER_LEN)?;
        let _ = header;
        let revision = i64::from_be_bytes(extra.try_into().unwrap());
        let target_dir = String::from_utf8(payload)
            .map_err(|_err| LogReadError::Block(ht_format::BlockError::BadHeader))?;
        Ok(ParsedBlock::Link { revision, target_dir })
    } else {
        Err(LogReadError::Block(ht_format::BlockError::BadMagic))
    }
}

fn decode_data_payload(payload: &[u8]) -> Result<Vec<(String, Vec<u8>)>, LogReadError> {
    let bad = || LogReadError::Block(ht_format::BlockError::BadHeader);

    let (count, used) = usize::decode_var(payload).ok_or_else(bad)?;
    let mut rest = payload.get(used..).ok_or_else(bad)?;
    let mut sections = Vec::with_capacity(count);

    for _ in 0..count {
        let (id_len, used) = usize::decode_var(rest).ok_or_else(bad)?;
        rest = rest.get(used..).ok_or_else(bad)?;
        let (id_bytes, after_id) = split_at(rest, id_len)?;
        let table_identifier = String::from_utf8(id_bytes.to_vec()).map_err(|_err| bad())?;

        let (mutations_len, used) = usize::decode_var(after_id).ok_or_else(bad)?;
        let after_id = after_id.get(used..).ok_or_else(bad)?;
        let (mutations, after_mutations) = split_at(after_id, mutations_len)?;

        sections.push((table_identifier, mutations.to_vec()));
        rest = after_mutations;
    }

    Ok(sections)
}

fn split_at(data: &[u8], at: usize) -> Result<(&[u8], &[u8]), LogReadError> {
    if at > data.len() {
        Err(LogReadError::Block(ht_format::BlockError::BadHeader))
    } else {
        Ok(data.split_at(at))
    }
}

/// Reads a sequence of framed commit-log blocks out of `file` back-to-back, calling `on_block`
/// with each complete block's raw bytes (still in need of [`parse_block`]) and the file offset it
/// started at. A short read of the fixed-length prefix ends the stream quietly — the tail of a
/// fragment a writer never finished a block in is not corruption. A prefix that reads in full but
/// fails to decode is reported through `on_error`; replay always stops after that, since a bad
/// header length leaves no way to find the next block's boundary.
pub(crate) fn read_block_stream<File, OnBlock, OnError>(
    mut file:  File,
    mut on_block: OnBlock,
    mut on_error: OnError,
) -> std::io::Result<()>
where
    File:    Read,
    OnBlock: FnMut(&[u8], u64),
    OnError: FnMut(LogReadError),
{
    let mut offset: u64 = 0;

    loop {
        let mut prefix = vec![0_u8; PREFIX_LEN];
        let read = read_up_to(&mut file, &mut prefix)?;
        if read == 0 {
            return Ok(());
        }
        if read < PREFIX_LEN {
            return Ok(());
        }

        let (header, _) = match ht_format::BlockHeader::decode(&prefix) {
            Ok(decoded) => decoded,
            Err(err) => {
                on_error(LogReadError::Block(err));
                return Ok(());
            }
        };

        let total_len = PREFIX_LEN as u64 + u64::from(header.compressed_len);
        let mut block = vec![0_u8; total_len as usize];
        block[..PREFIX_LEN].copy_from_slice(&prefix);
        let tail_read = read_up_to(&mut file, &mut block[PREFIX_LEN..])?;
        if tail_read < block.len() - PREFIX_LEN {
            return Ok(());
        }

        on_block(&block, offset);
        offset += total_len;
    }
}

/// Reads into `buf` until it is full, the file is exhausted, or an error other than interruption
/// occurs; returns how many bytes were actually read.
fn read_up_to<File: Read>(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::{ParsedBlock, build_data_block, build_link_block, parse_block, read_block_stream};
    use ht_format::CompressionType;

    #[test]
    fn round_trips_a_data_block() {
        let sections: Vec<(&str, &[u8])> = vec![("t1", b"mutation-bytes")];
        let block = build_data_block(&sections, 42, CompressionType::None).unwrap();
        match parse_block(&block).unwrap() {
            ParsedBlock::Data { revision, sections } => {
                assert_eq!(revision, 42);
                assert_eq!(sections, vec![("t1".to_string(), b"mutation-bytes".to_vec())]);
            }
            ParsedBlock::Link { .. } => panic!("expected a data block"),
        }
    }

    #[test]
    fn round_trips_a_link_block() {
        let block = build_link_block("/logs/other-range", 7, CompressionType::Zlib).unwrap();
        match parse_block(&block).unwrap() {
            ParsedBlock::Link { revision, target_dir } => {
                assert_eq!(revision, 7);
                assert_eq!(target_dir, "/logs/other-range");
            }
            ParsedBlock::Data { .. } => panic!("expected a link block"),
        }
    }

    #[test]
    fn rejects_truncated_block() {
        assert!(parse_block(b"short").is_err());
    }

    #[test]
    fn stream_yields_each_block_back_to_back() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&build_data_block(&[("t1", b"m1")], 1, CompressionType::None).unwrap());
        bytes.extend_from_slice(&build_link_block("/logs/other", 2, CompressionType::Zlib).unwrap());

        let mut seen = Vec::new();
        read_block_stream(
            std::io::Cursor::new(bytes),
            |block, offset| seen.push((parse_block(block).unwrap(), offset)),
            |err| panic!("unexpected corruption: {err}"),
        ).unwrap();

        assert_eq!(seen.len(), 2);
        match &seen[0].0 {
            ParsedBlock::Data { revision, sections } => {
                assert_eq!(*revision, 1);
                assert_eq!(sections, &[("t1".to_string(), b"m1".to_vec())]);
            }
            ParsedBlock::Link { .. } => panic!("expected a data block first"),
        }
        assert_eq!(seen[0].1, 0);
        match &seen[1].0 {
            ParsedBlock::Link { revision, target_dir } => {
                assert_eq!(*revision, 2);
                assert_eq!(target_dir, "/logs/other");
            }
            ParsedBlock::Data { .. } => panic!("expected a link block second"),
        }
    }

    #[test]
    fn stream_ends_quietly_on_a_torn_trailing_block() {
        let mut bytes = build_data_block(&[("t1", b"m1")], 1, CompressionType::None).unwrap();
        bytes.extend_from_slice(&build_data_block(&[("t1", b"m2")], 2, CompressionType::None).unwrap());
        bytes.truncate(bytes.len() - 3);

        let mut seen = Vec::new();
        read_block_stream(
            std::io::Cursor::new(bytes),
            |block, _offset| seen.push(parse_block(block).unwrap()),
            |err| panic!("a torn trailing block is not corruption: {err}"),
        ).unwrap();

        assert_eq!(seen.len(), 1);
    }
}
