//! The cell key model: the `(row, column_family_id, column_qualifier, flag, timestamp,
//! revision)` tuple, its ascending sort order, and the comparator a skiplist-backed cell cache
//! is parameterized over.

use std::cmp::Ordering;

use bijective_enum_map::injective_enum_map;
use clone_behavior::{IndependentClone, MirroredClone, NearInstant, NonRecursive};
use integer_encoding::{VarInt as _, VarIntWriter as _};
use seekable_iterator::Comparator;

use crate::error::BlockError;


/// Sentinel meaning "no explicit timestamp was supplied"; the range server fills in a real
/// timestamp before the cell is durably written.
pub const TIMESTAMP_NULL: i64 = i64::MIN;

/// The smallest timestamp that can be explicitly assigned to a cell.
pub const TIMESTAMP_MIN: i64 = i64::MIN + 1;

/// The largest timestamp that can be explicitly assigned to a cell.
pub const TIMESTAMP_MAX: i64 = i64::MAX;

/// The smallest revision a range server can assign; revisions increase strictly from there.
pub const REVISION_MIN: i64 = i64::MIN;

/// A cell's flag, indicating whether it is a live value or one of the four tombstone scopes.
///
/// Ascending order: `DeleteRow < DeleteColumnFamily < DeleteCell < DeleteCellVersion < Insert`,
/// matching the key order in which a delete of broader scope sorts first and masks every insert
/// or narrower delete at or below its timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CellFlag {
    DeleteRow,
    DeleteColumnFamily,
    DeleteCell,
    DeleteCellVersion,
    Insert,
}

injective_enum_map! {
    CellFlag, u8,
    DeleteRow          <=> 0,
    DeleteColumnFamily <=> 1,
    DeleteCell         <=> 2,
    DeleteCellVersion  <=> 3,
    Insert             <=> 4,
}

impl CellFlag {
    #[must_use]
    pub fn from_byte(byte: u8) -> Result<Self, BlockError> {
        Self::try_from(byte).map_err(|()| BlockError::BadHeader)
    }

    #[must_use]
    pub const fn is_delete(self) -> bool {
        !matches!(self, Self::Insert)
    }
}

/// An owned cell key: `(row, column_family_id, column_qualifier, flag, timestamp, revision)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellKey {
    pub row:               Vec<u8>,
    pub column_family_id:  u8,
    pub column_qualifier:  Vec<u8>,
    pub flag:              CellFlag,
    pub timestamp:         i64,
    pub revision:          i64,
}

impl CellKey {
    #[must_use]
    pub fn new(
        row:              impl Into<Vec<u8>>,
        column_family_id: u8,
        column_qualifier: impl Into<Vec<u8>>,
        flag:             CellFlag,
        timestamp:        i64,
        revision:         i64,
    ) -> Self {
        Self {
            row: row.into(),
            column_family_id,
            column_qualifier: column_qualifier.into(),
            flag,
            timestamp,
            revision,
        }
    }

    /// Appends this key, varint length-prefixed, to `output`. [`decode_key_prefix`] reverses
    /// this to recover the same fields from the front of a byte slice.
    pub fn append_encoded(&self, output: &mut Vec<u8>) {
        let _ = output.write_varint(self.row.len());
        output.extend_from_slice(&self.row);
        output.push(self.column_family_id);
        let _ = output.write_varint(self.column_qualifier.len());
        output.extend_from_slice(&self.column_qualifier);
        output.push(u8::from(self.flag));
        output.extend_from_slice(&self.timestamp.to_be_bytes());
        output.extend_from_slice(&self.revision.to_be_bytes());
    }

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.row.len().required_space()
            + self.row.len()
            + 1
            + self.column_qualifier.len().required_space()
            + self.column_qualifier.len()
            + 1
            + 8
            + 8
    }
}

/// A borrowed view of a [`CellKey`]'s fields, as decoded from an entry's byte prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellKeyRef<'a> {
    pub row:              &'a [u8],
    pub column_family_id: u8,
    pub column_qualifier: &'a [u8],
    pub flag:             CellFlag,
    pub timestamp:        i64,
    pub revision:         i64,
}

/// Decodes a [`CellKeyRef`] from the front of `entry`, returning it along with the remaining
/// (unparsed) suffix of `entry`, which holds whatever value bytes the caller appended after
/// [`CellKey::append_encoded`].
pub fn decode_key_prefix(entry: &[u8]) -> Result<(CellKeyRef<'_>, &[u8]), BlockError> {
    let (row_len, used) = usize::decode_var(entry).ok_or(BlockError::BadHeader)?;
    let rest = entry.get(used..).ok_or(BlockError::BadHeader)?;
    let (row, rest) = split_at(rest, row_len)?;

    let (&column_family_id, rest) = rest.split_first().ok_or(BlockError::BadHeader)?;

    let (cq_len, used) = usize::decode_var(rest).ok_or(BlockError::BadHeader)?;
    let rest = rest.get(used..).ok_or(BlockError::BadHeader)?;
    let (column_qualifier, rest) = split_at(rest, cq_len)?;

    let (&flag_byte, rest) = rest.split_first().ok_or(BlockError::BadHeader)?;
    let flag = CellFlag::from_byte(flag_byte)?;

    let (timestamp_bytes, rest) = split_at(rest, 8)?;
    let timestamp = i64::from_be_bytes(timestamp_bytes.try_into().unwrap());

    let (revision_bytes, rest) = split_at(rest, 8)?;
    let revision = i64::from_be_bytes(revision_bytes.try_into().unwrap());

    Ok((
        CellKeyRef { row, column_family_id, column_qualifier, flag, timestamp, revision },
        rest,
    ))
}

fn split_at(data: &[u8], at: usize) -> Result<(&[u8], &[u8]), BlockError> {
    if at > data.len() {
        Err(BlockError::BadHeader)
    } else {
        Ok(data.split_at(at))
    }
}

/// Orders two decoded keys: `row` asc, `column_family_id` asc, `column_qualifier` asc, `flag`
/// asc, `timestamp` desc, `revision` desc. Two entries with identical `(row, cf, cq, flag,
/// timestamp)` but distinct `revision` are distinct, ordered by descending revision.
#[must_use]
pub fn cmp_keys(lhs: &CellKeyRef<'_>, rhs: &CellKeyRef<'_>) -> Ordering {
    lhs.row.cmp(rhs.row)
        .then_with(|| lhs.column_family_id.cmp(&rhs.column_family_id))
        .then_with(|| lhs.column_qualifier.cmp(rhs.column_qualifier))
        .then_with(|| lhs.flag.cmp(&rhs.flag))
        .then_with(|| rhs.timestamp.cmp(&lhs.timestamp))
        .then_with(|| rhs.revision.cmp(&lhs.revision))
}

/// A [`Comparator`] over encoded cell entries (see [`CellKey::append_encoded`]), used to
/// parameterize the cell cache's skiplist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellKeyComparator;

impl Comparator<[u8]> for CellKeyComparator {
    fn cmp(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        let (lhs, _) = decode_key_prefix(lhs).expect("cache entries are always well-formed");
        let (rhs, _) = decode_key_prefix(rhs).expect("cache entries are always well-formed");
        cmp_keys(&lhs, &rhs)
    }
}

impl NonRecursive for CellKeyComparator {}

impl IndependentClone<NearInstant> for CellKeyComparator {
    #[inline]
    fn independent_clone(&self) -> Self {
        Self
    }
}

impl MirroredClone<NearInstant> for CellKeyComparator {
    #[inline]
    fn mirrored_clone(&self) -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use super::{CellFlag, CellKey, cmp_keys, decode_key_prefix};

    fn key(row: &str, cf: u8, cq: &str, flag: CellFlag, ts: i64, rev: i64) -> CellKey {
        CellKey::new(row.as_bytes(), cf, cq.as_bytes(), flag, ts, rev)
    }

    fn encode(key: &CellKey) -> Vec<u8> {
        let mut buf = Vec::new();
        key.append_encoded(&mut buf);
        buf.extend_from_slice(b"value");
        buf
    }

    #[test]
    fn row_then_cf_then_cq_ascend() {
        let a = encode(&key("a", 1, "x", CellFlag::Insert, 100, 1));
        let b = encode(&key("b", 1, "x", CellFlag::Insert, 100, 1));
        let (a, _) = decode_key_prefix(&a).unwrap();
        let (b, _) = decode_key_prefix(&b).unwrap();
        assert!(cmp_keys(&a, &b).is_lt());
    }

    #[test]
    fn delete_flags_sort_before_insert() {
        let del = encode(&key("r", 1, "", CellFlag::DeleteRow, 100, 1));
        let ins = encode(&key("r", 1, "", CellFlag::Insert, 100, 1));
        let (del, _) = decode_key_prefix(&del).unwrap();
        let (ins, _) = decode_key_prefix(&ins).unwrap();
        assert!(cmp_keys(&del, &ins).is_lt());
    }

    #[test]
    fn timestamp_and_revision_descend() {
        let newer = encode(&key("r", 1, "", CellFlag::Insert, 200, 5));
        let older = encode(&key("r", 1, "", CellFlag::Insert, 100, 1));
        let (newer, _) = decode_key_prefix(&newer).unwrap();
        let (older, _) = decode_key_prefix(&older).unwrap();
        assert!(cmp_keys(&newer, &older).is_lt());
    }

    #[test]
    fn same_timestamp_orders_by_descending_revision() {
        let high_rev = encode(&key("r", 1, "", CellFlag::Insert, 100, 9));
        let low_rev = encode(&key("r", 1, "", CellFlag::Insert, 100, 1));
        let (high_rev, _) = decode_key_prefix(&high_rev).unwrap();
        let (low_rev, _) = decode_key_prefix(&low_rev).unwrap();
        assert!(cmp_keys(&high_rev, &low_rev).is_lt());
    }

    #[test]
    fn round_trips_all_fields() {
        let original = key("row-1", 7, "qualifier", CellFlag::DeleteCellVersion, -42, 99);
        let encoded = encode(&original);
        let (decoded, suffix) = decode_key_prefix(&encoded).unwrap();
        assert_eq!(decoded.row, original.row.as_slice());
        assert_eq!(decoded.column_family_id, original.column_family_id);
        assert_eq!(decoded.column_qualifier, original.column_qualifier.as_slice());
        assert_eq!(decoded.flag, original.flag);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.revision, original.revision);
        assert_eq!(suffix, b"value");
    }
}
