//! Binlog offset and watermark algebra.
//!
//! A [`BinlogOffset`] is a position `(filename, position, [gtid_set])` in a
//! MySQL server's binary log. Offsets from one server are totally ordered:
//! binlog files carry a monotonically increasing numeric suffix
//! (`mysql-bin.000003`), so `(file index, position)` orders any two
//! positions from the same log series. When the filenames do not belong to
//! the same series, ordering falls back to GTID-set subsumption; if that
//! also fails the offsets are incomparable and the algebra refuses rather
//! than guessing.
//!
//! Two sentinels exist: [`BinlogOffset::EARLIEST`] orders before every real
//! offset and [`BinlogOffset::NO_STOPPING`] after every real offset.

use crate::error::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A position in a MySQL server's binary log.
///
/// Equality is structural on all fields. Ordering is total within one log
/// series and goes through [`BinlogOffset::try_compare`], which can fail
/// with [`CdcError::IncomparableOffsets`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogOffset {
    /// Binlog filename, e.g. `mysql-bin.000003`. Empty for sentinels.
    pub filename: String,
    /// Byte position within the file.
    pub position: u64,
    /// Executed GTID set at this position, if the server runs with GTIDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gtid_set: Option<GtidSet>,
}

impl BinlogOffset {
    /// Sentinel ordering before every real offset.
    pub const EARLIEST: BinlogOffset = BinlogOffset {
        filename: String::new(),
        position: 0,
        gtid_set: None,
    };

    /// Sentinel ordering after every real offset. Used as the stop offset
    /// of an unbounded binlog split.
    pub const NO_STOPPING: BinlogOffset = BinlogOffset {
        filename: String::new(),
        position: u64::MAX,
        gtid_set: None,
    };

    /// Create an offset from a filename and byte position.
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        Self {
            filename: filename.into(),
            position,
            gtid_set: None,
        }
    }

    /// Attach an executed GTID set.
    pub fn with_gtid_set(mut self, gtid_set: GtidSet) -> Self {
        self.gtid_set = Some(gtid_set);
        self
    }

    /// Whether this is the `EARLIEST` sentinel.
    pub fn is_earliest(&self) -> bool {
        self.filename.is_empty() && self.position == 0
    }

    /// Whether this is the `NO_STOPPING` sentinel.
    pub fn is_no_stopping(&self) -> bool {
        self.filename.is_empty() && self.position == u64::MAX
    }

    /// The numeric suffix of the binlog filename, e.g. `3` for
    /// `mysql-bin.000003`.
    fn file_index(&self) -> Option<u64> {
        let (_, suffix) = self.filename.rsplit_once('.')?;
        suffix.parse().ok()
    }

    /// The filename without its numeric suffix; identifies the log series.
    fn file_series(&self) -> Option<&str> {
        let (base, suffix) = self.filename.rsplit_once('.')?;
        suffix.parse::<u64>().ok().map(|_| base)
    }

    /// Total-order comparison.
    ///
    /// Defined when both offsets come from the same log series, or when
    /// both carry GTID sets and one subsumes the other. Sentinels compare
    /// against everything.
    pub fn try_compare(&self, other: &BinlogOffset) -> Result<Ordering> {
        if self == other {
            return Ok(Ordering::Equal);
        }
        // Sentinels first: they have empty filenames and must not hit the
        // series comparison below.
        match (self.is_earliest(), other.is_earliest()) {
            (true, true) => return Ok(Ordering::Equal),
            (true, false) => return Ok(Ordering::Less),
            (false, true) => return Ok(Ordering::Greater),
            _ => {}
        }
        match (self.is_no_stopping(), other.is_no_stopping()) {
            (true, true) => return Ok(Ordering::Equal),
            (true, false) => return Ok(Ordering::Greater),
            (false, true) => return Ok(Ordering::Less),
            _ => {}
        }

        if let (Some(a), Some(b)) = (self.file_series(), other.file_series()) {
            if a == b {
                let lhs = (self.file_index().unwrap_or(0), self.position);
                let rhs = (other.file_index().unwrap_or(0), other.position);
                return Ok(lhs.cmp(&rhs));
            }
        }

        if let (Some(a), Some(b)) = (&self.gtid_set, &other.gtid_set) {
            let a_in_b = b.contains_set(a);
            let b_in_a = a.contains_set(b);
            return match (a_in_b, b_in_a) {
                (true, true) => Ok(Ordering::Equal),
                (true, false) => Ok(Ordering::Less),
                (false, true) => Ok(Ordering::Greater),
                (false, false) => Err(self.incomparable(other)),
            };
        }

        Err(self.incomparable(other))
    }

    /// `self <= other` under the total order.
    pub fn at_or_before(&self, other: &BinlogOffset) -> Result<bool> {
        Ok(self.try_compare(other)? != Ordering::Greater)
    }

    /// `self < other` under the total order.
    pub fn is_before(&self, other: &BinlogOffset) -> Result<bool> {
        Ok(self.try_compare(other)? == Ordering::Less)
    }

    /// `self > other` under the total order.
    pub fn is_after(&self, other: &BinlogOffset) -> Result<bool> {
        Ok(self.try_compare(other)? == Ordering::Greater)
    }

    /// The smaller of two offsets.
    pub fn min(self, other: BinlogOffset) -> Result<BinlogOffset> {
        match self.try_compare(&other)? {
            Ordering::Greater => Ok(other),
            _ => Ok(self),
        }
    }

    /// The larger of two offsets.
    pub fn max(self, other: BinlogOffset) -> Result<BinlogOffset> {
        match self.try_compare(&other)? {
            Ordering::Less => Ok(other),
            _ => Ok(self),
        }
    }

    fn incomparable(&self, other: &BinlogOffset) -> CdcError {
        CdcError::IncomparableOffsets {
            left: self.to_string(),
            right: other.to_string(),
        }
    }
}

impl fmt::Display for BinlogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_earliest() {
            write!(f, "<earliest>")
        } else if self.is_no_stopping() {
            write!(f, "<no-stopping>")
        } else {
            write!(f, "{}:{}", self.filename, self.position)
        }
    }
}

/// A MySQL GTID set: executed transaction intervals per source UUID.
///
/// Parses the canonical text form `uuid:1-5:8,uuid2:1-3` and supports the
/// subsumption test used as the cross-series ordering fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GtidSet {
    /// Closed intervals `(start, end)` per source UUID, kept sorted.
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    /// Parse the canonical MySQL text form.
    pub fn parse(text: &str) -> Result<Self> {
        let mut intervals: BTreeMap<String, Vec<(u64, u64)>> = BTreeMap::new();
        for part in text.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let mut pieces = part.split(':');
            let uuid = pieces
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CdcError::config(format!("invalid GTID set: {text:?}")))?
                .to_ascii_lowercase();
            let entry = intervals.entry(uuid).or_default();
            let mut saw_interval = false;
            for range in pieces {
                saw_interval = true;
                let (start, end) = match range.split_once('-') {
                    Some((s, e)) => (parse_txn(s, text)?, parse_txn(e, text)?),
                    None => {
                        let n = parse_txn(range, text)?;
                        (n, n)
                    }
                };
                if start > end {
                    return Err(CdcError::config(format!(
                        "invalid GTID interval {start}-{end} in {text:?}"
                    )));
                }
                entry.push((start, end));
            }
            if !saw_interval {
                return Err(CdcError::config(format!("invalid GTID set: {text:?}")));
            }
            entry.sort_unstable();
        }
        Ok(Self { intervals })
    }

    /// Whether every transaction in `other` is contained in `self`.
    pub fn contains_set(&self, other: &GtidSet) -> bool {
        other.intervals.iter().all(|(uuid, ranges)| {
            let Some(own) = self.intervals.get(uuid) else {
                return ranges.is_empty();
            };
            ranges
                .iter()
                .all(|&(start, end)| covers(own, start, end))
        })
    }

    /// True when the set holds no intervals at all.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }
}

/// Whether sorted closed intervals cover the whole of `[start, end]`.
fn covers(intervals: &[(u64, u64)], start: u64, end: u64) -> bool {
    let mut needed = start;
    for &(s, e) in intervals {
        if s > needed {
            return false;
        }
        if e >= needed {
            if e >= end {
                return true;
            }
            needed = e + 1;
        }
    }
    false
}

fn parse_txn(s: &str, whole: &str) -> Result<u64> {
    s.trim()
        .parse()
        .map_err(|_| CdcError::config(format!("invalid GTID set: {whole:?}")))
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{uuid}")?;
            for (start, end) in ranges {
                if start == end {
                    write!(f, ":{start}")?;
                } else {
                    write!(f, ":{start}-{end}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn off(file: &str, pos: u64) -> BinlogOffset {
        BinlogOffset::new(file, pos)
    }

    #[test]
    fn test_same_file_orders_by_position() {
        assert_eq!(
            off("mysql-bin.000001", 4)
                .try_compare(&off("mysql-bin.000001", 120))
                .unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_rotation_orders_by_file_index() {
        // A later file always orders after an earlier one, regardless of
        // byte position.
        assert_eq!(
            off("mysql-bin.000002", 999_999)
                .try_compare(&off("mysql-bin.000010", 4))
                .unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_equality_is_structural() {
        let a = off("mysql-bin.000003", 77);
        let b = off("mysql-bin.000003", 77);
        assert_eq!(a, b);
        assert_eq!(a.try_compare(&b).unwrap(), Ordering::Equal);

        let with_gtid = b.clone().with_gtid_set(GtidSet::parse("aa:1-5").unwrap());
        assert_ne!(a, with_gtid);
    }

    #[test]
    fn test_sentinels() {
        let real = off("mysql-bin.000001", 4);
        assert!(BinlogOffset::EARLIEST.at_or_before(&real).unwrap());
        assert!(BinlogOffset::NO_STOPPING.is_after(&real).unwrap());
        assert!(real.is_before(&BinlogOffset::NO_STOPPING).unwrap());
        assert_eq!(
            BinlogOffset::EARLIEST
                .try_compare(&BinlogOffset::NO_STOPPING)
                .unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_gtid_fallback_across_series() {
        let a = off("mysql-bin.000009", 500)
            .with_gtid_set(GtidSet::parse("3e11fa47:1-5").unwrap());
        let b = off("binlog.000002", 4).with_gtid_set(GtidSet::parse("3e11fa47:1-9").unwrap());
        assert_eq!(a.try_compare(&b).unwrap(), Ordering::Less);
        assert_eq!(b.try_compare(&a).unwrap(), Ordering::Greater);
    }

    #[test]
    fn test_incomparable_offsets() {
        let a = off("mysql-bin.000009", 500)
            .with_gtid_set(GtidSet::parse("aaaaaaaa:1-5").unwrap());
        let b = off("binlog.000002", 4).with_gtid_set(GtidSet::parse("bbbbbbbb:1-9").unwrap());
        let err = a.try_compare(&b).unwrap_err();
        assert!(matches!(err, CdcError::IncomparableOffsets { .. }));

        // No GTIDs at all: also incomparable.
        let err = off("mysql-bin.000009", 500)
            .try_compare(&off("binlog.000002", 4))
            .unwrap_err();
        assert!(matches!(err, CdcError::IncomparableOffsets { .. }));
    }

    #[test]
    fn test_min_max() {
        let a = off("mysql-bin.000001", 4);
        let b = off("mysql-bin.000001", 400);
        assert_eq!(a.clone().min(b.clone()).unwrap(), a);
        assert_eq!(a.max(b.clone()).unwrap(), b);
    }

    #[test]
    fn test_serde_round_trip_preserves_order() {
        let offsets = vec![
            BinlogOffset::EARLIEST,
            off("mysql-bin.000001", 4),
            off("mysql-bin.000001", 900),
            off("mysql-bin.000007", 4).with_gtid_set(GtidSet::parse("aa:1-3").unwrap()),
            BinlogOffset::NO_STOPPING,
        ];
        let restored: Vec<BinlogOffset> = offsets
            .iter()
            .map(|o| serde_json::from_str(&serde_json::to_string(o).unwrap()).unwrap())
            .collect();
        assert_eq!(offsets, restored);
        for window in restored.windows(2) {
            assert!(window[0].at_or_before(&window[1]).unwrap());
        }
    }

    #[test]
    fn test_gtid_set_parse_and_display() {
        let set = GtidSet::parse("3E11FA47:1-5:8,ab:3").unwrap();
        assert_eq!(set.to_string(), "3e11fa47:1-5:8,ab:3");
        assert!(GtidSet::parse("").unwrap().is_empty());
        assert!(GtidSet::parse("uuid").is_err());
        assert!(GtidSet::parse("uuid:9-3").is_err());
    }

    #[test]
    fn test_gtid_subsumption() {
        let big = GtidSet::parse("aa:1-10,bb:1-4").unwrap();
        let small = GtidSet::parse("aa:2-5,bb:4").unwrap();
        let gapped = GtidSet::parse("aa:1-3:7-10").unwrap();

        assert!(big.contains_set(&small));
        assert!(!small.contains_set(&big));
        // aa:4-6 straddles the gap in `gapped`.
        assert!(!gapped.contains_set(&GtidSet::parse("aa:4-6").unwrap()));
        assert!(gapped.contains_set(&GtidSet::parse("aa:8-9").unwrap()));
    }
}
