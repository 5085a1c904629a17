//! GTID (Global Transaction ID) 관리
//!
//! GTID 형식: UUID:sequence-number
//! 여러 서버의 GTID 집합을 추적: "uuid1:1-100:150,uuid2:1-50"

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    /// 겹치거나 연접한 범위 병합
    fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

impl fmt::Display for GtidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// 전체 GTID 집합 (서버 UUID별 정렬된 범위 목록)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    sets: BTreeMap<Uuid, Vec<GtidRange>>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet::default()
    }

    /// GTID 집합 문자열 파싱
    ///
    /// "uuid:1-100:200" 형식과 "uuid:1-100,200" 형식을 모두 받는다.
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() || gtid_str.eq_ignore_ascii_case("NULL") {
            return Ok(gtid_set);
        }

        let mut current: Option<Uuid> = None;
        for segment in gtid_str.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let mut parts = segment.split(':');
            let intervals: Vec<&str> = if segment.contains(':') {
                let uuid_part = parts.next().unwrap_or_default();
                let uuid = Uuid::parse_str(uuid_part.trim()).map_err(|e| {
                    CdcError::GtidError(format!("Invalid server uuid {}: {}", uuid_part, e))
                })?;
                current = Some(uuid);
                parts.collect()
            } else {
                vec![segment]
            };

            let uuid = current.ok_or_else(|| {
                CdcError::GtidError(format!("Interval without server uuid: {}", segment))
            })?;
            for interval in intervals {
                gtid_set.add_range(uuid, parse_range(interval.trim())?);
            }
        }

        Ok(gtid_set)
    }

    /// "uuid:sequence" 하나 추가
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (uuid, sequence) = split_gtid(gtid)?;
        self.add_range(uuid, GtidRange::new(sequence, sequence)?);
        Ok(())
    }

    pub fn add_range(&mut self, uuid: Uuid, range: GtidRange) {
        let ranges = self.sets.entry(uuid).or_default();
        ranges.push(range);
        ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(ranges.len());
        for range in ranges.drain(..) {
            if let Some(last) = merged.last_mut() {
                if let Some(combined) = last.merge(&range) {
                    *last = combined;
                    continue;
                }
            }
            merged.push(range);
        }
        *ranges = merged;
    }

    pub fn contains(&self, gtid: &str) -> bool {
        match split_gtid(gtid) {
            Ok((uuid, sequence)) => self
                .sets
                .get(&uuid)
                .map(|ranges| ranges.iter().any(|r| r.contains(sequence)))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|ranges| ranges.is_empty())
    }

    /// COM_BINLOG_DUMP_GTID용 바이너리 인코딩 (끝 값은 exclusive)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        let sets: Vec<_> = self.sets.iter().filter(|(_, r)| !r.is_empty()).collect();
        // Vec<u8>에 쓰기는 실패하지 않는다
        let _ = buf.write_u64::<LittleEndian>(sets.len() as u64);
        for (uuid, ranges) in sets {
            buf.extend_from_slice(uuid.as_bytes());
            let _ = buf.write_u64::<LittleEndian>(ranges.len() as u64);
            for range in ranges {
                let _ = buf.write_u64::<LittleEndian>(range.start);
                let _ = buf.write_u64::<LittleEndian>(range.end + 1);
            }
        }
        buf
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in self.sets.iter().filter(|(_, r)| !r.is_empty()) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for range in ranges {
                write!(f, ":{}", range)?;
            }
        }
        Ok(())
    }
}

fn split_gtid(gtid: &str) -> Result<(Uuid, u64)> {
    let (uuid, sequence) = gtid
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
    let uuid = Uuid::parse_str(uuid)
        .map_err(|e| CdcError::GtidError(format!("Invalid server uuid {}: {}", uuid, e)))?;
    let sequence = sequence
        .parse::<u64>()
        .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", sequence)))?;
    Ok((uuid, sequence))
}

fn parse_range(interval: &str) -> Result<GtidRange> {
    let parse = |s: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|_| CdcError::GtidError(format!("Invalid range: {}", interval)))
    };
    match interval.split_once('-') {
        Some((start, end)) => GtidRange::new(parse(start)?, parse(end)?),
        None => {
            let value = parse(interval)?;
            GtidRange::new(value, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "550e8400-e29b-41d4-a716-446655440000";
    const UUID_B: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

    #[test]
    fn test_gtid_parse_both_notations() {
        let colon = GtidSet::parse(&format!("{}:1-100:200", UUID_A)).unwrap();
        let comma = GtidSet::parse(&format!("{}:1-100,200", UUID_A)).unwrap();
        assert_eq!(colon, comma);
        assert_eq!(colon.to_string(), format!("{}:1-100:200", UUID_A));
    }

    #[test]
    fn test_gtid_parse_multiple_servers() {
        let set = GtidSet::parse(&format!("{}:1-5,\n{}:1-3", UUID_A, UUID_B)).unwrap();
        assert!(set.contains(&format!("{}:4", UUID_A)));
        assert!(set.contains(&format!("{}:3", UUID_B)));
        assert!(!set.contains(&format!("{}:4", UUID_B)));
    }

    #[test]
    fn test_gtid_add_merges_adjacent() {
        let mut gtid_set = GtidSet::new();
        gtid_set.add_gtid(&format!("{}:1", UUID_A)).unwrap();
        gtid_set.add_gtid(&format!("{}:3", UUID_A)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1:3", UUID_A));
        gtid_set.add_gtid(&format!("{}:2", UUID_A)).unwrap();
        assert_eq!(gtid_set.to_string(), format!("{}:1-3", UUID_A));
    }

    #[test]
    fn test_gtid_invalid() {
        assert!(GtidSet::parse("not-a-uuid:1-2").is_err());
        assert!(GtidSet::parse(&format!("{}:5-2", UUID_A)).is_err());
        assert!(GtidSet::new().add_gtid("missing-sequence").is_err());
        assert!(GtidSet::parse("").unwrap().is_empty());
    }

    #[test]
    fn test_gtid_encode() {
        let set = GtidSet::parse(&format!("{}:1-10", UUID_A)).unwrap();
        let encoded = set.encode();
        // n_sids(8) + uuid(16) + n_intervals(8) + start(8) + end(8)
        assert_eq!(encoded.len(), 48);
        assert_eq!(&encoded[0..8], &1u64.to_le_bytes());
        assert_eq!(&encoded[8..24], Uuid::parse_str(UUID_A).unwrap().as_bytes());
        assert_eq!(&encoded[32..40], &1u64.to_le_bytes());
        assert_eq!(&encoded[40..48], &11u64.to_le_bytes());
    }
}
