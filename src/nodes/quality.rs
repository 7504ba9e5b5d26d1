/// Per-point data quality (IEC 61968 codes). Every measurement a SCADA
/// master polls carries one of these; operators treat BAD and SUSPECT data
/// very differently from GOOD, so degradation behavior must be faithful:
/// GOOD → SUSPECT after 3 consecutive missed polls, SUSPECT → BAD after 10.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Quality {
    Good = 0x00,
    Suspect = 0x01,
    Bad = 0x02,
    Overflow = 0x04,
    Underrange = 0x08,
}

impl Quality {
    pub fn as_register(&self) -> u16 {
        *self as u16
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Suspect => "SUSPECT",
            Quality::Bad => "BAD",
            Quality::Overflow => "OVERFLOW",
            Quality::Underrange => "UNDERRANGE",
        }
    }
}

#[derive(Debug, Clone)]
struct QualityEntry {
    quality: Quality,
    missed_polls: u32,
    last_update: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct QualityMap {
    entries: HashMap<u16, QualityEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QualitySummary {
    pub good: usize,
    pub suspect: usize,
    pub bad: usize,
    pub overflow: usize,
    pub underrange: usize,
}

impl QualityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, address: u16, quality: Quality, now: DateTime<Utc>) {
        let entry = self.entries.entry(address).or_insert(QualityEntry {
            quality,
            missed_polls: 0,
            last_update: now,
        });
        entry.quality = quality;
        entry.last_update = now;
        if quality == Quality::Good {
            entry.missed_polls = 0;
        }
    }

    /// A point that was never written reads BAD, not GOOD: absence of
    /// data is a failure state.
    pub fn get(&self, address: u16) -> Quality {
        self.entries
            .get(&address)
            .map(|e| e.quality)
            .unwrap_or(Quality::Bad)
    }

    pub fn last_update(&self, address: u16) -> Option<DateTime<Utc>> {
        self.entries.get(&address).map(|e| e.last_update)
    }

    /// Communication timeout degradation: GOOD → SUSPECT after 3 missed
    /// polls, SUSPECT → BAD after 10.
    pub fn mark_missed_poll(&mut self, address: u16, now: DateTime<Utc>) {
        let entry = self.entries.entry(address).or_insert(QualityEntry {
            quality: Quality::Good,
            missed_polls: 0,
            last_update: now,
        });
        entry.missed_polls += 1;
        if entry.missed_polls >= 10 {
            entry.quality = Quality::Bad;
        } else if entry.missed_polls >= 3 {
            entry.quality = Quality::Suspect;
        }
        entry.last_update = now;
    }

    /// Range check: sets OVERFLOW / UNDERRANGE / GOOD accordingly.
    pub fn check_range(
        &mut self,
        address: u16,
        value: f64,
        min: f64,
        max: f64,
        now: DateTime<Utc>,
    ) -> Quality {
        let quality = if value > max {
            Quality::Overflow
        } else if value < min {
            Quality::Underrange
        } else {
            Quality::Good
        };
        self.set(address, quality, now);
        quality
    }

    pub fn mark_all_bad(&mut self, now: DateTime<Utc>) {
        for entry in self.entries.values_mut() {
            entry.quality = Quality::Bad;
            entry.last_update = now;
        }
    }

    pub fn summary(&self) -> QualitySummary {
        let mut s = QualitySummary::default();
        for entry in self.entries.values() {
            match entry.quality {
                Quality::Good => s.good += 1,
                Quality::Suspect => s.suspect += 1,
                Quality::Bad => s.bad += 1,
                Quality::Overflow => s.overflow += 1,
                Quality::Underrange => s.underrange += 1,
            }
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_point_reads_bad() {
        let map = QualityMap::new();
        assert_eq!(map.get(3000), Quality::Bad);
    }

    #[test]
    fn test_missed_poll_degradation_thresholds() {
        let mut map = QualityMap::new();
        let now = Utc::now();
        map.set(3000, Quality::Good, now);
        for _ in 0..2 {
            map.mark_missed_poll(3000, now);
        }
        assert_eq!(map.get(3000), Quality::Good, "2 misses stay GOOD");
        map.mark_missed_poll(3000, now);
        assert_eq!(map.get(3000), Quality::Suspect, "3rd miss degrades");
        for _ in 0..6 {
            map.mark_missed_poll(3000, now);
        }
        assert_eq!(map.get(3000), Quality::Suspect, "9 misses still SUSPECT");
        map.mark_missed_poll(3000, now);
        assert_eq!(map.get(3000), Quality::Bad, "10th miss is BAD");
    }

    #[test]
    fn test_good_update_resets_missed_counter() {
        let mut map = QualityMap::new();
        let now = Utc::now();
        for _ in 0..5 {
            map.mark_missed_poll(3000, now);
        }
        assert_eq!(map.get(3000), Quality::Suspect);
        map.set(3000, Quality::Good, now);
        for _ in 0..2 {
            map.mark_missed_poll(3000, now);
        }
        assert_eq!(map.get(3000), Quality::Good, "counter must restart");
    }

    #[test]
    fn test_range_check() {
        let mut map = QualityMap::new();
        let now = Utc::now();
        assert_eq!(map.check_range(3000, 1.3, 0.8, 1.2, now), Quality::Overflow);
        assert_eq!(map.check_range(3000, 0.5, 0.8, 1.2, now), Quality::Underrange);
        assert_eq!(map.check_range(3000, 1.0, 0.8, 1.2, now), Quality::Good);
    }

    #[test]
    fn test_summary_counts() {
        let mut map = QualityMap::new();
        let now = Utc::now();
        map.set(3000, Quality::Good, now);
        map.set(3001, Quality::Good, now);
        map.set(3002, Quality::Overflow, now);
        let s = map.summary();
        assert_eq!(s.good, 2);
        assert_eq!(s.overflow, 1);
        assert_eq!(s.bad, 0);
    }
}
