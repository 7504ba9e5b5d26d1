/// ============================================================
///  Demand and Solar Profiles
///
///  Pure functions of the simulated wall-clock: deterministic
///  and restartable, so the same start time always reproduces
///  the same trace.
///
///  The demand curve follows the Indian grid diurnal pattern
///  (GRID-INDIA/POSOCO operating data):
///   - morning peak 09:00-11:00 (~70% of maximum)
///   - afternoon dip 13:00-16:00 (~55%)
///   - evening peak 19:00-22:00 (100%, lighting + cooking)
///   - night trough 02:00-05:00 (~30%)
///  layered with seasonal multipliers, a weekend reduction,
///  festival lighting surges, and a small deterministic
///  pseudo-random scatter seeded from the day and time slot.
///
///  Solar is a Gaussian day-arc scaled by season and a cloud
///  transient locked to a 5-minute slot so output is stable
///  within one update cycle.
/// ============================================================

use chrono::{DateTime, Datelike, Timelike, Utc};

// Hour-by-hour load factor, fraction of annual peak.
const LOAD_CURVE: [f64; 24] = [
    0.45, 0.38, 0.32, 0.30, 0.30, 0.35, // 00-05 night trough
    0.45, 0.55, 0.65, 0.70, 0.70, 0.68, // 06-11 morning ramp and peak
    0.62, 0.57, 0.55, 0.56, 0.60, 0.70, // 12-17 afternoon dip
    0.85, 0.95, 1.00, 0.98, 0.85, 0.60, // 18-23 evening peak
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Season {
    Summer,
    Monsoon,
    Autumn,
    Winter,
}

impl Season {
    pub fn of(when: DateTime<Utc>) -> Self {
        match when.month() {
            4..=6 => Season::Summer,
            7..=9 => Season::Monsoon,
            10 | 11 => Season::Autumn,
            _ => Season::Winter,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Season::Summer => "summer",
            Season::Monsoon => "monsoon",
            Season::Autumn => "autumn",
            Season::Winter => "winter",
        }
    }

    fn load_multiplier(&self) -> f64 {
        match self {
            Season::Summer => 1.20, // air conditioning
            Season::Monsoon => 1.00,
            Season::Autumn => 1.05, // festival season
            Season::Winter => 0.95,
        }
    }

    fn solar_multiplier(&self) -> f64 {
        match self {
            Season::Summer => 1.0,
            Season::Monsoon => 0.7, // cloud cover
            Season::Autumn => 0.9,
            Season::Winter => 0.8, // low sun angle
        }
    }
}

/// Deterministic [0, 1) noise from a day/slot seed, in the same
/// splitmix-style hash used for the cloud transients.
fn slot_noise(day_of_year: u32, slot: i64, salt: i64) -> f64 {
    let seed = (day_of_year as i64)
        .wrapping_mul(1013)
        .wrapping_add(slot.wrapping_mul(631))
        ^ salt.wrapping_mul(397);
    ((seed.wrapping_mul(0x9e3779b97f4a7c15_u64 as i64)) >> 11) as f64 / (1i64 << 53) as f64
}

fn festival_multiplier(when: DateTime<Utc>) -> f64 {
    let (month, day, hour) = (when.month(), when.day(), when.hour());
    if month == 10 && (20..=30).contains(&day) && (19..=22).contains(&hour) {
        1.25 // Diwali lighting surge
    } else if month == 3 && (15..=20).contains(&day) && (18..=21).contains(&hour) {
        1.15 // Holi
    } else {
        1.0
    }
}

/// System load factor in [0.25, 1.3]: multiply a feeder's peak MW by this
/// to obtain its instantaneous demand.
pub fn load_factor(when: DateTime<Utc>) -> f64 {
    let hour = when.hour() as usize;
    let next_hour = (hour + 1) % 24;
    let frac = when.minute() as f64 / 60.0 + when.second() as f64 / 3600.0;
    let base = LOAD_CURVE[hour] * (1.0 - frac) + LOAD_CURVE[next_hour] * frac;

    let seasonal = Season::of(when).load_multiplier();
    let weekend = if when.weekday().number_from_monday() >= 6 {
        0.85
    } else {
        1.0
    };
    let festival = festival_multiplier(when);

    // ±2% scatter on a 5-minute slot: enough texture for anomaly-detection
    // baselines without perturbing the frequency loop.
    let slot = (when.hour() * 12 + when.minute() / 5) as i64;
    let noise = 1.0 + (slot_noise(when.ordinal(), slot, 0x51) - 0.5) * 0.04;

    (base * seasonal * weekend * festival * noise).clamp(0.25, 1.3)
}

/// Solar capacity factor in [0, 1]: multiply the plant rating by this to
/// obtain available PV output.
pub fn solar_capacity_factor(when: DateTime<Utc>) -> f64 {
    let hour = when.hour() as f64 + when.minute() as f64 / 60.0;
    if !(6.0..=18.0).contains(&hour) {
        return 0.0;
    }

    // Gaussian day arc centered on solar noon, σ = 3 h.
    let irradiance = (-((hour - 12.0).powi(2)) / (2.0 * 3.0_f64.powi(2))).exp();
    let seasonal = Season::of(when).solar_multiplier();

    // Broken-cloud transient, ±20%, stable within a 5-minute slot.
    let slot = (when.hour() * 12 + when.minute() / 5) as i64;
    let cloud = 0.8 + 0.2 * slot_noise(when.ordinal(), slot, 0x2c);

    (irradiance * seasonal * cloud).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_evening_peak_exceeds_night_trough() {
        let evening = Utc.with_ymd_and_hms(2025, 6, 18, 20, 0, 0).unwrap();
        let night = Utc.with_ymd_and_hms(2025, 6, 18, 3, 0, 0).unwrap();
        assert!(load_factor(evening) > load_factor(night) * 2.0);
    }

    #[test]
    fn test_weekend_reduction() {
        // 2025-06-21 is a Saturday, 2025-06-18 a Wednesday.
        let saturday = Utc.with_ymd_and_hms(2025, 6, 21, 10, 0, 0).unwrap();
        let wednesday = Utc.with_ymd_and_hms(2025, 6, 18, 10, 0, 0).unwrap();
        assert!(load_factor(saturday) < load_factor(wednesday));
    }

    #[test]
    fn test_diwali_evening_surge() {
        // Both dates are weekdays so only the festival term differs.
        let diwali = Utc.with_ymd_and_hms(2025, 10, 21, 20, 0, 0).unwrap();
        let ordinary = Utc.with_ymd_and_hms(2025, 10, 8, 20, 0, 0).unwrap();
        assert!(load_factor(diwali) > load_factor(ordinary) * 1.1);
    }

    #[test]
    fn test_load_factor_bounds() {
        for day in 1..=28 {
            for hour in 0..24 {
                let t = Utc.with_ymd_and_hms(2025, 7, day, hour, 17, 0).unwrap();
                let f = load_factor(t);
                assert!((0.25..=1.3).contains(&f), "load factor {f} at {t}");
            }
        }
    }

    #[test]
    fn test_profiles_are_deterministic() {
        let t = Utc.with_ymd_and_hms(2025, 8, 14, 11, 42, 7).unwrap();
        assert_eq!(load_factor(t), load_factor(t));
        assert_eq!(solar_capacity_factor(t), solar_capacity_factor(t));
    }

    #[test]
    fn test_solar_zero_at_night() {
        let midnight = Utc.with_ymd_and_hms(2025, 6, 18, 0, 30, 0).unwrap();
        let dawn = Utc.with_ymd_and_hms(2025, 6, 18, 5, 0, 0).unwrap();
        assert_eq!(solar_capacity_factor(midnight), 0.0);
        assert_eq!(solar_capacity_factor(dawn), 0.0);
    }

    #[test]
    fn test_solar_peaks_at_noon() {
        let noon = Utc.with_ymd_and_hms(2025, 5, 18, 12, 0, 0).unwrap();
        let morning = Utc.with_ymd_and_hms(2025, 5, 18, 8, 0, 0).unwrap();
        let cf = solar_capacity_factor(noon);
        assert!(cf > 0.5, "summer noon capacity factor {cf}");
        assert!(cf > solar_capacity_factor(morning));
    }

    #[test]
    fn test_monsoon_solar_below_summer() {
        let monsoon = Utc.with_ymd_and_hms(2025, 8, 18, 12, 2, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2025, 5, 18, 12, 2, 0).unwrap();
        assert!(solar_capacity_factor(monsoon) < solar_capacity_factor(summer));
    }

    #[test]
    fn test_season_boundaries() {
        let t = |m| Utc.with_ymd_and_hms(2025, m, 15, 12, 0, 0).unwrap();
        assert_eq!(Season::of(t(5)), Season::Summer);
        assert_eq!(Season::of(t(8)), Season::Monsoon);
        assert_eq!(Season::of(t(10)), Season::Autumn);
        assert_eq!(Season::of(t(1)), Season::Winter);
    }
}
