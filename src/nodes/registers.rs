/// ============================================================
///  Register Map and Fixed-Point Encoding
///
///  Address conventions (industry practice):
///      0-:    coils, read/write binary controls
///   1000-:    discrete inputs, read-only binary status
///   3000-:    input registers, read-only analog measurements
///   4000-:    holding registers, read/write analog setpoints
///
///  Every analog address has a paired quality register at
///  address + 100 (IEC 61968 quality codes).
///
///  Scaling maximizes resolution inside a 16-bit register:
///      voltage   kV × 10      frequency  Hz × 1000
///      current   A × 1        temperature °C × 10
///      power     MW × 10      power factor × 1000
///      tap position + 100 offset (signed fits unsigned)
/// ============================================================

use crate::config::NodeClass;

/// Offset from an analog register to its quality register.
pub const QUALITY_OFFSET: u16 = 100;

// ─── Common analog block (all node classes) ──────────────────────────────────

pub mod common {
    pub mod input {
        pub const BUS_VOLTAGE_KV: u16 = 3000;
        pub const FREQUENCY_HZ: u16 = 3001;
        pub const ACTIVE_POWER_MW: u16 = 3002;
        pub const REACTIVE_POWER_MVAR: u16 = 3003;
        pub const POWER_FACTOR: u16 = 3004;
    }
    pub mod coil {
        pub const BREAKER: u16 = 0;
        pub const PROTECTION_RESET: u16 = 10;
    }
    pub mod discrete {
        pub const BREAKER_STATUS: u16 = 1000;
    }
}

// ─── Generation node ─────────────────────────────────────────────────────────

pub mod generation {
    pub mod coil {
        pub const GOVERNOR_AUTO: u16 = 2;
        pub const AVR_AUTO: u16 = 3;
    }
    pub mod discrete {
        pub const SYNC_STATUS: u16 = 1001;
        pub const GOVERNOR_MODE: u16 = 1002;
        pub const AVR_MODE: u16 = 1003;
        pub const PROTECTION_TRIP: u16 = 1010;
        pub const OVERCURRENT_TRIP: u16 = 1011;
        pub const OVERVOLTAGE_TRIP: u16 = 1012;
        pub const UNDERVOLTAGE_TRIP: u16 = 1013;
    }
    pub mod input {
        pub const GENERATOR_MW: u16 = 3010;
        pub const GENERATOR_MVAR: u16 = 3011;
    }
    pub mod holding {
        pub const GOVERNOR_SETPOINT_MW: u16 = 4010;
        pub const AVR_SETPOINT_KV: u16 = 4011;
    }
}

// ─── Transmission substation ─────────────────────────────────────────────────

pub mod substation {
    pub mod coil {
        pub const BREAKER_LV: u16 = 2;
        pub const OLTC_RAISE: u16 = 4;
        pub const OLTC_LOWER: u16 = 5;
        pub const OLTC_AUTO: u16 = 6;
    }
    pub mod discrete {
        pub const BREAKER_LV_STATUS: u16 = 1001;
        pub const OLTC_AUTO_MODE: u16 = 1002;
        pub const OLTC_AT_MAX: u16 = 1003;
        pub const OLTC_AT_MIN: u16 = 1004;
        pub const THERMAL_ALARM: u16 = 1010;
        pub const THERMAL_TRIP: u16 = 1011;
        pub const DIFFERENTIAL_TRIP: u16 = 1012;
        pub const OVERCURRENT_TRIP: u16 = 1013;
    }
    pub mod input {
        pub const TRANSFORMER_LOAD_PCT: u16 = 3020;
        pub const OIL_TEMP_C: u16 = 3021;
        pub const HOTSPOT_TEMP_C: u16 = 3022;
        pub const OLTC_TAP_POSITION: u16 = 3023;
        pub const LINE_CURRENT_PH_A: u16 = 3030;
        pub const LINE_CURRENT_PH_B: u16 = 3031;
        pub const LINE_CURRENT_PH_C: u16 = 3032;
    }
    pub mod holding {
        pub const OLTC_TARGET_KV: u16 = 4020;
    }
}

// ─── Distribution feeder ─────────────────────────────────────────────────────

pub mod distribution {
    pub mod coil {
        pub const CAPACITOR_AUTO: u16 = 2;
        pub const CAP_BANK_1: u16 = 3;
        pub const CAP_BANK_2: u16 = 4;
        pub const UFLS_ENABLE: u16 = 5;
    }
    pub mod discrete {
        pub const CAPACITOR_AUTO_MODE: u16 = 1001;
        pub const UFLS_ENABLED: u16 = 1002;
        pub const UFLS_STAGE_1: u16 = 1003;
        pub const UFLS_STAGE_2: u16 = 1004;
        pub const UFLS_STAGE_3: u16 = 1005;
    }
    pub mod input {
        pub const FEEDER_LOAD_PCT: u16 = 3040;
        pub const UFLS_SHED_PCT: u16 = 3041;
        pub const CAP_BANKS_ONLINE: u16 = 3042;
        pub const LINE_CURRENT_A: u16 = 3043;
        pub const VOLTAGE_PH_A_KV: u16 = 3044;
        pub const VOLTAGE_PH_B_KV: u16 = 3045;
        pub const VOLTAGE_PH_C_KV: u16 = 3046;
        pub const ENERGY_MWH: u16 = 3050;
    }
}

// ─── IEC 104 information object addresses ────────────────────────────────────

pub mod ioa {
    // Measured values (M_ME_NC_1)
    pub const VOLTAGE_KV: u32 = 1;
    pub const FREQUENCY_HZ: u32 = 2;
    pub const ACTIVE_POWER_MW: u32 = 3;
    pub const REACTIVE_POWER_MVAR: u32 = 4;
    pub const POWER_FACTOR: u32 = 5;
    pub const GENERATOR_MW: u32 = 10;
    pub const GENERATOR_MVAR: u32 = 11;
    pub const TRANSFORMER_LOAD_PCT: u32 = 20;
    pub const OIL_TEMP_C: u32 = 21;
    pub const HOTSPOT_TEMP_C: u32 = 22;
    pub const OLTC_TAP_POSITION: u32 = 23;
    pub const FEEDER_LOAD_PCT: u32 = 40;
    pub const UFLS_SHED_PCT: u32 = 41;

    // Single points (M_SP_NA_1)
    pub const BREAKER_STATUS: u32 = 50;
    pub const PROTECTION_TRIPPED: u32 = 51;
    pub const THERMAL_ALARM: u32 = 52;
    pub const SYNC_STATUS: u32 = 53;

    // Controls (C_SC_NA_1 / C_DC_NA_1)
    pub const CMD_BREAKER: u32 = 100;
    pub const CMD_PROTECTION_RESET: u32 = 101;
    pub const CMD_OLTC_STEP: u32 = 102;

    // Setpoints (C_SE_NC_1)
    pub const SP_GOVERNOR_MW: u32 = 110;
    pub const SP_AVR_KV: u32 = 111;
    pub const SP_OLTC_TARGET_KV: u32 = 112;
}

// ─── Address windows ─────────────────────────────────────────────────────────

/// Valid address windows for one node. All node classes share the same
/// window sizes; the class payload defines which addresses are meaningful.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    pub coils_start: u16,
    pub coils_end: u16,
    pub discrete_start: u16,
    pub discrete_end: u16,
    pub input_start: u16,
    pub input_end: u16,
    pub holding_start: u16,
    pub holding_end: u16,
}

impl AddressSpace {
    pub fn for_class(_class: NodeClass) -> Self {
        Self {
            coils_start: 0,
            coils_end: 16,
            discrete_start: 1000,
            discrete_end: 1016,
            input_start: 3000,
            input_end: 3200,
            holding_start: 4000,
            holding_end: 4032,
        }
    }
}

// ─── Fixed-point encoding ────────────────────────────────────────────────────

fn scaled(value: f64, scale: f64) -> u16 {
    if !value.is_finite() {
        return 0;
    }
    (value * scale).round().clamp(0.0, 65535.0) as u16
}

pub fn encode_voltage_kv(kv: f64) -> u16 {
    scaled(kv, 10.0)
}

pub fn decode_voltage_kv(register: u16) -> f64 {
    register as f64 / 10.0
}

pub fn encode_current_a(amps: f64) -> u16 {
    scaled(amps, 1.0)
}

pub fn encode_power_mw(mw: f64) -> u16 {
    scaled(mw, 10.0)
}

pub fn decode_power_mw(register: u16) -> f64 {
    register as f64 / 10.0
}

/// A non-finite frequency measurement encodes as nominal 50 Hz; the
/// quality register carries the BAD flag in that case.
pub fn encode_frequency_hz(hz: f64) -> u16 {
    if !hz.is_finite() {
        return 50_000;
    }
    scaled(hz, 1000.0)
}

pub fn decode_frequency_hz(register: u16) -> f64 {
    register as f64 / 1000.0
}

pub fn encode_temperature_c(celsius: f64) -> u16 {
    scaled(celsius, 10.0)
}

pub fn decode_temperature_c(register: u16) -> f64 {
    register as f64 / 10.0
}

pub fn encode_power_factor(pf: f64) -> u16 {
    scaled(pf, 1000.0)
}

pub fn encode_percent(pct: f64) -> u16 {
    scaled(pct, 10.0)
}

/// Signed tap position with +100 offset so it fits an unsigned register.
pub fn encode_tap_position(tap: i32) -> u16 {
    (tap + 100).clamp(0, 65535) as u16
}

pub fn decode_tap_position(register: u16) -> i32 {
    register as i32 - 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voltage_resolution() {
        assert_eq!(encode_voltage_kv(400.0), 4000);
        assert_eq!(encode_voltage_kv(132.05), 1321); // rounds to 0.1 kV
        assert_eq!(decode_voltage_kv(4000), 400.0);
    }

    #[test]
    fn test_frequency_millihertz_resolution() {
        assert_eq!(encode_frequency_hz(50.0), 50_000);
        assert_eq!(encode_frequency_hz(49.987), 49_987);
        assert_eq!(decode_frequency_hz(50_123), 50.123);
    }

    #[test]
    fn test_nan_frequency_encodes_nominal() {
        assert_eq!(encode_frequency_hz(f64::NAN), 50_000);
        assert_eq!(encode_frequency_hz(f64::INFINITY), 50_000);
    }

    #[test]
    fn test_encoding_saturates() {
        assert_eq!(encode_voltage_kv(7000.0), 65535);
        assert_eq!(encode_power_mw(-5.0), 0);
        assert_eq!(encode_current_a(f64::NAN), 0);
    }

    #[test]
    fn test_tap_offset_roundtrip() {
        for tap in [-16, -1, 0, 1, 16] {
            assert_eq!(decode_tap_position(encode_tap_position(tap)), tap);
        }
        assert_eq!(encode_tap_position(0), 100);
    }

    #[test]
    fn test_power_roundtrip() {
        assert_eq!(decode_power_mw(encode_power_mw(123.4)), 123.4);
    }

    #[test]
    fn test_quality_register_pairing() {
        use super::common::input::*;
        assert_eq!(BUS_VOLTAGE_KV + QUALITY_OFFSET, 3100);
        assert_eq!(FREQUENCY_HZ + QUALITY_OFFSET, 3101);
    }
}
