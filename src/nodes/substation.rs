/// Transmission substation payload: transformer thermal model, on-load tap
/// changer, and the HV/LV bay image. The OLTC holds the secondary bus
/// inside a deadband around its target in auto mode and obeys raise/lower
/// pulses in manual; either path is limited to 3 operations per 10 minutes
/// to keep mechanism wear realistic.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::config::TransformerParams;
use crate::electrical::protection::{DifferentialInput, ProtectionRelay, TripReason};
use crate::electrical::thermal::ThermalModel;

use super::quality::{Quality, QualityMap};
use super::registers::{self, QUALITY_OFFSET, substation::*};
use super::soe::{SoeClass, SoeLog};
use super::{ElectricalState, RegisterImage};

/// Sliding-window limit on tap operations.
const TAP_WINDOW_S: f64 = 600.0;
const TAP_OPS_PER_WINDOW: usize = 3;

#[derive(Debug)]
pub struct SubstationBay {
    pub params: TransformerParams,
    pub thermal: ThermalModel,

    pub tap_position: i32,
    pub oltc_auto: bool,
    pub oltc_target_kv: f64,
    pub lv_breaker_closed: bool,
    pub secondary_voltage_kv: f64,

    /// Simulation times of recent tap operations, oldest first.
    tap_times: VecDeque<f64>,
    alarm_was_active: bool,
    trip_was_active: bool,
}

impl SubstationBay {
    pub fn new(tag: &str, params: TransformerParams) -> Self {
        Self {
            thermal: ThermalModel::new(tag, params.clone()),
            tap_position: 0,
            oltc_auto: true,
            oltc_target_kv: params.secondary_kv,
            lv_breaker_closed: true,
            secondary_voltage_kv: params.secondary_kv,
            tap_times: VecDeque::new(),
            alarm_was_active: false,
            trip_was_active: false,
            params,
        }
    }

    /// Secondary bus voltage under the current tap: each step moves the
    /// secondary by `tap_step_percent` of rated.
    fn secondary_kv(&self, state: &ElectricalState) -> f64 {
        let tap_factor = 1.0 + self.tap_position as f64 * self.params.tap_step_percent / 100.0;
        state.voltage_pu * self.params.secondary_kv * tap_factor
    }

    /// Currents either side of the transformer for the differential element.
    /// The modeled transformer is healthy, so the secondary tracks the
    /// primary through the turns ratio; an internal fault breaks this.
    pub fn differential_input(&self, state: &ElectricalState) -> DifferentialInput {
        let ratio = 1.0 / self.params.turns_ratio;
        DifferentialInput {
            i_primary_a: state.current_a,
            i_secondary_a: state.current_a / ratio,
            turns_ratio: ratio,
        }
    }

    pub(super) fn tick(
        &mut self,
        state: &ElectricalState,
        soe: &mut SoeLog,
        now_s: f64,
        dt: f64,
    ) {
        let update = self.thermal.update(dt, state.s_mva);

        if update.alarm_active != self.alarm_was_active {
            self.alarm_was_active = update.alarm_active;
            if update.alarm_active {
                soe.record(
                    SoeClass::AlarmRaised,
                    &format!("Transformer thermal alarm: hot-spot {:.1} °C", update.theta_hs_c),
                    Some(update.theta_hs_c),
                );
            } else {
                soe.record(SoeClass::AlarmCleared, "Transformer thermal alarm cleared", None);
            }
        }
        if update.trip_active != self.trip_was_active {
            self.trip_was_active = update.trip_active;
            if update.trip_active {
                soe.record(
                    SoeClass::ProtectionTrip,
                    &format!("Transformer thermal trip: hot-spot {:.1} °C", update.theta_hs_c),
                    Some(update.theta_hs_c),
                );
            }
        }

        self.secondary_voltage_kv = self.secondary_kv(state);
        if self.oltc_auto {
            self.auto_tap(state, soe, now_s);
        }
    }

    /// Auto-OLTC: with the breaker closed and the secondary outside a
    /// 1%-of-rated deadband, step toward the target one tap at a time.
    fn auto_tap(&mut self, state: &ElectricalState, soe: &mut SoeLog, now_s: f64) {
        if state.breaker != super::BreakerPosition::Closed {
            return;
        }
        let deadband = 0.01 * self.params.secondary_kv;
        let error = self.secondary_voltage_kv - self.oltc_target_kv;
        if error < -deadband {
            self.try_tap(1, soe, now_s);
        } else if error > deadband {
            self.try_tap(-1, soe, now_s);
        }
    }

    /// One tap step, bounded by range and the operations-per-window limit.
    fn try_tap(&mut self, direction: i32, soe: &mut SoeLog, now_s: f64) -> bool {
        let next = self.tap_position + direction;
        if next.abs() > self.params.tap_range {
            return false;
        }
        while let Some(&t) = self.tap_times.front() {
            if now_s - t > TAP_WINDOW_S {
                self.tap_times.pop_front();
            } else {
                break;
            }
        }
        if self.tap_times.len() >= TAP_OPS_PER_WINDOW {
            debug!(tap = self.tap_position, "OLTC operation blocked by rate limit");
            return false;
        }

        self.tap_position = next;
        self.tap_times.push_back(now_s);
        info!(tap = self.tap_position, "OLTC tap changed");
        soe.record(
            SoeClass::SetpointChange,
            &format!("OLTC tap moved to {:+}", self.tap_position),
            Some(self.tap_position as f64),
        );
        true
    }

    pub(super) fn coil_written(&mut self, address: u16, value: bool, soe: &mut SoeLog, now_s: f64) {
        match address {
            coil::BREAKER_LV => {
                if self.lv_breaker_closed != value {
                    self.lv_breaker_closed = value;
                    let (class, verb) = if value {
                        (SoeClass::BreakerClose, "closed")
                    } else {
                        (SoeClass::BreakerOpen, "opened")
                    };
                    soe.record(class, &format!("LV breaker {verb}: REMOTE_COMMAND"), None);
                }
            }
            // Manual raise/lower pulses act once per write.
            coil::OLTC_RAISE if value => {
                if !self.try_tap(1, soe, now_s) {
                    warn!("OLTC raise pulse rejected (range or rate limit)");
                }
            }
            coil::OLTC_LOWER if value => {
                if !self.try_tap(-1, soe, now_s) {
                    warn!("OLTC lower pulse rejected (range or rate limit)");
                }
            }
            coil::OLTC_AUTO => {
                if self.oltc_auto != value {
                    self.oltc_auto = value;
                    let mode = if value { "AUTO" } else { "MANUAL" };
                    soe.record(SoeClass::ModeChange, &format!("OLTC mode: {mode}"), None);
                }
            }
            _ => {}
        }
    }

    pub(super) fn holding_written(
        &mut self,
        address: u16,
        value: u16,
        soe: &mut SoeLog,
    ) -> Option<u16> {
        if address != holding::OLTC_TARGET_KV {
            return None;
        }
        let requested = registers::decode_voltage_kv(value);
        // Target is held within ±10% of the rated secondary.
        let applied = requested.clamp(
            self.params.secondary_kv * 0.9,
            self.params.secondary_kv * 1.1,
        );
        if (applied - self.oltc_target_kv).abs() > 1e-9 {
            self.oltc_target_kv = applied;
            soe.record(
                SoeClass::SetpointChange,
                &format!("OLTC target voltage: {applied:.1} kV"),
                Some(applied),
            );
        }
        if (applied - requested).abs() > 1e-9 {
            warn!(requested, applied, "OLTC target clamped to limits");
            Some(registers::encode_voltage_kv(applied))
        } else {
            None
        }
    }

    pub(super) fn refresh(
        &self,
        image: &mut RegisterImage,
        relay: &ProtectionRelay,
        state: &ElectricalState,
        quality: &mut QualityMap,
        now: chrono::DateTime<chrono::Utc>,
    ) {
        image.set_input(
            input::TRANSFORMER_LOAD_PCT,
            registers::encode_percent(self.thermal.loading_pu * 100.0),
        );
        image.set_input(
            input::OIL_TEMP_C,
            registers::encode_temperature_c(self.thermal.theta_oil_c),
        );
        image.set_input(
            input::HOTSPOT_TEMP_C,
            registers::encode_temperature_c(self.thermal.theta_hs_c),
        );
        image.set_input(
            input::OLTC_TAP_POSITION,
            registers::encode_tap_position(self.tap_position),
        );

        // Balanced three-phase: the same magnitude on each phase register.
        let phase_current = registers::encode_current_a(state.current_a);
        image.set_input(input::LINE_CURRENT_PH_A, phase_current);
        image.set_input(input::LINE_CURRENT_PH_B, phase_current);
        image.set_input(input::LINE_CURRENT_PH_C, phase_current);

        let current_quality = if state.current_pu > 1.5 {
            Quality::Overflow
        } else {
            Quality::Good
        };
        quality.set(input::LINE_CURRENT_PH_A, current_quality, now);
        image.set_input(
            input::LINE_CURRENT_PH_A + QUALITY_OFFSET,
            current_quality.as_register(),
        );
        quality.set(input::OIL_TEMP_C, Quality::Good, now);
        image.set_input(input::OIL_TEMP_C + QUALITY_OFFSET, Quality::Good.as_register());
        quality.set(input::HOTSPOT_TEMP_C, Quality::Good, now);
        image.set_input(
            input::HOTSPOT_TEMP_C + QUALITY_OFFSET,
            Quality::Good.as_register(),
        );

        image.set_discrete(discrete::BREAKER_LV_STATUS, self.lv_breaker_closed);
        image.set_discrete(discrete::OLTC_AUTO_MODE, self.oltc_auto);
        image.set_discrete(
            discrete::OLTC_AT_MAX,
            self.tap_position >= self.params.tap_range,
        );
        image.set_discrete(
            discrete::OLTC_AT_MIN,
            self.tap_position <= -self.params.tap_range,
        );
        image.set_discrete(discrete::THERMAL_ALARM, self.thermal.alarm_active);
        image.set_discrete(discrete::THERMAL_TRIP, self.thermal.trip_active);
        image.set_discrete(
            discrete::DIFFERENTIAL_TRIP,
            relay.trip_reason == Some(TripReason::Differential),
        );
        image.set_discrete(
            discrete::OVERCURRENT_TRIP,
            relay.trip_reason == Some(TripReason::Overcurrent),
        );

        image.set_holding(
            holding::OLTC_TARGET_KV,
            registers::encode_voltage_kv(self.oltc_target_kv),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nodes::{ElectricalInput, NodeKind, RtuNode};

    fn sub_node() -> RtuNode {
        let config = Config::default_grid();
        RtuNode::new(config.node("SUB-001").unwrap(), &config.protection)
    }

    fn input(v_pu: f64) -> ElectricalInput {
        ElectricalInput {
            voltage_kv: 400.0 * v_pu,
            voltage_angle_deg: -1.0,
            current_a: 300.0,
            p_mw: 120.0,
            q_mvar: 40.0,
            frequency_hz: 50.0,
        }
    }

    fn bay(n: &RtuNode) -> &SubstationBay {
        match &n.kind {
            NodeKind::Substation(bay) => bay,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_auto_oltc_raises_on_low_voltage() {
        let mut n = sub_node();
        // 96% voltage: secondary ≈ 126.7 kV vs a 132 kV target.
        n.update_electrical_state(input(0.96), 0.1);
        assert_eq!(bay(&n).tap_position, 1);
        assert_eq!(n.read_input_registers(3023, 1).unwrap(), vec![101]);
    }

    #[test]
    fn test_auto_oltc_inside_deadband_holds() {
        let mut n = sub_node();
        n.update_electrical_state(input(1.005), 0.1);
        assert_eq!(bay(&n).tap_position, 0, "0.5% error is inside the deadband");
    }

    #[test]
    fn test_tap_rate_limit_three_per_window() {
        let mut n = sub_node();
        // Persistent 90% voltage would want many raises; only 3 may land
        // inside the 10-minute window.
        for _ in 0..100 {
            n.update_electrical_state(input(0.90), 0.1);
        }
        assert_eq!(bay(&n).tap_position, 3, "rate limit must cap tap travel");
    }

    #[test]
    fn test_manual_pulse_coils() {
        let mut n = sub_node();
        n.write_coil(6, false).unwrap(); // auto off
        n.write_coil(4, true).unwrap(); // raise pulse
        assert_eq!(bay(&n).tap_position, 1);
        // Pulse coil reads back as written until the next tick clears it.
        assert_eq!(n.read_coils(4, 1).unwrap(), vec![true]);
        n.update_electrical_state(input(1.0), 0.1);
        assert_eq!(n.read_coils(4, 1).unwrap(), vec![false]);
        n.write_coil(5, true).unwrap(); // lower pulse
        assert_eq!(bay(&n).tap_position, 0);
    }

    #[test]
    fn test_oltc_target_write_and_clamp() {
        let mut n = sub_node();
        n.write_holding_register(4020, 1340).unwrap(); // 134.0 kV
        assert_eq!(bay(&n).oltc_target_kv, 134.0);
        // 200 kV is clamped to 110% of 132 kV; the register shows the clamp.
        n.write_holding_register(4020, 2000).unwrap();
        assert!((bay(&n).oltc_target_kv - 145.2).abs() < 1e-9);
        assert_eq!(n.read_holding_registers(4020, 1).unwrap(), vec![1452]);
    }

    #[test]
    fn test_lv_breaker_coil() {
        let mut n = sub_node();
        assert!(bay(&n).lv_breaker_closed);
        n.write_coil(2, false).unwrap();
        assert!(!bay(&n).lv_breaker_closed);
        // HV breaker is untouched.
        assert!(n.breaker_closed());
    }

    #[test]
    fn test_thermal_registers_track_model() {
        let mut n = sub_node();
        // Heavy loading for two simulated hours.
        let heavy = ElectricalInput {
            p_mw: 170.0,
            q_mvar: 60.0,
            ..input(1.0)
        };
        for _ in 0..120 {
            n.update_electrical_state(heavy, 60.0);
        }
        let oil = n.read_input_registers(3021, 1).unwrap()[0];
        let hs = n.read_input_registers(3022, 1).unwrap()[0];
        assert!(oil > 400, "oil must heat above ambient, got {oil}");
        assert!(hs > oil, "hot-spot above oil");
    }

    #[test]
    fn test_healthy_transformer_no_differential_trip() {
        let mut n = sub_node();
        for _ in 0..100 {
            n.update_electrical_state(input(1.0), 0.1);
        }
        assert!(!n.relay.tripped);
    }
}
