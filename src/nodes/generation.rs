/// Generator station payload: governor and AVR setpoint control plus the
/// synchronization check. Real generator RTUs route active power through
/// the governor (droop + setpoint) and voltage through the AVR; both
/// accept remote setpoints inside hard physical limits.

use tracing::{info, warn};

use crate::config::{GeneratorKind, GeneratorParams};
use crate::electrical::protection::{ProtectionRelay, TripReason};

use super::registers::{self, generation::*};
use super::soe::{SoeClass, SoeLog};
use super::{ElectricalState, RegisterImage};

#[derive(Debug)]
pub struct GenerationUnit {
    pub params: GeneratorParams,
    pub rated_kv: f64,

    pub governor_setpoint_mw: f64,
    pub governor_auto: bool,
    /// Set when the setpoint changed through the register surface; the
    /// orchestrator consumes it to re-seed the frequency model.
    pub setpoint_dirty: bool,

    pub avr_setpoint_kv: f64,
    pub avr_auto: bool,

    pub synchronized: bool,
    pub sync_voltage_diff_kv: f64,
    pub sync_angle_diff_deg: f64,

    /// Fuel / water / irradiance availability, depending on kind.
    pub resource_available: bool,
}

impl GenerationUnit {
    pub fn new(params: GeneratorParams, rated_kv: f64) -> Self {
        Self {
            governor_setpoint_mw: 0.0,
            governor_auto: true,
            setpoint_dirty: false,
            avr_setpoint_kv: rated_kv,
            avr_auto: true,
            synchronized: false,
            sync_voltage_diff_kv: 0.0,
            sync_angle_diff_deg: 0.0,
            resource_available: true,
            params,
            rated_kv,
        }
    }

    pub fn kind(&self) -> GeneratorKind {
        self.params.kind
    }

    /// Clamp to [0, rated]; returns the value actually applied and whether
    /// it changed.
    pub fn set_governor_setpoint(&mut self, setpoint_mw: f64) -> (f64, bool) {
        let applied = setpoint_mw.clamp(0.0, self.params.rated_mw);
        let changed = (applied - self.governor_setpoint_mw).abs() > 1e-9;
        if changed {
            self.governor_setpoint_mw = applied;
            self.setpoint_dirty = true;
        }
        (applied, changed)
    }

    /// AVR setpoint is held within ±10% of rated terminal voltage.
    pub fn set_avr_setpoint(&mut self, setpoint_kv: f64) -> (f64, bool) {
        let applied = setpoint_kv.clamp(self.rated_kv * 0.9, self.rated_kv * 1.1);
        let changed = (applied - self.avr_setpoint_kv).abs() > 1e-9;
        if changed {
            self.avr_setpoint_kv = applied;
        }
        (applied, changed)
    }

    /// Synchronization window: |ΔV| < 5% of rated and |Δθ| < 10°.
    pub fn check_synchronization(
        &mut self,
        state: &ElectricalState,
        grid_kv: f64,
        grid_angle_deg: f64,
        soe: &mut SoeLog,
    ) -> bool {
        self.sync_voltage_diff_kv = (state.voltage_kv - grid_kv).abs();
        self.sync_angle_diff_deg = (state.voltage_angle_deg - grid_angle_deg).abs();
        let ok = self.sync_voltage_diff_kv < 0.05 * self.rated_kv
            && self.sync_angle_diff_deg < 10.0;

        if ok && !self.synchronized {
            self.synchronized = true;
            info!(dv_kv = self.sync_voltage_diff_kv, "generator synchronized to grid");
            soe.record(SoeClass::ModeChange, "Generator synchronized to grid", None);
        } else if !ok && self.synchronized {
            self.synchronized = false;
            warn!(
                dv_kv = self.sync_voltage_diff_kv,
                dangle_deg = self.sync_angle_diff_deg,
                "generator lost synchronization"
            );
            soe.record(SoeClass::ModeChange, "Lost synchronization", None);
        }
        ok
    }

    pub(super) fn coil_written(&mut self, address: u16, value: bool, soe: &mut SoeLog) {
        match address {
            coil::GOVERNOR_AUTO => {
                if self.governor_auto != value {
                    self.governor_auto = value;
                    let mode = if value { "AUTO" } else { "MANUAL" };
                    soe.record(SoeClass::ModeChange, &format!("Governor mode: {mode}"), None);
                }
            }
            coil::AVR_AUTO => {
                if self.avr_auto != value {
                    self.avr_auto = value;
                    let mode = if value { "AUTO" } else { "MANUAL" };
                    soe.record(SoeClass::ModeChange, &format!("AVR mode: {mode}"), None);
                }
            }
            _ => {}
        }
    }

    /// Setpoint registers; returns the clamped encoding when the stored
    /// register must reflect a limited value.
    pub(super) fn holding_written(
        &mut self,
        address: u16,
        value: u16,
        soe: &mut SoeLog,
    ) -> Option<u16> {
        match address {
            holding::GOVERNOR_SETPOINT_MW => {
                let requested = registers::decode_power_mw(value);
                let (applied, changed) = self.set_governor_setpoint(requested);
                if changed {
                    soe.record(
                        SoeClass::SetpointChange,
                        &format!("Governor setpoint: {applied:.1} MW"),
                        Some(applied),
                    );
                }
                if (applied - requested).abs() > 1e-9 {
                    warn!(requested, applied, "governor setpoint clamped to limits");
                    Some(registers::encode_power_mw(applied))
                } else {
                    None
                }
            }
            holding::AVR_SETPOINT_KV => {
                let requested = registers::decode_voltage_kv(value);
                let (applied, changed) = self.set_avr_setpoint(requested);
                if changed {
                    soe.record(
                        SoeClass::SetpointChange,
                        &format!("AVR setpoint: {applied:.1} kV"),
                        Some(applied),
                    );
                }
                if (applied - requested).abs() > 1e-9 {
                    warn!(requested, applied, "AVR setpoint clamped to limits");
                    Some(registers::encode_voltage_kv(applied))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub(super) fn refresh(&self, image: &mut RegisterImage, relay: &ProtectionRelay) {
        // The machine output mirrors the bus injection on a generator bus.
        let p = image.input(registers::common::input::ACTIVE_POWER_MW).unwrap_or(0);
        let q = image.input(registers::common::input::REACTIVE_POWER_MVAR).unwrap_or(0);
        image.set_input(input::GENERATOR_MW, p);
        image.set_input(input::GENERATOR_MVAR, q);

        image.set_discrete(discrete::SYNC_STATUS, self.synchronized);
        image.set_discrete(discrete::GOVERNOR_MODE, self.governor_auto);
        image.set_discrete(discrete::AVR_MODE, self.avr_auto);
        image.set_discrete(discrete::PROTECTION_TRIP, relay.tripped);
        image.set_discrete(
            discrete::OVERCURRENT_TRIP,
            relay.trip_reason == Some(TripReason::Overcurrent),
        );
        image.set_discrete(
            discrete::OVERVOLTAGE_TRIP,
            relay.trip_reason == Some(TripReason::Overvoltage),
        );
        image.set_discrete(
            discrete::UNDERVOLTAGE_TRIP,
            relay.trip_reason == Some(TripReason::Undervoltage),
        );

        image.set_holding(
            holding::GOVERNOR_SETPOINT_MW,
            registers::encode_power_mw(self.governor_setpoint_mw),
        );
        image.set_holding(
            holding::AVR_SETPOINT_KV,
            registers::encode_voltage_kv(self.avr_setpoint_kv),
        );
    }
}
