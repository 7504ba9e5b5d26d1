/// ============================================================
///  Multi-Function Protection Relay
///
///  The trip logic of a microprocessor relay, per IEC 60255 and
///  the IEEE C37.2 device numbering:
///
///   ANSI 51  – inverse-time overcurrent, IEC standard inverse
///              t = TMS · 0.14 / ((I/Is)^0.02 − 1)
///   ANSI 59  – definite-time overvoltage
///   ANSI 27  – definite-time undervoltage
///   ANSI 81  – staged under-frequency load shedding
///   ANSI 87T – transformer differential (instantaneous)
///
///  Simultaneous pickups resolve by severity: differential >
///  overcurrent > overvoltage > undervoltage (internal faults
///  first). A trip latches: the relay ignores further inputs
///  until an operator reset, exactly like the hardware.
/// ============================================================

use tracing::{error, info, warn};

use crate::config::ProtectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    Overcurrent,
    Overvoltage,
    Undervoltage,
    Differential,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::Overcurrent => "ANSI 51 - Overcurrent",
            TripReason::Overvoltage => "ANSI 59 - Overvoltage",
            TripReason::Undervoltage => "ANSI 27 - Undervoltage",
            TripReason::Differential => "ANSI 87T - Differential",
        }
    }
}

/// Currents either side of a protected transformer, for ANSI 87T.
#[derive(Debug, Clone, Copy)]
pub struct DifferentialInput {
    pub i_primary_a: f64,
    pub i_secondary_a: f64,
    pub turns_ratio: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UflsStatus {
    pub stage_active: [bool; 3],
    pub total_shed_percent: f64,
    /// Set on the tick the recovery timer clears all stages.
    pub reset: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RelayUpdate {
    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    /// Set only on the tick the latch first closes.
    pub newly_tripped: Option<TripReason>,
    pub pickup_51: bool,
    pub ufls: UflsStatus,
}

#[derive(Debug, Clone)]
pub struct TripEvent {
    pub time_s: f64,
    pub reason: TripReason,
}

#[derive(Debug)]
pub struct ProtectionRelay {
    tag: String,
    rated_current_a: f64,
    rated_voltage_kv: f64,
    config: ProtectionConfig,

    overcurrent_pickup_s: Option<f64>,
    overvoltage_pickup_s: Option<f64>,
    undervoltage_pickup_s: Option<f64>,
    ufls_pickup_s: [Option<f64>; 3],
    ufls_stage_active: [bool; 3],
    ufls_recovery_s: Option<f64>,

    pub tripped: bool,
    pub trip_reason: Option<TripReason>,
    pub trip_time_s: f64,
    trip_log: Vec<TripEvent>,
}

impl ProtectionRelay {
    pub fn new(
        tag: &str,
        rated_current_a: f64,
        rated_voltage_kv: f64,
        config: ProtectionConfig,
    ) -> Self {
        Self {
            tag: tag.to_string(),
            rated_current_a,
            rated_voltage_kv,
            config,
            overcurrent_pickup_s: None,
            overvoltage_pickup_s: None,
            undervoltage_pickup_s: None,
            ufls_pickup_s: [None; 3],
            ufls_stage_active: [false; 3],
            ufls_recovery_s: None,
            tripped: false,
            trip_reason: None,
            trip_time_s: 0.0,
            trip_log: Vec::new(),
        }
    }

    /// Evaluate all protection functions for one step. Once latched the
    /// relay ignores every input until `reset()`.
    pub fn update(
        &mut self,
        now_s: f64,
        current_a: f64,
        voltage_kv: f64,
        frequency_hz: f64,
        differential: Option<DifferentialInput>,
    ) -> RelayUpdate {
        if self.tripped {
            return RelayUpdate {
                tripped: true,
                trip_reason: self.trip_reason,
                newly_tripped: None,
                pickup_51: false,
                ufls: UflsStatus {
                    stage_active: self.ufls_stage_active,
                    total_shed_percent: self.shed_percent(),
                    reset: false,
                },
            };
        }

        let trip_differential = differential
            .map(|d| self.check_differential(d))
            .unwrap_or(false);
        let trip_overcurrent = self.check_overcurrent(now_s, current_a);
        let trip_overvoltage = self.check_overvoltage(now_s, voltage_kv);
        let trip_undervoltage = self.check_undervoltage(now_s, voltage_kv);
        let ufls = self.check_underfrequency(now_s, frequency_hz);

        let mut newly_tripped = None;
        // Severity order: internal faults first.
        let reason = if trip_differential {
            Some(TripReason::Differential)
        } else if trip_overcurrent {
            Some(TripReason::Overcurrent)
        } else if trip_overvoltage {
            Some(TripReason::Overvoltage)
        } else if trip_undervoltage {
            Some(TripReason::Undervoltage)
        } else {
            None
        };
        if let Some(reason) = reason {
            self.trip(now_s, reason);
            newly_tripped = Some(reason);
        }

        RelayUpdate {
            tripped: self.tripped,
            trip_reason: self.trip_reason,
            newly_tripped,
            pickup_51: self.overcurrent_pickup_s.is_some(),
            ufls,
        }
    }

    fn check_overcurrent(&mut self, now_s: f64, current_a: f64) -> bool {
        let cfg = &self.config.overcurrent;
        let pickup_a = cfg.pickup_percent / 100.0 * self.rated_current_a;
        if current_a > pickup_a {
            let ratio = current_a / pickup_a;
            let t_trip = (cfg.time_multiplier * 0.14
                / (ratio.powf(cfg.curve_exponent) - 1.0))
                .max(cfg.min_trip_time_s);
            let started = *self.overcurrent_pickup_s.get_or_insert_with(|| {
                warn!(
                    tag = %self.tag,
                    current_a,
                    percent = ratio * cfg.pickup_percent,
                    trip_in_s = t_trip,
                    "ANSI 51 pickup"
                );
                now_s
            });
            if now_s - started >= t_trip {
                error!(tag = %self.tag, current_a, held_s = now_s - started, "ANSI 51 trip");
                return true;
            }
        } else if self.overcurrent_pickup_s.take().is_some() {
            info!(tag = %self.tag, "ANSI 51 reset");
        }
        false
    }

    fn check_overvoltage(&mut self, now_s: f64, voltage_kv: f64) -> bool {
        let cfg = &self.config.overvoltage;
        let pickup_kv = cfg.pickup_percent / 100.0 * self.rated_voltage_kv;
        if voltage_kv > pickup_kv {
            let started = *self.overvoltage_pickup_s.get_or_insert_with(|| {
                warn!(tag = %self.tag, voltage_kv, "ANSI 59 pickup");
                now_s
            });
            if now_s - started >= cfg.trip_delay_s {
                error!(tag = %self.tag, voltage_kv, "ANSI 59 trip");
                return true;
            }
        } else if self.overvoltage_pickup_s.take().is_some() {
            info!(tag = %self.tag, "ANSI 59 reset");
        }
        false
    }

    fn check_undervoltage(&mut self, now_s: f64, voltage_kv: f64) -> bool {
        let cfg = &self.config.undervoltage;
        let pickup_kv = cfg.pickup_percent / 100.0 * self.rated_voltage_kv;
        // A dead bus is an open breaker, not an undervoltage condition.
        if voltage_kv > 0.1 && voltage_kv < pickup_kv {
            let started = *self.undervoltage_pickup_s.get_or_insert_with(|| {
                warn!(tag = %self.tag, voltage_kv, "ANSI 27 pickup");
                now_s
            });
            if now_s - started >= cfg.trip_delay_s {
                error!(tag = %self.tag, voltage_kv, "ANSI 27 trip");
                return true;
            }
        } else if self.undervoltage_pickup_s.take().is_some() {
            info!(tag = %self.tag, "ANSI 27 reset");
        }
        false
    }

    /// ANSI 81 staged shedding. Stages latch in order and only a sustained
    /// recovery above the reset threshold clears them, together.
    fn check_underfrequency(&mut self, now_s: f64, frequency_hz: f64) -> UflsStatus {
        let ufls = &self.config.ufls;
        let mut reset = false;

        for (idx, stage) in ufls.stages.iter().enumerate().take(3) {
            if self.ufls_stage_active[idx] {
                continue;
            }
            let lower_stages_active = idx == 0 || self.ufls_stage_active[idx - 1];
            if frequency_hz < stage.frequency_hz && lower_stages_active {
                let started = *self.ufls_pickup_s[idx].get_or_insert_with(|| {
                    warn!(
                        tag = %self.tag,
                        stage = idx + 1,
                        frequency_hz,
                        threshold_hz = stage.frequency_hz,
                        "ANSI 81 stage pickup"
                    );
                    now_s
                });
                if now_s - started >= stage.delay_s {
                    self.ufls_stage_active[idx] = true;
                    error!(
                        tag = %self.tag,
                        stage = idx + 1,
                        shed_percent = stage.shed_percent,
                        frequency_hz,
                        "ANSI 81 stage shed"
                    );
                }
            } else {
                self.ufls_pickup_s[idx] = None;
            }
        }

        if self.ufls_stage_active.iter().any(|&a| a) {
            if frequency_hz > ufls.recovery_hz {
                let started = *self.ufls_recovery_s.get_or_insert(now_s);
                if now_s - started >= ufls.recovery_time_s {
                    self.ufls_stage_active = [false; 3];
                    self.ufls_pickup_s = [None; 3];
                    self.ufls_recovery_s = None;
                    reset = true;
                    info!(tag = %self.tag, frequency_hz, "ANSI 81 stages reset");
                }
            } else {
                self.ufls_recovery_s = None;
            }
        }

        UflsStatus {
            stage_active: self.ufls_stage_active,
            total_shed_percent: self.shed_percent(),
            reset,
        }
    }

    fn check_differential(&mut self, input: DifferentialInput) -> bool {
        let cfg = &self.config.differential;
        let i_secondary_ref = input.i_secondary_a * input.turns_ratio;
        let i_diff = (input.i_primary_a - i_secondary_ref).abs();
        let i_restraint = (input.i_primary_a.abs() + i_secondary_ref.abs()) / 2.0;
        let pickup_a = cfg.pickup_percent / 100.0 * self.rated_current_a;
        let restraint_min_a = cfg.restraint_min_percent / 100.0 * self.rated_current_a;
        if i_diff > pickup_a && i_restraint > restraint_min_a {
            error!(
                tag = %self.tag,
                i_diff_a = i_diff,
                i_primary_a = input.i_primary_a,
                i_secondary_a = input.i_secondary_a,
                "ANSI 87T trip"
            );
            return true;
        }
        false
    }

    fn trip(&mut self, now_s: f64, reason: TripReason) {
        self.tripped = true;
        self.trip_reason = Some(reason);
        self.trip_time_s = now_s;
        self.trip_log.push(TripEvent {
            time_s: now_s,
            reason,
        });
        error!(tag = %self.tag, reason = reason.as_str(), time_s = now_s, "PROTECTION TRIP");
    }

    pub fn shed_percent(&self) -> f64 {
        self.config
            .ufls
            .stages
            .iter()
            .enumerate()
            .take(3)
            .filter(|(idx, _)| self.ufls_stage_active[*idx])
            .map(|(_, s)| s.shed_percent)
            .sum()
    }

    pub fn ufls_stages_active(&self) -> [bool; 3] {
        self.ufls_stage_active
    }

    /// Operator reset after the fault is cleared. All timers and latches
    /// clear; the trip log is retained for the SOE history.
    pub fn reset(&mut self) {
        if self.tripped {
            info!(tag = %self.tag, "protection relay reset by operator");
        }
        self.tripped = false;
        self.trip_reason = None;
        self.trip_time_s = 0.0;
        self.overcurrent_pickup_s = None;
        self.overvoltage_pickup_s = None;
        self.undervoltage_pickup_s = None;
        self.ufls_pickup_s = [None; 3];
        self.ufls_stage_active = [false; 3];
        self.ufls_recovery_s = None;
    }

    pub fn trip_log(&self) -> &[TripEvent] {
        &self.trip_log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtectionConfig;

    fn relay() -> ProtectionRelay {
        ProtectionRelay::new("SUB-001", 1000.0, 400.0, ProtectionConfig::default())
    }

    /// Step the relay at 100 ms with fixed inputs for `seconds`.
    fn hold(
        r: &mut ProtectionRelay,
        from_s: f64,
        seconds: f64,
        i: f64,
        v: f64,
        f: f64,
    ) -> (RelayUpdate, f64) {
        let dt = 0.1;
        let steps = (seconds / dt) as usize;
        let mut t = from_s;
        let mut last = r.update(t, i, v, f, None);
        for _ in 0..steps {
            t += dt;
            last = r.update(t, i, v, f, None);
        }
        (last, t)
    }

    #[test]
    fn test_overcurrent_inverse_time_trip() {
        let mut r = relay();
        // 150% of rated = 125% of pickup; the IEC SI time lands under the
        // 5 s floor with TMS 0.15, so the floor governs.
        let (update, _) = hold(&mut r, 0.0, 6.0, 1500.0, 400.0, 50.0);
        assert!(update.tripped);
        assert_eq!(update.trip_reason, Some(TripReason::Overcurrent));
    }

    #[test]
    fn test_overcurrent_no_trip_below_pickup() {
        let mut r = relay();
        let (update, _) = hold(&mut r, 0.0, 30.0, 1100.0, 400.0, 50.0);
        assert!(!update.tripped, "1100 A is below the 1200 A pickup");
    }

    #[test]
    fn test_overcurrent_dropout_resets_timer() {
        let mut r = relay();
        let (_, t) = hold(&mut r, 0.0, 3.0, 1500.0, 400.0, 50.0);
        // Drop below pickup, then re-apply: the timer must restart.
        let (_, t) = hold(&mut r, t, 1.0, 800.0, 400.0, 50.0);
        let (update, _) = hold(&mut r, t, 3.0, 1500.0, 400.0, 50.0);
        assert!(!update.tripped, "3 s after re-pickup is before the 5 s floor");
    }

    #[test]
    fn test_overvoltage_definite_time() {
        let mut r = relay();
        let (update, t) = hold(&mut r, 0.0, 1.5, 450.0, 450.0, 50.0);
        assert!(!update.tripped, "2 s delay not yet elapsed");
        let (update, _) = hold(&mut r, t, 1.0, 450.0, 450.0, 50.0);
        // 450 kV = 112.5% of rated, above the 110% pickup.
        assert!(update.tripped);
        assert_eq!(update.trip_reason, Some(TripReason::Overvoltage));
    }

    #[test]
    fn test_undervoltage_definite_time() {
        let mut r = relay();
        let (update, _) = hold(&mut r, 0.0, 4.0, 800.0, 320.0, 50.0);
        // 320 kV = 80% of rated, below the 85% pickup; delay 3 s.
        assert!(update.tripped);
        assert_eq!(update.trip_reason, Some(TripReason::Undervoltage));
    }

    #[test]
    fn test_dead_bus_is_not_undervoltage() {
        let mut r = relay();
        let (update, _) = hold(&mut r, 0.0, 10.0, 0.0, 0.0, 50.0);
        assert!(!update.tripped);
    }

    #[test]
    fn test_differential_instantaneous_and_priority() {
        let mut r = relay();
        let diff = DifferentialInput {
            i_primary_a: 1600.0,
            i_secondary_a: 300.0,
            turns_ratio: 400.0 / 132.0,
        };
        // Also hold an overcurrent condition: differential must win.
        let update = r.update(0.0, 1600.0, 400.0, 50.0, Some(diff));
        assert!(update.tripped);
        assert_eq!(update.trip_reason, Some(TripReason::Differential));
    }

    #[test]
    fn test_differential_needs_restraint() {
        let mut config = ProtectionConfig::default();
        // Sensitive pickup so the restraint minimum is the deciding factor.
        config.differential.pickup_percent = 5.0;
        let mut r = ProtectionRelay::new("SUB-001", 1000.0, 400.0, config);
        let diff = DifferentialInput {
            i_primary_a: 60.0,
            i_secondary_a: 0.0,
            turns_ratio: 1.0,
        };
        // Differential 60 A exceeds the 50 A pickup, but the 30 A restraint
        // is below the 100 A minimum: an unloaded transformer must not trip.
        let update = r.update(0.0, 60.0, 400.0, 50.0, Some(diff));
        assert!(!update.tripped);
    }

    #[test]
    fn test_trip_latches_until_reset() {
        let mut r = relay();
        let (update, t) = hold(&mut r, 0.0, 6.0, 1500.0, 400.0, 50.0);
        assert!(update.tripped);
        // Healthy inputs do not clear the latch.
        let (update, _) = hold(&mut r, t, 30.0, 500.0, 400.0, 50.0);
        assert!(update.tripped, "latch must survive healthy inputs");
        r.reset();
        let update = r.update(100.0, 500.0, 400.0, 50.0, None);
        assert!(!update.tripped);
        assert_eq!(r.trip_log().len(), 1);
    }

    #[test]
    fn test_ufls_stage1_only_just_below_threshold() {
        let mut r = relay();
        let (update, _) = hold(&mut r, 0.0, 1.0, 500.0, 400.0, 49.49);
        assert_eq!(update.ufls.stage_active, [true, false, false]);
        assert_eq!(update.ufls.total_shed_percent, 10.0);
    }

    #[test]
    fn test_ufls_stages_cascade_in_order() {
        let mut r = relay();
        let (_, t) = hold(&mut r, 0.0, 1.0, 500.0, 400.0, 49.4);
        assert_eq!(r.ufls_stages_active(), [true, false, false]);
        let (_, t) = hold(&mut r, t, 1.0, 500.0, 400.0, 49.1);
        assert_eq!(r.ufls_stages_active(), [true, true, false]);
        let (update, _) = hold(&mut r, t, 1.0, 500.0, 400.0, 48.7);
        assert_eq!(r.ufls_stages_active(), [true, true, true]);
        assert_eq!(update.ufls.total_shed_percent, 45.0);
    }

    #[test]
    fn test_ufls_never_skips_stages() {
        let mut r = relay();
        // Frequency crashes straight to 48.7: stage 1 must arm first;
        // stages 2 and 3 follow only after stage 1 is active.
        let update = r.update(0.0, 500.0, 400.0, 48.7, None);
        assert_eq!(update.ufls.stage_active, [false, false, false]);
        let (_, t) = hold(&mut r, 0.0, 0.6, 500.0, 400.0, 48.7);
        assert_eq!(r.ufls_stages_active(), [true, false, false]);
        let (_, _t) = hold(&mut r, t, 0.6, 500.0, 400.0, 48.7);
        assert_eq!(r.ufls_stages_active(), [true, true, false]);
    }

    #[test]
    fn test_ufls_recovery_clears_all_stages() {
        let mut r = relay();
        let (_, t) = hold(&mut r, 0.0, 1.0, 500.0, 400.0, 49.1);
        assert_eq!(r.ufls_stages_active(), [true, true, false]);
        // Above 49.7 Hz for the configured 5 s recovery time.
        let (update, _) = hold(&mut r, t, 6.0, 500.0, 400.0, 49.8);
        assert_eq!(update.ufls.stage_active, [false, false, false]);
        assert_eq!(update.ufls.total_shed_percent, 0.0);
    }

    #[test]
    fn test_ufls_brief_recovery_does_not_clear() {
        let mut r = relay();
        let (_, t) = hold(&mut r, 0.0, 1.0, 500.0, 400.0, 49.4);
        let (_, t) = hold(&mut r, t, 2.0, 500.0, 400.0, 49.8);
        let (update, _) = hold(&mut r, t, 1.0, 500.0, 400.0, 49.6);
        assert_eq!(
            update.ufls.stage_active,
            [true, false, false],
            "2 s above recovery must not clear a 5 s timer"
        );
    }
}
