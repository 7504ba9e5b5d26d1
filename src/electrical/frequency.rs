/// ============================================================
///  System Frequency Dynamics
///
///  All synchronous machines share one frequency; deviation is
///  driven by the active power imbalance through the swing
///  equation (per-unit on the aggregate machine base):
///
///      df/dt = f_nom · ΔP_pu / (2 · H_sys)
///
///  Three control layers act on it:
///   1. Inertia        – instantaneous, sets the ROCOF
///   2. Governor droop – primary response within seconds,
///                       ΔP = −(Δf/f_nom)/R per machine,
///                       first-order lag with time constant Tg
///   3. AGC            – secondary PI loop on a ~4 s cadence
///                       driving the steady-state error to zero
///
///  The swing and droop paths are kept in per-unit throughout;
///  mixing MW- and pu-based gains is a known source of hunting.
/// ============================================================

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::{AgcConfig, FrequencyLimits, GeneratorParams};

/// State variables for a single generating unit.
#[derive(Debug, Clone)]
pub struct GeneratorState {
    pub tag: String,
    pub params: GeneratorParams,
    /// Dispatch/operator setpoint (AGC adjusts around it).
    pub setpoint_mw: f64,
    /// Governor output (mechanical power).
    pub mech_mw: f64,
    /// Electrical output (equals mechanical, machine losses neglected).
    pub elec_mw: f64,
    pub agc_participating: bool,
}

#[derive(Debug, Clone)]
pub struct FrequencyUpdate {
    pub frequency_hz: f64,
    pub deviation_hz: f64,
    pub rocof_hz_per_s: f64,
    pub power_imbalance_mw: f64,
    pub system_inertia_s: f64,
    pub generator_outputs_mw: HashMap<String, f64>,
}

/// Operational classification per grid code bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyStatus {
    Normal,
    Low,
    High,
    Emergency,
}

impl FrequencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrequencyStatus::Normal => "NORMAL",
            FrequencyStatus::Low => "LOW",
            FrequencyStatus::High => "HIGH",
            FrequencyStatus::Emergency => "EMERGENCY",
        }
    }
}

pub struct FrequencyModel {
    f_nom: f64,
    limits: FrequencyLimits,
    agc: AgcConfig,
    units: Vec<GeneratorState>,
    index: HashMap<String, usize>,
    pub frequency_hz: f64,
    agc_integral_mw_s: f64,
    last_agc_time_s: f64,
    last_rocof: f64,
    last_imbalance_mw: f64,
}

impl FrequencyModel {
    pub fn new(
        units: Vec<(String, GeneratorParams)>,
        f_nom: f64,
        limits: FrequencyLimits,
        agc: AgcConfig,
    ) -> Self {
        let units: Vec<GeneratorState> = units
            .into_iter()
            .map(|(tag, params)| {
                // Start at mid-range; solar never participates in AGC.
                let initial = (params.min_mw + params.max_mw) / 2.0;
                let participates = params.inertia_h_s > 0.0;
                GeneratorState {
                    tag,
                    setpoint_mw: initial,
                    mech_mw: initial,
                    elec_mw: initial,
                    agc_participating: participates,
                    params,
                }
            })
            .collect();
        let index = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.tag.clone(), i))
            .collect();
        debug!(units = units.len(), "frequency model initialized");
        Self {
            f_nom,
            limits,
            agc,
            units,
            index,
            frequency_hz: f_nom,
            agc_integral_mw_s: 0.0,
            last_agc_time_s: 0.0,
            last_rocof: 0.0,
            last_imbalance_mw: 0.0,
        }
    }

    /// Advance frequency and governor states one step.
    pub fn update(
        &mut self,
        dt: f64,
        total_load_mw: f64,
        total_losses_mw: f64,
        now_s: f64,
    ) -> FrequencyUpdate {
        // Capacity-weighted system inertia; inverter resources (H = 0)
        // contribute capacity but no inertia.
        let total_capacity: f64 = self.units.iter().map(|u| u.params.rated_mw).sum();
        let h_sys = if total_capacity > 0.0 {
            self.units
                .iter()
                .map(|u| u.params.inertia_h_s * u.params.rated_mw)
                .sum::<f64>()
                / total_capacity
        } else {
            5.0
        };

        let mech_total: f64 = self.units.iter().map(|u| u.mech_mw).sum();
        let elec_total = total_load_mw + total_losses_mw;
        let imbalance_mw = mech_total - elec_total;
        let imbalance_pu = if total_capacity > 0.0 {
            imbalance_mw / total_capacity
        } else {
            0.0
        };

        let rocof = if h_sys > 0.0 {
            (self.f_nom * imbalance_pu / (2.0 * h_sys)).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        self.frequency_hz = (self.frequency_hz + rocof * dt)
            .clamp(self.limits.emergency_min_hz, self.limits.emergency_max_hz);
        let deviation_hz = self.frequency_hz - self.f_nom;

        // Primary response: governor droop around the setpoint.
        let df_pu = deviation_hz / self.f_nom;
        let mut outputs = HashMap::with_capacity(self.units.len());
        for unit in &mut self.units {
            let droop_mw = if unit.params.droop_pu > 0.0 {
                -(df_pu / unit.params.droop_pu) * unit.params.rated_mw
            } else {
                0.0
            };
            let target =
                (unit.setpoint_mw + droop_mw).clamp(unit.params.min_mw, unit.params.max_mw);
            if unit.params.governor_tg_s > 0.0 {
                let dp = (target - unit.mech_mw) / unit.params.governor_tg_s;
                unit.mech_mw += dp * dt;
            } else {
                unit.mech_mw = target;
            }
            unit.elec_mw = unit.mech_mw;
            outputs.insert(unit.tag.clone(), unit.elec_mw);
        }

        if now_s - self.last_agc_time_s >= self.agc.control_interval_s {
            self.run_agc(deviation_hz);
            self.last_agc_time_s = now_s;
        }

        if deviation_hz.abs() > 0.2 {
            warn!(
                frequency_hz = self.frequency_hz,
                deviation_hz, rocof, "significant frequency deviation"
            );
        }

        self.last_rocof = rocof;
        self.last_imbalance_mw = imbalance_mw;
        FrequencyUpdate {
            frequency_hz: self.frequency_hz,
            deviation_hz,
            rocof_hz_per_s: rocof,
            power_imbalance_mw: imbalance_mw,
            system_inertia_s: h_sys,
            generator_outputs_mw: outputs,
        }
    }

    /// Secondary control: PI on the Area Control Error. With no tie lines
    /// ACE = β·Δf; the control signal is rate-limited and distributed to
    /// participating units proportional to their remaining headroom.
    fn run_agc(&mut self, deviation_hz: f64) {
        let ace_mw = self.agc.frequency_bias_mw_per_hz * deviation_hz;
        self.agc_integral_mw_s = (self.agc_integral_mw_s
            + ace_mw * self.agc.control_interval_s)
            .clamp(-self.agc.integral_limit_mw_s, self.agc.integral_limit_mw_s);

        let mut control_mw = -(self.agc.proportional_gain * ace_mw
            + self.agc.integral_gain * self.agc_integral_mw_s);
        let max_step =
            self.agc.max_rate_mw_per_min * (self.agc.control_interval_s / 60.0);
        control_mw = control_mw.clamp(-max_step, max_step);

        let participants: Vec<usize> = (0..self.units.len())
            .filter(|&i| self.units[i].agc_participating)
            .collect();
        if participants.is_empty() || control_mw == 0.0 {
            return;
        }

        let headroom = |u: &GeneratorState, up: bool| -> f64 {
            if up {
                (u.params.max_mw - u.setpoint_mw).max(0.0)
            } else {
                (u.setpoint_mw - u.params.min_mw).max(0.0)
            }
        };
        let raising = control_mw > 0.0;
        let total_headroom: f64 = participants
            .iter()
            .map(|&i| headroom(&self.units[i], raising))
            .sum();
        if total_headroom <= 0.0 {
            return;
        }

        for &i in &participants {
            let unit = &mut self.units[i];
            let share = headroom(unit, raising) / total_headroom;
            unit.setpoint_mw = (unit.setpoint_mw + control_mw * share)
                .clamp(unit.params.min_mw, unit.params.max_mw);
        }

        if control_mw.abs() > 1.0 {
            debug!(ace_mw, control_mw, deviation_hz, "AGC adjustment");
        }
    }

    /// Operator/dispatch setpoint override; clamped to the unit limits.
    /// AGC keeps adjusting around the new value when participation is on.
    pub fn set_setpoint(&mut self, tag: &str, setpoint_mw: f64) -> Option<f64> {
        let idx = *self.index.get(tag)?;
        let unit = &mut self.units[idx];
        let clamped = setpoint_mw.clamp(unit.params.min_mw, unit.params.max_mw);
        if (clamped - unit.setpoint_mw).abs() > 1e-9 {
            info!(tag, setpoint_mw = clamped, "generator setpoint changed");
        }
        unit.setpoint_mw = clamped;
        Some(clamped)
    }

    pub fn setpoint(&self, tag: &str) -> Option<f64> {
        self.index.get(tag).map(|&i| self.units[i].setpoint_mw)
    }

    pub fn output(&self, tag: &str) -> Option<f64> {
        self.index.get(tag).map(|&i| self.units[i].elec_mw)
    }

    pub fn outputs(&self) -> HashMap<String, f64> {
        self.units
            .iter()
            .map(|u| (u.tag.clone(), u.elec_mw))
            .collect()
    }

    pub fn rocof(&self) -> f64 {
        self.last_rocof
    }

    pub fn imbalance_mw(&self) -> f64 {
        self.last_imbalance_mw
    }

    pub fn deviation_hz(&self) -> f64 {
        self.frequency_hz - self.f_nom
    }

    pub fn status(&self) -> FrequencyStatus {
        let f = self.frequency_hz;
        if f >= self.limits.normal_band_min_hz && f <= self.limits.normal_band_max_hz {
            FrequencyStatus::Normal
        } else if f >= self.limits.emergency_min_hz && f < self.limits.normal_band_min_hz {
            FrequencyStatus::Low
        } else if f > self.limits.normal_band_max_hz && f <= self.limits.emergency_max_hz {
            FrequencyStatus::High
        } else {
            FrequencyStatus::Emergency
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NodeClass};

    fn model() -> FrequencyModel {
        let config = Config::default_grid();
        let units: Vec<(String, GeneratorParams)> = config
            .nodes
            .iter()
            .filter(|n| n.class == NodeClass::Generation)
            .map(|n| (n.tag.clone(), n.generator.clone().unwrap()))
            .collect();
        FrequencyModel::new(
            units,
            config.nominal_frequency_hz,
            config.frequency.clone(),
            config.agc.clone(),
        )
    }

    /// Run the model to a balanced steady state at the given load.
    fn settle(model: &mut FrequencyModel, load_mw: f64, seconds: f64, from_s: f64) -> f64 {
        let dt = 0.1;
        let steps = (seconds / dt) as usize;
        let mut t = from_s;
        for _ in 0..steps {
            t += dt;
            model.update(dt, load_mw, 0.0, t);
        }
        t
    }

    #[test]
    fn test_balanced_system_holds_nominal() {
        let mut m = model();
        // Load exactly matching the initial mid-range mechanical output.
        let load: f64 = m.units.iter().map(|u| u.mech_mw).sum();
        let result = m.update(0.1, load, 0.0, 0.1);
        assert!((result.frequency_hz - 50.0).abs() < 1e-6);
        assert!(result.rocof_hz_per_s.abs() < 1e-9);
    }

    #[test]
    fn test_load_step_drops_frequency() {
        let mut m = model();
        let base_load: f64 = m.units.iter().map(|u| u.mech_mw).sum();
        let t = settle(&mut m, base_load, 5.0, 0.0);
        // 50 MW step: inertia lets frequency fall before the governors act.
        let result = m.update(0.1, base_load + 50.0, 0.0, t + 0.1);
        assert!(result.frequency_hz < 50.0);
        assert!(result.rocof_hz_per_s < 0.0);
    }

    #[test]
    fn test_governor_arrests_frequency_fall() {
        let mut m = model();
        let base_load: f64 = m.units.iter().map(|u| u.mech_mw).sum();
        let t = settle(&mut m, base_load, 5.0, 0.0);
        settle(&mut m, base_load + 50.0, 10.0, t);
        // Primary response alone leaves a bounded steady-state error.
        let dev = m.deviation_hz();
        assert!(dev < 0.0, "deviation {dev:+.3} Hz should be negative");
        assert!(dev > -0.4, "droop should arrest the fall, got {dev:+.3} Hz");
    }

    #[test]
    fn test_agc_restores_nominal_after_step() {
        let mut m = model();
        let base_load: f64 = m.units.iter().map(|u| u.mech_mw).sum();
        let t = settle(&mut m, base_load, 10.0, 0.0);
        settle(&mut m, base_load + 50.0, 120.0, t);
        assert!(
            m.deviation_hz().abs() < 0.05,
            "AGC should restore frequency, residual {:+.3} Hz",
            m.deviation_hz()
        );
        // No unit pushed beyond its limits.
        for u in &m.units {
            assert!(u.setpoint_mw >= u.params.min_mw - 1e-6);
            assert!(u.setpoint_mw <= u.params.max_mw + 1e-6);
        }
    }

    #[test]
    fn test_rocof_clamped() {
        let mut m = model();
        // Absurd 2000 MW loss of load.
        let result = m.update(0.1, 0.0, 0.0, 0.1);
        assert!(result.rocof_hz_per_s <= 1.0);
    }

    #[test]
    fn test_frequency_clamped_to_emergency_band() {
        let mut m = model();
        for i in 0..10_000 {
            m.update(0.1, 2000.0, 0.0, i as f64 * 0.1);
        }
        assert!(m.frequency_hz >= 48.8 - 1e-9);
    }

    #[test]
    fn test_setpoint_clamped_to_limits() {
        let mut m = model();
        let applied = m.set_setpoint("GEN-002", 10_000.0).unwrap();
        assert_eq!(applied, 200.0);
        let applied = m.set_setpoint("GEN-002", -50.0).unwrap();
        assert_eq!(applied, 20.0);
        assert!(m.set_setpoint("GEN-099", 100.0).is_none());
    }

    #[test]
    fn test_solar_excluded_from_agc() {
        let m = model();
        let solar = m.units.iter().find(|u| u.tag == "GEN-003").unwrap();
        assert!(!solar.agc_participating);
    }

    #[test]
    fn test_status_classification() {
        let mut m = model();
        assert_eq!(m.status(), FrequencyStatus::Normal);
        m.frequency_hz = 49.4;
        assert_eq!(m.status(), FrequencyStatus::Low);
        m.frequency_hz = 50.4;
        assert_eq!(m.status(), FrequencyStatus::High);
        m.frequency_hz = 48.5;
        assert_eq!(m.status(), FrequencyStatus::Emergency);
    }
}
