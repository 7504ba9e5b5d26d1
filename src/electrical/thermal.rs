/// ============================================================
///  Transformer Thermal Model (IEC 60076-7)
///
///  Two thermal masses drive the loading limits of a power
///  transformer:
///   1. Top-oil temperature – first-order response toward the
///      loading-dependent steady state
///
///          θ_oil* = θ_ambient + (θ_oil_rated − θ_ambient) · K^n
///          dθ_oil/dt = (θ_oil* − θ_oil) / τ_oil
///
///   2. Winding hot-spot – algebraic rise over the oil
///
///          θ_hs = θ_oil + H · Δθ_r · K^(2m)
///
///  K is per-unit loading (MVA / MVA_rated), optionally scaled
///  by a degradation factor ≥ 1.0 to emulate insulation aging
///  or cooling faults. Alarm and trip latch with hysteresis so
///  the outputs do not chatter at the thresholds.
/// ============================================================

use tracing::{info, warn};

use crate::config::TransformerParams;

#[derive(Debug, Clone)]
pub struct ThermalUpdate {
    pub theta_oil_c: f64,
    pub theta_hs_c: f64,
    pub loading_pu: f64,
    pub alarm_active: bool,
    pub trip_active: bool,
    pub rate_of_rise_c_per_min: f64,
    /// Projected time until the hot-spot crosses the alarm threshold,
    /// None when the temperature is steady or falling.
    pub time_to_alarm_s: Option<f64>,
    pub time_to_trip_s: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct ThermalMargin {
    pub to_alarm_c: f64,
    pub to_trip_c: f64,
    pub capacity_remaining_percent: f64,
}

#[derive(Debug)]
pub struct ThermalModel {
    tag: String,
    params: TransformerParams,
    pub theta_oil_c: f64,
    pub theta_hs_c: f64,
    pub loading_pu: f64,
    pub alarm_active: bool,
    pub trip_active: bool,
    degradation_factor: f64,
    theta_oil_prev: f64,
}

impl ThermalModel {
    pub fn new(tag: &str, params: TransformerParams) -> Self {
        // Transformer starts cold at ambient.
        let ambient = params.ambient_c;
        Self {
            tag: tag.to_string(),
            theta_oil_c: ambient,
            theta_hs_c: ambient,
            loading_pu: 0.0,
            alarm_active: false,
            trip_active: false,
            degradation_factor: 1.0,
            theta_oil_prev: ambient,
            params,
        }
    }

    pub fn update(&mut self, dt_s: f64, loading_mva: f64) -> ThermalUpdate {
        let p = &self.params;
        let k = (loading_mva / p.rated_mva).max(0.0);
        self.loading_pu = k;
        let k_eff = k * self.degradation_factor;

        // Top-oil first-order lag toward the loading-dependent target.
        let delta_oil_rated = p.oil_rated_c - p.ambient_c;
        let oil_rise = if k_eff > 0.0 {
            delta_oil_rated * k_eff.powf(p.oil_exponent_n)
        } else {
            0.0
        };
        let oil_target = p.ambient_c + oil_rise;
        let tau_s = p.oil_time_constant_min * 60.0;
        if tau_s > 0.0 {
            self.theta_oil_c += (oil_target - self.theta_oil_c) / tau_s * dt_s;
        } else {
            self.theta_oil_c = oil_target;
        }
        // The oil never cools below ambient.
        self.theta_oil_c = self.theta_oil_c.max(p.ambient_c);

        // Hot-spot rise over oil, algebraic.
        let hs_rise = if k_eff > 0.0 {
            p.hot_spot_factor_h * p.hot_spot_rise_c * k_eff.powf(2.0 * p.winding_exponent_m)
        } else {
            0.0
        };
        self.theta_hs_c = self.theta_oil_c + hs_rise;

        // Alarm with 5 °C hysteresis, trip with 10 °C.
        if self.theta_hs_c > p.alarm_c {
            if !self.alarm_active {
                warn!(
                    tag = %self.tag,
                    theta_hs_c = self.theta_hs_c,
                    threshold_c = p.alarm_c,
                    "transformer thermal alarm"
                );
            }
            self.alarm_active = true;
        } else if self.theta_hs_c < p.alarm_c - 5.0 {
            if self.alarm_active {
                info!(tag = %self.tag, "transformer thermal alarm cleared");
            }
            self.alarm_active = false;
        }
        if self.theta_hs_c > p.trip_c {
            if !self.trip_active {
                warn!(
                    tag = %self.tag,
                    theta_hs_c = self.theta_hs_c,
                    threshold_c = p.trip_c,
                    "transformer thermal trip"
                );
            }
            self.trip_active = true;
        } else if self.theta_hs_c < p.trip_c - 10.0 {
            if self.trip_active {
                info!(tag = %self.tag, "transformer thermal trip reset");
            }
            self.trip_active = false;
        }

        // Rate of rise and projected times for the operator display.
        let rate_c_per_s = if dt_s > 0.0 {
            (self.theta_oil_c - self.theta_oil_prev) / dt_s
        } else {
            0.0
        };
        self.theta_oil_prev = self.theta_oil_c;
        let (time_to_alarm_s, time_to_trip_s) = if rate_c_per_s > 0.01 / 60.0 {
            let to_alarm = p.alarm_c - self.theta_hs_c;
            let to_trip = p.trip_c - self.theta_hs_c;
            (
                (to_alarm > 0.0).then(|| to_alarm / rate_c_per_s),
                (to_trip > 0.0).then(|| to_trip / rate_c_per_s),
            )
        } else {
            (None, None)
        };

        ThermalUpdate {
            theta_oil_c: self.theta_oil_c,
            theta_hs_c: self.theta_hs_c,
            loading_pu: self.loading_pu,
            alarm_active: self.alarm_active,
            trip_active: self.trip_active,
            rate_of_rise_c_per_min: rate_c_per_s * 60.0,
            time_to_alarm_s,
            time_to_trip_s,
        }
    }

    /// Simulated aging: a degraded transformer runs hotter at the same
    /// loading (1.05 early, 1.10 moderate, 1.20 approaching failure).
    pub fn set_degradation_factor(&mut self, factor: f64) {
        self.degradation_factor = factor.max(1.0);
        info!(
            tag = %self.tag,
            factor = self.degradation_factor,
            "transformer degradation factor set"
        );
    }

    pub fn degradation_factor(&self) -> f64 {
        self.degradation_factor
    }

    pub fn margins(&self) -> ThermalMargin {
        let p = &self.params;
        let to_trip = (p.trip_c - self.theta_hs_c).max(0.0);
        ThermalMargin {
            to_alarm_c: (p.alarm_c - self.theta_hs_c).max(0.0),
            to_trip_c: to_trip,
            capacity_remaining_percent: to_trip / (p.trip_c - p.ambient_c) * 100.0,
        }
    }

    /// Maximum permissible emergency loading for the given duration.
    /// Operators push transformers past nameplate during N-1 contingencies
    /// when the thermal margin allows; short excursions tolerate more.
    pub fn emergency_load_limit_pu(&self, duration_min: f64) -> f64 {
        let time_ratio = duration_min / self.params.oil_time_constant_min;
        let emergency_mult = if time_ratio < 0.1 {
            1.5
        } else if time_ratio < 0.5 {
            1.3
        } else {
            1.15
        };
        let limit = emergency_mult * (1.0 - self.loading_pu) + self.loading_pu;
        limit.min(1.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransformerParams;

    fn model() -> ThermalModel {
        ThermalModel::new("SUB-001", TransformerParams::default())
    }

    /// Run with one-minute steps for the given number of simulated hours.
    fn run(m: &mut ThermalModel, loading_mva: f64, hours: f64) -> ThermalUpdate {
        let steps = (hours * 60.0) as usize;
        let mut last = m.update(60.0, loading_mva);
        for _ in 1..steps {
            last = m.update(60.0, loading_mva);
        }
        last
    }

    #[test]
    fn test_cold_start_at_ambient() {
        let m = model();
        assert_eq!(m.theta_oil_c, 35.0);
        assert_eq!(m.theta_hs_c, 35.0);
    }

    #[test]
    fn test_rated_load_asymptotes_to_rated_oil() {
        let mut m = model();
        // τ_oil = 180 min; 18 h ≈ 6 time constants.
        let last = run(&mut m, 150.0, 18.0);
        assert!(
            (last.theta_oil_c - 75.0).abs() < 0.5,
            "oil at K=1.0 should approach 75 °C, got {:.1}",
            last.theta_oil_c
        );
    }

    #[test]
    fn test_hotspot_always_at_or_above_oil_and_ambient() {
        let mut m = model();
        for loading in [0.0, 40.0, 90.0, 150.0, 180.0, 60.0, 0.0] {
            let last = run(&mut m, loading, 2.0);
            assert!(last.theta_oil_c >= 35.0 - 1e-9);
            assert!(last.theta_hs_c >= last.theta_oil_c - 1e-9);
        }
    }

    #[test]
    fn test_sustained_overload_reaches_alarm() {
        let mut m = model();
        let last = run(&mut m, 180.0, 24.0); // K = 1.2 sustained
        assert!(
            last.theta_hs_c > 98.0,
            "hot-spot at K=1.2 should cross the alarm threshold, got {:.1}",
            last.theta_hs_c
        );
        assert!(last.alarm_active);
    }

    #[test]
    fn test_alarm_hysteresis() {
        let mut m = model();
        run(&mut m, 180.0, 24.0);
        assert!(m.alarm_active);
        // Just below threshold is inside the hysteresis band.
        m.theta_oil_c = 96.0 - 1.1 * 20.0; // puts θ_hs ≈ 96 at K≈1
        let last = run(&mut m, 150.0, 0.05);
        assert!(last.theta_hs_c < 98.0 && last.theta_hs_c > 93.0);
        assert!(m.alarm_active, "alarm must hold within hysteresis band");
        // Cooling well below clears it.
        let last = run(&mut m, 30.0, 24.0);
        assert!(!last.alarm_active, "alarm should clear after cooldown");
    }

    #[test]
    fn test_degradation_runs_hotter() {
        let mut healthy = model();
        let mut degraded = model();
        degraded.set_degradation_factor(1.2);
        let h = run(&mut healthy, 120.0, 6.0);
        let d = run(&mut degraded, 120.0, 6.0);
        assert!(d.theta_hs_c > h.theta_hs_c + 2.0);
    }

    #[test]
    fn test_degradation_floor_is_one() {
        let mut m = model();
        m.set_degradation_factor(0.5);
        assert_eq!(m.degradation_factor(), 1.0);
    }

    #[test]
    fn test_time_to_alarm_projected_while_heating() {
        let mut m = model();
        let last = run(&mut m, 180.0, 0.5);
        assert!(last.rate_of_rise_c_per_min > 0.0);
        assert!(last.time_to_alarm_s.is_some());
    }

    #[test]
    fn test_emergency_limit_shrinks_with_duration() {
        let mut m = model();
        run(&mut m, 90.0, 2.0);
        let short = m.emergency_load_limit_pu(5.0);
        let long = m.emergency_load_limit_pu(120.0);
        assert!(short > long);
        assert!(short <= 1.5);
    }
}
