/// ============================================================
///  Merit-Order Economic Dispatch
///
///  Simplified form of the optimization real grid operators run
///  every 5-15 minutes:
///
///      minimize   Σ C_g(P_g),  C(P) = a·P² + b·P + c
///      subject to Σ P_g = demand,  min_g ≤ P_g ≤ max_g
///
///  Units are ranked once by marginal cost dC/dP = 2aP + b at
///  mid-range output and loaded in that order until demand is
///  met; the last unit loaded sets the system marginal price.
///  Zero-marginal-cost solar loads first, hydro second, thermal
///  last, which is adequate when transmission constraints are not
///  binding, and the same shape lambda iteration converges to.
/// ============================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::{GeneratorKind, GeneratorParams};

#[derive(Debug, Clone)]
struct DispatchUnit {
    tag: String,
    params: GeneratorParams,
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub setpoints_mw: HashMap<String, f64>,
    pub total_cost_per_h: f64,
    pub marginal_price_per_mwh: f64,
    /// Demand left unserved when it exceeds available capacity.
    pub shortfall_mw: f64,
}

pub struct MeritOrderDispatch {
    units: Vec<DispatchUnit>,
    /// Indices into `units`, cheapest marginal cost first.
    order: Vec<usize>,
}

fn marginal_cost(params: &GeneratorParams, at_mw: f64) -> f64 {
    2.0 * params.cost_a * at_mw + params.cost_b
}

impl MeritOrderDispatch {
    pub fn new(units: Vec<(String, GeneratorParams)>) -> Self {
        let units: Vec<DispatchUnit> = units
            .into_iter()
            .map(|(tag, params)| DispatchUnit { tag, params })
            .collect();
        let mut order: Vec<usize> = (0..units.len()).collect();
        order.sort_by(|&a, &b| {
            let ua = &units[a].params;
            let ub = &units[b].params;
            let ca = marginal_cost(ua, (ua.min_mw + ua.max_mw) / 2.0);
            let cb = marginal_cost(ub, (ub.min_mw + ub.max_mw) / 2.0);
            ca.total_cmp(&cb)
        });
        debug!(
            order = ?order.iter().map(|&i| units[i].tag.as_str()).collect::<Vec<_>>(),
            "merit order built"
        );
        Self { units, order }
    }

    /// Allocate generation to meet `demand_mw`. Solar output is capped by
    /// the smaller of its rating and `solar_available_mw`.
    pub fn dispatch(&self, demand_mw: f64, solar_available_mw: f64) -> DispatchResult {
        let mut setpoints: HashMap<String, f64> = HashMap::with_capacity(self.units.len());
        let mut remaining = demand_mw;

        for &idx in &self.order {
            let unit = &self.units[idx];
            let p = &unit.params;
            let cap = if p.kind == GeneratorKind::Solar {
                p.max_mw.min(solar_available_mw.max(0.0))
            } else {
                p.max_mw
            };

            let output = if remaining > p.min_mw {
                remaining.min(cap).max(p.min_mw)
            } else if remaining > 0.0 {
                // Demand below the unit minimum: run it at what is left
                // rather than cycling it offline.
                remaining.min(p.min_mw).min(cap)
            } else {
                0.0
            };
            setpoints.insert(unit.tag.clone(), output);
            remaining -= output;
        }

        let mut shortfall = 0.0;
        if remaining > 1.0 {
            // Demand exceeds capacity: push every online unit toward max
            // proportionally. The leftover appears as a frequency decline.
            warn!(
                demand_mw,
                deficit_mw = remaining,
                "under-generation: demand exceeds available capacity"
            );
            let total: f64 = setpoints.values().sum();
            if total > 0.0 {
                let scale = demand_mw / total;
                for (tag, value) in setpoints.iter_mut() {
                    let unit = self.units.iter().find(|u| &u.tag == tag).unwrap();
                    let cap = if unit.params.kind == GeneratorKind::Solar {
                        unit.params.max_mw.min(solar_available_mw.max(0.0))
                    } else {
                        unit.params.max_mw
                    };
                    *value = (*value * scale).min(cap);
                }
            }
            shortfall = (demand_mw - setpoints.values().sum::<f64>()).max(0.0);
        }

        DispatchResult {
            total_cost_per_h: self.total_cost(&setpoints),
            marginal_price_per_mwh: self.marginal_price(&setpoints),
            setpoints_mw: setpoints,
            shortfall_mw: shortfall,
        }
    }

    pub fn total_cost(&self, setpoints: &HashMap<String, f64>) -> f64 {
        self.units
            .iter()
            .map(|u| {
                let p = setpoints.get(&u.tag).copied().unwrap_or(0.0);
                u.params.cost_a * p * p + u.params.cost_b * p + u.params.cost_c
            })
            .sum()
    }

    /// Price of the next MW: the marginal cost of the most expensive unit
    /// loaded above its minimum.
    pub fn marginal_price(&self, setpoints: &HashMap<String, f64>) -> f64 {
        for &idx in self.order.iter().rev() {
            let unit = &self.units[idx];
            let p = setpoints.get(&unit.tag).copied().unwrap_or(0.0);
            if p > unit.params.min_mw + 1.0 {
                return marginal_cost(&unit.params, p);
            }
        }
        0.0
    }

    pub fn merit_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(|&i| self.units[i].tag.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, NodeClass};

    fn dispatcher() -> MeritOrderDispatch {
        let config = Config::default_grid();
        let units = config
            .nodes
            .iter()
            .filter(|n| n.class == NodeClass::Generation)
            .map(|n| (n.tag.clone(), n.generator.clone().unwrap()))
            .collect();
        MeritOrderDispatch::new(units)
    }

    #[test]
    fn test_merit_order_solar_hydro_thermal() {
        let d = dispatcher();
        assert_eq!(d.merit_order(), vec!["GEN-003", "GEN-002", "GEN-001"]);
    }

    #[test]
    fn test_solar_capped_by_availability() {
        let d = dispatcher();
        let result = d.dispatch(500.0, 100.0);
        assert_eq!(result.setpoints_mw["GEN-003"], 100.0);
    }

    #[test]
    fn test_demand_met_when_within_capacity() {
        let d = dispatcher();
        let result = d.dispatch(510.0, 100.0);
        let total: f64 = result.setpoints_mw.values().sum();
        assert!((total - 510.0).abs() < 1e-6, "dispatched {total:.2} MW");
        assert_eq!(result.shortfall_mw, 0.0);
    }

    #[test]
    fn test_thermal_on_margin_sets_price() {
        let d = dispatcher();
        let result = d.dispatch(510.0, 100.0);
        // Solar 100, hydro 200 → thermal carries 210 and is marginal.
        let expected = 2.0 * 0.02 * result.setpoints_mw["GEN-001"] + 18.0;
        assert!((result.marginal_price_per_mwh - expected).abs() < 1e-9);
    }

    #[test]
    fn test_under_generation_scales_to_max() {
        let d = dispatcher();
        let result = d.dispatch(1200.0, 150.0);
        assert!(result.shortfall_mw > 0.0);
        assert!(result.setpoints_mw["GEN-001"] <= 500.0 + 1e-9);
        assert!(result.setpoints_mw["GEN-002"] <= 200.0 + 1e-9);
        assert!(result.setpoints_mw["GEN-003"] <= 150.0 + 1e-9);
    }

    #[test]
    fn test_limits_respected() {
        let d = dispatcher();
        for demand in [0.0, 50.0, 150.0, 400.0, 700.0, 860.0] {
            let result = d.dispatch(demand, 80.0);
            for unit in &d.units {
                let p = result.setpoints_mw[&unit.tag];
                assert!(p <= unit.params.max_mw + 1e-9, "{} over max", unit.tag);
                assert!(p >= 0.0);
            }
        }
    }

    #[test]
    fn test_dispatch_is_deterministic() {
        let d = dispatcher();
        let a = d.dispatch(480.0, 60.0);
        let b = d.dispatch(480.0, 60.0);
        assert_eq!(a.setpoints_mw, b.setpoints_mw);
        assert_eq!(a.total_cost_per_h, b.total_cost_per_h);
    }

    #[test]
    fn test_night_no_solar() {
        let d = dispatcher();
        let result = d.dispatch(300.0, 0.0);
        assert_eq!(result.setpoints_mw["GEN-003"], 0.0);
    }
}
