/// ============================================================
///  DC Power Flow Solver
///
///  Linearized power flow for real-time simulation, the fast
///  approximation used inside real Energy Management Systems:
///   1. All bus voltages ≈ 1.0 per-unit
///   2. R << X on every line
///   3. Angle differences small (sin θ ≈ θ)
///   4. Reactive power decoupled from active power
///
///  Under these assumptions P_ij = (θ_i − θ_j) / X_ij, which is
///  the linear system B·θ = P on the DC susceptance matrix B.
///  The slack bus angle is fixed at 0; its row and column are
///  struck from B, and the reduced matrix is LU-factored once
///  at construction. Each tick is one forward/back substitution.
/// ============================================================

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::{Config, LineConfig};

/// Per-line solution: active flow from `from` to `to` and ohmic loss.
#[derive(Debug, Clone)]
pub struct LineFlow {
    pub from: String,
    pub to: String,
    pub flow_mw: f64,
    pub loss_mw: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PowerFlowResult {
    pub converged: bool,
    pub bus_angle_rad: HashMap<String, f64>,
    pub bus_voltage_pu: HashMap<String, f64>,
    pub line_flows: Vec<LineFlow>,
    pub total_generation_mw: f64,
    pub total_load_mw: f64,
    pub total_losses_mw: f64,
}

/// Dense LU factorization with partial pivoting. The reduced
/// susceptance matrix of a 15-bus grid is 14×14; no linear-algebra
/// dependency is warranted at this size.
struct LuFactors {
    n: usize,
    lu: Vec<f64>,
    pivot: Vec<usize>,
}

impl LuFactors {
    fn factor(mut a: Vec<f64>, n: usize) -> Option<Self> {
        let mut pivot = vec![0usize; n];
        for k in 0..n {
            let mut max_row = k;
            let mut max_val = a[k * n + k].abs();
            for r in (k + 1)..n {
                let v = a[r * n + k].abs();
                if v > max_val {
                    max_val = v;
                    max_row = r;
                }
            }
            if max_val < 1e-12 {
                return None; // singular
            }
            pivot[k] = max_row;
            if max_row != k {
                for c in 0..n {
                    a.swap(k * n + c, max_row * n + c);
                }
            }
            let diag = a[k * n + k];
            for r in (k + 1)..n {
                let factor = a[r * n + k] / diag;
                a[r * n + k] = factor;
                for c in (k + 1)..n {
                    a[r * n + c] -= factor * a[k * n + c];
                }
            }
        }
        Some(Self { n, lu: a, pivot })
    }

    fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.n;
        let mut x = b.to_vec();
        for k in 0..n {
            x.swap(k, self.pivot[k]);
        }
        // Forward substitution (unit lower triangle).
        for r in 1..n {
            for c in 0..r {
                x[r] -= self.lu[r * n + c] * x[c];
            }
        }
        // Back substitution.
        for r in (0..n).rev() {
            for c in (r + 1)..n {
                x[r] -= self.lu[r * n + c] * x[c];
            }
            x[r] /= self.lu[r * n + r];
        }
        x
    }
}

pub struct DcPowerFlow {
    bus_tags: Vec<String>,
    bus_index: HashMap<String, usize>,
    slack: usize,
    lines: Vec<LineConfig>,
    base_mva: f64,
    factors: Option<LuFactors>,
    /// Angles retained from the last converged solve; reused verbatim
    /// when the reduced matrix is singular.
    prev_angles: Vec<f64>,
}

impl DcPowerFlow {
    pub fn new(config: &Config) -> Self {
        let bus_tags: Vec<String> = config.nodes.iter().map(|n| n.tag.clone()).collect();
        let bus_index: HashMap<String, usize> = bus_tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (tag.clone(), i))
            .collect();
        let slack_tag = config
            .slack_bus()
            .map(|n| n.tag.clone())
            .unwrap_or_else(|| bus_tags[0].clone());
        let slack = bus_index[&slack_tag];
        let n = bus_tags.len();

        // B[i][j] = -1/X for each line, +1/X accumulated on both diagonals.
        let mut b = vec![0.0f64; n * n];
        for line in &config.lines {
            let i = bus_index[&line.from];
            let j = bus_index[&line.to];
            let susceptance = 1.0 / line.x_pu;
            b[i * n + j] -= susceptance;
            b[j * n + i] -= susceptance;
            b[i * n + i] += susceptance;
            b[j * n + j] += susceptance;
        }

        // Strike the slack row and column to form the reduced matrix.
        let m = n - 1;
        let keep: Vec<usize> = (0..n).filter(|&i| i != slack).collect();
        let mut reduced = vec![0.0f64; m * m];
        for (ri, &i) in keep.iter().enumerate() {
            for (rj, &j) in keep.iter().enumerate() {
                reduced[ri * m + rj] = b[i * n + j];
            }
        }

        let factors = LuFactors::factor(reduced, m);
        if factors.is_none() {
            warn!("reduced susceptance matrix is singular; power flow will not converge");
        }
        debug!(buses = n, slack = %slack_tag, "DC power flow initialized");

        Self {
            prev_angles: vec![0.0; n],
            bus_tags,
            bus_index,
            slack,
            lines: config.lines.clone(),
            base_mva: config.system_base_mva,
            factors,
        }
    }

    pub fn slack_tag(&self) -> &str {
        &self.bus_tags[self.slack]
    }

    /// Solve for bus angles given per-bus generation and load in MW.
    ///
    /// The slack bus closes the balance: its injection is recomputed from
    /// the solved line flows, so generation = load + losses holds on every
    /// converged result. Never fails the tick; a singular matrix yields
    /// `converged = false` and the previous angles.
    pub fn solve(
        &mut self,
        generation_mw: &HashMap<String, f64>,
        load_mw: &HashMap<String, f64>,
    ) -> PowerFlowResult {
        let n = self.bus_tags.len();

        let theta: Vec<f64> = match &self.factors {
            Some(factors) => {
                // Net injection per bus, per-unit on the system base.
                let mut injection = vec![0.0f64; n];
                for (tag, &idx) in &self.bus_index {
                    let injected = generation_mw.get(tag).copied().unwrap_or(0.0);
                    let load = load_mw.get(tag).copied().unwrap_or(0.0);
                    injection[idx] = (injected - load) / self.base_mva;
                }
                let reduced_p: Vec<f64> = (0..n)
                    .filter(|&i| i != self.slack)
                    .map(|i| injection[i])
                    .collect();
                let reduced_theta = factors.solve(&reduced_p);

                let mut theta = vec![0.0f64; n];
                let mut it = reduced_theta.into_iter();
                for (i, slot) in theta.iter_mut().enumerate() {
                    if i != self.slack {
                        *slot = it.next().unwrap_or(0.0);
                    }
                }
                self.prev_angles = theta.clone();
                theta
            }
            None => {
                warn!("singular susceptance matrix; retaining previous bus angles");
                return self.failed_result(load_mw);
            }
        };

        // Line flows and losses from the angle solution.
        let mut line_flows = Vec::with_capacity(self.lines.len());
        let mut total_losses_mw = 0.0;
        let mut slack_injection_pu = 0.0;
        for line in &self.lines {
            let i = self.bus_index[&line.from];
            let j = self.bus_index[&line.to];
            let flow_pu = (theta[i] - theta[j]) / line.x_pu;
            let loss_pu = flow_pu * flow_pu * line.r_pu;
            if i == self.slack {
                slack_injection_pu += flow_pu;
            }
            if j == self.slack {
                slack_injection_pu -= flow_pu;
            }
            total_losses_mw += loss_pu * self.base_mva;
            line_flows.push(LineFlow {
                from: line.from.clone(),
                to: line.to.clone(),
                flow_mw: flow_pu * self.base_mva,
                loss_mw: loss_pu * self.base_mva,
            });
        }

        // Totals with the slack bus closing the balance. Half of each line
        // loss is attributed to the sending end, so the slack picks up the
        // loss share its outgoing flows carry.
        let slack_tag = self.bus_tags[self.slack].clone();
        let slack_load = load_mw.get(&slack_tag).copied().unwrap_or(0.0);
        let slack_gen_mw = slack_injection_pu * self.base_mva + slack_load;
        let mut total_generation_mw = slack_gen_mw;
        for (tag, mw) in generation_mw {
            if *tag != slack_tag {
                total_generation_mw += mw;
            }
        }
        let total_load_mw: f64 = load_mw.values().sum();

        // Loss attribution in the DC model is approximate: losses ride on
        // top of the lossless angle solution, so fold them into the slack.
        let total_generation_mw = total_generation_mw + total_losses_mw;

        let residual = (total_generation_mw - total_load_mw - total_losses_mw).abs();
        if residual > 0.1 {
            warn!(
                residual_mw = residual,
                generation_mw = total_generation_mw,
                load_mw = total_load_mw,
                losses_mw = total_losses_mw,
                "power balance residual exceeds tolerance"
            );
        }

        let bus_angle_rad: HashMap<String, f64> = self
            .bus_tags
            .iter()
            .cloned()
            .zip(theta.iter().copied())
            .collect();
        let bus_voltage_pu: HashMap<String, f64> =
            self.bus_tags.iter().cloned().map(|t| (t, 1.0)).collect();

        PowerFlowResult {
            converged: true,
            bus_angle_rad,
            bus_voltage_pu,
            line_flows,
            total_generation_mw,
            total_load_mw,
            total_losses_mw,
        }
    }

    fn failed_result(&self, load_mw: &HashMap<String, f64>) -> PowerFlowResult {
        let bus_angle_rad = self
            .bus_tags
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), self.prev_angles[i]))
            .collect();
        let bus_voltage_pu = self.bus_tags.iter().cloned().map(|t| (t, 1.0)).collect();
        PowerFlowResult {
            converged: false,
            bus_angle_rad,
            bus_voltage_pu,
            line_flows: Vec::new(),
            total_generation_mw: 0.0,
            total_load_mw: load_mw.values().sum(),
            total_losses_mw: 0.0,
        }
    }

    /// Aggregate |I| over the lines incident to a bus, in amperes,
    /// using the bus nominal voltage (|V| = 1.0 pu under DC).
    pub fn bus_current_a(&self, result: &PowerFlowResult, tag: &str, nominal_kv: f64) -> f64 {
        if nominal_kv < 0.1 {
            return 0.0;
        }
        result
            .line_flows
            .iter()
            .filter(|l| l.from == tag || l.to == tag)
            .map(|l| three_phase_current_a(l.flow_mw, nominal_kv))
            .sum()
    }

    /// Power transiting a bus: half the incident flow magnitudes
    /// (every MW through the bus enters on one line and leaves on another).
    pub fn bus_through_mw(&self, result: &PowerFlowResult, tag: &str) -> f64 {
        let total: f64 = result
            .line_flows
            .iter()
            .filter(|l| l.from == tag || l.to == tag)
            .map(|l| l.flow_mw.abs())
            .sum();
        total / 2.0
    }
}

/// Three-phase current magnitude: I = P / (√3 · V).
pub fn three_phase_current_a(p_mw: f64, v_kv: f64) -> f64 {
    if v_kv < 0.1 {
        return 0.0;
    }
    p_mw.abs() * 1000.0 / (1.732 * v_kv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn solve_default() -> (DcPowerFlow, PowerFlowResult) {
        let config = Config::default_grid();
        let mut pf = DcPowerFlow::new(&config);
        let generation = HashMap::from([
            ("GEN-001".to_string(), 250.0),
            ("GEN-002".to_string(), 160.0),
            ("GEN-003".to_string(), 100.0),
        ]);
        let load = HashMap::from([
            ("DIST-001".to_string(), 150.0),
            ("DIST-002".to_string(), 120.0),
            ("DIST-003".to_string(), 100.0),
            ("DIST-004".to_string(), 80.0),
            ("DIST-005".to_string(), 60.0),
        ]);
        let result = pf.solve(&generation, &load);
        (pf, result)
    }

    #[test]
    fn test_power_balance_within_tolerance() {
        let (_, result) = solve_default();
        assert!(result.converged);
        let residual =
            (result.total_generation_mw - result.total_load_mw - result.total_losses_mw).abs();
        assert!(residual < 0.1, "balance residual {residual:.4} MW");
    }

    #[test]
    fn test_slack_angle_is_reference() {
        let (pf, result) = solve_default();
        let slack_angle = result.bus_angle_rad[pf.slack_tag()];
        assert_eq!(slack_angle, 0.0);
    }

    #[test]
    fn test_voltages_fixed_at_unity() {
        let (_, result) = solve_default();
        assert!(result.bus_voltage_pu.values().all(|&v| v == 1.0));
    }

    #[test]
    fn test_losses_positive_and_small() {
        let (_, result) = solve_default();
        assert!(result.total_losses_mw > 0.0);
        // A well-sized transmission grid loses a few percent.
        assert!(
            result.total_losses_mw < 0.05 * result.total_load_mw,
            "losses {:.2} MW unreasonably high",
            result.total_losses_mw
        );
    }

    #[test]
    fn test_flow_direction_toward_load() {
        let (_, result) = solve_default();
        // Power must leave GEN-001 toward SUB-001.
        let gen_line = result
            .line_flows
            .iter()
            .find(|l| l.from == "GEN-001")
            .unwrap();
        assert!(gen_line.flow_mw > 0.0, "flow {:.2}", gen_line.flow_mw);
    }

    #[test]
    fn test_bus_current_aggregation() {
        let (pf, result) = solve_default();
        let i = pf.bus_current_a(&result, "SUB-001", 400.0);
        assert!(i > 0.0 && i < 2000.0, "current {i:.0} A");
    }

    #[test]
    fn test_zero_injection_zero_flow() {
        let config = Config::default_grid();
        let mut pf = DcPowerFlow::new(&config);
        let result = pf.solve(&HashMap::new(), &HashMap::new());
        assert!(result.converged);
        for flow in &result.line_flows {
            assert!(flow.flow_mw.abs() < 1e-9);
        }
    }
}
