/// ============================================================
///  Grid Simulator: Orchestration Engine
///
///  Fixed-step coordinator for the 15-bus grid (default 100 ms,
///  the usual RTU scan rate). Each tick:
///
///   1. simulated wall-clock → time-of-day, season
///   2. load profile → per-feeder demand (minus UFLS shed)
///   3. solar profile → PV availability
///   4. economic dispatch on its own cadence → setpoints,
///      pushed through the holding-register write so the SOE
///      captures every change
///   5. DC power flow
///   6. frequency dynamics (swing + governor + AGC)
///   7. per-bus quantities → node electrical updates
///   8. snapshot broadcast to subscribers
///
///  The tick runs on one task and never suspends on protocol
///  I/O; all node mutation goes through the per-node lock the
///  protocol servers also use, so wire reads see either the
///  pre-tick or post-tick image.
/// ============================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{Config, GeneratorKind, NodeClass};
use crate::electrical::dispatch::MeritOrderDispatch;
use crate::electrical::frequency::FrequencyModel;
use crate::electrical::power_flow::{DcPowerFlow, three_phase_current_a};
use crate::electrical::profiles;
use crate::nodes::registers::{encode_power_mw, generation};
use crate::nodes::{ElectricalInput, NodeKind, RtuNode};
use crate::shared_state::{GridSnapshot, NodeHandle, NodeSnapshot, node_handle};

// ─── Command channel ─────────────────────────────────────────────────────────

/// Operations external collaborators may inject; each is identical in
/// effect to the corresponding wire command on a protocol socket.
#[derive(Debug, Clone)]
pub enum NodeOp {
    OpenBreaker,
    CloseBreaker,
    ReadBits { address: u16, count: u16 },
    ReadWords { address: u16, count: u16 },
    WriteCoil { address: u16, value: bool },
    WriteHolding { address: u16, value: u16 },
    WriteHoldings { address: u16, values: Vec<u16> },
    SetGovernorSetpoint { mw: f64 },
    SetAvrSetpoint { kv: f64 },
    ResetProtection,
    SetDegradationFactor { factor: f64 },
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub node: String,
    pub op: NodeOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Success,
    Bits(Vec<bool>),
    Words(Vec<u16>),
    OutOfRange,
    Busy,
    DeviceFault,
    UnknownNode,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimStats {
    pub ticks: u64,
    pub frequency_violations: u64,
    pub power_flow_failures: u64,
}

// ─── The simulator ───────────────────────────────────────────────────────────

pub struct GridSimulator {
    config: Arc<Config>,
    nodes: Vec<NodeHandle>,
    tags: Vec<String>,
    by_tag: HashMap<String, usize>,
    power_flow: DcPowerFlow,
    frequency: FrequencyModel,
    dispatch: MeritOrderDispatch,
    snapshot_tx: broadcast::Sender<GridSnapshot>,
    start_time: DateTime<Utc>,
    sim_time_s: f64,
    tick: u64,
    last_losses_mw: f64,
    last_dispatch_s: Option<f64>,
    pub stats: SimStats,
}

impl GridSimulator {
    pub fn new(config: Config) -> Result<Self, crate::error::ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let nodes: Vec<NodeHandle> = config
            .nodes
            .iter()
            .map(|nc| node_handle(RtuNode::new(nc, &config.protection)))
            .collect();
        let tags: Vec<String> = config.nodes.iter().map(|n| n.tag.clone()).collect();
        let by_tag = tags
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();

        let units: Vec<_> = config
            .nodes
            .iter()
            .filter(|n| n.class == NodeClass::Generation)
            .map(|n| (n.tag.clone(), n.generator.clone().unwrap()))
            .collect();

        let power_flow = DcPowerFlow::new(&config);
        let frequency = FrequencyModel::new(
            units.clone(),
            config.nominal_frequency_hz,
            config.frequency.clone(),
            config.agc.clone(),
        );
        let dispatch = MeritOrderDispatch::new(units);
        let (snapshot_tx, _) = broadcast::channel(64);
        let start_time = config.start_time.unwrap_or_else(Utc::now);

        info!(
            nodes = nodes.len(),
            lines = config.lines.len(),
            timestep_s = config.timestep_s,
            "grid simulator initialized"
        );

        Ok(Self {
            config,
            nodes,
            tags,
            by_tag,
            power_flow,
            frequency,
            dispatch,
            snapshot_tx,
            start_time,
            sim_time_s: 0.0,
            tick: 0,
            last_losses_mw: 0.0,
            last_dispatch_s: None,
            stats: SimStats::default(),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    pub fn node(&self, tag: &str) -> Option<NodeHandle> {
        self.by_tag.get(tag).map(|&i| Arc::clone(&self.nodes[i]))
    }

    pub fn nodes(&self) -> Vec<(String, NodeHandle)> {
        self.tags
            .iter()
            .cloned()
            .zip(self.nodes.iter().map(Arc::clone))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot_sender(&self) -> broadcast::Sender<GridSnapshot> {
        self.snapshot_tx.clone()
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency.frequency_hz
    }

    pub fn sim_time_s(&self) -> f64 {
        self.sim_time_s
    }

    pub fn sim_clock(&self) -> DateTime<Utc> {
        self.start_time + chrono::Duration::milliseconds((self.sim_time_s * 1000.0) as i64)
    }

    // ── The tick ─────────────────────────────────────────────────────────────

    pub fn step(&mut self) {
        let dt = self.config.timestep_s;
        self.sim_time_s += dt;
        self.tick += 1;
        let when = self.sim_clock();

        // 1-2. Demand from the profile, shaved by any active UFLS stages.
        let load_factor = profiles::load_factor(when);
        let mut loads_mw: HashMap<String, f64> = HashMap::new();
        let mut total_load_mw = 0.0;
        for (i, tag) in self.tags.iter().enumerate() {
            let Ok(node) = self.nodes[i].read() else { continue };
            if let NodeKind::Distribution(feeder) = &node.kind {
                let mut load = feeder.params.peak_load_mw * load_factor;
                load *= 1.0 - node.ufls_shed_percent() / 100.0;
                if !node.breaker_closed() {
                    load = 0.0;
                }
                loads_mw.insert(tag.clone(), load);
                total_load_mw += load;
            }
        }

        // 3. PV availability.
        let solar_rated: f64 = self
            .config
            .nodes
            .iter()
            .filter_map(|n| n.generator.as_ref())
            .filter(|g| g.kind == GeneratorKind::Solar)
            .map(|g| g.rated_mw)
            .sum();
        let solar_available_mw = solar_rated * profiles::solar_capacity_factor(when);

        // 4. Economic dispatch on its own cadence, plus the loss estimate
        // from the previous tick.
        let dispatch_due = match self.last_dispatch_s {
            None => true,
            Some(at) => self.sim_time_s - at >= self.config.dispatch_interval_s,
        };
        if dispatch_due {
            self.last_dispatch_s = Some(self.sim_time_s);
            let result = self
                .dispatch
                .dispatch(total_load_mw + self.last_losses_mw, solar_available_mw);
            debug!(
                demand_mw = total_load_mw,
                marginal_price = result.marginal_price_per_mwh,
                "dispatch run"
            );
            for (tag, mw) in &result.setpoints_mw {
                // Through the register write so the SOE captures changes.
                if let Some(&idx) = self.by_tag.get(tag) {
                    if let Ok(mut node) = self.nodes[idx].write() {
                        let _ = node.write_holding_register(
                            generation::holding::GOVERNOR_SETPOINT_MW,
                            encode_power_mw(*mw),
                        );
                    }
                }
            }
        }

        // Reconcile operator/wire setpoint writes into the frequency model.
        for (i, tag) in self.tags.iter().enumerate() {
            let Ok(mut node) = self.nodes[i].write() else { continue };
            if let NodeKind::Generation(unit) = &mut node.kind {
                if unit.setpoint_dirty {
                    unit.setpoint_dirty = false;
                    let setpoint = unit.governor_setpoint_mw;
                    self.frequency.set_setpoint(tag, setpoint);
                }
            }
        }

        // 5-6. Power flow on the actual electrical outputs; the slack bus
        // closes the balance.
        let generation_mw = self.frequency.outputs();
        let pf = self.power_flow.solve(&generation_mw, &loads_mw);
        if !pf.converged {
            self.stats.power_flow_failures += 1;
        }
        self.last_losses_mw = pf.total_losses_mw;

        // 7. Frequency dynamics against the served load.
        let freq = self
            .frequency
            .update(dt, total_load_mw, pf.total_losses_mw, self.sim_time_s);

        // 8. Per-bus quantities into each node.
        for (i, tag) in self.tags.iter().enumerate() {
            let Ok(mut node) = self.nodes[i].write() else { continue };
            let nominal_kv = node.nominal_kv();
            let angle_deg = pf.bus_angle_rad.get(tag).copied().unwrap_or(0.0).to_degrees();
            let voltage_kv = pf.bus_voltage_pu.get(tag).copied().unwrap_or(1.0) * nominal_kv;

            let (p_mw, q_mvar, current_a) = match node.class() {
                NodeClass::Generation => {
                    let p = freq.generator_outputs_mw.get(tag).copied().unwrap_or(0.0);
                    let q = p * (1.0 / 0.95f64.powi(2) - 1.0).sqrt() * 0.5;
                    (p, q, three_phase_current_a(p, voltage_kv))
                }
                NodeClass::Transmission => {
                    let p = self.power_flow.bus_through_mw(&pf, tag);
                    let q = p * (1.0 / 0.95f64.powi(2) - 1.0).sqrt();
                    (p, q, self.power_flow.bus_current_a(&pf, tag, nominal_kv))
                }
                NodeClass::Distribution => {
                    let p = loads_mw.get(tag).copied().unwrap_or(0.0);
                    let mvar_offset = match &node.kind {
                        NodeKind::Distribution(feeder) => feeder.capacitor_mvar_online(),
                        _ => 0.0,
                    };
                    let q = (p * (1.0 / 0.92f64.powi(2) - 1.0).sqrt() - mvar_offset).max(0.0);
                    (p, q, three_phase_current_a(p, voltage_kv))
                }
            };

            node.update_electrical_state(
                ElectricalInput {
                    voltage_kv,
                    voltage_angle_deg: angle_deg,
                    current_a,
                    p_mw,
                    q_mvar,
                    frequency_hz: freq.frequency_hz,
                },
                dt,
            );

            if node.class() == NodeClass::Generation {
                node.check_synchronization(voltage_kv, angle_deg);
            }
        }

        // 9. Counters and the published snapshot.
        self.stats.ticks += 1;
        if (freq.frequency_hz - self.config.nominal_frequency_hz).abs() > 0.5 {
            self.stats.frequency_violations += 1;
        }
        self.publish_snapshot(&pf, freq.rocof_hz_per_s, total_load_mw);
    }

    fn publish_snapshot(
        &self,
        pf: &crate::electrical::power_flow::PowerFlowResult,
        rocof: f64,
        total_load_mw: f64,
    ) {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for (i, tag) in self.tags.iter().enumerate() {
            if let Ok(node) = self.nodes[i].read() {
                nodes.insert(tag.clone(), NodeSnapshot::from_node(&node));
            }
        }
        let snapshot = GridSnapshot {
            timestamp: self.sim_clock(),
            tick: self.tick,
            frequency_hz: self.frequency.frequency_hz,
            rocof_hz_per_s: rocof,
            frequency_status: self.frequency.status().as_str().to_string(),
            total_generation_mw: pf.total_generation_mw,
            total_load_mw,
            total_losses_mw: pf.total_losses_mw,
            nodes,
        };
        // Nobody listening is fine; subscribers must never block the tick.
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Run for a simulated duration. In real-time mode each tick is
    /// throttled to wall-clock; otherwise the loop yields to the
    /// scheduler between ticks and runs as fast as possible.
    pub async fn run_for(&mut self, duration_s: f64) {
        let steps = (duration_s / self.config.timestep_s).round() as u64;
        let mut interval = tokio::time::interval(Duration::from_secs_f64(
            self.config.timestep_s.max(0.001),
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        for step_num in 0..steps {
            if self.config.realtime {
                interval.tick().await;
            } else if step_num % 64 == 0 {
                tokio::task::yield_now().await;
            }
            self.step();
            if step_num % 600 == 0 {
                let clock = self.sim_clock();
                let time_of_day = format!("{:02}:{:02}", clock.hour(), clock.minute());
                info!(
                    t_s = self.sim_time_s,
                    frequency_hz = self.frequency.frequency_hz,
                    time_of_day = %time_of_day,
                    season = profiles::Season::of(clock).as_str(),
                    "simulation progress"
                );
            }
        }
    }

    pub async fn run_forever(&mut self) {
        loop {
            self.run_for(3600.0).await;
        }
    }

    // ── Command channel ──────────────────────────────────────────────────────

    /// Route an injected command to the target node. Never re-enters the
    /// tick; the same locks protocol writes use serialize everything.
    pub fn execute(&mut self, request: CommandRequest) -> CommandOutcome {
        let Some(&idx) = self.by_tag.get(&request.node) else {
            return CommandOutcome::UnknownNode;
        };
        let handle = Arc::clone(&self.nodes[idx]);

        match request.op {
            NodeOp::OpenBreaker => match handle.write() {
                Ok(mut node) => {
                    node.open_breaker("OPERATOR_COMMAND");
                    CommandOutcome::Success
                }
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::CloseBreaker => match handle.write() {
                Ok(mut node) => {
                    node.close_breaker("OPERATOR_COMMAND");
                    CommandOutcome::Success
                }
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::ReadBits { address, count } => match handle.read() {
                Ok(node) => match node.read_bit_block(address, count) {
                    Ok(bits) => CommandOutcome::Bits(bits),
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::ReadWords { address, count } => match handle.read() {
                Ok(node) => match node.read_word_block(address, count) {
                    Ok(words) => CommandOutcome::Words(words),
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::WriteCoil { address, value } => match handle.write() {
                Ok(mut node) => match node.write_coil(address, value) {
                    Ok(()) => CommandOutcome::Success,
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::WriteHolding { address, value } => match handle.write() {
                Ok(mut node) => match node.write_holding_register(address, value) {
                    Ok(()) => CommandOutcome::Success,
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::WriteHoldings { address, values } => match handle.write() {
                Ok(mut node) => match node.write_holding_registers(address, &values) {
                    Ok(()) => CommandOutcome::Success,
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::SetGovernorSetpoint { mw } => match handle.write() {
                Ok(mut node) => match node.write_holding_register(
                    generation::holding::GOVERNOR_SETPOINT_MW,
                    encode_power_mw(mw),
                ) {
                    Ok(()) => CommandOutcome::Success,
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::SetAvrSetpoint { kv } => match handle.write() {
                Ok(mut node) => match node.write_holding_register(
                    generation::holding::AVR_SETPOINT_KV,
                    crate::nodes::registers::encode_voltage_kv(kv),
                ) {
                    Ok(()) => CommandOutcome::Success,
                    Err(_) => CommandOutcome::OutOfRange,
                },
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::ResetProtection => match handle.write() {
                Ok(mut node) => {
                    node.reset_protection();
                    CommandOutcome::Success
                }
                Err(_) => CommandOutcome::DeviceFault,
            },
            NodeOp::SetDegradationFactor { factor } => match handle.write() {
                Ok(mut node) => {
                    if node.set_degradation_factor(factor) {
                        CommandOutcome::Success
                    } else {
                        warn!(node = %request.node, "degradation factor on a non-transformer node");
                        CommandOutcome::OutOfRange
                    }
                }
                Err(_) => CommandOutcome::DeviceFault,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn simulator() -> GridSimulator {
        let mut config = Config::default_grid();
        // Fixed origin keeps the profile deterministic: a weekday summer
        // mid-morning with solid solar.
        config.start_time = Some(Utc.with_ymd_and_hms(2025, 6, 18, 10, 0, 0).unwrap());
        GridSimulator::new(config).unwrap()
    }

    fn run_seconds(sim: &mut GridSimulator, seconds: f64) {
        let steps = (seconds / sim.config.timestep_s) as usize;
        for _ in 0..steps {
            sim.step();
        }
    }

    #[test]
    fn test_cold_start_settles_near_nominal() {
        let mut sim = simulator();
        run_seconds(&mut sim, 30.0);
        let deviation = (sim.frequency_hz() - 50.0).abs();
        assert!(
            deviation < 0.05,
            "frequency must settle within ±0.05 Hz, got {:+.3}",
            sim.frequency_hz() - 50.0
        );
        assert_eq!(sim.stats.power_flow_failures, 0);
    }

    #[test]
    fn test_generation_tracks_load_plus_losses() {
        let mut sim = simulator();
        run_seconds(&mut sim, 30.0);
        let mut rx = sim.subscribe();
        sim.step();
        let snap = rx.try_recv().unwrap();
        assert!(snap.total_load_mw > 100.0, "daytime load {}", snap.total_load_mw);
        assert!(snap.total_losses_mw > 0.0);
        let residual =
            (snap.total_generation_mw - snap.total_load_mw - snap.total_losses_mw).abs();
        assert!(residual < 0.1, "balance residual {residual:.3} MW");
    }

    #[test]
    fn test_nodes_receive_electrical_updates() {
        let mut sim = simulator();
        run_seconds(&mut sim, 2.0);
        let node = sim.node("DIST-001").unwrap();
        let guard = node.read().unwrap();
        assert!(guard.state.p_mw > 10.0, "feeder load {:.1} MW", guard.state.p_mw);
        assert!((guard.state.voltage_kv - 132.0).abs() < 1.0);
        assert!((guard.state.frequency_hz - 50.0).abs() < 0.5);
        assert!(guard.stats.updates >= 20);
    }

    #[test]
    fn test_load_step_dips_then_agc_recovers() {
        let mut sim = simulator();
        run_seconds(&mut sim, 20.0);
        let before = sim.frequency_hz();

        // 50 MW step: drop DIST-002 peak in by raising its peak load.
        {
            let node = sim.node("DIST-002").unwrap();
            let mut guard = node.write().unwrap();
            if let NodeKind::Distribution(feeder) = &mut guard.kind {
                feeder.params.peak_load_mw += 60.0;
            }
        }
        run_seconds(&mut sim, 3.0);
        let dipped = sim.frequency_hz();
        assert!(dipped < before - 0.02, "expected a dip, {before:.3} → {dipped:.3}");

        run_seconds(&mut sim, 120.0);
        assert!(
            (sim.frequency_hz() - 50.0).abs() < 0.05,
            "AGC must restore frequency, got {:.3}",
            sim.frequency_hz()
        );
    }

    #[test]
    fn test_breaker_open_drops_feeder_load() {
        let mut sim = simulator();
        run_seconds(&mut sim, 2.0);
        let outcome = sim.execute(CommandRequest {
            node: "DIST-003".to_string(),
            op: NodeOp::OpenBreaker,
        });
        assert_eq!(outcome, CommandOutcome::Success);
        sim.step();
        let node = sim.node("DIST-003").unwrap();
        assert_eq!(node.read().unwrap().state.p_mw, 0.0);
    }

    #[test]
    fn test_command_routing() {
        let mut sim = simulator();
        sim.step();
        assert_eq!(
            sim.execute(CommandRequest {
                node: "GEN-099".to_string(),
                op: NodeOp::OpenBreaker,
            }),
            CommandOutcome::UnknownNode
        );
        assert_eq!(
            sim.execute(CommandRequest {
                node: "GEN-001".to_string(),
                op: NodeOp::SetGovernorSetpoint { mw: 350.0 },
            }),
            CommandOutcome::Success
        );
        // The next tick reconciles the register write into the model.
        sim.step();
        assert_eq!(sim.frequency.setpoint("GEN-001"), Some(350.0));
        match sim.execute(CommandRequest {
            node: "DIST-001".to_string(),
            op: NodeOp::ReadWords { address: 3000, count: 2 },
        }) {
            CommandOutcome::Words(words) => assert_eq!(words.len(), 2),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            sim.execute(CommandRequest {
                node: "DIST-001".to_string(),
                op: NodeOp::ReadWords { address: 9000, count: 1 },
            }),
            CommandOutcome::OutOfRange
        );
    }

    #[test]
    fn test_degradation_command_only_for_substations() {
        let mut sim = simulator();
        assert_eq!(
            sim.execute(CommandRequest {
                node: "SUB-002".to_string(),
                op: NodeOp::SetDegradationFactor { factor: 1.1 },
            }),
            CommandOutcome::Success
        );
        assert_eq!(
            sim.execute(CommandRequest {
                node: "GEN-001".to_string(),
                op: NodeOp::SetDegradationFactor { factor: 1.1 },
            }),
            CommandOutcome::OutOfRange
        );
    }

    #[test]
    fn test_snapshot_stream_has_all_nodes() {
        let mut sim = simulator();
        let mut rx = sim.subscribe();
        sim.step();
        let snap = rx.try_recv().unwrap();
        assert_eq!(snap.nodes.len(), 15);
        assert_eq!(snap.tick, 1);
        assert!(snap.nodes.contains_key("SUB-007"));
    }
}
