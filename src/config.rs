use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// ─── Top-level configuration ─────────────────────────────────────────────────

fn default_timestep_s() -> f64 { 0.1 }
fn default_realtime() -> bool { false }
fn default_base_mva() -> f64 { 100.0 }
fn default_nominal_hz() -> f64 { 50.0 }
fn default_dispatch_interval_s() -> f64 { 60.0 }

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Simulation tick length in seconds (100 ms = typical RTU scan rate).
    #[serde(default = "default_timestep_s")]
    pub timestep_s: f64,
    /// Throttle each tick to wall-clock when true.
    #[serde(default = "default_realtime")]
    pub realtime: bool,
    /// Simulated wall-clock origin for the load/solar profiles.
    /// Defaults to the current UTC time when absent.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default = "default_base_mva")]
    pub system_base_mva: f64,
    #[serde(default = "default_nominal_hz")]
    pub nominal_frequency_hz: f64,
    /// Economic dispatch cadence. Real EMS runs dispatch every 5-15 minutes;
    /// between runs the governor and AGC close the balance.
    #[serde(default = "default_dispatch_interval_s")]
    pub dispatch_interval_s: f64,
    #[serde(default)]
    pub frequency: FrequencyLimits,
    #[serde(default)]
    pub agc: AgcConfig,
    #[serde(default)]
    pub protection: ProtectionConfig,
    #[serde(default)]
    pub modbus: ModbusConfig,
    #[serde(default)]
    pub iec104: Iec104Config,
    pub nodes: Vec<NodeConfig>,
    pub lines: Vec<LineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FrequencyLimits {
    pub normal_band_min_hz: f64,
    pub normal_band_max_hz: f64,
    pub emergency_min_hz: f64,
    pub emergency_max_hz: f64,
}

impl Default for FrequencyLimits {
    fn default() -> Self {
        // Indian grid code band, wider than the European 49.8-50.2 Hz.
        Self {
            normal_band_min_hz: 49.7,
            normal_band_max_hz: 50.3,
            emergency_min_hz: 48.8,
            emergency_max_hz: 51.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgcConfig {
    /// Area frequency bias β (MW/Hz) for the islanded test system.
    pub frequency_bias_mw_per_hz: f64,
    pub proportional_gain: f64,
    pub integral_gain: f64,
    /// Anti-windup clamp on the ACE integrator (MW·s).
    pub integral_limit_mw_s: f64,
    pub control_interval_s: f64,
    pub max_rate_mw_per_min: f64,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            frequency_bias_mw_per_hz: 20.0,
            proportional_gain: 3.0,
            integral_gain: 0.02,
            integral_limit_mw_s: 200.0,
            control_interval_s: 4.0,
            max_rate_mw_per_min: 120.0,
        }
    }
}

// ─── Protection settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    pub overcurrent: OvercurrentConfig,
    pub overvoltage: DefiniteTimeConfig,
    pub undervoltage: DefiniteTimeConfig,
    pub differential: DifferentialConfig,
    pub ufls: UflsConfig,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            overcurrent: OvercurrentConfig::default(),
            overvoltage: DefiniteTimeConfig { pickup_percent: 110.0, trip_delay_s: 2.0 },
            undervoltage: DefiniteTimeConfig { pickup_percent: 85.0, trip_delay_s: 3.0 },
            differential: DifferentialConfig::default(),
            ufls: UflsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OvercurrentConfig {
    pub pickup_percent: f64,
    /// TMS in the IEC standard-inverse characteristic t = TMS·0.14/((I/Is)^0.02 − 1).
    pub time_multiplier: f64,
    pub curve_exponent: f64,
    pub min_trip_time_s: f64,
}

impl Default for OvercurrentConfig {
    fn default() -> Self {
        Self {
            pickup_percent: 120.0,
            time_multiplier: 0.15,
            curve_exponent: 0.02,
            min_trip_time_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DefiniteTimeConfig {
    pub pickup_percent: f64,
    pub trip_delay_s: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DifferentialConfig {
    pub pickup_percent: f64,
    /// Minimum restraint (average through-current) as percent of rated.
    pub restraint_min_percent: f64,
}

impl Default for DifferentialConfig {
    fn default() -> Self {
        Self { pickup_percent: 30.0, restraint_min_percent: 10.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UflsConfig {
    pub stages: Vec<UflsStage>,
    pub recovery_hz: f64,
    pub recovery_time_s: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UflsStage {
    pub frequency_hz: f64,
    pub delay_s: f64,
    pub shed_percent: f64,
}

impl Default for UflsConfig {
    fn default() -> Self {
        Self {
            stages: vec![
                UflsStage { frequency_hz: 49.5, delay_s: 0.5, shed_percent: 10.0 },
                UflsStage { frequency_hz: 49.2, delay_s: 0.5, shed_percent: 15.0 },
                UflsStage { frequency_hz: 48.8, delay_s: 0.5, shed_percent: 20.0 },
            ],
            recovery_hz: 49.7,
            recovery_time_s: 5.0,
        }
    }
}

// ─── Protocol endpoints ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    /// Each node listens on port_base + its index. Real RTUs sit on 502;
    /// a single-host deployment needs an unprivileged base.
    pub port_base: u16,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self { port_base: 5020 }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Iec104Config {
    /// Each node listens on port_base + its index (2404 is the standard port).
    pub port_base: u16,
    pub common_address: u16,
    #[serde(default)]
    pub deadbands: Deadbands,
}

impl Default for Iec104Config {
    fn default() -> Self {
        Self {
            port_base: 2404,
            common_address: 1,
            deadbands: Deadbands::default(),
        }
    }
}

/// Change required before a measurement is reported spontaneously.
#[derive(Debug, Clone, Deserialize)]
pub struct Deadbands {
    pub voltage_kv: f64,
    pub frequency_hz: f64,
    pub power_mw: f64,
    pub temperature_c: f64,
    pub percent: f64,
}

impl Default for Deadbands {
    fn default() -> Self {
        Self {
            voltage_kv: 0.5,
            frequency_hz: 0.02,
            power_mw: 1.0,
            temperature_c: 1.0,
            percent: 1.0,
        }
    }
}

// ─── Grid topology ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeClass {
    Generation,
    Transmission,
    Distribution,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::Generation => "GENERATION",
            NodeClass::Transmission => "TRANSMISSION",
            NodeClass::Distribution => "DISTRIBUTION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    Thermal,
    Hydro,
    Solar,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub tag: String,
    pub class: NodeClass,
    pub nominal_kv: f64,
    pub rated_current_a: f64,
    pub unit_id: u8,
    #[serde(default)]
    pub generator: Option<GeneratorParams>,
    #[serde(default)]
    pub transformer: Option<TransformerParams>,
    #[serde(default)]
    pub feeder: Option<FeederParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorParams {
    pub kind: GeneratorKind,
    pub rated_mw: f64,
    pub min_mw: f64,
    pub max_mw: f64,
    /// Inertia constant H in seconds (zero for inverter-based resources).
    pub inertia_h_s: f64,
    /// Governor droop in per-unit (0.05 = 5%); zero disables droop.
    pub droop_pu: f64,
    /// Governor first-order time constant; zero snaps to target.
    pub governor_tg_s: f64,
    pub ramp_mw_per_min: f64,
    /// Cost curve C(P) = a·P² + b·P + c.
    pub cost_a: f64,
    pub cost_b: f64,
    pub cost_c: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransformerParams {
    pub rated_mva: f64,
    pub turns_ratio: f64,
    pub secondary_kv: f64,
    pub oil_time_constant_min: f64,
    /// Oil thermal exponent n (IEC 60076-7, typically 0.8).
    pub oil_exponent_n: f64,
    /// Winding thermal exponent m (typically 0.8).
    pub winding_exponent_m: f64,
    pub hot_spot_factor_h: f64,
    /// Rated winding hot-spot rise over oil Δθ_r (°C).
    pub hot_spot_rise_c: f64,
    pub ambient_c: f64,
    pub oil_rated_c: f64,
    pub alarm_c: f64,
    pub trip_c: f64,
    /// OLTC range: tap position in [-tap_range, +tap_range].
    pub tap_range: i32,
    /// Secondary voltage change per tap step, percent of rated.
    pub tap_step_percent: f64,
}

impl Default for TransformerParams {
    fn default() -> Self {
        Self {
            rated_mva: 150.0,
            turns_ratio: 400.0 / 132.0,
            secondary_kv: 132.0,
            oil_time_constant_min: 180.0,
            oil_exponent_n: 0.8,
            winding_exponent_m: 0.8,
            hot_spot_factor_h: 1.1,
            hot_spot_rise_c: 20.0,
            ambient_c: 35.0,
            oil_rated_c: 75.0,
            alarm_c: 98.0,
            trip_c: 110.0,
            tap_range: 16,
            tap_step_percent: 0.625,
        }
    }
}

fn default_target_pf() -> f64 { 0.95 }

#[derive(Debug, Clone, Deserialize)]
pub struct FeederParams {
    pub peak_load_mw: f64,
    pub feeder_mva: f64,
    /// Rated MVAr of each switchable capacitor bank, in switching order.
    pub capacitor_banks_mvar: Vec<f64>,
    #[serde(default = "default_target_pf")]
    pub target_power_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineConfig {
    pub from: String,
    pub to: String,
    pub r_pu: f64,
    pub x_pu: f64,
    pub b_pu: f64,
}

// ─── Loading and validation ──────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reference 15-bus grid: 3 generation, 7 transmission, 5 distribution.
    pub fn default_grid() -> Self {
        let genset = |tag: &str, kind, rated: f64, min, max, h, droop, tg, ramp, a, b, c, kv: f64, unit| {
            let rated_mva = rated / 0.9;
            NodeConfig {
                tag: tag.to_string(),
                class: NodeClass::Generation,
                nominal_kv: kv,
                rated_current_a: rated_mva * 1000.0 / (1.732 * kv),
                unit_id: unit,
                generator: Some(GeneratorParams {
                    kind,
                    rated_mw: rated,
                    min_mw: min,
                    max_mw: max,
                    inertia_h_s: h,
                    droop_pu: droop,
                    governor_tg_s: tg,
                    ramp_mw_per_min: ramp,
                    cost_a: a,
                    cost_b: b,
                    cost_c: c,
                }),
                transformer: None,
                feeder: None,
            }
        };
        let sub = |tag: &str, unit| NodeConfig {
            tag: tag.to_string(),
            class: NodeClass::Transmission,
            nominal_kv: 400.0,
            rated_current_a: 800.0,
            unit_id: unit,
            generator: None,
            transformer: Some(TransformerParams::default()),
            feeder: None,
        };
        let dist = |tag: &str, peak: f64, unit| {
            let feeder_mva = peak * 1.2;
            NodeConfig {
                tag: tag.to_string(),
                class: NodeClass::Distribution,
                nominal_kv: 132.0,
                rated_current_a: feeder_mva * 1000.0 / (1.732 * 132.0),
                unit_id: unit,
                generator: None,
                transformer: None,
                feeder: Some(FeederParams {
                    peak_load_mw: peak,
                    feeder_mva,
                    capacitor_banks_mvar: vec![peak * 0.05, peak * 0.05],
                    target_power_factor: 0.95,
                }),
            }
        };
        let line = |from: &str, to: &str, r: f64, x: f64| LineConfig {
            from: from.to_string(),
            to: to.to_string(),
            r_pu: r,
            x_pu: x,
            b_pu: 0.0,
        };

        Config {
            timestep_s: default_timestep_s(),
            realtime: false,
            start_time: None,
            system_base_mva: default_base_mva(),
            nominal_frequency_hz: default_nominal_hz(),
            dispatch_interval_s: default_dispatch_interval_s(),
            frequency: FrequencyLimits::default(),
            agc: AgcConfig::default(),
            protection: ProtectionConfig::default(),
            modbus: ModbusConfig::default(),
            iec104: Iec104Config::default(),
            nodes: vec![
                // Coal base load, largest unit: slack bus.
                genset("GEN-001", GeneratorKind::Thermal, 500.0, 100.0, 500.0, 5.0, 0.05, 0.6, 120.0, 0.02, 18.0, 500.0, 21.0, 1),
                genset("GEN-002", GeneratorKind::Hydro, 200.0, 20.0, 200.0, 3.5, 0.04, 0.4, 300.0, 0.01, 5.0, 100.0, 21.0, 2),
                genset("GEN-003", GeneratorKind::Solar, 150.0, 0.0, 150.0, 0.0, 0.0, 0.0, 600.0, 0.0, 0.0, 0.0, 21.0, 3),
                sub("SUB-001", 4),
                sub("SUB-002", 5),
                sub("SUB-003", 6),
                sub("SUB-004", 7),
                sub("SUB-005", 8),
                sub("SUB-006", 9),
                sub("SUB-007", 10),
                dist("DIST-001", 150.0, 11),
                dist("DIST-002", 120.0, 12),
                dist("DIST-003", 100.0, 13),
                dist("DIST-004", 80.0, 14),
                dist("DIST-005", 90.0, 15),
            ],
            lines: vec![
                line("GEN-001", "SUB-001", 0.0020, 0.020),
                line("GEN-002", "SUB-002", 0.0025, 0.025),
                line("GEN-003", "SUB-003", 0.0030, 0.030),
                line("SUB-001", "SUB-002", 0.0040, 0.040),
                line("SUB-002", "SUB-003", 0.0045, 0.045),
                line("SUB-001", "SUB-004", 0.0035, 0.035),
                line("SUB-002", "SUB-005", 0.0040, 0.040),
                line("SUB-003", "SUB-006", 0.0040, 0.040),
                line("SUB-004", "SUB-005", 0.0050, 0.050),
                line("SUB-005", "SUB-006", 0.0050, 0.050),
                line("SUB-004", "SUB-007", 0.0045, 0.045),
                line("SUB-006", "SUB-007", 0.0050, 0.050),
                line("SUB-004", "DIST-001", 0.0060, 0.060),
                line("SUB-005", "DIST-002", 0.0060, 0.060),
                line("SUB-006", "DIST-003", 0.0060, 0.060),
                line("SUB-007", "DIST-004", 0.0065, 0.065),
                line("SUB-007", "DIST-005", 0.0065, 0.065),
            ],
        }
    }

    /// Fatal startup validation. Reports the first offending item.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.tag.clone()) {
                return Err(ConfigError::DuplicateTag(node.tag.clone()));
            }
            match node.class {
                NodeClass::Generation if node.generator.is_none() => {
                    return Err(ConfigError::InvalidNode {
                        tag: node.tag.clone(),
                        reason: "generation node without generator parameters".into(),
                    });
                }
                NodeClass::Transmission if node.transformer.is_none() => {
                    return Err(ConfigError::InvalidNode {
                        tag: node.tag.clone(),
                        reason: "transmission node without transformer parameters".into(),
                    });
                }
                NodeClass::Distribution if node.feeder.is_none() => {
                    return Err(ConfigError::InvalidNode {
                        tag: node.tag.clone(),
                        reason: "distribution node without feeder parameters".into(),
                    });
                }
                _ => {}
            }
            if let Some(g) = &node.generator {
                if !(g.min_mw <= g.max_mw && g.rated_mw > 0.0) {
                    return Err(ConfigError::InvalidNode {
                        tag: node.tag.clone(),
                        reason: format!(
                            "generator limits invalid (min {}, max {}, rated {})",
                            g.min_mw, g.max_mw, g.rated_mw
                        ),
                    });
                }
            }
        }

        if !self.nodes.iter().any(|n| n.class == NodeClass::Generation) {
            return Err(ConfigError::NoSlackBus);
        }

        for line in &self.lines {
            for bus in [&line.from, &line.to] {
                if !self.nodes.iter().any(|n| &n.tag == bus) {
                    return Err(ConfigError::UnknownBus {
                        from: line.from.clone(),
                        to: line.to.clone(),
                        bus: bus.clone(),
                    });
                }
            }
            if line.x_pu <= 0.0 {
                return Err(ConfigError::BadReactance {
                    from: line.from.clone(),
                    to: line.to.clone(),
                    x: line.x_pu,
                });
            }
        }

        // Every bus must be reachable from the first one.
        let mut reached = std::collections::HashSet::new();
        let mut stack = vec![self.nodes[0].tag.clone()];
        while let Some(bus) = stack.pop() {
            if !reached.insert(bus.clone()) {
                continue;
            }
            for line in &self.lines {
                if line.from == bus && !reached.contains(&line.to) {
                    stack.push(line.to.clone());
                }
                if line.to == bus && !reached.contains(&line.from) {
                    stack.push(line.from.clone());
                }
            }
        }
        for node in &self.nodes {
            if !reached.contains(&node.tag) {
                return Err(ConfigError::IsolatedBus(node.tag.clone()));
            }
        }

        Ok(())
    }

    pub fn node(&self, tag: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.tag == tag)
    }

    /// Slack bus: the largest-rated generator (typical EMS configuration).
    pub fn slack_bus(&self) -> Option<&NodeConfig> {
        self.nodes
            .iter()
            .filter(|n| n.class == NodeClass::Generation)
            .max_by(|a, b| {
                let ra = a.generator.as_ref().map(|g| g.rated_mw).unwrap_or(0.0);
                let rb = b.generator.as_ref().map(|g| g.rated_mw).unwrap_or(0.0);
                ra.total_cmp(&rb)
            })
    }
}
