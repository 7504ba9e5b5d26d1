/// ============================================================
///  RTU Node Layer
///
///  Fifteen remote terminal units translate electrical state
///  into the protocol-exposed register image. A common base
///  carries the electrical state, register/coil storage, data
///  quality, SOE log, and protection relay; a tagged variant
///  holds the class-specific payload:
///
///   Generation   – governor / AVR setpoints, synchronization
///   Substation   – transformer thermal model, OLTC
///   Distribution – capacitor banks, UFLS, energy metering
///
///  Protocol servers only ever touch a node through the read
///  and write façades below, so every side effect (breaker
///  toggle, setpoint change) rides on the register write that
///  caused it, exactly like real RTU firmware.
/// ============================================================

pub mod distribution;
pub mod generation;
pub mod quality;
pub mod registers;
pub mod soe;
pub mod substation;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::config::{NodeClass, NodeConfig, ProtectionConfig};
use crate::electrical::protection::{DifferentialInput, ProtectionRelay, TripReason};
use distribution::DistributionFeeder;
use generation::GenerationUnit;
use quality::{Quality, QualityMap};
use registers::{AddressSpace, QUALITY_OFFSET, common};
use soe::{SoeClass, SoeLog};
use substation::SubstationBay;

// ─── Access results ──────────────────────────────────────────────────────────

/// Register-façade failures, mapped onto protocol exception codes by the
/// servers (illegal data address / illegal data value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    IllegalAddress,
    IllegalValue,
}

// ─── Electrical state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerPosition {
    Open,
    Closed,
    Intermediate,
}

impl BreakerPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerPosition::Open => "OPEN",
            BreakerPosition::Closed => "CLOSED",
            BreakerPosition::Intermediate => "INTERMEDIATE",
        }
    }
}

/// What a real RTU measures and derives, refreshed once per tick.
#[derive(Debug, Clone)]
pub struct ElectricalState {
    pub voltage_kv: f64,
    pub voltage_pu: f64,
    pub voltage_angle_deg: f64,
    pub current_a: f64,
    pub current_pu: f64,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub s_mva: f64,
    pub power_factor: f64,
    pub frequency_hz: f64,
    pub breaker: BreakerPosition,
    pub protection_enabled: bool,
    pub last_update: DateTime<Utc>,
}

impl Default for ElectricalState {
    fn default() -> Self {
        Self {
            voltage_kv: 0.0,
            voltage_pu: 0.0,
            voltage_angle_deg: 0.0,
            current_a: 0.0,
            current_pu: 0.0,
            p_mw: 0.0,
            q_mvar: 0.0,
            s_mva: 0.0,
            power_factor: 1.0,
            frequency_hz: 50.0,
            breaker: BreakerPosition::Closed,
            protection_enabled: true,
            last_update: Utc::now(),
        }
    }
}

/// Bus quantities handed to a node by the simulator each tick.
#[derive(Debug, Clone, Copy)]
pub struct ElectricalInput {
    pub voltage_kv: f64,
    pub voltage_angle_deg: f64,
    pub current_a: f64,
    pub p_mw: f64,
    pub q_mvar: f64,
    pub frequency_hz: f64,
}

// ─── Register image ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RegisterImage {
    space: AddressSpace,
    coils: Vec<bool>,
    discrete: Vec<bool>,
    input: Vec<u16>,
    holding: Vec<u16>,
}

impl RegisterImage {
    fn new(space: AddressSpace) -> Self {
        Self {
            coils: vec![false; (space.coils_end - space.coils_start) as usize],
            discrete: vec![false; (space.discrete_end - space.discrete_start) as usize],
            input: vec![0; (space.input_end - space.input_start) as usize],
            holding: vec![0; (space.holding_end - space.holding_start) as usize],
            space,
        }
    }

    pub fn space(&self) -> AddressSpace {
        self.space
    }

    fn bit_index(addr: u16, start: u16, end: u16) -> Option<usize> {
        (addr >= start && addr < end).then(|| (addr - start) as usize)
    }

    pub fn coil(&self, addr: u16) -> Option<bool> {
        Self::bit_index(addr, self.space.coils_start, self.space.coils_end)
            .map(|i| self.coils[i])
    }

    pub fn set_coil(&mut self, addr: u16, value: bool) -> bool {
        match Self::bit_index(addr, self.space.coils_start, self.space.coils_end) {
            Some(i) => {
                self.coils[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn discrete(&self, addr: u16) -> Option<bool> {
        Self::bit_index(addr, self.space.discrete_start, self.space.discrete_end)
            .map(|i| self.discrete[i])
    }

    pub fn set_discrete(&mut self, addr: u16, value: bool) -> bool {
        match Self::bit_index(addr, self.space.discrete_start, self.space.discrete_end) {
            Some(i) => {
                self.discrete[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn input(&self, addr: u16) -> Option<u16> {
        Self::bit_index(addr, self.space.input_start, self.space.input_end)
            .map(|i| self.input[i])
    }

    pub fn set_input(&mut self, addr: u16, value: u16) -> bool {
        match Self::bit_index(addr, self.space.input_start, self.space.input_end) {
            Some(i) => {
                self.input[i] = value;
                true
            }
            None => false,
        }
    }

    pub fn holding(&self, addr: u16) -> Option<u16> {
        Self::bit_index(addr, self.space.holding_start, self.space.holding_end)
            .map(|i| self.holding[i])
    }

    pub fn set_holding(&mut self, addr: u16, value: u16) -> bool {
        match Self::bit_index(addr, self.space.holding_start, self.space.holding_end) {
            Some(i) => {
                self.holding[i] = value;
                true
            }
            None => false,
        }
    }
}

// ─── Node statistics ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct NodeStats {
    pub updates: u64,
    pub breaker_operations: u64,
    pub protection_trips: u64,
}

// ─── Class payloads ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum NodeKind {
    Generation(GenerationUnit),
    Substation(SubstationBay),
    Distribution(DistributionFeeder),
}

/// One IEC 104 information object as published by a node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Analog(f64),
    Single(bool),
}

// ─── The node ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct RtuNode {
    tag: String,
    class: NodeClass,
    nominal_kv: f64,
    rated_current_a: f64,
    unit_id: u8,
    pub state: ElectricalState,
    image: RegisterImage,
    pub quality: QualityMap,
    pub soe: SoeLog,
    pub relay: ProtectionRelay,
    pub kind: NodeKind,
    pub stats: NodeStats,
    sim_time_s: f64,
}

impl RtuNode {
    pub fn new(config: &NodeConfig, protection: &ProtectionConfig) -> Self {
        let kind = match config.class {
            NodeClass::Generation => NodeKind::Generation(GenerationUnit::new(
                config.generator.clone().unwrap_or_else(|| {
                    panic!("generation node {} missing generator parameters", config.tag)
                }),
                config.nominal_kv,
            )),
            NodeClass::Transmission => NodeKind::Substation(SubstationBay::new(
                &config.tag,
                config.transformer.clone().unwrap_or_default(),
            )),
            NodeClass::Distribution => NodeKind::Distribution(DistributionFeeder::new(
                config.feeder.clone().unwrap_or_else(|| {
                    panic!("distribution node {} missing feeder parameters", config.tag)
                }),
            )),
        };

        let mut state = ElectricalState::default();
        state.voltage_kv = config.nominal_kv;
        state.voltage_pu = 1.0;

        let mut node = Self {
            tag: config.tag.clone(),
            class: config.class,
            nominal_kv: config.nominal_kv,
            rated_current_a: config.rated_current_a,
            unit_id: config.unit_id,
            state,
            image: RegisterImage::new(AddressSpace::for_class(config.class)),
            quality: QualityMap::new(),
            soe: SoeLog::new(&config.tag),
            relay: ProtectionRelay::new(
                &config.tag,
                config.rated_current_a,
                config.nominal_kv,
                protection.clone(),
            ),
            kind,
            stats: NodeStats::default(),
            sim_time_s: 0.0,
        };
        node.image.set_coil(common::coil::BREAKER, true);
        node.refresh_registers();
        info!(
            tag = %node.tag,
            class = node.class.as_str(),
            rated_kv = node.nominal_kv,
            rated_a = node.rated_current_a,
            "node initialized"
        );
        node
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn class(&self) -> NodeClass {
        self.class
    }

    pub fn nominal_kv(&self) -> f64 {
        self.nominal_kv
    }

    pub fn rated_current_a(&self) -> f64 {
        self.rated_current_a
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    pub fn sim_time_s(&self) -> f64 {
        self.sim_time_s
    }

    // ── Electrical update (simulator only) ───────────────────────────────────

    /// Store new bus quantities, re-derive pu/apparent/power-factor values,
    /// re-evaluate data quality, tick the protection relay and the class
    /// payload, and refresh the register encodings.
    pub fn update_electrical_state(&mut self, input: ElectricalInput, dt: f64) {
        self.sim_time_s += dt;
        self.clear_pulse_coils();
        let now = Utc::now();

        // Numerical singularities coerce to safe defaults; the quality
        // register carries the BAD flag.
        let mut bad_voltage = false;
        let mut bad_frequency = false;
        let voltage_kv = if input.voltage_kv.is_finite() {
            input.voltage_kv
        } else {
            bad_voltage = true;
            0.0
        };
        let frequency_hz = if input.frequency_hz.is_finite() {
            input.frequency_hz
        } else {
            bad_frequency = true;
            50.0
        };
        let current_a = if input.current_a.is_finite() { input.current_a } else { 0.0 };
        let p_mw = if input.p_mw.is_finite() { input.p_mw } else { 0.0 };
        let q_mvar = if input.q_mvar.is_finite() { input.q_mvar } else { 0.0 };

        self.state.voltage_kv = voltage_kv;
        self.state.voltage_pu = voltage_kv / self.nominal_kv;
        self.state.voltage_angle_deg = input.voltage_angle_deg;
        self.state.current_a = current_a;
        self.state.current_pu = if self.rated_current_a > 0.0 {
            current_a / self.rated_current_a
        } else {
            0.0
        };
        self.state.p_mw = p_mw;
        self.state.q_mvar = q_mvar;
        self.state.s_mva = (p_mw * p_mw + q_mvar * q_mvar).sqrt();
        self.state.power_factor = if self.state.s_mva > 0.0 {
            (p_mw.abs() / self.state.s_mva).min(1.0)
        } else {
            1.0
        };
        self.state.frequency_hz = frequency_hz;
        self.state.last_update = now;
        self.stats.updates += 1;

        // Data quality from measurement validity.
        if bad_voltage {
            self.quality.set(common::input::BUS_VOLTAGE_KV, Quality::Bad, now);
        } else {
            self.quality
                .check_range(common::input::BUS_VOLTAGE_KV, self.state.voltage_pu, 0.8, 1.2, now);
        }
        if bad_frequency || !(49.0..=51.0).contains(&frequency_hz) {
            self.quality.set(common::input::FREQUENCY_HZ, Quality::Bad, now);
        } else {
            self.quality.set(common::input::FREQUENCY_HZ, Quality::Good, now);
        }
        self.quality.set(common::input::ACTIVE_POWER_MW, Quality::Good, now);
        self.quality.set(common::input::REACTIVE_POWER_MVAR, Quality::Good, now);
        self.quality.set(common::input::POWER_FACTOR, Quality::Good, now);

        // Protection relay tick; substations add the differential element.
        let differential: Option<DifferentialInput> = match &self.kind {
            NodeKind::Substation(bay) => Some(bay.differential_input(&self.state)),
            _ => None,
        };
        let relay_update = if self.state.protection_enabled {
            self.relay.update(
                self.sim_time_s,
                self.state.current_a,
                self.state.voltage_kv,
                self.state.frequency_hz,
                differential,
            )
        } else {
            Default::default()
        };

        if let Some(reason) = relay_update.newly_tripped {
            self.stats.protection_trips += 1;
            self.soe.record(
                SoeClass::ProtectionTrip,
                &format!("Protection trip: {}", reason.as_str()),
                None,
            );
            self.open_breaker("PROTECTION_TRIP");
        }

        // Class payload tick. Field borrows are disjoint on purpose: the
        // payload may append SOE records while the image is being updated.
        match &mut self.kind {
            NodeKind::Generation(_) => {}
            NodeKind::Substation(bay) => {
                bay.tick(&self.state, &mut self.soe, self.sim_time_s, dt);
            }
            NodeKind::Distribution(feeder) => {
                feeder.tick(&self.state, &relay_update.ufls, &mut self.soe, dt);
            }
        }

        self.refresh_registers();
    }

    // ── Breaker control ──────────────────────────────────────────────────────

    /// Idempotent: opening an open breaker is a no-op.
    pub fn open_breaker(&mut self, reason: &str) {
        if self.state.breaker == BreakerPosition::Open {
            return;
        }
        info!(tag = %self.tag, reason, "opening breaker");
        self.state.breaker = BreakerPosition::Open;
        self.image.set_coil(common::coil::BREAKER, false);
        self.image.set_discrete(common::discrete::BREAKER_STATUS, false);
        self.stats.breaker_operations += 1;
        self.soe.record(
            SoeClass::BreakerOpen,
            &format!("Breaker opened: {reason}"),
            None,
        );
    }

    pub fn close_breaker(&mut self, reason: &str) {
        if self.state.breaker == BreakerPosition::Closed {
            return;
        }
        info!(tag = %self.tag, reason, "closing breaker");
        self.state.breaker = BreakerPosition::Closed;
        self.image.set_coil(common::coil::BREAKER, true);
        self.image.set_discrete(common::discrete::BREAKER_STATUS, true);
        self.stats.breaker_operations += 1;
        self.soe.record(
            SoeClass::BreakerClose,
            &format!("Breaker closed: {reason}"),
            None,
        );
    }

    pub fn breaker_closed(&self) -> bool {
        self.state.breaker == BreakerPosition::Closed
    }

    pub fn record_soe(&mut self, class: SoeClass, description: &str, value: Option<f64>) {
        self.soe.record(class, description, value);
    }

    /// Operator protection reset: clears the relay latch and every stage
    /// timer. The breaker stays open until closed deliberately.
    pub fn reset_protection(&mut self) {
        self.relay.reset();
        self.soe
            .record(SoeClass::ModeChange, "Protection relay reset", None);
        self.refresh_registers();
    }

    pub fn ufls_shed_percent(&self) -> f64 {
        match &self.kind {
            NodeKind::Distribution(feeder) if feeder.ufls_enabled => self.relay.shed_percent(),
            _ => 0.0,
        }
    }

    pub fn set_degradation_factor(&mut self, factor: f64) -> bool {
        match &mut self.kind {
            NodeKind::Substation(bay) => {
                bay.thermal.set_degradation_factor(factor);
                true
            }
            _ => false,
        }
    }

    /// Synchronization check against the grid-side quantities; `true` only
    /// when |ΔV| < 5% of rated and |Δθ| < 10°. Transitions drive SOE.
    pub fn check_synchronization(&mut self, grid_kv: f64, grid_angle_deg: f64) -> bool {
        match &mut self.kind {
            NodeKind::Generation(unit) => {
                unit.check_synchronization(&self.state, grid_kv, grid_angle_deg, &mut self.soe)
            }
            _ => false,
        }
    }

    // ── Read façades (no side effects) ───────────────────────────────────────

    pub fn read_coils(&self, addr: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        self.read_range(addr, count, self.image.space().coils_start, self.image.space().coils_end)?
            .map(|a| self.image.coil(a).ok_or(AccessError::IllegalAddress))
            .collect()
    }

    pub fn read_discrete_inputs(&self, addr: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        self.read_range(
            addr,
            count,
            self.image.space().discrete_start,
            self.image.space().discrete_end,
        )?
        .map(|a| self.image.discrete(a).ok_or(AccessError::IllegalAddress))
        .collect()
    }

    pub fn read_input_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        self.read_range(addr, count, self.image.space().input_start, self.image.space().input_end)?
            .map(|a| self.image.input(a).ok_or(AccessError::IllegalAddress))
            .collect()
    }

    pub fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        self.read_range(
            addr,
            count,
            self.image.space().holding_start,
            self.image.space().holding_end,
        )?
        .map(|a| self.image.holding(a).ok_or(AccessError::IllegalAddress))
        .collect()
    }

    /// FC01 window dispatch: coils below 1000, discrete inputs above.
    /// The wire has no FC02, so both bit windows are served here.
    pub fn read_bit_block(&self, addr: u16, count: u16) -> Result<Vec<bool>, AccessError> {
        let space = self.image.space();
        if addr < space.discrete_start {
            self.read_coils(addr, count)
        } else {
            self.read_discrete_inputs(addr, count)
        }
    }

    /// FC03 window dispatch: input registers at 3000+, holding at 4000+.
    /// The wire has no FC04, so the measurement block is read through FC03.
    pub fn read_word_block(&self, addr: u16, count: u16) -> Result<Vec<u16>, AccessError> {
        let space = self.image.space();
        if addr < space.holding_start {
            self.read_input_registers(addr, count)
        } else {
            self.read_holding_registers(addr, count)
        }
    }

    fn read_range(
        &self,
        addr: u16,
        count: u16,
        start: u16,
        end: u16,
    ) -> Result<std::ops::Range<u16>, AccessError> {
        if count == 0 {
            return Err(AccessError::IllegalValue);
        }
        let last = addr.checked_add(count - 1).ok_or(AccessError::IllegalAddress)?;
        if addr < start || last >= end {
            return Err(AccessError::IllegalAddress);
        }
        Ok(addr..last + 1)
    }

    // ── Write façades (side effects ride on the write) ───────────────────────

    pub fn write_coil(&mut self, address: u16, value: bool) -> Result<(), AccessError> {
        if !self.image.set_coil(address, value) {
            return Err(AccessError::IllegalAddress);
        }
        match address {
            common::coil::BREAKER => {
                if value {
                    self.close_breaker("REMOTE_COMMAND");
                } else {
                    self.open_breaker("REMOTE_COMMAND");
                }
            }
            common::coil::PROTECTION_RESET if value => {
                self.reset_protection();
            }
            _ => self.kind_coil_side_effects(address, value),
        }
        Ok(())
    }

    pub fn write_holding_register(&mut self, address: u16, value: u16) -> Result<(), AccessError> {
        if !self.image.set_holding(address, value) {
            return Err(AccessError::IllegalAddress);
        }
        self.kind_holding_side_effects(address, value);
        Ok(())
    }

    pub fn write_holding_registers(
        &mut self,
        address: u16,
        values: &[u16],
    ) -> Result<(), AccessError> {
        // Validate the whole window first so a partial write never lands.
        let space = self.image.space();
        if values.is_empty() {
            return Err(AccessError::IllegalValue);
        }
        let last = address
            .checked_add(values.len() as u16 - 1)
            .ok_or(AccessError::IllegalAddress)?;
        if address < space.holding_start || last >= space.holding_end {
            return Err(AccessError::IllegalAddress);
        }
        for (i, &value) in values.iter().enumerate() {
            self.write_holding_register(address + i as u16, value)?;
        }
        Ok(())
    }

    fn kind_coil_side_effects(&mut self, address: u16, value: bool) {
        match &mut self.kind {
            NodeKind::Generation(unit) => {
                unit.coil_written(address, value, &mut self.soe);
            }
            NodeKind::Substation(bay) => {
                bay.coil_written(address, value, &mut self.soe, self.sim_time_s);
            }
            NodeKind::Distribution(feeder) => {
                feeder.coil_written(address, value, &mut self.soe);
            }
        }
    }

    fn kind_holding_side_effects(&mut self, address: u16, value: u16) {
        let clamped_encoding = match &mut self.kind {
            NodeKind::Generation(unit) => unit.holding_written(address, value, &mut self.soe),
            NodeKind::Substation(bay) => bay.holding_written(address, value, &mut self.soe),
            NodeKind::Distribution(_) => None,
        };
        // Out-of-range setpoints clamp to the physical limit; the register
        // reflects the value actually applied.
        if let Some(encoded) = clamped_encoding {
            self.image.set_holding(address, encoded);
        }
    }

    /// Pulse coils (protection reset, OLTC raise/lower) fire on the write
    /// and hold their value until the next tick so an immediate read-back
    /// still returns what was written.
    fn clear_pulse_coils(&mut self) {
        self.image.set_coil(common::coil::PROTECTION_RESET, false);
        if self.class == NodeClass::Transmission {
            self.image.set_coil(registers::substation::coil::OLTC_RAISE, false);
            self.image.set_coil(registers::substation::coil::OLTC_LOWER, false);
        }
    }

    // ── Register refresh ─────────────────────────────────────────────────────

    /// Re-encode state into the register image. Pulse coils (OLTC raise /
    /// lower, protection reset) clear here, one tick after they fired.
    pub fn refresh_registers(&mut self) {
        let now = Utc::now();
        let state = &self.state;
        let image = &mut self.image;

        image.set_input(common::input::BUS_VOLTAGE_KV, registers::encode_voltage_kv(state.voltage_kv));
        image.set_input(common::input::FREQUENCY_HZ, registers::encode_frequency_hz(state.frequency_hz));
        image.set_input(common::input::ACTIVE_POWER_MW, registers::encode_power_mw(state.p_mw));
        image.set_input(common::input::REACTIVE_POWER_MVAR, registers::encode_power_mw(state.q_mvar));
        image.set_input(common::input::POWER_FACTOR, registers::encode_power_factor(state.power_factor));

        image.set_discrete(
            common::discrete::BREAKER_STATUS,
            state.breaker == BreakerPosition::Closed,
        );

        match &self.kind {
            NodeKind::Generation(unit) => {
                unit.refresh(image, &self.relay);
            }
            NodeKind::Substation(bay) => {
                bay.refresh(image, &self.relay, state, &mut self.quality, now);
            }
            NodeKind::Distribution(feeder) => {
                feeder.refresh(image, &self.relay, state, &mut self.quality, now);
            }
        }

        // Quality codes mirror into the paired registers.
        for addr in [
            common::input::BUS_VOLTAGE_KV,
            common::input::FREQUENCY_HZ,
            common::input::ACTIVE_POWER_MW,
            common::input::REACTIVE_POWER_MVAR,
            common::input::POWER_FACTOR,
        ] {
            let code = self.quality.get(addr).as_register();
            image.set_input(addr + QUALITY_OFFSET, code);
        }
    }

    // ── Published points and alarms ──────────────────────────────────────────

    /// The measurement table an IEC 104 server publishes for this node:
    /// every analog and single-point object with its current value.
    pub fn measurement_points(&self) -> Vec<(u32, PointValue)> {
        use registers::ioa;
        let mut points = vec![
            (ioa::VOLTAGE_KV, PointValue::Analog(self.state.voltage_kv)),
            (ioa::FREQUENCY_HZ, PointValue::Analog(self.state.frequency_hz)),
            (ioa::ACTIVE_POWER_MW, PointValue::Analog(self.state.p_mw)),
            (ioa::REACTIVE_POWER_MVAR, PointValue::Analog(self.state.q_mvar)),
            (ioa::POWER_FACTOR, PointValue::Analog(self.state.power_factor)),
            (
                ioa::BREAKER_STATUS,
                PointValue::Single(self.state.breaker == BreakerPosition::Closed),
            ),
            (ioa::PROTECTION_TRIPPED, PointValue::Single(self.relay.tripped)),
        ];
        match &self.kind {
            NodeKind::Generation(unit) => {
                points.push((ioa::GENERATOR_MW, PointValue::Analog(self.state.p_mw)));
                points.push((ioa::GENERATOR_MVAR, PointValue::Analog(self.state.q_mvar)));
                points.push((ioa::SYNC_STATUS, PointValue::Single(unit.synchronized)));
            }
            NodeKind::Substation(bay) => {
                points.push((
                    ioa::TRANSFORMER_LOAD_PCT,
                    PointValue::Analog(bay.thermal.loading_pu * 100.0),
                ));
                points.push((ioa::OIL_TEMP_C, PointValue::Analog(bay.thermal.theta_oil_c)));
                points.push((ioa::HOTSPOT_TEMP_C, PointValue::Analog(bay.thermal.theta_hs_c)));
                points.push((
                    ioa::OLTC_TAP_POSITION,
                    PointValue::Analog(bay.tap_position as f64),
                ));
                points.push((
                    ioa::THERMAL_ALARM,
                    PointValue::Single(bay.thermal.alarm_active),
                ));
            }
            NodeKind::Distribution(feeder) => {
                points.push((
                    ioa::FEEDER_LOAD_PCT,
                    PointValue::Analog(feeder.load_percent(&self.state)),
                ));
                points.push((
                    ioa::UFLS_SHED_PCT,
                    PointValue::Analog(self.ufls_shed_percent()),
                ));
            }
        }
        points
    }

    pub fn active_alarms(&self) -> Vec<String> {
        let mut alarms = Vec::new();
        if let Some(reason) = self.relay.trip_reason {
            alarms.push(format!("PROTECTION_TRIP: {}", reason.as_str()));
        }
        match &self.kind {
            NodeKind::Substation(bay) => {
                if bay.thermal.alarm_active {
                    alarms.push("TRANSFORMER_THERMAL_ALARM".to_string());
                }
                if bay.thermal.trip_active {
                    alarms.push("TRANSFORMER_THERMAL_TRIP".to_string());
                }
            }
            NodeKind::Distribution(_) => {
                for (i, active) in self.relay.ufls_stages_active().iter().enumerate() {
                    if *active {
                        alarms.push(format!("UFLS_STAGE_{}", i + 1));
                    }
                }
            }
            NodeKind::Generation(_) => {}
        }
        alarms
    }

    pub fn protection_trips(&self) -> Vec<String> {
        self.relay
            .trip_log()
            .iter()
            .map(|e| e.reason.as_str().to_string())
            .collect()
    }

    pub fn trip_reason(&self) -> Option<TripReason> {
        self.relay.trip_reason
    }
}
