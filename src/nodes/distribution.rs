/// Distribution feeder payload: switched capacitor banks for power-factor
/// correction, the under-frequency load-shedding interface to the ANSI 81
/// element, and the feeder energy meter. Capacitor switching is one bank
/// per tick in auto mode; UFLS stage transitions land in the SOE the tick
/// they happen.

use tracing::info;

use crate::config::FeederParams;
use crate::electrical::protection::{ProtectionRelay, UflsStatus};

use super::quality::{Quality, QualityMap};
use super::registers::{self, QUALITY_OFFSET, distribution::*};
use super::soe::{SoeClass, SoeLog};
use super::{BreakerPosition, ElectricalState, RegisterImage};

#[derive(Debug, Clone)]
pub struct CapacitorBank {
    pub rated_mvar: f64,
    pub closed: bool,
}

#[derive(Debug)]
pub struct DistributionFeeder {
    pub params: FeederParams,
    pub banks: Vec<CapacitorBank>,
    pub capacitor_auto: bool,
    pub target_power_factor: f64,
    pub ufls_enabled: bool,
    pub energy_mwh: f64,
    /// Indices of closed banks in closing order, for last-in-first-out
    /// opening when the power factor goes leading.
    close_order: Vec<usize>,
    stages_seen: [bool; 3],
}

impl DistributionFeeder {
    pub fn new(params: FeederParams) -> Self {
        let banks = params
            .capacitor_banks_mvar
            .iter()
            .map(|&rated_mvar| CapacitorBank {
                rated_mvar,
                closed: false,
            })
            .collect();
        Self {
            banks,
            capacitor_auto: true,
            target_power_factor: params.target_power_factor,
            ufls_enabled: true,
            energy_mwh: 0.0,
            close_order: Vec::new(),
            stages_seen: [false; 3],
            params,
        }
    }

    pub fn banks_online(&self) -> usize {
        self.banks.iter().filter(|b| b.closed).count()
    }

    pub fn capacitor_mvar_online(&self) -> f64 {
        self.banks
            .iter()
            .filter(|b| b.closed)
            .map(|b| b.rated_mvar)
            .sum()
    }

    pub fn load_percent(&self, state: &ElectricalState) -> f64 {
        if self.params.feeder_mva > 0.0 {
            state.s_mva / self.params.feeder_mva * 100.0
        } else {
            0.0
        }
    }

    pub(super) fn tick(
        &mut self,
        state: &ElectricalState,
        ufls: &UflsStatus,
        soe: &mut SoeLog,
        dt: f64,
    ) {
        // Feeder energy meter.
        if state.breaker == BreakerPosition::Closed {
            self.energy_mwh += state.p_mw * dt / 3600.0;
        }

        if self.capacitor_auto {
            self.auto_capacitor(state, soe);
        }

        // UFLS stage transitions into the SOE, shed percentage included.
        if self.ufls_enabled {
            for (idx, (&now_active, seen)) in ufls
                .stage_active
                .iter()
                .zip(self.stages_seen.iter_mut())
                .enumerate()
            {
                if now_active && !*seen {
                    soe.record(
                        SoeClass::UflsShed,
                        &format!("UFLS stage {} shed", idx + 1),
                        Some(ufls.total_shed_percent),
                    );
                }
                *seen = now_active;
            }
            if ufls.reset {
                self.stages_seen = [false; 3];
                soe.record(SoeClass::UflsReset, "UFLS stages reset, load restored", None);
            }
        }
    }

    /// Auto power-factor control: lagging below target closes the next open
    /// bank; leading above target opens the most recently closed. At most
    /// one bank moves per tick.
    fn auto_capacitor(&mut self, state: &ElectricalState, soe: &mut SoeLog) {
        if state.breaker != BreakerPosition::Closed {
            return;
        }
        let pf = state.power_factor;
        let lagging = state.q_mvar > 0.0;
        if lagging && pf < self.target_power_factor - 0.02 {
            if let Some(idx) = self.banks.iter().position(|b| !b.closed) {
                self.switch_bank(idx, true, soe);
            }
        } else if pf > self.target_power_factor + 0.02 {
            if let Some(&idx) = self.close_order.last() {
                self.switch_bank(idx, false, soe);
            }
        }
    }

    fn switch_bank(&mut self, index: usize, close: bool, soe: &mut SoeLog) {
        let Some(bank) = self.banks.get_mut(index) else {
            return;
        };
        if bank.closed == close {
            return;
        }
        bank.closed = close;
        if close {
            self.close_order.push(index);
        } else {
            self.close_order.retain(|&i| i != index);
        }
        info!(bank = index + 1, close, "capacitor bank switched");
        soe.record(
            SoeClass::ModeChange,
            &format!(
                "Capacitor bank {} switched {}",
                index + 1,
                if close { "in" } else { "out" }
            ),
            Some(bank.rated_mvar),
        );
    }

    pub(super) fn coil_written(&mut self, address: u16, value: bool, soe: &mut SoeLog) {
        match address {
            coil::CAPACITOR_AUTO => {
                if self.capacitor_auto != value {
                    self.capacitor_auto = value;
                    let mode = if value { "AUTO" } else { "MANUAL" };
                    soe.record(
                        SoeClass::ModeChange,
                        &format!("Capacitor control mode: {mode}"),
                        None,
                    );
                }
            }
            coil::CAP_BANK_1 => self.switch_bank(0, value, soe),
            coil::CAP_BANK_2 => self.switch_bank(1, value, soe),
            coil::UFLS_ENABLE => {
                if self.ufls_enabled != value {
                    self.ufls_enabled = value;
                    let mode = if value { "ENABLED" } else { "DISABLED" };
                    soe.record(SoeClass::ModeChange, &format!("UFLS {mode}"), None);
                }
            }
            _ => {}
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
            input::FEEDER_LOAD_PCT,
            registers::encode_percent(self.load_percent(state)),
        );
        let shed = if self.ufls_enabled {
            relay.shed_percent()
        } else {
            0.0
        };
        image.set_input(input::UFLS_SHED_PCT, registers::encode_percent(shed));
        image.set_input(input::CAP_BANKS_ONLINE, self.banks_online() as u16);
        image.set_input(input::LINE_CURRENT_A, registers::encode_current_a(state.current_a));

        // Balanced phases: one magnitude across A/B/C.
        let phase_kv = registers::encode_voltage_kv(state.voltage_kv);
        image.set_input(input::VOLTAGE_PH_A_KV, phase_kv);
        image.set_input(input::VOLTAGE_PH_B_KV, phase_kv);
        image.set_input(input::VOLTAGE_PH_C_KV, phase_kv);

        image.set_input(
            input::ENERGY_MWH,
            registers::encode_power_mw(self.energy_mwh),
        );

        let current_quality = if state.current_pu > 1.5 {
            Quality::Overflow
        } else {
            Quality::Good
        };
        quality.set(input::LINE_CURRENT_A, current_quality, now);
        image.set_input(
            input::LINE_CURRENT_A + QUALITY_OFFSET,
            current_quality.as_register(),
        );

        let stages = relay.ufls_stages_active();
        image.set_discrete(discrete::CAPACITOR_AUTO_MODE, self.capacitor_auto);
        image.set_discrete(discrete::UFLS_ENABLED, self.ufls_enabled);
        image.set_discrete(discrete::UFLS_STAGE_1, self.ufls_enabled && stages[0]);
        image.set_discrete(discrete::UFLS_STAGE_2, self.ufls_enabled && stages[1]);
        image.set_discrete(discrete::UFLS_STAGE_3, self.ufls_enabled && stages[2]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::nodes::{ElectricalInput, NodeKind, RtuNode};

    fn dist_node() -> RtuNode {
        let config = Config::default_grid();
        RtuNode::new(config.node("DIST-001").unwrap(), &config.protection)
    }

    fn feeder(n: &RtuNode) -> &DistributionFeeder {
        match &n.kind {
            NodeKind::Distribution(f) => f,
            _ => unreachable!(),
        }
    }

    fn input(p_mw: f64, q_mvar: f64, f_hz: f64) -> ElectricalInput {
        ElectricalInput {
            voltage_kv: 132.0,
            voltage_angle_deg: -4.0,
            current_a: 400.0,
            p_mw,
            q_mvar,
            frequency_hz: f_hz,
        }
    }

    #[test]
    fn test_auto_capacitor_closes_one_bank_per_tick() {
        let mut n = dist_node();
        // PF = 100/√(100²+60²) ≈ 0.857, lagging and well below 0.95.
        n.update_electrical_state(input(100.0, 60.0, 50.0), 0.1);
        assert_eq!(feeder(&n).banks_online(), 1);
        n.update_electrical_state(input(100.0, 60.0, 50.0), 0.1);
        assert_eq!(feeder(&n).banks_online(), 2, "one bank per tick");
        assert_eq!(n.read_input_registers(3042, 1).unwrap(), vec![2]);
    }

    #[test]
    fn test_auto_capacitor_opens_last_closed_when_leading() {
        let mut n = dist_node();
        n.update_electrical_state(input(100.0, 60.0, 50.0), 0.1);
        n.update_electrical_state(input(100.0, 60.0, 50.0), 0.1);
        assert_eq!(feeder(&n).banks_online(), 2);
        // High PF: open the most recently closed bank only.
        n.update_electrical_state(input(100.0, 1.0, 50.0), 0.1);
        assert_eq!(feeder(&n).banks_online(), 1);
        assert!(feeder(&n).banks[0].closed);
        assert!(!feeder(&n).banks[1].closed);
    }

    #[test]
    fn test_capacitor_holds_inside_deadband() {
        let mut n = dist_node();
        // PF ≈ 0.943, inside the ±0.02 band around 0.95.
        n.update_electrical_state(input(100.0, 35.0, 50.0), 0.1);
        let online = feeder(&n).banks_online();
        n.update_electrical_state(input(100.0, 35.0, 50.0), 0.1);
        assert_eq!(feeder(&n).banks_online(), online, "deadband must hold");
    }

    #[test]
    fn test_manual_bank_coils() {
        let mut n = dist_node();
        n.write_coil(2, false).unwrap(); // auto off
        n.write_coil(3, true).unwrap(); // bank 1 in
        assert_eq!(feeder(&n).banks_online(), 1);
        n.write_coil(3, false).unwrap();
        assert_eq!(feeder(&n).banks_online(), 0);
    }

    #[test]
    fn test_ufls_stages_exposed_and_shed_register() {
        let mut n = dist_node();
        // Hold stage-1 underfrequency past the 0.5 s delay.
        for _ in 0..12 {
            n.update_electrical_state(input(100.0, 33.0, 49.45), 0.1);
        }
        assert_eq!(n.read_discrete_inputs(1003, 1).unwrap(), vec![true]);
        assert_eq!(n.read_discrete_inputs(1004, 1).unwrap(), vec![false]);
        // 10% shed, percent × 10 encoding.
        assert_eq!(n.read_input_registers(3041, 1).unwrap(), vec![100]);
        assert_eq!(n.ufls_shed_percent(), 10.0);
    }

    #[test]
    fn test_ufls_recovery_records_reset_soe() {
        let mut n = dist_node();
        for _ in 0..12 {
            n.update_electrical_state(input(100.0, 33.0, 49.45), 0.1);
        }
        assert_eq!(n.ufls_shed_percent(), 10.0);
        // Recovery above 49.7 Hz for longer than the 5 s reset time.
        for _ in 0..70 {
            n.update_electrical_state(input(100.0, 33.0, 49.85), 0.1);
        }
        assert_eq!(n.ufls_shed_percent(), 0.0);
        let recent = n.soe.recent(10);
        assert!(recent.iter().any(|r| r.class == SoeClass::UflsReset));
    }

    #[test]
    fn test_ufls_disable_masks_shedding() {
        let mut n = dist_node();
        n.write_coil(5, false).unwrap(); // UFLS off
        for _ in 0..12 {
            n.update_electrical_state(input(100.0, 33.0, 49.45), 0.1);
        }
        assert_eq!(n.ufls_shed_percent(), 0.0);
        assert_eq!(n.read_input_registers(3041, 1).unwrap(), vec![0]);
    }

    #[test]
    fn test_energy_meter_accumulates() {
        let mut n = dist_node();
        // 120 MW for one simulated hour.
        for _ in 0..3600 {
            n.update_electrical_state(input(120.0, 30.0, 50.0), 1.0);
        }
        let energy = feeder(&n).energy_mwh;
        assert!((energy - 120.0).abs() < 0.5, "energy {energy:.1} MWh");
        assert_eq!(n.read_input_registers(3050, 1).unwrap(), vec![1200]);
    }

    #[test]
    fn test_feeder_load_percent_register() {
        let mut n = dist_node();
        n.update_electrical_state(input(90.0, 0.0, 50.0), 0.1);
        // 90 MVA on a 180 MVA feeder = 50%, percent × 10 encoding.
        assert_eq!(n.read_input_registers(3040, 1).unwrap(), vec![500]);
    }
}
