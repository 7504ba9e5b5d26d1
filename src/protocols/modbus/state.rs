/// ============================================================
///  Modbus Request State Machine
///
///  Real RTUs process one request at a time:
///
///      IDLE → PROCESSING → RESPONDING → IDLE
///
///  Only IDLE admits a new request; anything arriving while the
///  unit is busy gets exception 0x06 without touching the
///  register image. The per-function processing delays are
///  load-bearing realism: they are what a passive analyzer sees
///  of the "RTU firmware" and scripted attacks that ignore them
///  stand out.
///
///      FC01  8-15 ms      FC05  15-30 ms
///      FC03 12-25 ms      FC06  15-30 ms
///                         FC16  20-40 ms
/// ============================================================

use std::time::Duration;

use rand::Rng;

use super::frame::function;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Processing,
    Responding,
}

/// Uniformly drawn processing delay for one request.
pub fn processing_delay(function_code: u8) -> Duration {
    let mut rng = rand::thread_rng();
    let ms = match function_code {
        function::READ_COILS => rng.gen_range(8..=15),
        function::READ_HOLDING_REGISTERS => rng.gen_range(12..=25),
        function::WRITE_SINGLE_COIL | function::WRITE_SINGLE_REGISTER => rng.gen_range(15..=30),
        function::WRITE_MULTIPLE_REGISTERS => rng.gen_range(20..=40),
        _ => rng.gen_range(10..=20),
    };
    Duration::from_millis(ms)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MachineStats {
    pub requests: u64,
    pub responses: u64,
    pub busy_rejections: u64,
}

#[derive(Debug)]
pub struct RequestMachine {
    phase: Phase,
    /// Transaction id of the request currently in flight (or the last one
    /// completed); echoed verbatim in the response header.
    pub last_transaction_id: Option<u16>,
    pub stats: MachineStats,
}

impl RequestMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            last_transaction_id: None,
            stats: MachineStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Offer a request: `true` transitions to PROCESSING, `false` means
    /// busy and the caller must answer with exception 0x06.
    pub fn accept(&mut self, transaction_id: u16) -> bool {
        self.stats.requests += 1;
        if self.phase != Phase::Idle {
            self.stats.busy_rejections += 1;
            return false;
        }
        self.last_transaction_id = Some(transaction_id);
        self.phase = Phase::Processing;
        true
    }

    /// Processing delay elapsed; the response is about to be written.
    pub fn responding(&mut self) {
        if self.phase == Phase::Processing {
            self.phase = Phase::Responding;
        }
    }

    /// Response bytes flushed; ready for the next request.
    pub fn complete(&mut self) {
        self.phase = Phase::Idle;
        self.stats.responses += 1;
    }
}

impl Default for RequestMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_accepts() {
        let mut machine = RequestMachine::new();
        assert!(machine.accept(0x1234));
        assert_eq!(machine.phase(), Phase::Processing);
        assert_eq!(machine.last_transaction_id, Some(0x1234));
        assert!(!machine.accept(0x1235), "PROCESSING must reject");
        machine.responding();
        assert!(!machine.accept(0x1236), "RESPONDING must reject");
        machine.complete();
        assert!(machine.accept(0x1237));
        assert_eq!(machine.stats.busy_rejections, 2);
        assert_eq!(machine.last_transaction_id, Some(0x1237));
    }

    #[test]
    fn test_delay_windows_per_function() {
        for _ in 0..200 {
            let d = processing_delay(function::READ_COILS).as_millis();
            assert!((8..=15).contains(&d), "FC01 delay {d} ms");
            let d = processing_delay(function::READ_HOLDING_REGISTERS).as_millis();
            assert!((12..=25).contains(&d), "FC03 delay {d} ms");
            let d = processing_delay(function::WRITE_MULTIPLE_REGISTERS).as_millis();
            assert!((20..=40).contains(&d), "FC16 delay {d} ms");
        }
    }
}
