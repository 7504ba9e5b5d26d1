/// Sequence-of-Events recording. Real RTUs timestamp state transitions to
/// the millisecond and hold them in a bounded buffer the master can drain.
/// Timestamps are monotone per node; a per-node sequence counter totally
/// orders events that land inside the same tick.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoeClass {
    BreakerOpen,
    BreakerClose,
    ProtectionPickup,
    ProtectionTrip,
    AlarmRaised,
    AlarmCleared,
    SetpointChange,
    ModeChange,
    UflsShed,
    UflsReset,
}

impl SoeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SoeClass::BreakerOpen => "BREAKER_OPEN",
            SoeClass::BreakerClose => "BREAKER_CLOSE",
            SoeClass::ProtectionPickup => "PROTECTION_PICKUP",
            SoeClass::ProtectionTrip => "PROTECTION_TRIP",
            SoeClass::AlarmRaised => "ALARM_RAISED",
            SoeClass::AlarmCleared => "ALARM_CLEARED",
            SoeClass::SetpointChange => "SETPOINT_CHANGE",
            SoeClass::ModeChange => "MODE_CHANGE",
            SoeClass::UflsShed => "UFLS_SHED",
            SoeClass::UflsReset => "UFLS_RESET",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SoeRecord {
    pub timestamp: DateTime<Utc>,
    /// Tiebreaker for events within one tick; monotone per node.
    pub sequence: u64,
    pub node: String,
    pub class: SoeClass,
    pub description: String,
    pub value: Option<f64>,
}

#[derive(Debug)]
pub struct SoeLog {
    node: String,
    buffer: VecDeque<SoeRecord>,
    capacity: usize,
    next_sequence: u64,
    last_timestamp: DateTime<Utc>,
}

impl SoeLog {
    pub fn new(node: &str) -> Self {
        Self::with_capacity(node, 1000)
    }

    pub fn with_capacity(node: &str, capacity: usize) -> Self {
        Self {
            node: node.to_string(),
            buffer: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            next_sequence: 0,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn record(&mut self, class: SoeClass, description: &str, value: Option<f64>) {
        // Clamp to the last timestamp so the log never runs backwards even
        // if the wall clock does.
        let now = Utc::now().max(self.last_timestamp);
        self.last_timestamp = now;
        let record = SoeRecord {
            timestamp: now,
            sequence: self.next_sequence,
            node: self.node.clone(),
            class,
            description: description.to_string(),
            value,
        };
        self.next_sequence += 1;
        info!(
            node = %self.node,
            class = class.as_str(),
            description,
            "SOE"
        );
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(record);
    }

    /// Most recent records, newest first.
    pub fn recent(&self, count: usize) -> Vec<SoeRecord> {
        self.buffer.iter().rev().take(count).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn total_recorded(&self) -> u64 {
        self.next_sequence
    }
}
