/// ============================================================
///  IEC 104 Connection State Machine
///
///  One per accepted peer:
///
///      IDLE → CONNECTED → STARTED → STOPPED → IDLE
///
///  Only STARTED admits data transfer. Sequence discipline per
///  the standard: V(S) counts outbound I-frames, V(R) tracks
///  the next expected inbound V(S); the peer must be
///  acknowledged at least every W received I-frames, and at
///  most K of our I-frames may be unacknowledged in flight.
///
///  Timers: T1 response, T2 acknowledge, T3 test-frame idle,
///  plus the hard 120 s receive-idle disconnect.
/// ============================================================

use std::time::{Duration, Instant};

/// Max unacknowledged I-frames outbound.
pub const K_WINDOW: u16 = 12;
/// Acknowledge no later than every W received I-frames.
pub const W_WINDOW: u16 = 8;
pub const T1_RESPONSE: Duration = Duration::from_secs(15);
pub const T2_ACK: Duration = Duration::from_secs(10);
pub const T3_IDLE: Duration = Duration::from_secs(20);
pub const IDLE_DISCONNECT: Duration = Duration::from_secs(120);

const SEQ_MODULO: u16 = 0x7FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Connected,
    Started,
    Stopped,
    Error,
    Timeout,
}

#[derive(Debug)]
pub struct LinkState {
    pub peer: String,
    pub phase: LinkPhase,
    /// Send sequence V(S), 15 bits.
    vs: u16,
    /// Receive sequence V(R): next expected inbound V(S).
    vr: u16,
    /// Our I-frames not yet acknowledged by the peer.
    unacked_sent: u16,
    /// Peer I-frames received since our last acknowledgement.
    recv_since_ack: u16,
    pub testfr_active: bool,
    testfr_sent_at: Option<Instant>,
    last_send: Instant,
    last_recv: Instant,
}

/// Inbound I-frame violated the expected sequence; the connection must
/// be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMismatch {
    pub expected: u16,
    pub got: u16,
}

impl LinkState {
    pub fn new(peer: &str) -> Self {
        let now = Instant::now();
        Self {
            peer: peer.to_string(),
            phase: LinkPhase::Connected,
            vs: 0,
            vr: 0,
            unacked_sent: 0,
            recv_since_ack: 0,
            testfr_active: false,
            testfr_sent_at: None,
            last_send: now,
            last_recv: now,
        }
    }

    pub fn vs(&self) -> u16 {
        self.vs
    }

    pub fn vr(&self) -> u16 {
        self.vr
    }

    pub fn is_started(&self) -> bool {
        self.phase == LinkPhase::Started
    }

    // ── U-frame transitions ──────────────────────────────────────────────────

    pub fn on_startdt(&mut self) -> bool {
        self.mark_received();
        if matches!(self.phase, LinkPhase::Connected | LinkPhase::Stopped) {
            self.phase = LinkPhase::Started;
            true
        } else {
            false
        }
    }

    pub fn on_stopdt(&mut self) -> bool {
        self.mark_received();
        if self.phase == LinkPhase::Started {
            self.phase = LinkPhase::Stopped;
            true
        } else {
            false
        }
    }

    pub fn on_testfr_con(&mut self) {
        self.mark_received();
        self.testfr_active = false;
        self.testfr_sent_at = None;
    }

    pub fn on_testfr_act(&mut self) {
        self.mark_received();
    }

    // ── Sequence discipline ──────────────────────────────────────────────────

    /// Claim the sequence numbers for one outbound I-frame. V(S)
    /// increments by exactly one per emitted frame.
    pub fn next_i_frame(&mut self) -> (u16, u16) {
        let numbers = (self.vs, self.vr);
        self.vs = (self.vs + 1) & SEQ_MODULO;
        self.unacked_sent += 1;
        self.mark_sent();
        numbers
    }

    pub fn can_send_i(&self) -> bool {
        self.is_started() && self.unacked_sent < K_WINDOW
    }

    /// Inbound I-frame carrying the peer's V(S) and its acknowledgement
    /// of our frames.
    pub fn on_i_frame(&mut self, send: u16, recv: u16) -> Result<(), SequenceMismatch> {
        self.mark_received();
        if send != self.vr {
            return Err(SequenceMismatch {
                expected: self.vr,
                got: send,
            });
        }
        self.vr = (self.vr + 1) & SEQ_MODULO;
        self.recv_since_ack += 1;
        self.acknowledge(recv);
        Ok(())
    }

    /// Peer acknowledgement (S-frame or piggy-backed on an I-frame).
    pub fn acknowledge(&mut self, _recv: u16) {
        // The peer acknowledged everything up to recv; with in-order TCP
        // delivery that clears the whole in-flight window.
        self.unacked_sent = 0;
    }

    pub fn on_s_frame(&mut self, recv: u16) {
        self.mark_received();
        self.acknowledge(recv);
    }

    /// An S-frame acknowledgement is due: W inbound frames unacked, or
    /// anything unacked while the link has gone quiet (T2).
    pub fn ack_due(&self, now: Instant) -> bool {
        if self.recv_since_ack == 0 {
            return false;
        }
        self.recv_since_ack >= W_WINDOW || now.duration_since(self.last_send) >= T2_ACK
    }

    /// Record that V(R) reached the peer (S-frame sent or piggy-backed).
    pub fn acked(&mut self) {
        self.recv_since_ack = 0;
    }

    pub fn recv_since_ack(&self) -> u16 {
        self.recv_since_ack
    }

    // ── Timers ───────────────────────────────────────────────────────────────

    fn mark_sent(&mut self) {
        self.last_send = Instant::now();
    }

    pub fn mark_sent_now(&mut self) {
        self.mark_sent();
    }

    fn mark_received(&mut self) {
        self.last_recv = Instant::now();
    }

    /// T3 keep-alive: emit TESTFR_ACT after outbound idleness.
    pub fn testfr_due(&mut self, now: Instant) -> bool {
        if !self.is_started() || self.testfr_active {
            return false;
        }
        if now.duration_since(self.last_send) >= T3_IDLE {
            self.testfr_active = true;
            self.testfr_sent_at = Some(now);
            return true;
        }
        false
    }

    /// T1: no TESTFR_CON within the response timeout.
    pub fn testfr_timed_out(&self, now: Instant) -> bool {
        match self.testfr_sent_at {
            Some(at) => self.testfr_active && now.duration_since(at) >= T1_RESPONSE,
            None => false,
        }
    }

    /// Hard receive-idle disconnect.
    pub fn idle_timed_out(&self, now: Instant) -> bool {
        now.duration_since(self.last_recv) >= IDLE_DISCONNECT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startdt_only_from_connected_or_stopped() {
        let mut link = LinkState::new("10.0.0.1:1234");
        assert_eq!(link.phase, LinkPhase::Connected);
        assert!(link.on_startdt());
        assert_eq!(link.phase, LinkPhase::Started);
        assert!(!link.on_startdt(), "second STARTDT is a protocol error");
        assert!(link.on_stopdt());
        assert_eq!(link.phase, LinkPhase::Stopped);
        assert!(link.on_startdt(), "restart after STOPDT is legal");
    }

    #[test]
    fn test_vs_increments_per_i_frame() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        for expected in 0..5u16 {
            let (send, _recv) = link.next_i_frame();
            assert_eq!(send, expected);
        }
        assert_eq!(link.vs(), 5);
    }

    #[test]
    fn test_vs_wraps_at_15_bits() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        link.vs = 0x7FFE;
        link.next_i_frame();
        assert_eq!(link.vs(), 0x7FFF);
        link.acknowledge(0);
        link.next_i_frame();
        assert_eq!(link.vs(), 0, "V(S) wraps modulo 2^15");
    }

    #[test]
    fn test_vr_tracks_inbound_sequence() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        assert!(link.on_i_frame(0, 0).is_ok());
        assert!(link.on_i_frame(1, 0).is_ok());
        assert_eq!(link.vr(), 2);
        let err = link.on_i_frame(5, 0).unwrap_err();
        assert_eq!(err.expected, 2);
        assert_eq!(err.got, 5);
    }

    #[test]
    fn test_k_window_blocks_at_twelve() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        for _ in 0..K_WINDOW {
            assert!(link.can_send_i());
            link.next_i_frame();
        }
        assert!(!link.can_send_i(), "13th unacked frame must be held");
        link.on_s_frame(link.vs());
        assert!(link.can_send_i());
    }

    #[test]
    fn test_ack_due_after_w_received() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        let now = Instant::now();
        for i in 0..W_WINDOW {
            assert!(!link.ack_due(now), "no ack due before W at frame {i}");
            link.on_i_frame(i, 0).unwrap();
            // Receiving refreshes nothing on the send side.
            link.mark_sent_now();
        }
        assert!(link.ack_due(now));
        link.acked();
        assert!(!link.ack_due(now));
    }

    #[test]
    fn test_testfr_cycle() {
        let mut link = LinkState::new("peer");
        link.on_startdt();
        let later = Instant::now() + T3_IDLE + Duration::from_secs(1);
        assert!(link.testfr_due(later));
        assert!(link.testfr_active);
        assert!(!link.testfr_due(later), "one TESTFR in flight at a time");
        link.on_testfr_con();
        assert!(!link.testfr_active);
    }
}
