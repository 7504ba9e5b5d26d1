/// ============================================================
///  IEC 60870-5-104 Server
///
///  One instance per node on 2404 + offset. Each accepted peer
///  gets its own task: a reader frames APDUs off the socket
///  while the handler drives the link state machine, answers
///  STARTDT / STOPDT / TESTFR, executes commands against the
///  node façade, serves general interrogations, and publishes
///  deadband-filtered spontaneous measurements from the
///  simulator's snapshot stream.
///
///  Causes of transmission follow the standard pattern: a
///  command or interrogation ACTIVATION is answered with
///  ACTIVATION_CON, interrogation objects carry INTERROGATION,
///  and the walk terminates with ACTIVATION_TERM.
/// ============================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Deadbands;
use crate::error::FrameError;
use crate::nodes::{PointValue, registers::ioa};
use crate::shared_state::{GridSnapshot, NodeHandle};

use super::connection::LinkState;
use super::frame::{Apdu, Asdu, Cot, Element, InformationObject, TypeId, UFunction};

#[derive(Debug, Default)]
pub struct Iec104Stats {
    pub connections_total: AtomicU64,
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub framing_errors: AtomicU64,
    pub commands_executed: AtomicU64,
}

pub struct Iec104Server {
    node: NodeHandle,
    tag: String,
    common_address: u16,
    deadbands: Deadbands,
    snapshots: broadcast::Sender<GridSnapshot>,
    stats: Arc<Iec104Stats>,
}

impl Iec104Server {
    pub fn new(
        node: NodeHandle,
        common_address: u16,
        deadbands: Deadbands,
        snapshots: broadcast::Sender<GridSnapshot>,
    ) -> Self {
        let tag = node
            .read()
            .map(|n| n.tag().to_string())
            .unwrap_or_default();
        Self {
            node,
            tag,
            common_address,
            deadbands,
            snapshots,
            stats: Arc::new(Iec104Stats::default()),
        }
    }

    pub fn stats(&self) -> Arc<Iec104Stats> {
        Arc::clone(&self.stats)
    }

    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            tag = %self.tag,
            addr = %listener.local_addr()?,
            "iec104 server listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            debug!(tag = %self.tag, %peer, "iec104 client connected");
            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
            let connection = Connection {
                node: Arc::clone(&self.node),
                common_address: self.common_address,
                deadbands: self.deadbands.clone(),
                snapshot_rx: self.snapshots.subscribe(),
                stats: Arc::clone(&self.stats),
                link: LinkState::new(&peer.to_string()),
                last_published: HashMap::new(),
            };
            tokio::spawn(async move {
                connection.run(stream).await;
                debug!(%peer, "iec104 client disconnected");
            });
        }
    }
}

/// Feed raw APDUs to the handler. Any framing error ends the stream,
/// which closes the connection.
async fn read_frames(
    mut reader: OwnedReadHalf,
    tx: mpsc::Sender<Apdu>,
    stats: Arc<Iec104Stats>,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
        }
        loop {
            match Apdu::decode(&buffer) {
                Ok((apdu, consumed)) => {
                    buffer.drain(..consumed);
                    stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    if tx.send(apdu).await.is_err() {
                        return;
                    }
                }
                Err(FrameError::Short { .. }) => break,
                Err(err) => {
                    warn!(%err, "iec104 framing error; closing connection");
                    stats.framing_errors.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

struct Connection {
    node: NodeHandle,
    common_address: u16,
    deadbands: Deadbands,
    snapshot_rx: broadcast::Receiver<GridSnapshot>,
    stats: Arc<Iec104Stats>,
    link: LinkState,
    /// Values last reported per IOA, for spontaneous deadbands.
    last_published: HashMap<u32, PointValue>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Apdu>(32);
        let reader = tokio::spawn(read_frames(read_half, tx, Arc::clone(&self.stats)));
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        // Cleared when the simulator side of the snapshot stream goes away;
        // the connection then serves polls and commands only.
        let mut snapshots_open = true;

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(apdu) = received else { break };
                    if !self.handle_apdu(apdu, &mut write_half).await {
                        break;
                    }
                    // Drain acknowledgements the reader already framed so
                    // the send window opens as early as possible.
                    while let Ok(apdu) = rx.try_recv() {
                        if !self.handle_apdu(apdu, &mut write_half).await {
                            reader.abort();
                            return;
                        }
                    }
                }
                snapshot = self.snapshot_rx.recv(), if snapshots_open => {
                    match snapshot {
                        Ok(_) => {
                            if self.link.is_started()
                                && !self.publish_spontaneous(&mut write_half).await
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "iec104 spontaneous stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            snapshots_open = false;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let now = Instant::now();
                    if self.link.idle_timed_out(now) || self.link.testfr_timed_out(now) {
                        warn!(peer = %self.link.peer, "iec104 connection timed out");
                        break;
                    }
                    if self.link.testfr_due(now)
                        && !self.send(&mut write_half, Apdu::u_frame(UFunction::TestFrAct)).await
                    {
                        break;
                    }
                    if self.link.ack_due(now) {
                        let frame = Apdu::s_frame(self.link.vr());
                        self.link.acked();
                        if !self.send(&mut write_half, frame).await {
                            break;
                        }
                    }
                }
            }
        }
        reader.abort();
    }

    async fn send(&mut self, writer: &mut OwnedWriteHalf, apdu: Apdu) -> bool {
        let bytes = apdu.encode();
        if writer.write_all(&bytes).await.is_err() {
            return false;
        }
        self.link.mark_sent_now();
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Wrap an ASDU into the next I-frame. The piggy-backed V(R)
    /// acknowledges everything received so far.
    async fn send_i(&mut self, writer: &mut OwnedWriteHalf, asdu: Asdu) -> bool {
        let (send, recv) = self.link.next_i_frame();
        self.link.acked();
        self.send(writer, Apdu::i_frame(send, recv, asdu)).await
    }

    /// Returns `false` when the connection must close.
    async fn handle_apdu(&mut self, apdu: Apdu, writer: &mut OwnedWriteHalf) -> bool {
        match apdu.apci {
            super::frame::Apci::U(function) => match function {
                UFunction::StartDtAct => {
                    if !self.link.on_startdt() {
                        return false;
                    }
                    if !self.send(writer, Apdu::u_frame(UFunction::StartDtCon)).await {
                        return false;
                    }
                    info!(peer = %self.link.peer, "iec104 data transfer started");
                    // Station initialization marker on the fresh link.
                    let breaker = {
                        let Ok(node) = self.node.read() else { return false };
                        node.breaker_closed()
                    };
                    let asdu = Asdu::new(TypeId::MSpNa1, Cot::Initialized, self.common_address)
                        .with_object(InformationObject {
                            address: ioa::BREAKER_STATUS,
                            element: Element::SinglePoint {
                                on: breaker,
                                quality: 0,
                            },
                        });
                    self.send_i(writer, asdu).await
                }
                UFunction::StopDtAct => {
                    if !self.link.on_stopdt() {
                        return false;
                    }
                    info!(peer = %self.link.peer, "iec104 data transfer stopped");
                    self.send(writer, Apdu::u_frame(UFunction::StopDtCon)).await
                }
                UFunction::TestFrAct => {
                    self.link.on_testfr_act();
                    self.send(writer, Apdu::u_frame(UFunction::TestFrCon)).await
                }
                UFunction::TestFrCon => {
                    self.link.on_testfr_con();
                    true
                }
                // A server never receives these confirmations.
                UFunction::StartDtCon | UFunction::StopDtCon => true,
            },
            super::frame::Apci::S { recv } => {
                self.link.on_s_frame(recv);
                true
            }
            super::frame::Apci::I { send, recv } => {
                if !self.link.is_started() {
                    warn!(peer = %self.link.peer, "I-frame before STARTDT");
                    return false;
                }
                if let Err(mismatch) = self.link.on_i_frame(send, recv) {
                    warn!(
                        peer = %self.link.peer,
                        expected = mismatch.expected,
                        got = mismatch.got,
                        "iec104 sequence mismatch"
                    );
                    return false;
                }
                let Some(asdu) = apdu.asdu else {
                    // Bare I-frame: acknowledge and move on.
                    let frame = Apdu::s_frame(self.link.vr());
                    self.link.acked();
                    return self.send(writer, frame).await;
                };
                self.handle_asdu(asdu, writer).await
            }
        }
    }

    async fn handle_asdu(&mut self, asdu: Asdu, writer: &mut OwnedWriteHalf) -> bool {
        match (asdu.type_id, asdu.cot) {
            (TypeId::CIcNa1, Cot::Activation) => self.general_interrogation(asdu, writer).await,
            (TypeId::CScNa1, Cot::Activation) => self.single_commands(asdu, writer).await,
            (TypeId::CDcNa1, Cot::Activation) => self.double_commands(asdu, writer).await,
            (TypeId::CSeNc1, Cot::Activation) => self.setpoint_commands(asdu, writer).await,
            _ => {
                // Anything else is confirmed negatively with the cause
                // marked unknown; the connection continues.
                let mut reply = asdu.clone();
                reply.cot = Cot::UnknownCause;
                reply.negative = true;
                self.send_i(writer, reply).await
            }
        }
    }

    /// C_IC_NA_1: ACTIVATION_CON, one M_ME_NC_1 / M_SP_NA_1 per point with
    /// COT = INTERROGATION, then ACTIVATION_TERM.
    async fn general_interrogation(&mut self, request: Asdu, writer: &mut OwnedWriteHalf) -> bool {
        info!(peer = %self.link.peer, "general interrogation");
        let mut confirm = request.clone();
        confirm.cot = Cot::ActivationCon;
        if !self.send_i(writer, confirm).await {
            return false;
        }

        let points = {
            let Ok(node) = self.node.read() else { return false };
            node.measurement_points()
        };
        for (address, value) in &points {
            let asdu = match value {
                PointValue::Analog(v) => Asdu::new(
                    TypeId::MMeNc1,
                    Cot::Interrogation,
                    self.common_address,
                )
                .with_object(InformationObject {
                    address: *address,
                    element: Element::ShortFloat {
                        value: *v as f32,
                        quality: 0,
                    },
                }),
                PointValue::Single(on) => Asdu::new(
                    TypeId::MSpNa1,
                    Cot::Interrogation,
                    self.common_address,
                )
                .with_object(InformationObject {
                    address: *address,
                    element: Element::SinglePoint {
                        on: *on,
                        quality: 0,
                    },
                }),
            };
            if !self.send_i(writer, asdu).await {
                return false;
            }
            self.last_published.insert(*address, *value);
        }

        let mut terminate = request;
        terminate.cot = Cot::ActivationTerm;
        self.send_i(writer, terminate).await
    }

    async fn single_commands(&mut self, asdu: Asdu, writer: &mut OwnedWriteHalf) -> bool {
        let mut ok = true;
        for object in &asdu.objects {
            let Element::SingleCommand { on } = object.element else {
                ok = false;
                continue;
            };
            let executed = {
                let Ok(mut node) = self.node.write() else { return false };
                match object.address {
                    ioa::CMD_BREAKER => node.write_coil(0, on).is_ok(),
                    ioa::CMD_PROTECTION_RESET => {
                        if on {
                            node.reset_protection();
                        }
                        true
                    }
                    _ => false,
                }
            };
            if executed {
                self.stats.commands_executed.fetch_add(1, Ordering::Relaxed);
                info!(address = object.address, on, "single command executed");
            } else {
                warn!(address = object.address, "single command rejected");
            }
            ok &= executed;
        }
        let mut confirm = asdu;
        confirm.cot = Cot::ActivationCon;
        confirm.negative = !ok;
        self.send_i(writer, confirm).await
    }

    async fn double_commands(&mut self, asdu: Asdu, writer: &mut OwnedWriteHalf) -> bool {
        let mut ok = true;
        for object in &asdu.objects {
            let Element::DoubleCommand { state } = object.element else {
                ok = false;
                continue;
            };
            // 1 = off / lower, 2 = on / raise.
            let executed = {
                let Ok(mut node) = self.node.write() else { return false };
                match (object.address, state) {
                    (ioa::CMD_BREAKER, 1) => node.write_coil(0, false).is_ok(),
                    (ioa::CMD_BREAKER, 2) => node.write_coil(0, true).is_ok(),
                    (ioa::CMD_OLTC_STEP, 1) => {
                        node.write_coil(crate::nodes::registers::substation::coil::OLTC_LOWER, true)
                            .is_ok()
                    }
                    (ioa::CMD_OLTC_STEP, 2) => {
                        node.write_coil(crate::nodes::registers::substation::coil::OLTC_RAISE, true)
                            .is_ok()
                    }
                    _ => false,
                }
            };
            if executed {
                self.stats.commands_executed.fetch_add(1, Ordering::Relaxed);
            }
            ok &= executed;
        }
        let mut confirm = asdu;
        confirm.cot = Cot::ActivationCon;
        confirm.negative = !ok;
        self.send_i(writer, confirm).await
    }

    async fn setpoint_commands(&mut self, asdu: Asdu, writer: &mut OwnedWriteHalf) -> bool {
        use crate::nodes::registers::{encode_power_mw, encode_voltage_kv};
        use crate::nodes::registers::{generation, substation};

        let mut ok = true;
        for object in &asdu.objects {
            let Element::SetpointFloat { value } = object.element else {
                ok = false;
                continue;
            };
            let executed = {
                let Ok(mut node) = self.node.write() else { return false };
                match object.address {
                    ioa::SP_GOVERNOR_MW => node
                        .write_holding_register(
                            generation::holding::GOVERNOR_SETPOINT_MW,
                            encode_power_mw(value as f64),
                        )
                        .is_ok(),
                    ioa::SP_AVR_KV => node
                        .write_holding_register(
                            generation::holding::AVR_SETPOINT_KV,
                            encode_voltage_kv(value as f64),
                        )
                        .is_ok(),
                    ioa::SP_OLTC_TARGET_KV => node
                        .write_holding_register(
                            substation::holding::OLTC_TARGET_KV,
                            encode_voltage_kv(value as f64),
                        )
                        .is_ok(),
                    _ => false,
                }
            };
            if executed {
                self.stats.commands_executed.fetch_add(1, Ordering::Relaxed);
            }
            ok &= executed;
        }
        let mut confirm = asdu;
        confirm.cot = Cot::ActivationCon;
        confirm.negative = !ok;
        self.send_i(writer, confirm).await
    }

    fn deadband_for(&self, address: u32) -> f64 {
        match address {
            ioa::VOLTAGE_KV => self.deadbands.voltage_kv,
            ioa::FREQUENCY_HZ => self.deadbands.frequency_hz,
            ioa::ACTIVE_POWER_MW
            | ioa::REACTIVE_POWER_MVAR
            | ioa::GENERATOR_MW
            | ioa::GENERATOR_MVAR => self.deadbands.power_mw,
            ioa::OIL_TEMP_C | ioa::HOTSPOT_TEMP_C => self.deadbands.temperature_c,
            _ => self.deadbands.percent,
        }
    }

    /// Deadband-filtered spontaneous transmission, in the order the
    /// changes appear in the measurement table.
    async fn publish_spontaneous(&mut self, writer: &mut OwnedWriteHalf) -> bool {
        let points = {
            let Ok(node) = self.node.read() else { return true };
            node.measurement_points()
        };
        for (address, value) in points {
            let changed = match (self.last_published.get(&address), &value) {
                (None, _) => true,
                (Some(PointValue::Analog(old)), PointValue::Analog(new)) => {
                    (new - old).abs() > self.deadband_for(address)
                }
                (Some(PointValue::Single(old)), PointValue::Single(new)) => old != new,
                _ => true,
            };
            if !changed {
                continue;
            }
            if !self.link.can_send_i() {
                // Window full: drop this round, the next snapshot catches up.
                debug!(peer = %self.link.peer, "spontaneous send window full");
                return true;
            }
            let asdu = match value {
                PointValue::Analog(v) => {
                    Asdu::new(TypeId::MMeNc1, Cot::Spontaneous, self.common_address).with_object(
                        InformationObject {
                            address,
                            element: Element::ShortFloat {
                                value: v as f32,
                                quality: 0,
                            },
                        },
                    )
                }
                PointValue::Single(on) => {
                    Asdu::new(TypeId::MSpNa1, Cot::Spontaneous, self.common_address).with_object(
                        InformationObject {
                            address,
                            element: Element::SinglePoint { on, quality: 0 },
                        },
                    )
                }
            };
            if !self.send_i(writer, asdu).await {
                return false;
            }
            self.last_published.insert(address, value);
        }
        true
    }
}
