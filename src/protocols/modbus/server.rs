/// ============================================================
///  Modbus/TCP Server
///
///  One instance per node, one task per accepted peer. The
///  server owns no data: every read and write goes through the
///  node façade, so register side effects (breaker toggle,
///  setpoint change) ride on the wire operation that caused
///  them, and a read sees either the pre-tick or post-tick
///  image, never a half-updated one.
///
///  Per connection, a reader task frames MBAP + PDU off the
///  socket while the handler task runs the request state
///  machine: a request that lands while another is inside its
///  processing window is answered with exception 0x06
///  immediately, and the original response still arrives when
///  its delay elapses.
/// ============================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, tcp::OwnedReadHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::nodes::AccessError;
use crate::shared_state::NodeHandle;

use super::frame::{
    ExceptionCode, MBAP_LEN, MbapHeader, Request, Response, decode_request, encode_frame, function,
};
use super::state::{RequestMachine, processing_delay};

#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub exceptions_total: AtomicU64,
    pub framing_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

pub struct ModbusServer {
    node: NodeHandle,
    unit_id: u8,
    tag: String,
    stats: Arc<ServerStats>,
}

impl ModbusServer {
    pub fn new(node: NodeHandle) -> Self {
        let (unit_id, tag) = {
            let guard = node.read().expect("node lock poisoned at startup");
            (guard.unit_id(), guard.tag().to_string())
        };
        Self {
            node,
            unit_id,
            tag,
            stats: Arc::new(ServerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept loop; the caller binds so tests can use an ephemeral port.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(
            tag = %self.tag,
            unit_id = self.unit_id,
            addr = %listener.local_addr()?,
            "modbus server listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true).ok();
            debug!(tag = %self.tag, %peer, "modbus client connected");
            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
            let node = Arc::clone(&self.node);
            let stats = Arc::clone(&self.stats);
            let unit_id = self.unit_id;
            tokio::spawn(async move {
                handle_connection(node, unit_id, stream, stats.clone()).await;
                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                debug!(%peer, "modbus client disconnected");
            });
        }
    }
}

/// Frame requests off the socket. Returns on EOF or on any framing error;
/// dropping the channel ends the handler which closes the socket.
async fn read_requests(
    mut reader: OwnedReadHalf,
    unit_id: u8,
    tx: mpsc::Sender<(u16, Vec<u8>)>,
    stats: Arc<ServerStats>,
) {
    loop {
        let mut header_buf = [0u8; MBAP_LEN];
        if reader.read_exact(&mut header_buf).await.is_err() {
            return;
        }
        stats.bytes_received.fetch_add(MBAP_LEN as u64, Ordering::Relaxed);
        let header = MbapHeader::decode(&header_buf);
        if let Err(err) = header.validate() {
            warn!(%err, "modbus framing error; closing connection");
            stats.framing_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if header.unit_id != unit_id {
            warn!(
                expected = unit_id,
                got = header.unit_id,
                "modbus unit id mismatch; closing connection"
            );
            stats.framing_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let mut pdu = vec![0u8; header.length as usize - 1];
        if reader.read_exact(&mut pdu).await.is_err() {
            return;
        }
        stats.bytes_received.fetch_add(pdu.len() as u64, Ordering::Relaxed);
        if tx.send((header.transaction_id, pdu)).await.is_err() {
            return;
        }
    }
}

async fn handle_connection(
    node: NodeHandle,
    unit_id: u8,
    stream: tokio::net::TcpStream,
    stats: Arc<ServerStats>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<(u16, Vec<u8>)>(8);
    let reader = tokio::spawn(read_requests(read_half, unit_id, tx, Arc::clone(&stats)));

    let mut machine = RequestMachine::new();
    let delay = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(delay);
    // The response held back until its processing delay elapses.
    let mut pending: Option<Vec<u8>> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut delay, if pending.is_some() => {
                machine.responding();
                let response = pending.take().unwrap_or_default();
                if write_half.write_all(&response).await.is_err() {
                    break;
                }
                stats.bytes_sent.fetch_add(response.len() as u64, Ordering::Relaxed);
                machine.complete();
            }
            received = rx.recv() => {
                let Some((transaction_id, pdu)) = received else {
                    break;
                };
                stats.requests_total.fetch_add(1, Ordering::Relaxed);

                // Busy: answer 0x06 at once, without consulting the image.
                if !machine.accept(transaction_id) {
                    let code = pdu.first().copied().unwrap_or(0);
                    let exception =
                        Response::exception(code, ExceptionCode::ServerDeviceBusy).encode();
                    let response = encode_frame(transaction_id, unit_id, &exception);
                    stats.exceptions_total.fetch_add(1, Ordering::Relaxed);
                    if write_half.write_all(&response).await.is_err() {
                        break;
                    }
                    stats.bytes_sent.fetch_add(response.len() as u64, Ordering::Relaxed);
                    continue;
                }

                let (response_pdu, function_code) = match decode_request(&pdu) {
                    Ok(request) => {
                        let code = request.function();
                        (execute(&node, request), code)
                    }
                    Err(err) => (
                        Response::exception(err.function, err.exception),
                        err.function,
                    ),
                };
                if matches!(response_pdu, Response::Exception { .. }) {
                    stats.exceptions_total.fetch_add(1, Ordering::Relaxed);
                }
                let frame = encode_frame(transaction_id, unit_id, &response_pdu.encode());
                pending = Some(frame);
                delay.as_mut().reset(
                    tokio::time::Instant::now() + processing_delay(function_code),
                );
            }
        }
    }
    reader.abort();
}

fn access_exception(function_code: u8, err: AccessError) -> Response {
    let code = match err {
        AccessError::IllegalAddress => ExceptionCode::IllegalDataAddress,
        AccessError::IllegalValue => ExceptionCode::IllegalDataValue,
    };
    Response::exception(function_code, code)
}

/// Run one request against the node image. The write lock is held only
/// for the duration of the access, never across an await point.
fn execute(node: &NodeHandle, request: Request) -> Response {
    match request {
        Request::ReadCoils { address, count } => {
            if !(1..=2000).contains(&count) {
                return Response::exception(
                    function::READ_COILS,
                    ExceptionCode::IllegalDataValue,
                );
            }
            let Ok(guard) = node.read() else {
                return Response::exception(
                    function::READ_COILS,
                    ExceptionCode::ServerDeviceFailure,
                );
            };
            match guard.read_bit_block(address, count) {
                Ok(bits) => Response::Bits {
                    function: function::READ_COILS,
                    bits,
                },
                Err(err) => access_exception(function::READ_COILS, err),
            }
        }
        Request::ReadHoldingRegisters { address, count } => {
            if !(1..=125).contains(&count) {
                return Response::exception(
                    function::READ_HOLDING_REGISTERS,
                    ExceptionCode::IllegalDataValue,
                );
            }
            let Ok(guard) = node.read() else {
                return Response::exception(
                    function::READ_HOLDING_REGISTERS,
                    ExceptionCode::ServerDeviceFailure,
                );
            };
            match guard.read_word_block(address, count) {
                Ok(words) => Response::Words {
                    function: function::READ_HOLDING_REGISTERS,
                    words,
                },
                Err(err) => access_exception(function::READ_HOLDING_REGISTERS, err),
            }
        }
        Request::WriteSingleCoil { address, raw_value } => {
            // Only the two canonical encodings are legal; anything else
            // is rejected without mutating the image.
            if raw_value != 0x0000 && raw_value != 0xFF00 {
                return Response::exception(
                    function::WRITE_SINGLE_COIL,
                    ExceptionCode::IllegalDataValue,
                );
            }
            let Ok(mut guard) = node.write() else {
                return Response::exception(
                    function::WRITE_SINGLE_COIL,
                    ExceptionCode::ServerDeviceFailure,
                );
            };
            match guard.write_coil(address, raw_value == 0xFF00) {
                Ok(()) => Response::Echo {
                    function: function::WRITE_SINGLE_COIL,
                    address,
                    value: raw_value,
                },
                Err(err) => access_exception(function::WRITE_SINGLE_COIL, err),
            }
        }
        Request::WriteSingleRegister { address, value } => {
            let Ok(mut guard) = node.write() else {
                return Response::exception(
                    function::WRITE_SINGLE_REGISTER,
                    ExceptionCode::ServerDeviceFailure,
                );
            };
            match guard.write_holding_register(address, value) {
                Ok(()) => Response::Echo {
                    function: function::WRITE_SINGLE_REGISTER,
                    address,
                    value,
                },
                Err(err) => access_exception(function::WRITE_SINGLE_REGISTER, err),
            }
        }
        Request::WriteMultipleRegisters { address, values } => {
            let count = values.len() as u16;
            let Ok(mut guard) = node.write() else {
                return Response::exception(
                    function::WRITE_MULTIPLE_REGISTERS,
                    ExceptionCode::ServerDeviceFailure,
                );
            };
            match guard.write_holding_registers(address, &values) {
                Ok(()) => Response::WriteAck {
                    function: function::WRITE_MULTIPLE_REGISTERS,
                    address,
                    count,
                },
                Err(err) => access_exception(function::WRITE_MULTIPLE_REGISTERS, err),
            }
        }
    }
}
