//! Socket-level tests for the Modbus/TCP surface: wire framing, function
//! handlers, the busy state machine, and the realistic processing delays,
//! as a SCADA master (or a protocol analyzer) would observe them.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use grid_scada_sim::config::Config;
use grid_scada_sim::nodes::{ElectricalInput, RtuNode};
use grid_scada_sim::protocols::modbus::ModbusServer;
use grid_scada_sim::shared_state::{NodeHandle, node_handle};

async fn spawn_server(tag: &str) -> (SocketAddr, NodeHandle) {
    let config = Config::default_grid();
    let node = node_handle(RtuNode::new(config.node(tag).unwrap(), &config.protection));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = ModbusServer::new(node.clone());
    tokio::spawn(server.serve(listener));
    (addr, node)
}

fn mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

async fn read_response(stream: &mut TcpStream) -> (u16, u16, Vec<u8>) {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]);
    let mut pdu = vec![0u8; length as usize - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    (transaction_id, length, pdu)
}

/// Drive the node to a known electrical state so register contents are
/// predictable on the wire.
fn prime_substation(node: &NodeHandle) {
    let mut guard = node.write().unwrap();
    guard.update_electrical_state(
        ElectricalInput {
            voltage_kv: 400.0,
            voltage_angle_deg: -2.5,
            current_a: 350.0,
            p_mw: 123.4,
            q_mvar: 45.6,
            frequency_hz: 50.123,
        },
        0.1,
    );
}

#[tokio::test]
async fn test_fc03_measurement_block_happy_path() {
    let (addr, node) = spawn_server("SUB-001").await;
    prime_substation(&node);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // FC03, start 3000, count 4.
    let pdu = [0x03, 0x0B, 0xB8, 0x00, 0x04];
    let started = Instant::now();
    stream.write_all(&mbap(0x1234, 4, &pdu)).await.unwrap();
    let (transaction_id, length, response) = read_response(&mut stream).await;
    let elapsed = started.elapsed();

    assert_eq!(transaction_id, 0x1234);
    assert_eq!(length, 11, "unit id + FC + byte count + 8 data bytes");
    assert_eq!(response[0], 0x03);
    assert_eq!(response[1], 8);
    let words: Vec<u16> = response[2..]
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(words, vec![4000, 50_123, 1234, 456]);

    // The FC03 processing window is 12-25 ms; allow scheduler slack above.
    assert!(elapsed >= Duration::from_millis(11), "response too fast: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(200), "response too slow: {elapsed:?}");
}

#[tokio::test]
async fn test_busy_rejection_while_processing() {
    let (addr, node) = spawn_server("SUB-001").await;
    prime_substation(&node);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // First request enters its processing window; the second must be
    // rejected immediately with exception 0x06.
    let fc03 = [0x03, 0x0B, 0xB8, 0x00, 0x64]; // 100 registers
    let fc01 = [0x01, 0x00, 0x00, 0x00, 0x08];
    let mut burst = mbap(1, 4, &fc03);
    burst.extend_from_slice(&mbap(2, 4, &fc01));
    stream.write_all(&burst).await.unwrap();

    let (transaction_id, _, response) = read_response(&mut stream).await;
    assert_eq!(transaction_id, 2, "busy exception must arrive first");
    assert_eq!(response, vec![0x81, 0x06]);

    let (transaction_id, _, response) = read_response(&mut stream).await;
    assert_eq!(transaction_id, 1, "original response arrives unaffected");
    assert_eq!(response[0], 0x03);
    assert_eq!(response[1], 200);
}

#[tokio::test]
async fn test_fc05_rejects_non_canonical_value() {
    let (addr, node) = spawn_server("DIST-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    // 0x1234 is neither 0x0000 nor 0xFF00.
    let pdu = [0x05, 0x00, 0x00, 0x12, 0x34];
    stream.write_all(&mbap(7, 11, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x85, 0x03]);
    // No mutation: the breaker is still closed.
    assert!(node.read().unwrap().breaker_closed());
}

#[tokio::test]
async fn test_fc05_breaker_toggle_and_write_readback() {
    let (addr, node) = spawn_server("DIST-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // Open the breaker through coil 0.
    let pdu = [0x05, 0x00, 0x00, 0x00, 0x00];
    stream.write_all(&mbap(1, 11, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x05, 0x00, 0x00, 0x00, 0x00], "FC05 echoes");
    assert!(!node.read().unwrap().breaker_closed());

    // FC01 read of the same coil returns what was written.
    let pdu = [0x01, 0x00, 0x00, 0x00, 0x01];
    stream.write_all(&mbap(2, 11, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x01, 1, 0x00]);
}

#[tokio::test]
async fn test_fc06_fc16_write_then_read_roundtrip() {
    let (addr, _node) = spawn_server("SUB-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // FC06 single register write (OLTC target 132.0 kV).
    let pdu = [0x06, 0x0F, 0xB4, 0x05, 0x28];
    stream.write_all(&mbap(1, 4, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x06, 0x0F, 0xB4, 0x05, 0x28]);

    // FC16 multi-register write at 4021.
    let pdu = [0x10, 0x0F, 0xB5, 0x00, 0x02, 0x04, 0x00, 0x2A, 0x00, 0x2B];
    stream.write_all(&mbap(2, 4, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x10, 0x0F, 0xB5, 0x00, 0x02]);

    // FC03 read-back of all three registers.
    let pdu = [0x03, 0x0F, 0xB4, 0x00, 0x03];
    stream.write_all(&mbap(3, 4, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x03, 6, 0x05, 0x28, 0x00, 0x2A, 0x00, 0x2B]);
}

#[tokio::test]
async fn test_address_bounds_end_minus_one_readable() {
    let (addr, _node) = spawn_server("GEN-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    // 3199 is the last input register; reading it succeeds.
    let pdu = [0x03, 0x0C, 0x7F, 0x00, 0x01];
    stream.write_all(&mbap(1, 1, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response[0], 0x03);

    // 3200 is one past the end: illegal data address.
    let pdu = [0x03, 0x0C, 0x80, 0x00, 0x01];
    stream.write_all(&mbap(2, 1, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0x83, 0x02]);
}

#[tokio::test]
async fn test_unknown_function_code() {
    let (addr, _node) = spawn_server("GEN-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let pdu = [0x2B, 0x0E, 0x01, 0x00];
    stream.write_all(&mbap(5, 1, &pdu)).await.unwrap();
    let (_, _, response) = read_response(&mut stream).await;
    assert_eq!(response, vec![0xAB, 0x01]);
}

#[tokio::test]
async fn test_unit_id_mismatch_disconnects() {
    let (addr, _node) = spawn_server("GEN-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let pdu = [0x03, 0x0B, 0xB8, 0x00, 0x01];
    stream.write_all(&mbap(1, 99, &pdu)).await.unwrap();
    // The server drops the connection instead of answering.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close promptly");
    assert_eq!(read.unwrap(), 0, "expected EOF after unit id mismatch");
}

#[tokio::test]
async fn test_bad_protocol_id_disconnects() {
    let (addr, _node) = spawn_server("GEN-001").await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut frame = mbap(1, 1, &[0x03, 0x0B, 0xB8, 0x00, 0x01]);
    frame[2] = 0xDE; // corrupt the protocol id
    frame[3] = 0xAD;
    stream.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .expect("server should close promptly");
    assert_eq!(read.unwrap(), 0);
}

#[tokio::test]
async fn test_tokio_modbus_client_polls_the_server() {
    use tokio_modbus::prelude::*;

    let (addr, node) = spawn_server("SUB-001").await;
    prime_substation(&node);

    let mut ctx = tcp::connect_slave(addr, Slave(4)).await.unwrap();
    let words = ctx.read_holding_registers(3000, 4).await.unwrap().unwrap();
    assert_eq!(words, vec![4000, 50_123, 1234, 456]);

    ctx.write_single_register(4020, 1330).await.unwrap().unwrap();
    let words = ctx.read_holding_registers(4020, 1).await.unwrap().unwrap();
    assert_eq!(words, vec![1330]);

    let coils = ctx.read_coils(0, 1).await.unwrap().unwrap();
    assert_eq!(coils, vec![true]);
}
