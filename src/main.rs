use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::EnvFilter;

use grid_scada_sim::config::Config;
use grid_scada_sim::protocols::iec104::Iec104Server;
use grid_scada_sim::protocols::modbus::ModbusServer;
use grid_scada_sim::simulator::GridSimulator;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 1. Load configuration; a missing file falls back to the built-in
    // 15-bus reference grid, anything invalid is fatal.
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = if std::path::Path::new(&path).exists() {
        match Config::load(&path) {
            Ok(config) => {
                println!("Configuration loaded from {path}: {} nodes", config.nodes.len());
                config
            }
            Err(err) => {
                error!(%err, "refusing to start on invalid configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!("No {path} found, using the built-in 15-bus reference grid");
        Config::default_grid()
    };

    let modbus_base = config.modbus.port_base;
    let iec104_base = config.iec104.port_base;
    let common_address = config.iec104.common_address;
    let deadbands = config.iec104.deadbands.clone();

    // 2. Build the simulator and the node set.
    let mut sim = match GridSimulator::new(config) {
        Ok(sim) => sim,
        Err(err) => {
            error!(%err, "refusing to start on invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    // 3. Protocol servers: one Modbus and one IEC 104 endpoint per node,
    // each on port base + node index.
    let snapshots = sim.snapshot_sender();
    for (index, (tag, node)) in sim.nodes().into_iter().enumerate() {
        let modbus_addr = SocketAddr::from(([0, 0, 0, 0], modbus_base + index as u16));
        match TcpListener::bind(modbus_addr).await {
            Ok(listener) => {
                let server = ModbusServer::new(node.clone());
                tokio::spawn(async move {
                    if let Err(err) = server.serve(listener).await {
                        error!(%err, "modbus server terminated");
                    }
                });
            }
            Err(err) => {
                error!(%err, %modbus_addr, %tag, "failed to bind modbus listener");
                return ExitCode::FAILURE;
            }
        }

        let iec104_addr = SocketAddr::from(([0, 0, 0, 0], iec104_base + index as u16));
        match TcpListener::bind(iec104_addr).await {
            Ok(listener) => {
                let server = Iec104Server::new(
                    node,
                    common_address,
                    deadbands.clone(),
                    snapshots.clone(),
                );
                tokio::spawn(async move {
                    if let Err(err) = server.serve(listener).await {
                        error!(%err, "iec104 server terminated");
                    }
                });
            }
            Err(err) => {
                error!(%err, %iec104_addr, %tag, "failed to bind iec104 listener");
                return ExitCode::FAILURE;
            }
        }
    }

    let config = sim.config();
    println!("─────────────────────────────────────────────────────");
    println!(" Grid SCADA Simulator | v{}", env!("CARGO_PKG_VERSION"));
    println!("─────────────────────────────────────────────────────");
    println!(" Nodes:       {} (3 GEN / 7 SUB / 5 DIST)", config.nodes.len());
    println!(" Timestep:    {} ms", (config.timestep_s * 1000.0) as u64);
    println!(" Modbus TCP:  ports {}..{}", modbus_base, modbus_base + 14);
    println!(" IEC 104:     ports {}..{}", iec104_base, iec104_base + 14);
    println!(" Realtime:    {}", config.realtime);
    println!("─────────────────────────────────────────────────────");

    // 4. The simulation tick loop owns the electrical models and runs on
    // this task; protocol tasks do all the socket blocking.
    sim.run_forever().await;
    ExitCode::SUCCESS
}
