pub mod frame;
pub mod server;
pub mod state;

pub use server::{ModbusServer, ServerStats};
