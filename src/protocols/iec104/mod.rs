pub mod connection;
pub mod frame;
pub mod server;

pub use server::Iec104Server;
