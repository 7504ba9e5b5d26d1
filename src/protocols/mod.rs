pub mod iec104;
pub mod modbus;
