use thiserror::Error;

/// Startup configuration errors. All of these are fatal: the simulator
/// refuses to start and reports the first offending item.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate node tag {0}")]
    DuplicateTag(String),

    #[error("line {from}-{to} references unknown bus {bus}")]
    UnknownBus {
        from: String,
        to: String,
        bus: String,
    },

    #[error("line {from}-{to} has non-positive reactance {x}")]
    BadReactance {
        from: String,
        to: String,
        x: f64,
    },

    #[error("node {tag}: {reason}")]
    InvalidNode { tag: String, reason: String },

    #[error("no generation node configured; a slack bus is required")]
    NoSlackBus,

    #[error("bus {0} is not connected to the rest of the grid")]
    IsolatedBus(String),
}

/// Wire-framing errors. These fail the affected connection only; the
/// handler closes the socket and the server keeps serving other peers.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("short frame: need {need} bytes, have {have}")]
    Short { need: usize, have: usize },

    #[error("bad start byte 0x{0:02x}")]
    BadStartByte(u8),

    #[error("bad APCI control field 0x{0:02x}")]
    BadControlField(u8),

    #[error("bad APDU length {0}")]
    BadLength(u8),

    #[error("unsupported type identification {0}")]
    UnsupportedType(u8),

    #[error("unknown cause of transmission {0}")]
    UnknownCause(u8),

    #[error("modbus protocol id {0:#06x} is not 0")]
    BadProtocolId(u16),

    #[error("truncated PDU")]
    Truncated,
}
