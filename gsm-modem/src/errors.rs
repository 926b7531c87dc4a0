use std::io;

use thiserror::Error;

/// Failures of the byte-stream transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("serial port is not open")]
    NotOpen,

    #[error("failed to open serial port '{port}': {source}")]
    Open {
        port: String,
        #[source]
        source: io::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the PDU codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PduError {
    #[error("PDU is not valid hexadecimal: {0}")]
    InvalidHex(String),

    #[error("PDU truncated while reading {field} at octet {offset}")]
    Truncated { field: &'static str, offset: usize },

    #[error("phone number contains no digits")]
    InvalidNumber,

    #[error("message of {len} septets does not fit into a single SMS")]
    MessageTooLong { len: usize },

    #[error("unsupported PDU message type indicator {0:#04x}")]
    UnsupportedMessageType(u8),
}

/// Errors surfaced by the modem session.
///
/// Only [`crate::GsmModem::open`] and [`crate::GsmModem::execute_command`]
/// return these; every other session operation maps them to an absent result.
#[derive(Error, Debug)]
pub enum ModemError {
    #[error("modem is not connected")]
    NotConnected,

    #[error("modem session already has an open port")]
    AlreadyOpen,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pdu(#[from] PduError),
}

pub type Result<T> = std::result::Result<T, ModemError>;
