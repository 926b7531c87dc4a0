#![forbid(unsafe_code)]

pub mod commands;
pub mod config;
pub mod errors;
pub mod events;
pub mod modem;
pub mod pdu;
pub mod serial_port;
pub mod sms;
pub mod startup;
pub mod transport;

pub use errors::{ModemError, PduError, Result, TransportError};
pub use events::{EventKind, ModemEvent};
pub use modem::GsmModem;
pub use sms::{MessageStatus, SmsMessage, SmsMode};
