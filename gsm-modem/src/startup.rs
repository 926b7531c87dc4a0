//! Process start-up: builds the session from [`Config`] and brings it online.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::errors::Result;
use crate::modem::GsmModem;
use crate::transport::PortOpener;

/// Builds the session and, when `auto_connect` is set, connects it.
pub fn start(config: &Config) -> Result<GsmModem> {
    start_with(config, GsmModem::new(config.session()))
}

/// Like [`start`], opening ports through `opener`.
pub fn start_with_opener(config: &Config, opener: Arc<dyn PortOpener>) -> Result<GsmModem> {
    start_with(config, GsmModem::with_opener(config.session(), opener))
}

fn start_with(config: &Config, mut modem: GsmModem) -> Result<GsmModem> {
    if config.auto_connect {
        connect(&mut modem, config)?;
    }

    Ok(modem)
}

/// Opens the configured port, selects the preferred storage and unlocks the
/// SIM when a PIN is configured.
///
/// Only a failure to open is an error; storage and PIN failures are logged.
pub fn connect(modem: &mut GsmModem, config: &Config) -> Result<()> {
    let connection = &config.connection;
    modem.open(&connection.port, &connection.settings)?;
    info!(port = %connection.port, mode = %modem.sms_mode(), "connected to modem");

    if let Some(storage) = &config.storage
        && !modem.set_preferred_storage(storage)
    {
        warn!(%storage, "modem rejected preferred message storage");
    }

    if let Some(pin) = &config.pin {
        if modem.unlock_sim(pin) {
            info!("SIM unlocked");
        } else {
            warn!("failed to unlock SIM");
        }
    }

    Ok(())
}
