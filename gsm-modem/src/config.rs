use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::serial_port::{FlowControl, Parity, PortSettings, StopBits};
use crate::sms::SmsMode;

/// Primary application configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Serial connection to the modem
    pub connection: ConnectionConfig,

    /// SMS mode the session starts in
    pub sms_mode: SmsMode,

    /// SIM PIN unlocked on start-up, if any
    pub pin: Option<String>,

    /// Whether the startup routine opens the session right away
    pub auto_connect: bool,

    /// Whether the session logs its traffic and failures
    pub debug: bool,

    pub timeouts: Timeouts,

    /// Preferred message storage, e.g. `SM` or `ME`
    pub storage: Option<String>,

    /// Character set selected with `AT+CSCS` before sending in TEXT mode
    pub charset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Path to the modem's serial device
    pub port: String,

    pub settings: PortSettings,
}

/// Upper bounds for the session's reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Regular command/response exchanges
    pub command: Duration,

    /// Waiting for the modem to accept a submitted message
    pub sms_send: Duration,

    /// Waiting for the network's reply to a USSD request
    pub ussd: Duration,

    /// Second read looking for `ERROR` when a reply lacks both status tokens
    pub error_fallback: Duration,

    /// Pause between `AT+CMGS` and the message body
    pub prompt_delay: Duration,

    /// Sleep between polls of the serial port
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command: Duration::from_secs(10),
            sms_send: Duration::from_secs(30),
            ussd: Duration::from_secs(30),
            error_fallback: Duration::from_secs(1),
            prompt_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// The part of [`Config`] a [`crate::GsmModem`] session needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub sms_mode: SmsMode,
    pub debug: bool,
    pub timeouts: Timeouts,
    pub charset: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sms_mode: SmsMode::Text,
            debug: false,
            timeouts: Timeouts::default(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

pub const DEFAULT_CHARSET: &str = "GSM";

impl Config {
    /// Create a new config from CLI arguments
    pub fn from_cli(cli: &Cli) -> Self {
        let settings = PortSettings {
            baud_rate: cli.baud_rate,
            data_bits: cli.data_bits,
            parity: cli.parity,
            stop_bits: cli.stop_bits,
            flow_control: cli.flow_control,
        };

        Self {
            connection: ConnectionConfig {
                port: cli.port.clone(),
                settings,
            },
            sms_mode: cli.sms_mode,
            pin: cli.pin.clone().filter(|pin| !pin.is_empty()),
            auto_connect: cli.auto_connect,
            debug: cli.debug,
            timeouts: Timeouts {
                command: Duration::from_millis(cli.command_timeout),
                sms_send: Duration::from_millis(cli.sms_timeout),
                ussd: Duration::from_millis(cli.ussd_timeout),
                ..Timeouts::default()
            },
            storage: cli.storage.clone().filter(|mem| !mem.is_empty()),
            charset: cli.charset.clone(),
        }
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            sms_mode: self.sms_mode,
            debug: self.debug,
            timeouts: self.timeouts,
            charset: self.charset.clone(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    #[arg(
        short = 'p',
        long = "port",
        env = "GSM_MODEM_PORT",
        default_value = "/dev/ttyUSB0",
        help = "Path to the modem's serial device"
    )]
    pub port: String,

    #[arg(long = "baud-rate", env = "GSM_MODEM_BAUD_RATE", default_value = "115200")]
    pub baud_rate: u32,

    #[arg(
        long = "data-bits",
        env = "GSM_MODEM_DATA_BITS",
        default_value = "8",
        value_parser = clap::value_parser!(u8).range(5..=8)
    )]
    pub data_bits: u8,

    #[arg(long = "parity", env = "GSM_MODEM_PARITY", value_enum, default_value = "none")]
    pub parity: Parity,

    #[arg(long = "stop-bits", env = "GSM_MODEM_STOP_BITS", value_enum, default_value = "1")]
    pub stop_bits: StopBits,

    #[arg(
        long = "flow-control",
        env = "GSM_MODEM_FLOW_CONTROL",
        value_enum,
        default_value = "none"
    )]
    pub flow_control: FlowControl,

    #[arg(
        long = "sms-mode",
        env = "GSM_MODEM_SMS_MODE",
        default_value = "TEXT",
        help = "SMS mode: TEXT or PDU"
    )]
    pub sms_mode: SmsMode,

    /// SIM PIN to unlock after connecting.
    #[arg(long = "pin", env = "GSM_MODEM_PIN")]
    pub pin: Option<String>,

    #[arg(
        long = "auto-connect",
        env = "GSM_MODEM_AUTO_CONNECT",
        help = "Connect, select storage and unlock the SIM at start-up"
    )]
    pub auto_connect: bool,

    #[arg(
        short = 'd',
        long = "debug",
        env = "GSM_MODEM_DEBUG",
        help = "Log modem traffic and failures"
    )]
    pub debug: bool,

    #[arg(
        long = "command-timeout",
        env = "GSM_MODEM_COMMAND_TIMEOUT",
        help = "Timeout in milliseconds for regular AT commands",
        default_value = "10000"
    )]
    pub command_timeout: u64,

    #[arg(
        long = "sms-timeout",
        env = "GSM_MODEM_SMS_TIMEOUT",
        help = "Timeout in milliseconds for the modem to accept a sent SMS",
        default_value = "30000"
    )]
    pub sms_timeout: u64,

    #[arg(
        long = "ussd-timeout",
        env = "GSM_MODEM_USSD_TIMEOUT",
        help = "Timeout in milliseconds for the network's USSD reply",
        default_value = "30000"
    )]
    pub ussd_timeout: u64,

    #[arg(long = "storage", env = "GSM_MODEM_STORAGE", help = "Preferred message storage, e.g. SM")]
    pub storage: Option<String>,

    #[arg(long = "charset", env = "GSM_MODEM_CHARSET", default_value = DEFAULT_CHARSET)]
    pub charset: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print modem, SIM and network information.
    Test,
    /// Send one SMS.
    SendSms { number: String, message: String },
    /// Watch for new messages, calls and signal changes until interrupted.
    Monitor {
        /// Seconds between inbox checks.
        #[arg(long, default_value = "5")]
        interval: u64,
    },
    /// Print every stored message as JSON.
    Inbox,
    /// Send a raw AT command and print the reply.
    At { command: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_cli() {
        let cli = Cli::parse_from([
            "orb-gsm-modem",
            "--port",
            "/dev/ttyUSB2",
            "--baud-rate",
            "9600",
            "--parity",
            "even",
            "--stop-bits",
            "2",
            "--flow-control",
            "hardware",
            "--sms-mode",
            "pdu",
            "--pin",
            "1234",
            "--storage",
            "ME",
            "send-sms",
            "+491701234567",
            "hello",
        ]);
        let config = Config::from_cli(&cli);

        assert_eq!(config.connection.port, "/dev/ttyUSB2");
        assert_eq!(
            config.connection.settings,
            PortSettings {
                baud_rate: 9600,
                data_bits: 8,
                parity: Parity::Even,
                stop_bits: StopBits::Two,
                flow_control: FlowControl::Hardware,
            }
        );
        assert_eq!(config.sms_mode, SmsMode::Pdu);
        assert_eq!(config.pin.as_deref(), Some("1234"));
        assert_eq!(config.storage.as_deref(), Some("ME"));
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(
            cli.command,
            Command::SendSms {
                number: "+491701234567".to_string(),
                message: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_timeouts_from_cli() {
        let cli = Cli::parse_from([
            "orb-gsm-modem",
            "--command-timeout",
            "2000",
            "--sms-timeout",
            "60000",
            "--ussd-timeout",
            "15000",
            "inbox",
        ]);
        let timeouts = Config::from_cli(&cli).timeouts;

        assert_eq!(timeouts.command, Duration::from_secs(2));
        assert_eq!(timeouts.sms_send, Duration::from_secs(60));
        assert_eq!(timeouts.ussd, Duration::from_secs(15));
        assert_eq!(timeouts.error_fallback, Timeouts::default().error_fallback);
    }

    #[test]
    fn test_default_port_settings_match_cli_defaults() {
        let cli = Cli::parse_from(["orb-gsm-modem", "inbox"]);
        let config = Config::from_cli(&cli);

        assert_eq!(config.connection.settings, PortSettings::default());
        assert_eq!(PortSettings::default().baud_rate, 115_200);
    }

    #[test]
    fn test_invalid_data_bits_are_rejected() {
        let result = Cli::try_parse_from(["orb-gsm-modem", "--data-bits", "9", "inbox"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_session_config_follows_config() {
        let cli = Cli::parse_from(["orb-gsm-modem", "--debug", "--pin", "", "inbox"]);
        let config = Config::from_cli(&cli);
        let session = config.session();

        assert!(session.debug);
        assert_eq!(session.sms_mode, SmsMode::Text);
        assert_eq!(session.charset, "GSM");
        assert_eq!(config.pin, None);
        assert!(!config.auto_connect);
    }
}
