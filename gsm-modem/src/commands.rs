//! AT command strings and pure parsers for the replies they produce.
//!
//! See 3GPP TS 27.005 (SMS) and TS 27.007 (general modem control).

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const AT: &str = "AT";
pub const OK: &str = "OK";
pub const ERROR: &str = "ERROR";
pub const CME_ERROR: &str = "CME ERROR";
pub const CMS_ERROR: &str = "CMS ERROR";

pub const ECHO_OFF: &str = "ATE0";
pub const GET_MANUFACTURER: &str = "AT+CGMI";
pub const GET_MODEL: &str = "AT+CGMM";
pub const GET_IMEI: &str = "AT+CGSN";
pub const GET_IMSI: &str = "AT+CIMI";
pub const GET_SIGNAL: &str = "AT+CSQ";
pub const GET_NETWORK: &str = "AT+COPS?";
pub const GET_OWN_NUMBER: &str = "AT+CNUM";
pub const SET_SMS_CHARSET: &str = "AT+CSCS=";
pub const SET_SMS_INDICATION: &str = "AT+CNMI=";
pub const SEND_SMS: &str = "AT+CMGS=";
pub const LIST_SMS: &str = "AT+CMGL=";
pub const READ_SMS: &str = "AT+CMGR=";
pub const DELETE_SMS: &str = "AT+CMGD=";
pub const DELETE_ALL_SMS: &str = "AT+CMGDA=";
pub const DIAL: &str = "ATD";
pub const ANSWER: &str = "ATA";
pub const HANGUP: &str = "ATH";
pub const SEND_USSD: &str = "AT+CUSD=";
pub const UNLOCK_PIN: &str = "AT+CPIN=";
pub const GET_SIM_STATUS: &str = "AT+CPIN?";
pub const SET_SMS_FORMAT: &str = "AT+CMGF=";
pub const ENABLE_CALLER_ID: &str = "AT+CLIP=1";
pub const SET_STORAGE: &str = "AT+CPMS=";

/// Route new-message indications to the host: `+CMTI` for stored SMS.
pub const SMS_INDICATION_ARGS: &str = "2,1,0,0,0";
/// Marker understood by `AT+CMGDA` in TEXT mode.
pub const DELETE_ALL_MARKER: &str = "\"DEL ALL\"";

/// Terminates the message body of `AT+CMGS`.
pub const CTRL_Z: u8 = 0x1A;

static CSQ_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CSQ:\s*(\d+),").expect("valid regex"));
static COPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\+COPS:\s*\d+,\d+,"([^"]+)",(\d+)"#).expect("valid regex")
});
static CNUM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+CNUM:[^,]*,"([^"]+)""#).expect("valid regex"));
static CUSD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\+CUSD:\s*\d+,"([^"]+)""#).expect("valid regex"));
static LETTERS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]+").expect("valid regex"));
static FIFTEEN_DIGITS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(\d{15})(?:\D|$)").expect("valid regex"));

/// Appends the CR LF line terminator the modem expects.
pub fn format_command(command: &str) -> String {
    format!("{command}\r\n")
}

pub fn is_success_response(response: &str) -> bool {
    response.contains(OK)
}

pub fn is_error_response(response: &str) -> bool {
    response.contains(ERROR) || response.contains(CME_ERROR) || response.contains(CMS_ERROR)
}

/// Converts the `+CSQ: <rssi>,<ber>` RSSI (0..=31) into a percentage.
///
/// Returns `None` for 99 ("not known or not detectable") or a missing field.
pub fn parse_signal_strength(response: &str) -> Option<u8> {
    let rssi: u32 = CSQ_RE.captures(response)?[1].parse().ok()?;
    if rssi == 99 {
        return None;
    }

    Some((rssi.min(31) * 100 / 31) as u8)
}

/// Radio access technology reported in the `<AcT>` field of `+COPS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessTechnology {
    #[serde(rename = "GSM")]
    Gsm,
    #[serde(rename = "3G")]
    ThreeG,
    #[serde(rename = "4G")]
    FourG,
    Unknown,
}

impl From<u32> for AccessTechnology {
    fn from(act: u32) -> Self {
        match act {
            0 => Self::Gsm,
            2 => Self::ThreeG,
            7 => Self::FourG,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AccessTechnology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Gsm => "GSM",
            Self::ThreeG => "3G",
            Self::FourG => "4G",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub operator: String,
    pub mode: AccessTechnology,
}

/// Parses `+COPS: <mode>,<format>,"<operator>",<act>`.
pub fn parse_network_info(response: &str) -> Option<NetworkInfo> {
    let caps = COPS_RE.captures(response)?;
    let act: u32 = caps[2].parse().ok()?;

    Some(NetworkInfo {
        operator: caps[1].to_string(),
        mode: AccessTechnology::from(act),
    })
}

pub fn parse_own_number(response: &str) -> Option<String> {
    CNUM_RE.captures(response).map(|c| c[1].to_string())
}

pub fn parse_ussd_response(response: &str) -> Option<String> {
    CUSD_RE.captures(response).map(|c| c[1].to_string())
}

/// First run of ASCII letters, e.g. `Quectel` out of `AT+CGMI\r\nQuectel\r\nOK`.
pub fn parse_manufacturer(response: &str) -> Option<String> {
    LETTERS_RE.find(response).map(|m| m.as_str().to_string())
}

/// First line that is neither empty, an echoed `AT+` command nor the `OK`
/// terminator.
pub fn parse_model(response: &str) -> Option<String> {
    response
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.contains("AT+") && !line.contains(OK))
        .map(str::to_string)
}

/// Extracts an IMEI or IMSI: the first run of exactly 15 digits.
pub fn parse_identity(response: &str) -> Option<String> {
    FIFTEEN_DIGITS_RE
        .captures(response)
        .map(|c| c[1].to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimStatus {
    Ready,
    PinRequired,
    Unknown,
}

/// Interprets the reply to `AT+CPIN?`.
pub fn parse_sim_status(response: &str) -> SimStatus {
    if response.contains("READY") {
        SimStatus::Ready
    } else if response.contains("SIM PIN") {
        SimStatus::PinRequired
    } else {
        SimStatus::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_command_appends_crlf() {
        assert_eq!(format_command("AT"), "AT\r\n");
        assert_eq!(format_command("AT+CMGF=1"), "AT+CMGF=1\r\n");
    }

    #[test]
    fn test_success_and_error_classification() {
        assert!(is_success_response("AT\r\nOK"));
        assert!(is_success_response("Some response\r\nOK\r\n"));
        assert!(!is_success_response("ERROR"));

        assert!(is_error_response("ERROR"));
        assert!(is_error_response("+CME ERROR: 10"));
        assert!(is_error_response("\r\n+CMS ERROR: 304\r\n"));
        assert!(!is_error_response("OK"));
    }

    #[test]
    fn test_parse_signal_strength() {
        let strength = parse_signal_strength("+CSQ: 20,0\r\nOK").unwrap();
        assert_eq!(strength, 64);
        assert_eq!(parse_signal_strength("+CSQ: 31,0"), Some(100));
        assert_eq!(parse_signal_strength("+CSQ: 0,0"), Some(0));
        assert_eq!(parse_signal_strength("+CSQ: 45,0"), Some(100));
        assert_eq!(parse_signal_strength("+CSQ: 42949673,0"), Some(100));
        assert_eq!(parse_signal_strength("+CSQ: 4294967295,0"), Some(100));
        assert_eq!(parse_signal_strength("+CSQ: 99,99\r\nOK"), None);
        assert_eq!(parse_signal_strength("OK"), None);
    }

    #[test]
    fn test_parse_network_info() {
        let info = parse_network_info("+COPS: 0,0,\"Vodafone\",7\r\nOK").unwrap();
        assert_eq!(info.operator, "Vodafone");
        assert_eq!(info.mode, AccessTechnology::FourG);
        assert_eq!(info.mode.to_string(), "4G");

        let info = parse_network_info("+COPS: 0,0,\"T-Mobile\",2").unwrap();
        assert_eq!(info.mode, AccessTechnology::ThreeG);
        let info = parse_network_info("+COPS: 0,0,\"Orange\",3").unwrap();
        assert_eq!(info.mode, AccessTechnology::Unknown);

        assert_eq!(parse_network_info("+COPS: 0\r\nOK"), None);
    }

    #[test]
    fn test_parse_own_number_and_ussd() {
        assert_eq!(
            parse_own_number("+CNUM: \"\",\"+15551234567\",145\r\nOK").as_deref(),
            Some("+15551234567")
        );
        assert_eq!(parse_own_number("OK"), None);
        assert_eq!(
            parse_ussd_response("+CUSD: 0,\"Balance: 5.00 EUR\",15\r\nOK").as_deref(),
            Some("Balance: 5.00 EUR")
        );
        assert_eq!(parse_ussd_response("+CUSD: 4"), None);
    }

    #[test]
    fn test_parse_modem_identity() {
        assert_eq!(
            parse_manufacturer("\r\nQuectel\r\n\r\nOK\r\n").as_deref(),
            Some("Quectel")
        );
        assert_eq!(
            parse_model("AT+CGMM\r\n\r\nEC25\r\n\r\nOK\r\n").as_deref(),
            Some("EC25")
        );
        assert_eq!(parse_model("\r\nOK\r\n"), None);
        assert_eq!(
            parse_identity("\r\n867698041234567\r\n\r\nOK").as_deref(),
            Some("867698041234567")
        );
        // A 16 digit run is not an identity.
        assert_eq!(parse_identity("1234567890123456\r\nOK"), None);
    }

    #[test]
    fn test_parse_sim_status() {
        assert_eq!(parse_sim_status("+CPIN: READY\r\nOK"), SimStatus::Ready);
        assert_eq!(parse_sim_status("+CPIN: SIM PIN\r\nOK"), SimStatus::PinRequired);
        assert_eq!(parse_sim_status("+CME ERROR: 10"), SimStatus::Unknown);
    }
}
