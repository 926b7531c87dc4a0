use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Local, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::PduError;
use crate::pdu::{self, DecodedPdu};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// `yy/MM/dd,hh:mm:ss` as used by TEXT mode; the `±zz` suffix is dropped.
const TEXT_TIMESTAMP_FORMAT: &str = "%y/%m/%d,%H:%M:%S";

static TEXT_LIST_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\+CMGL:\s*(\d+),"([^"]+)","([^"]*)",[^,]*,"([^"]+)""#)
        .expect("valid regex")
});
static PDU_LIST_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CMGL:\s*(\d+),(\d*)").expect("valid regex"));
static TEXT_READ_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\+CMGR:\s*"([^"]+)","([^"]*)",[^,]*,"([^"]+)""#).expect("valid regex")
});
static PDU_READ_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\+CMGR:\s*(\d*),").expect("valid regex"));

/// How the modem exchanges SMS payloads (`AT+CMGF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SmsMode {
    Pdu,
    #[default]
    Text,
}

impl SmsMode {
    /// Value of the `AT+CMGF=<mode>` argument.
    pub fn cmgf_value(self) -> u8 {
        match self {
            Self::Pdu => 0,
            Self::Text => 1,
        }
    }
}

impl FromStr for SmsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PDU" => Ok(Self::Pdu),
            "TEXT" => Ok(Self::Text),
            other => Err(format!("unknown SMS mode '{other}', expected TEXT or PDU")),
        }
    }
}

impl fmt::Display for SmsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pdu => "PDU",
            Self::Text => "TEXT",
        })
    }
}

/// Storage status of a message, and the `ALL` filter used when listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Unread,
    Read,
    Unsent,
    Sent,
    All,
}

impl MessageStatus {
    /// Name used by TEXT mode, e.g. `REC UNREAD`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unread => "REC UNREAD",
            Self::Read => "REC READ",
            Self::Unsent => "STO UNSENT",
            Self::Sent => "STO SENT",
            Self::All => "ALL",
        }
    }

    /// Quoted `AT+CMGL` argument in TEXT mode.
    pub fn text_arg(self) -> String {
        format!("\"{}\"", self.as_str())
    }

    /// Numeric `<stat>` used by PDU mode.
    pub fn pdu_code(self) -> u8 {
        match self {
            Self::Unread => 0,
            Self::Read => 1,
            Self::Unsent => 2,
            Self::Sent => 3,
            Self::All => 4,
        }
    }

    /// State of a stored message. `4` only selects messages in a listing, so
    /// it maps to `None` like any other unknown code.
    pub fn from_pdu_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Unread),
            1 => Some(Self::Read),
            2 => Some(Self::Unsent),
            3 => Some(Self::Sent),
            _ => None,
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REC UNREAD" => Ok(Self::Unread),
            "REC READ" => Ok(Self::Read),
            "STO UNSENT" => Ok(Self::Unsent),
            "STO SENT" => Ok(Self::Sent),
            "ALL" => Ok(Self::All),
            other => Err(format!("unknown message status '{other}'")),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// What a message was parsed from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RawMessage {
    /// Header and body lines of a TEXT mode listing.
    Response(String),
    Pdu { pdu: String, decoded: DecodedPdu },
}

/// A message held by the modem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SmsMessage {
    pub index: u32,
    pub sender: String,
    #[serde(rename = "message")]
    pub body: String,
    #[serde(serialize_with = "serialize_timestamp")]
    pub timestamp: NaiveDateTime,
    pub status: MessageStatus,
    #[serde(skip)]
    pub raw: RawMessage,
}

fn serialize_timestamp<S: Serializer>(ts: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&ts.format(TIMESTAMP_FORMAT))
}

/// Timestamps that cannot be parsed are replaced with the current local time.
fn timestamp_or_now(parsed: Option<NaiveDateTime>) -> NaiveDateTime {
    parsed.unwrap_or_else(|| Local::now().naive_local())
}

fn parse_text_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let without_zone = raw.get(..17).unwrap_or(raw);
    NaiveDateTime::parse_from_str(without_zone, TEXT_TIMESTAMP_FORMAT).ok()
}

impl SmsMessage {
    /// Builds a message from a `+CMGL:` TEXT mode header and the body line
    /// following it.
    pub fn from_text_listing(header: &str, body: &str) -> Option<Self> {
        let caps = TEXT_LIST_HEADER_RE.captures(header)?;
        let index = caps[1].parse().ok()?;
        let status = caps[2].parse().ok()?;

        Some(Self {
            index,
            sender: caps[3].to_string(),
            body: body.trim().to_string(),
            timestamp: timestamp_or_now(parse_text_timestamp(&caps[4])),
            status,
            raw: RawMessage::Response(format!("{header}\n{body}")),
        })
    }

    pub fn from_pdu(index: u32, status: MessageStatus, pdu: &str, decoded: DecodedPdu) -> Self {
        let timestamp = decoded
            .timestamp
            .as_deref()
            .and_then(|ts| NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok());

        Self {
            index,
            sender: decoded.sender.clone(),
            body: decoded.message.clone(),
            timestamp: timestamp_or_now(timestamp),
            status,
            raw: RawMessage::Pdu {
                pdu: pdu.to_string(),
                decoded,
            },
        }
    }
}

fn response_lines(response: &str) -> Vec<&str> {
    response.split('\n').map(|l| l.trim_end_matches('\r')).collect()
}

/// Pairs each `+CMGL:` header of a TEXT mode listing with the line after it.
/// Other lines, including blanks and the final `OK`, are ignored.
pub fn parse_text_listing(response: &str) -> Vec<SmsMessage> {
    let lines = response_lines(response);
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.trim_start().starts_with("+CMGL:"))
        .filter_map(|(i, header)| {
            let body = lines.get(i + 1).copied().unwrap_or_default();
            SmsMessage::from_text_listing(header, body)
        })
        .collect()
}

/// A PDU listing entry that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub index: u32,
    pub error: PduError,
}

/// Decodes every `+CMGL: <index>,<stat>,...` entry of a PDU mode listing.
///
/// Entries whose PDU fails to decode are returned separately and do not
/// affect the others.
pub fn parse_pdu_listing(response: &str) -> (Vec<SmsMessage>, Vec<SkippedEntry>) {
    let lines = response_lines(response);
    let mut messages = Vec::new();
    let mut skipped = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Some(caps) = PDU_LIST_HEADER_RE.captures(line) else {
            continue;
        };
        let Ok(index) = caps[1].parse::<u32>() else {
            continue;
        };
        let Some(pdu) = lines.get(i + 1).map(|l| l.trim()) else {
            continue;
        };
        let status = caps[2]
            .parse()
            .ok()
            .and_then(MessageStatus::from_pdu_code)
            .unwrap_or(MessageStatus::Unread);

        match pdu::decode_pdu(pdu) {
            Ok(decoded) => messages.push(SmsMessage::from_pdu(index, status, pdu, decoded)),
            Err(error) => skipped.push(SkippedEntry { index, error }),
        }
    }

    (messages, skipped)
}

/// Parses the reply to `AT+CMGR=<index>` in TEXT mode.
pub fn parse_text_read(index: u32, response: &str) -> Option<SmsMessage> {
    let lines = response_lines(response);
    let pos = lines.iter().position(|l| TEXT_READ_HEADER_RE.is_match(l))?;
    let caps = TEXT_READ_HEADER_RE.captures(lines[pos])?;
    let body = lines.get(pos + 1).copied().unwrap_or_default();

    Some(SmsMessage {
        index,
        sender: caps[2].to_string(),
        body: body.trim().to_string(),
        timestamp: timestamp_or_now(parse_text_timestamp(&caps[3])),
        status: caps[1].parse().ok()?,
        raw: RawMessage::Response(format!("{}\n{body}", lines[pos])),
    })
}

/// Parses the reply to `AT+CMGR=<index>` in PDU mode.
pub fn parse_pdu_read(index: u32, response: &str) -> Result<Option<SmsMessage>, PduError> {
    let lines = response_lines(response);
    let Some(pos) = lines.iter().position(|l| PDU_READ_HEADER_RE.is_match(l)) else {
        return Ok(None);
    };
    let Some(pdu) = lines.get(pos + 1).map(|l| l.trim()) else {
        return Ok(None);
    };
    let status = PDU_READ_HEADER_RE
        .captures(lines[pos])
        .and_then(|c| c[1].parse().ok())
        .and_then(MessageStatus::from_pdu_code)
        .unwrap_or(MessageStatus::Unread);
    let decoded = pdu::decode_pdu(pdu)?;

    Ok(Some(SmsMessage::from_pdu(index, status, pdu, decoded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    const DELIVER_FIXTURE: &str =
        "0791947101670000040C91947156436587000021309141705440054C29B01E";

    #[test]
    fn test_message_from_text_listing() {
        let response =
            "+CMGL: 1,\"REC READ\",\"+1234567890\",,\"24/01/01,10:30:00+00\"\nHello World";
        let messages = parse_text_listing(response);
        assert_eq!(messages.len(), 1);

        let message = &messages[0];
        assert_eq!(message.index, 1);
        assert_eq!(message.sender, "+1234567890");
        assert_eq!(message.status, MessageStatus::Read);
        assert_eq!(message.status.to_string(), "REC READ");
        assert_eq!(message.body, "Hello World");
        assert_eq!(message.timestamp.year(), 2024);
        assert_eq!(message.timestamp.hour(), 10);
        assert_eq!(message.timestamp.minute(), 30);
    }

    #[test]
    fn test_text_listing_ignores_noise() {
        let response = "\r\n+CMGL: 2,\"REC UNREAD\",\"+4915112345\",,\"23/12/24,18:00:05+04\"\r\n\
                        Merry Christmas\r\n\
                        +CMTI: \"SM\",3\r\n\
                        +CMGL: 5,\"STO SENT\",\"5550100\",,\"23/12/25,09:15:00+04\"\r\n\
                        On my way\r\n\r\nOK\r\n";
        let messages = parse_text_listing(response);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].index, 2);
        assert_eq!(messages[0].status, MessageStatus::Unread);
        assert_eq!(messages[0].body, "Merry Christmas");
        assert_eq!(messages[1].index, 5);
        assert_eq!(messages[1].status, MessageStatus::Sent);
        assert_eq!(messages[1].body, "On my way");
    }

    #[test]
    fn test_pdu_listing_skips_broken_entries() {
        let response = format!(
            "+CMGL: 0,1,,30\r\n{DELIVER_FIXTURE}\r\n\
             +CMGL: 1,0,,12\r\n0791ZZ\r\n\
             +CMGL: 2,0,,30\r\n{DELIVER_FIXTURE}\r\n\r\nOK\r\n"
        );
        let (messages, skipped) = parse_pdu_listing(&response);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].index, 0);
        assert_eq!(messages[0].status, MessageStatus::Read);
        assert_eq!(messages[0].sender, "+491765345678");
        assert_eq!(
            messages[0].timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2012-03-19 14:07:45"
        );
        assert_eq!(messages[1].index, 2);
        assert_eq!(messages[1].status, MessageStatus::Unread);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].index, 1);

        let kept = skipped.clone();
        assert_eq!(kept, skipped);
        assert!(matches!(kept[0].error, PduError::InvalidHex(_)));
    }

    #[test]
    fn test_pdu_listing_never_stores_the_all_filter() {
        let response = format!("+CMGL: 5,4,,30\r\n{DELIVER_FIXTURE}\r\n\r\nOK\r\n");
        let (messages, skipped) = parse_pdu_listing(&response);
        assert!(skipped.is_empty());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Unread);

        let read = format!("+CMGR: 4,,30\r\n{DELIVER_FIXTURE}\r\n\r\nOK\r\n");
        let message = parse_pdu_read(5, &read).unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Unread);
    }

    #[test]
    fn test_message_from_pdu_uses_decoded_timestamp() {
        let decoded = DecodedPdu {
            sender: "+1234567890".to_string(),
            timestamp: Some("2024-01-01 10:30:00".to_string()),
            message: "Test message".to_string(),
        };
        let message = SmsMessage::from_pdu(1, MessageStatus::Unread, "0000", decoded);
        assert_eq!(message.index, 1);
        assert_eq!(message.sender, "+1234567890");
        assert_eq!(message.body, "Test message");
        assert_eq!(
            message.timestamp,
            NaiveDateTime::parse_from_str("2024-01-01 10:30:00", TIMESTAMP_FORMAT).unwrap()
        );
    }

    #[test]
    fn test_message_serializes_like_a_record() {
        let decoded = DecodedPdu {
            sender: "+1234567890".to_string(),
            timestamp: Some("2024-01-01 10:30:00".to_string()),
            message: "Test".to_string(),
        };
        let message = SmsMessage::from_pdu(1, MessageStatus::Unread, "0000", decoded);
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "index": 1,
                "sender": "+1234567890",
                "message": "Test",
                "timestamp": "2024-01-01 10:30:00",
                "status": "REC UNREAD",
            })
        );
    }

    #[test]
    fn test_read_replies() {
        let text = "\r\n+CMGR: \"REC UNREAD\",\"+3161234\",,\"24/02/29,23:59:59+04\"\r\nLeap\r\n\r\nOK\r\n";
        let message = parse_text_read(7, text).unwrap();
        assert_eq!(message.index, 7);
        assert_eq!(message.sender, "+3161234");
        assert_eq!(message.body, "Leap");
        assert_eq!(message.timestamp.day(), 29);

        let pdu = format!("\r\n+CMGR: 1,,30\r\n{DELIVER_FIXTURE}\r\n\r\nOK\r\n");
        let message = parse_pdu_read(3, &pdu).unwrap().unwrap();
        assert_eq!(message.index, 3);
        assert_eq!(message.status, MessageStatus::Read);

        assert_eq!(parse_pdu_read(3, "\r\nOK\r\n"), Ok(None));
        assert!(parse_pdu_read(3, "+CMGR: 1,,30\r\nXYZ\r\n").is_err());
    }

    #[test]
    fn test_status_codes() {
        for status in [
            MessageStatus::Unread,
            MessageStatus::Read,
            MessageStatus::Unsent,
            MessageStatus::Sent,
        ] {
            assert_eq!(MessageStatus::from_pdu_code(status.pdu_code()), Some(status));
            assert_eq!(status.as_str().parse::<MessageStatus>(), Ok(status));
        }
        assert_eq!(MessageStatus::All.pdu_code(), 4);
        assert_eq!(MessageStatus::from_pdu_code(4), None);
        assert_eq!("ALL".parse::<MessageStatus>(), Ok(MessageStatus::All));
        assert_eq!(MessageStatus::All.text_arg(), "\"ALL\"");
        assert_eq!("pdu".parse::<SmsMode>(), Ok(SmsMode::Pdu));
        assert!("binary".parse::<SmsMode>().is_err());
    }
}
