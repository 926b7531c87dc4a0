//! SMS PDU codec (3GPP TS 23.040) with the GSM 7-bit default alphabet
//! (3GPP TS 23.038).
//!
//! PDUs travel as uppercase hex strings, one hex pair per octet.

use serde::{Deserialize, Serialize};

use crate::errors::PduError;

/// The GSM 7-bit default alphabet, indexed by septet value.
pub const GSM_ALPHABET: [char; 128] = [
    '@', '£', '$', '¥', 'è', 'é', 'ù', 'ì', 'ò', 'Ç', '\n', 'Ø', 'ø', '\r', 'Å', 'å', //
    'Δ', '_', 'Φ', 'Γ', 'Λ', 'Ω', 'Π', 'Ψ', 'Σ', 'Θ', 'Ξ', '\x1B', 'Æ', 'æ', 'ß', 'É', //
    ' ', '!', '"', '#', '¤', '%', '&', '\'', '(', ')', '*', '+', ',', '-', '.', '/', //
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', ':', ';', '<', '=', '>', '?', //
    '¡', 'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', //
    'P', 'Q', 'R', 'S', 'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'Ä', 'Ö', 'Ñ', 'Ü', '§', //
    '¿', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', //
    'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'ä', 'ö', 'ñ', 'ü', 'à', //
];

/// Septet written for characters outside the alphabet (`?`).
pub const UNMAPPABLE_SEPTET: u8 = 0x3F;
/// Longest user data of a single, unconcatenated SMS.
pub const MAX_SEPTETS: usize = 160;

const PAD_NIBBLE: char = 'F';
const TYPE_INTERNATIONAL: u8 = 0x91;
const TON_MASK: u8 = 0x70;
const TON_ALPHANUMERIC: u8 = 0x50;

const MTI_MASK: u8 = 0x03;
const MTI_DELIVER: u8 = 0x00;
const MTI_SUBMIT: u8 = 0x01;
const UDHI: u8 = 0x40;
const VPF_MASK: u8 = 0x18;

/// SMS-SUBMIT, no validity period, no reply path.
const SUBMIT_FIRST_OCTET: u8 = 0x01;

/// What [`decode_pdu`] recovers from a PDU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedPdu {
    /// Originating address of a DELIVER, destination address of a SUBMIT.
    pub sender: String,
    /// Service centre timestamp as `20YY-MM-DD HH:MM:SS`; SUBMIT PDUs carry none.
    pub timestamp: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    Gsm7,
    EightBit,
    Ucs2,
}

impl Alphabet {
    fn from_dcs(dcs: u8) -> Self {
        match dcs & 0xF0 {
            // General data coding, bits 3..2 select the alphabet.
            0x00..=0x30 => match (dcs >> 2) & 0x03 {
                0x01 => Self::EightBit,
                0x02 => Self::Ucs2,
                _ => Self::Gsm7,
            },
            0xE0 => Self::Ucs2,
            0xF0 if dcs & 0x04 != 0 => Self::EightBit,
            _ => Self::Gsm7,
        }
    }
}

/// Strips non-digits and pads an odd digit count with `F` so the number
/// fills whole octets.
pub fn format_phone_number(number: &str) -> String {
    let mut digits: String = number.chars().filter(char::is_ascii_digit).collect();
    if digits.len() % 2 != 0 {
        digits.push(PAD_NIBBLE);
    }
    digits
}

/// Swaps every pair of hex digits, converting to and from semi-octet order.
///
/// A trailing unpaired digit is passed through unchanged.
pub fn swap_nibbles(hex_digits: &str) -> String {
    let chars: Vec<char> = hex_digits.chars().collect();
    let mut swapped = String::with_capacity(chars.len());
    for pair in chars.chunks(2) {
        match pair {
            [high, low] => {
                swapped.push(*low);
                swapped.push(*high);
            }
            [single] => swapped.push(*single),
            _ => {}
        }
    }
    swapped
}

fn char_to_septet(c: char) -> u8 {
    GSM_ALPHABET
        .iter()
        .position(|&symbol| symbol == c)
        .map_or(UNMAPPABLE_SEPTET, |pos| pos as u8)
}

fn septet_to_char(septet: u8) -> char {
    GSM_ALPHABET.get(usize::from(septet)).copied().unwrap_or('?')
}

/// Packs `text` into GSM 7-bit octets, low bits first.
///
/// `n` characters produce `ceil(n * 7 / 8)` octets.
pub fn encode_7bit(text: &str) -> Vec<u8> {
    let septets: Vec<u8> = text.chars().map(char_to_septet).collect();
    pack_septets(&septets)
}

fn pack_septets(septets: &[u8]) -> Vec<u8> {
    let mut packed = vec![0u8; (septets.len() * 7).div_ceil(8)];
    for (i, &septet) in septets.iter().enumerate() {
        let bit = i * 7;
        let (octet, shift) = (bit / 8, bit % 8);
        let value = u16::from(septet & 0x7F) << shift;
        packed[octet] |= value as u8;
        if let Some(next) = packed.get_mut(octet + 1) {
            *next |= (value >> 8) as u8;
        }
    }
    packed
}

/// Unpacks up to `count` septets from `octets` and maps them through the
/// alphabet.
///
/// Stops early if the octets run out, so a short payload yields a shorter
/// string rather than an error.
pub fn decode_7bit(octets: &[u8], count: usize) -> String {
    unpack_septets(octets, count)
        .into_iter()
        .map(septet_to_char)
        .collect()
}

fn unpack_septets(octets: &[u8], count: usize) -> Vec<u8> {
    let available = octets.len() * 8 / 7;
    (0..count.min(available))
        .map(|i| {
            let bit = i * 7;
            let (octet, shift) = (bit / 8, bit % 8);
            let low = u16::from(octets[octet]);
            let high = octets.get(octet + 1).map_or(0, |&b| u16::from(b));
            (((high << 8 | low) >> shift) & 0x7F) as u8
        })
        .collect()
}

/// Builds an SMS-SUBMIT PDU addressed to an international `number`, using
/// the SMSC stored in the modem and the default alphabet.
pub fn encode_pdu(number: &str, message: &str) -> Result<String, PduError> {
    let digits = format_phone_number(number);
    let digit_count = digits.trim_end_matches(PAD_NIBBLE).len();
    if digit_count == 0 {
        return Err(PduError::InvalidNumber);
    }
    let septet_count = message.chars().count();
    if septet_count > MAX_SEPTETS {
        return Err(PduError::MessageTooLong { len: septet_count });
    }

    let mut pdu = String::new();
    // SMSC length 0: use the one configured in the modem.
    pdu.push_str("00");
    pdu.push_str(&format!("{SUBMIT_FIRST_OCTET:02X}"));
    // Message reference, assigned by the modem.
    pdu.push_str("00");
    pdu.push_str(&format!("{digit_count:02X}{TYPE_INTERNATIONAL:02X}"));
    pdu.push_str(&swap_nibbles(&digits));
    // Protocol identifier and data coding scheme: plain SMS, default alphabet.
    pdu.push_str("00");
    pdu.push_str("00");
    pdu.push_str(&format!("{septet_count:02X}"));
    pdu.push_str(&hex::encode_upper(encode_7bit(message)));

    Ok(pdu)
}

/// Number of TPDU octets in `pdu`, i.e. without the SMSC length octet.
/// This is the length `AT+CMGS` expects in PDU mode.
pub fn tpdu_length(pdu: &str) -> usize {
    (pdu.len() / 2).saturating_sub(1)
}

struct Octets<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Octets<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], PduError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or(PduError::Truncated {
            field,
            offset: self.pos,
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn octet(&mut self, field: &'static str) -> Result<u8, PduError> {
        Ok(self.take(1, field)?[0])
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.pos.min(self.bytes.len())..];
        self.pos = self.bytes.len();
        rest
    }
}

/// Decodes an SMS-DELIVER or SMS-SUBMIT PDU.
pub fn decode_pdu(pdu: &str) -> Result<DecodedPdu, PduError> {
    let bytes = hex::decode(pdu.trim()).map_err(|e| PduError::InvalidHex(e.to_string()))?;
    let mut octets = Octets::new(&bytes);

    let smsc_len = octets.octet("SMSC length")?;
    octets.take(usize::from(smsc_len), "SMSC address")?;

    let first_octet = octets.octet("PDU type")?;
    let mti = first_octet & MTI_MASK;
    match mti {
        MTI_DELIVER => {}
        MTI_SUBMIT => {
            octets.octet("message reference")?;
        }
        other => return Err(PduError::UnsupportedMessageType(other)),
    }

    let sender = decode_address(&mut octets)?;
    octets.octet("protocol identifier")?;
    let dcs = octets.octet("data coding scheme")?;

    let timestamp = if mti == MTI_DELIVER {
        Some(decode_timestamp(octets.take(7, "timestamp")?))
    } else {
        match first_octet & VPF_MASK {
            0x10 => {
                octets.take(1, "validity period")?;
            }
            0x08 | 0x18 => {
                octets.take(7, "validity period")?;
            }
            _ => {}
        }
        None
    };

    let udl = usize::from(octets.octet("user data length")?);
    let user_data = octets.rest();
    let message = decode_user_data(
        user_data,
        udl,
        Alphabet::from_dcs(dcs),
        first_octet & UDHI != 0,
    )?;

    Ok(DecodedPdu {
        sender,
        timestamp,
        message,
    })
}

fn decode_address(octets: &mut Octets<'_>) -> Result<String, PduError> {
    let digit_count = usize::from(octets.octet("address length")?);
    let address_type = octets.octet("address type")?;
    let raw = octets.take(digit_count.div_ceil(2), "address digits")?;

    if address_type & TON_MASK == TON_ALPHANUMERIC {
        return Ok(decode_7bit(raw, digit_count * 4 / 7));
    }

    let mut digits = swap_nibbles(&hex::encode_upper(raw));
    // An odd digit count leaves a pad nibble in the last octet.
    digits.truncate(digit_count);
    if address_type == TYPE_INTERNATIONAL {
        digits.insert(0, '+');
    }

    Ok(digits)
}

/// Renders the 7 semi-octet timestamp fields; the time zone octet is ignored.
fn decode_timestamp(raw: &[u8]) -> String {
    let field = |i: usize| swap_nibbles(&format!("{:02X}", raw[i]));
    format!(
        "20{}-{}-{} {}:{}:{}",
        field(0),
        field(1),
        field(2),
        field(3),
        field(4),
        field(5)
    )
}

fn decode_user_data(
    user_data: &[u8],
    udl: usize,
    alphabet: Alphabet,
    has_header: bool,
) -> Result<String, PduError> {
    let header_len = match (has_header, user_data.first()) {
        (false, _) => 0,
        (true, Some(&udhl)) => usize::from(udhl) + 1,
        (true, None) => {
            return Err(PduError::Truncated {
                field: "user data header",
                offset: 0,
            });
        }
    };

    match alphabet {
        Alphabet::Gsm7 => {
            // The header is padded with fill bits up to a septet boundary.
            let skip = (header_len * 8).div_ceil(7);
            Ok(unpack_septets(user_data, udl)
                .into_iter()
                .skip(skip)
                .map(septet_to_char)
                .collect())
        }
        Alphabet::EightBit => {
            let body = user_data.get(header_len..udl.min(user_data.len())).unwrap_or_default();
            Ok(String::from_utf8_lossy(body).into_owned())
        }
        Alphabet::Ucs2 => {
            let body = user_data.get(header_len..udl.min(user_data.len())).unwrap_or_default();
            let units = body
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]));
            Ok(char::decode_utf16(units)
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect())
        }
    }
}
