/// Helpers for the SCPI dialect spoken by the instrument: block headers and reply parsing.
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::{Error, FramingError};

/// Delimiter following binary waveform data blocks.
pub const DATA_DELIMITER: &[u8] = b"\n\n";

/// The IEND chunk closing a PNG file, followed by the reply newline.
pub const PNG_DELIMITER: &[u8] = b"\x00\x00\x00\x00\x49\x45\x4E\x44\xAE\x42\x60\x82\n";

/// Parse the single ASCII digit following `#`, giving the number of length digits.
pub fn header_digits(x: u8) -> crate::Result<usize> {
    if !x.is_ascii_digit() || x == b'0' {
        return Err(Error::framing(FramingError::InvalidBinaryHeader(format!(
            "Invalid digit count {:?}",
            x as char
        ))));
    }
    Ok((x - b'0') as usize)
}

/// Parse the decimal payload length of a binary block.
pub fn block_length(digits: &[u8]) -> crate::Result<usize> {
    let invalid = || {
        Error::framing(FramingError::InvalidBinaryHeader(format!(
            "Invalid block length {:?}",
            String::from_utf8_lossy(digits)
        )))
    };
    if digits.is_empty() || !digits.iter().all(|x| x.is_ascii_digit()) {
        return Err(invalid());
    }
    std::str::from_utf8(digits)
        .map_err(|_| invalid())?
        .parse::<usize>()
        .map_err(|_| invalid())
}

/// Encode a definite length block header, e.g. `#9000000128`.
pub fn block_header(len: usize) -> Vec<u8> {
    let digits = len.to_string();
    format!("#{}{}", digits.len(), digits).into_bytes()
}

/// Strip trailing line endings from a text reply.
pub fn trim_reply(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && (data[end - 1] == b'\n' || data[end - 1] == b'\r') {
        end -= 1;
    }
    &data[..end]
}

/// Interpret a reply to `INR?`, e.g. `INR 8193`. Returns whether new waveform data is available.
pub fn parse_inr(data: &[u8]) -> crate::Result<bool> {
    let text = std::str::from_utf8(trim_reply(data))
        .map_err(|_| Error::interpretation(anyhow!("Internal state register reply is not ASCII")))?;
    let text = text.trim();
    let text = text.strip_prefix("INR").unwrap_or(text).trim();
    let value: u32 = text
        .parse()
        .map_err(|_| Error::interpretation(anyhow!("Cannot interpret internal state register: {:?}", text)))?;
    Ok(value & 0x0001 != 0)
}

/// Parse an integer reply such as `"2500000\n"`.
pub fn parse_int(data: &[u8]) -> crate::Result<i64> {
    let text = std::str::from_utf8(trim_reply(data))
        .map_err(|_| Error::interpretation(anyhow!("Reply is not ASCII")))?
        .trim();
    if let Ok(x) = text.parse::<i64>() {
        return Ok(x);
    }
    // some firmware reports counts in exponent notation, e.g. `1.00E+07`
    match text.parse::<f64>() {
        Ok(x) if x.fract() == 0.0 && x.is_finite() => Ok(x as i64),
        _ => Err(Error::interpretation(anyhow!("Cannot interpret {:?} as integer", text))),
    }
}

/// A query reply, interpreted as the most specific type that fits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Interpret a reply as integer, float, text or raw bytes, in that order.
    /// Returns `None` for an empty reply.
    pub fn parse(data: &[u8]) -> Option<Value> {
        if data.is_empty() {
            return None;
        }
        let trimmed = trim_reply(data);
        let text = match std::str::from_utf8(trimmed) {
            Ok(x) if x.is_ascii() => x,
            _ => return Some(Value::Bytes(data.to_vec())),
        };
        let number = text.trim();
        if let Ok(x) = number.parse::<i64>() {
            return Some(Value::Integer(x));
        }
        if let Ok(x) = number.parse::<f64>() {
            return Some(Value::Float(x));
        }
        Some(Value::Text(text.to_string()))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(x) => Some(*x as f64),
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(x) => Some(x),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(x) => write!(f, "{}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(x) => write!(f, "{}", x),
            Value::Bytes(x) => write!(f, "{:?}", x),
        }
    }
}
