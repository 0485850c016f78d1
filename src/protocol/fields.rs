//! Per-field update payload codec.
//!
//! An update payload is a `|` separated list of slots. Each slot either carries
//! a percent-encoded value or one of the compact markers below, and the slots
//! are applied left to right over the positions of the field schema.
//!
//! | slot   | meaning                                    |
//! |--------|--------------------------------------------|
//! | empty  | field unchanged                            |
//! | `#`    | field set to null                          |
//! | `$`    | field set to the empty string              |
//! | `^N`   | the next `N` fields are unchanged          |
//! | other  | percent-decoded UTF-8 value                |
//!
//! The decoder does not know the schema size: it returns as many values as the
//! payload describes and leaves the count check to the caller.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::DecodeError;

pub const SEPARATOR: u8 = b'|';

/// Longest `^N` run accepted. No schema comes close; anything above is garbage.
pub const MAX_UNCHANGED_RUN: usize = 1 << 16;

/// Characters left verbatim when encoding request parameters.
const PARAM_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Unchanged,
    Null,
    Value(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, FieldValue::Unchanged)
    }
}

/// Decodes an update payload into one value per schema position it covers.
pub fn decode_fields(payload: &[u8]) -> Result<Vec<FieldValue>, DecodeError> {
    let mut values = Vec::new();

    for slot in payload.split(|b| *b == SEPARATOR) {
        match slot {
            [] => values.push(FieldValue::Unchanged),
            [b'#'] => values.push(FieldValue::Null),
            [b'$'] => values.push(FieldValue::Value(String::new())),
            [b'^', count @ ..] => {
                let count = parse_count(count)?;
                values.extend(std::iter::repeat(FieldValue::Unchanged).take(count));
            }
            _ => values.push(FieldValue::Value(unquote(slot)?)),
        }
    }

    Ok(values)
}

fn parse_count(digits: &[u8]) -> Result<usize, DecodeError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|count| *count <= MAX_UNCHANGED_RUN)
        .ok_or_else(|| DecodeError::InvalidNumber {
            field: "unchanged run length",
            value: String::from_utf8_lossy(digits).into_owned(),
        })
}

/// Decodes `%XX` sequences and interprets the result as UTF-8.
///
/// Unlike a lenient URL decoder, a malformed escape is an error.
pub fn unquote(bytes: &[u8]) -> Result<String, DecodeError> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return Err(DecodeError::TruncatedEscape(i));
            }
            let high = hex_value(bytes[i + 1], i + 1)?;
            let low = hex_value(bytes[i + 2], i + 2)?;
            out.push((high << 4) | low);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| DecodeError::InvalidUtf8)
}

fn hex_value(digit: u8, pos: usize) -> Result<u8, DecodeError> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(DecodeError::InvalidHex {
            pos,
            digit: digit as char,
        }),
    }
}

/// Percent-encodes a request parameter value for a form body.
pub fn quote(value: &str) -> String {
    utf8_percent_encode(value, PARAM_ENCODE_SET).to_string()
}
