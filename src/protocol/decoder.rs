use std::str::FromStr;

use crate::error::DecodeError;
use crate::message::Event;

use super::fields::decode_fields;

/// Classifies a complete frame and extracts its fields.
///
/// Returns `None` for frames with an unknown prefix, which are skipped.
/// Malformed known frames come back as [`Event::ParseError`] carrying the frame.
pub fn decode(frame: &[u8]) -> Option<Event> {
    let result = if let Some(rest) = frame.strip_prefix(b"U,") {
        decode_update(rest)
    } else if let Some(rest) = frame.strip_prefix(b"SUBOK,") {
        decode_subok(rest)
    } else if let Some(rest) = frame.strip_prefix(b"CONOK,") {
        decode_conok(rest)
    } else if let Some(rest) = frame.strip_prefix(b"CONERR,") {
        decode_conerr(rest)
    } else if let Some(rest) = frame.strip_prefix(b"REQERR,") {
        decode_reqerr(rest)
    } else if frame == b"LOOP" || frame.starts_with(b"LOOP,") {
        Ok(Event::Rebind)
    } else {
        return None;
    };

    Some(result.unwrap_or_else(|cause| Event::ParseError {
        cause,
        frame: String::from_utf8_lossy(frame).into_owned(),
    }))
}

/// Comma separated arguments of one frame kind.
struct Args<'a> {
    kind: &'static str,
    parts: std::slice::SplitN<'a, u8, fn(&u8) -> bool>,
}

impl<'a> Args<'a> {
    /// Splits into at most `n` arguments: the last one keeps any further commas.
    fn new(kind: &'static str, rest: &'a [u8], n: usize) -> Self {
        let is_comma: fn(&u8) -> bool = |b| *b == b',';
        Self {
            kind,
            parts: rest.splitn(n, is_comma),
        }
    }

    fn bytes(&mut self, field: &'static str) -> Result<&'a [u8], DecodeError> {
        self.parts.next().ok_or(DecodeError::MissingField {
            kind: self.kind,
            field,
        })
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let bytes = self.bytes(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    fn number<T: FromStr>(&mut self, field: &'static str) -> Result<T, DecodeError> {
        let bytes = self.bytes(field)?;
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| DecodeError::InvalidNumber {
                field,
                value: String::from_utf8_lossy(bytes).into_owned(),
            })
    }
}

// U,<subId>,<item>,<payload>
fn decode_update(rest: &[u8]) -> Result<Event, DecodeError> {
    let mut args = Args::new("U", rest, 3);
    let sub_id = args.string("subId")?;
    let item = args.number("item")?;
    let values = decode_fields(args.bytes("values")?)?;

    Ok(Event::Update {
        sub_id,
        item,
        values,
    })
}

// SUBOK,<subId>,<totalItems>,<totalFields>
fn decode_subok(rest: &[u8]) -> Result<Event, DecodeError> {
    let mut args = Args::new("SUBOK", rest, 3);

    Ok(Event::SubscribeOk {
        sub_id: args.string("subId")?,
        total_items: args.number("totalItems")?,
        total_fields: args.number("totalFields")?,
    })
}

// CONOK,<sessionId>,<requestLimit>,<keepalive>,<controlLink>
fn decode_conok(rest: &[u8]) -> Result<Event, DecodeError> {
    let mut args = Args::new("CONOK", rest, 4);
    let session_id = args.string("sessionId")?;
    let request_limit = args.number("requestLimit")?;
    let keepalive_ms = args.number("keepalive")?;
    let control_link = match args.string("controlLink")? {
        link if link == "*" => None,
        link => Some(link),
    };

    Ok(Event::SessionOk {
        session_id,
        request_limit,
        keepalive_ms,
        control_link,
    })
}

// CONERR,<code>,<message>
fn decode_conerr(rest: &[u8]) -> Result<Event, DecodeError> {
    let mut args = Args::new("CONERR", rest, 2);

    Ok(Event::SessionError {
        code: args.number("code")?,
        message: args.string("message")?,
    })
}

// REQERR,<reqId>,<code>,<message>
fn decode_reqerr(rest: &[u8]) -> Result<Event, DecodeError> {
    let mut args = Args::new("REQERR", rest, 3);

    Ok(Event::RequestError {
        req_id: args.string("reqId")?,
        code: args.number("code")?,
        message: args.string("message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldValue;

    #[test]
    fn test_conok_without_redirect() {
        assert_eq!(
            decode(b"CONOK,S8f3,50000,5000,*"),
            Some(Event::SessionOk {
                session_id: "S8f3".to_string(),
                request_limit: 50000,
                keepalive_ms: 5000,
                control_link: None,
            })
        );
    }

    #[test]
    fn test_conok_with_control_link() {
        match decode(b"CONOK,S1,50000,5000,push2.example.com") {
            Some(Event::SessionOk { control_link, .. }) => {
                assert_eq!(control_link.as_deref(), Some("push2.example.com"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_error_messages_keep_commas() {
        assert_eq!(
            decode(b"CONERR,1,User/password check failed, try again"),
            Some(Event::SessionError {
                code: 1,
                message: "User/password check failed, try again".to_string(),
            })
        );
        assert_eq!(
            decode(b"REQERR,7,19,Item not found"),
            Some(Event::RequestError {
                req_id: "7".to_string(),
                code: 19,
                message: "Item not found".to_string(),
            })
        );
    }

    #[test]
    fn test_subok_and_update() {
        assert_eq!(
            decode(b"SUBOK,3,10,4"),
            Some(Event::SubscribeOk {
                sub_id: "3".to_string(),
                total_items: 10,
                total_fields: 4,
            })
        );

        assert_eq!(
            decode(b"U,3,2,A|#|$|^1"),
            Some(Event::Update {
                sub_id: "3".to_string(),
                item: 2,
                values: vec![
                    FieldValue::Value("A".to_string()),
                    FieldValue::Null,
                    FieldValue::Value(String::new()),
                    FieldValue::Unchanged,
                ],
            })
        );
    }

    #[test]
    fn test_update_payload_may_contain_commas() {
        match decode(b"U,1,1,a,b|c") {
            Some(Event::Update { values, .. }) => assert_eq!(values[0].as_str(), Some("a,b")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_loop() {
        assert_eq!(decode(b"LOOP,0"), Some(Event::Rebind));
        assert_eq!(decode(b"LOOP"), Some(Event::Rebind));
    }

    #[test]
    fn test_unknown_prefixes_are_ignored() {
        assert_eq!(decode(b"REQOK,4"), None);
        assert_eq!(decode(b"PROBE"), None);
        assert_eq!(decode(b"SYNC,12"), None);
        assert_eq!(decode(b"UNSUB,1"), None);
        assert_eq!(decode(b""), None);
    }

    #[test]
    fn test_malformed_frames() {
        match decode(b"SUBOK,3,ten,4") {
            Some(Event::ParseError { cause, frame }) => {
                assert_eq!(
                    cause,
                    DecodeError::InvalidNumber {
                        field: "totalItems",
                        value: "ten".to_string()
                    }
                );
                assert_eq!(frame, "SUBOK,3,ten,4");
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            decode(b"CONOK,S1,50000"),
            Some(Event::ParseError {
                cause: DecodeError::MissingField {
                    field: "keepalive",
                    ..
                },
                ..
            })
        ));

        assert!(matches!(
            decode(b"U,1,1,%ZZ"),
            Some(Event::ParseError {
                cause: DecodeError::InvalidHex { .. },
                ..
            })
        ));
    }
}
