use std::fmt;

use crate::error::DecodeError;
use crate::protocol::fields::{quote, FieldValue};
use crate::subscription::Subscription;

pub const PROTOCOL_VERSION: &str = "TLCP-2.0.0";
pub const WS_SUBPROTOCOL: &str = "TLCP-2.0.0.lightstreamer.com";
pub const WS_PATH: &str = "/lightstreamer";

const CLIENT_ID: &str = "mgQkwtwdysogQz2BJ4Ji%20kOj2Bg";

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    SessionOk {
        session_id: String,
        request_limit: u64,
        keepalive_ms: u64,
        /// `None` when the server sent `*`.
        control_link: Option<String>,
    },
    SessionError {
        code: i32,
        message: String,
    },
    Rebind,
    SubscribeOk {
        sub_id: String,
        total_items: i32,
        total_fields: i32,
    },
    Update {
        sub_id: String,
        item: u32,
        values: Vec<FieldValue>,
    },
    RequestError {
        req_id: String,
        code: i32,
        message: String,
    },
    ParseError {
        cause: DecodeError,
        frame: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::SessionOk { .. } => "CONOK",
            Event::SessionError { .. } => "CONERR",
            Event::Rebind => "LOOP",
            Event::SubscribeOk { .. } => "SUBOK",
            Event::Update { .. } => "U",
            Event::RequestError { .. } => "REQERR",
            Event::ParseError { .. } => "parse error",
        }
    }
}

/// The four request kinds the client issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    CreateSession,
    BindSession,
    Control,
    Message,
}

impl RequestKind {
    /// Name used both as HTTP endpoint and as WebSocket preamble.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::CreateSession => "create_session",
            RequestKind::BindSession => "bind_session",
            RequestKind::Control => "control",
            RequestKind::Message => "msg",
        }
    }

    pub fn http_path(&self) -> String {
        format!(
            "/lightstreamer/{}.txt?LS_protocol={}",
            self.name(),
            PROTOCOL_VERSION
        )
    }
}

/// An outbound request: a kind plus its form-encoded parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub params: String,
}

impl Request {
    pub fn create_session(adapter_set: &str, user: Option<&str>, password: Option<&str>) -> Self {
        let mut params = format!(
            "LS_polling=true&LS_cause=new.api&LS_polling_millis=0&LS_idle_millis=0&LS_cid={}&LS_adapter_set={}",
            CLIENT_ID,
            quote(adapter_set)
        );
        if let Some(user) = user {
            params.push_str(&format!("&LS_user={}", quote(user)));
        }
        if let Some(password) = password {
            params.push_str(&format!("&LS_password={}", quote(password)));
        }

        Self {
            kind: RequestKind::CreateSession,
            params,
        }
    }

    pub fn bind_session(session_id: &str) -> Self {
        Self {
            kind: RequestKind::BindSession,
            params: format!("LS_cause=loop1&LS_session={}", quote(session_id)),
        }
    }

    pub fn subscribe(req_id: u64, sub_id: &str, sub: &Subscription, session_id: &str) -> Self {
        let mut params = format!(
            "LS_reqId={}&LS_op=add&LS_subId={}&LS_mode={}&LS_group={}&LS_schema={}",
            req_id,
            sub_id,
            sub.mode(),
            quote(sub.items().names()),
            quote(sub.fields().names()),
        );
        if let Some(adapter) = sub.data_adapter() {
            params.push_str(&format!("&LS_data_adapter={}", quote(adapter)));
        }
        if let Some(snapshot) = sub.snapshot() {
            params.push_str(&format!("&LS_snapshot={}", snapshot));
        }
        if let Some(frequency) = sub.requested_max_frequency() {
            params.push_str(&format!("&LS_requested_max_frequency={}", quote(frequency)));
        }
        if let Some(size) = sub.requested_buffer_size() {
            params.push_str(&format!("&LS_requested_buffer_size={}", size));
        }
        params.push_str(&format!("&LS_session={}", quote(session_id)));

        Self {
            kind: RequestKind::Control,
            params,
        }
    }

    pub fn message(req_id: u64, text: &str, session_id: &str) -> Self {
        Self {
            kind: RequestKind::Message,
            params: format!(
                "LS_reqId={}&LS_message={}&LS_outcome=false&LS_ack=false&LS_session={}",
                req_id,
                quote(text),
                quote(session_id)
            ),
        }
    }

    /// HTTP request body; the server expects a trailing CR LF.
    pub fn http_body(&self) -> String {
        format!("{}\r\n", self.params)
    }

    /// WebSocket text frame: preamble line followed by the parameters.
    pub fn ws_text(&self) -> String {
        format!("{}\r\n{}", self.kind.name(), self.params)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.name(), self.params)
    }
}
