use thiserror::Error;

/// Failure while turning a frame or a field payload into values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("missing field {field} in {kind} frame")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("invalid number {value:?} for {field}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("truncated percent escape at byte {0}")]
    TruncatedEscape(usize),

    #[error("invalid hex digit {digit:?} at byte {pos}")]
    InvalidHex { pos: usize, digit: char },

    #[error("invalid utf-8 in field value")]
    InvalidUtf8,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Socket, TLS, HTTP or WebSocket handshake failures.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CONERR / REQERR reported by the server.
    #[error("server error {code}: {message}")]
    Server { code: i32, message: String },

    #[error("decode error: {cause} (frame: {frame:?})")]
    Decode { cause: DecodeError, frame: String },

    /// Operation on a session that has already terminated.
    #[error("session disconnected")]
    Disconnected,

    #[error("connection does not accept protocol requests after speed-up")]
    SpedUp,

    /// Valid call, wrong moment: e.g. a second subscription on one session.
    #[error("{0}")]
    Usage(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }

    /// Code reported to the server-error callback. Locally detected failures use -1.
    pub fn code(&self) -> i32 {
        match self {
            Error::Server { code, .. } => *code,
            _ => -1,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::Transport(format!("http: {}", err))
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        Error::Transport(format!("websocket: {}", err))
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Transport(format!("http request: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
