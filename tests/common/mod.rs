#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::StreamBody;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const SESSION_ID: &str = "S1";
pub const UPDATE_PAYLOAD: &str = "A|#|$|^1";
pub const FOREIGN_SUB_ID: &str = "unknown";

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Host sent as control link in CONOK; `*` when unset.
    pub control_link: Option<String>,
    /// Answer binds with CONERR instead of CONOK.
    pub refuse_bind: bool,
    /// Hold the create stream open and send LOOP only after this delay.
    pub loop_delay: Option<Duration>,
    /// Payload of the update pushed after SUBOK; [`UPDATE_PAYLOAD`] when unset.
    pub update_payload: Option<String>,
    /// Answer subscriptions with REQERR on the control response.
    pub reject_subscription: bool,
    /// Acknowledge and update under a sub id the client never used.
    pub foreign_sub_id: bool,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub kind: String,
    pub host: Option<String>,
    pub cookie: Option<String>,
    pub subprotocol: Option<String>,
    pub body: String,
}

/// In-process TLCP server speaking HTTP streaming and WebSocket.
pub struct MockServer {
    behavior: Behavior,
    requests: Mutex<Vec<Recorded>>,
    stream: Mutex<Option<UnboundedSender<String>>>,
}

impl MockServer {
    pub async fn start(behavior: Behavior) -> (SocketAddr, Arc<Self>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        Self::start_on(listener, behavior).await
    }

    pub async fn start_on(
        listener: std::net::TcpListener,
        behavior: Behavior,
    ) -> (SocketAddr, Arc<Self>) {
        let server = Arc::new(Self {
            behavior,
            requests: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
        });

        let app = Router::new()
            .route("/lightstreamer/create_session.txt", post(create_session))
            .route("/lightstreamer/bind_session.txt", post(bind_session))
            .route("/lightstreamer/control.txt", post(control))
            .route("/lightstreamer/msg.txt", post(message))
            .route("/lightstreamer", get(websocket))
            .with_state(server.clone());

        let addr = listener.local_addr().unwrap();
        let http = axum::Server::from_tcp(listener).unwrap();
        tokio::spawn(http.serve(app.into_make_service()));

        (addr, server)
    }

    pub fn requests(&self, kind: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    fn record(&self, kind: &str, headers: &HeaderMap, body: &str) {
        let get = |name: header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        self.requests.lock().push(Recorded {
            kind: kind.to_string(),
            host: get(header::HOST),
            cookie: get(header::COOKIE),
            subprotocol: get(header::SEC_WEBSOCKET_PROTOCOL),
            body: body.to_string(),
        });
    }

    fn create_reply(&self) -> String {
        let link = self.behavior.control_link.as_deref().unwrap_or("*");
        format!("CONOK,{},50000,5000,{}\r\n", SESSION_ID, link)
    }

    fn bind_reply(&self) -> String {
        if self.behavior.refuse_bind {
            "CONERR,4,Bad session\r\n".to_string()
        } else {
            format!("CONOK,{},50000,5000,*\r\n", SESSION_ID)
        }
    }

    fn push(&self, frames: String) {
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.send(frames);
        }
    }

    fn subscribe_reply(&self, params: &str) -> Option<String> {
        let sub_id = match param(params, "LS_subId")? {
            _ if self.behavior.foreign_sub_id => FOREIGN_SUB_ID,
            sub_id => sub_id,
        };
        let payload = self
            .behavior
            .update_payload
            .as_deref()
            .unwrap_or(UPDATE_PAYLOAD);

        Some(format!("SUBOK,{0},1,4\r\nU,{0},1,{1}\r\n", sub_id, payload))
    }

    fn reject_reply(&self, params: &str) -> Option<String> {
        param(params, "LS_subId")?;
        let req_id = param(params, "LS_reqId")?;

        Some(format!("REQERR,{},19,Item not available\r\n", req_id))
    }
}

fn param<'a>(params: &'a str, name: &str) -> Option<&'a str> {
    for pair in params.trim_end().split('&') {
        match pair.split_once('=') {
            Some((key, value)) if key == name => return Some(value),
            _ => {}
        }
    }
    None
}

async fn create_session(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    server.record("create_session", &headers, &body);

    let (tx, rx) = unbounded_channel();
    match server.behavior.loop_delay {
        None => {
            let _ = tx.send(server.create_reply() + "LOOP,0\r\n");
        }
        Some(delay) => {
            let _ = tx.send(server.create_reply());
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send("LOOP,0\r\n".to_string());
            });
        }
    }

    (
        [(header::SET_COOKIE, "lb=node1; Path=/")],
        StreamBody::new(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>)),
    )
        .into_response()
}

async fn bind_session(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    server.record("bind_session", &headers, &body);

    let (tx, rx) = unbounded_channel();
    let _ = tx.send(server.bind_reply());
    if !server.behavior.refuse_bind {
        *server.stream.lock() = Some(tx);
    }

    StreamBody::new(UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>))
        .into_response()
}

async fn control(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    body: String,
) -> String {
    server.record("control", &headers, &body);
    if server.behavior.reject_subscription {
        if let Some(reply) = server.reject_reply(&body) {
            return reply;
        }
    }
    if let Some(reply) = server.subscribe_reply(&body) {
        server.push(reply);
    }
    "REQOK\r\n".to_string()
}

async fn message(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    body: String,
) -> String {
    server.record("msg", &headers, &body);
    "REQOK\r\n".to_string()
}

async fn websocket(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    server.record("websocket", &headers, "");
    ws.protocols(["TLCP-2.0.0.lightstreamer.com"])
        .on_upgrade(move |socket| serve_websocket(server, socket))
}

async fn serve_websocket(server: Arc<MockServer>, mut socket: WebSocket) {
    let empty = HeaderMap::new();

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let (kind, params) = text.split_once("\r\n").unwrap_or((text.as_str(), ""));
        server.record(&format!("ws:{}", kind), &empty, params);

        let reply = match kind {
            "bind_session" => Some(server.bind_reply()),
            "control" => server.subscribe_reply(params),
            _ => None,
        };

        if let Some(reply) = reply {
            if socket.send(Message::Text(reply)).await.is_err() {
                break;
            }
        }
    }
}

/// Two listeners on consecutive ports, for port rotation.
pub fn consecutive_listeners() -> (std::net::TcpListener, std::net::TcpListener) {
    for _ in 0..50 {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = first.local_addr().unwrap().port();
        if port == u16::MAX {
            continue;
        }
        if let Ok(second) = std::net::TcpListener::bind(("127.0.0.1", port + 1)) {
            return (first, second);
        }
    }
    panic!("no consecutive free ports");
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}
