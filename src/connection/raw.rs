//! WebSocket binding without a WebSocket library.
//!
//! The upgrade is written by hand and outbound frames are encoded directly on
//! the socket. Nothing read from the server after the handshake is parsed:
//! the stream is only counted, so the session is told it is bound as soon as
//! the bind frame is out, and subscribed as soon as each control frame is.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::future::{self, Either};
use futures_util::pin_mut;
use log::debug;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{Request, RequestKind, WS_PATH, WS_SUBPROTOCOL};
use crate::pool::{PoolKey, Socket};

use super::http::USER_AGENT_VALUE;
use super::{Channel, Connection, Link, SessionIo, Signal};

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

#[derive(Debug)]
pub struct RawWsConnection {
    endpoint: PoolKey,
    outbound: UnboundedSender<Request>,
    link: Arc<Link>,
}

impl RawWsConnection {
    fn enqueue(&self, request: Request) -> Result<()> {
        self.link.check_writable()?;
        self.outbound.send(request).map_err(|_| Error::Disconnected)
    }
}

impl Connection for RawWsConnection {
    fn send_message(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn send_control(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn close(&self) {
        debug!("Closing raw WebSocket to {}", self.endpoint);
        self.link.close();
    }

    fn speed_up(&self) {
        self.link.speed_up();
    }
}

impl Drop for RawWsConnection {
    fn drop(&mut self) {
        self.link.close();
    }
}

pub fn bind(io: SessionIo, endpoint: PoolKey, request: Request) -> Arc<RawWsConnection> {
    let link = Link::new();
    let (outbound, requests) = unbounded_channel();

    let task = {
        let endpoint = endpoint.clone();

        tokio::spawn(async move {
            match run(&io, &endpoint, request, requests).await {
                Ok(()) => io.signal(Signal::Closed(Channel::Bind)),
                Err(e) => io.signal(Signal::Failed(e)),
            }
        })
    };
    link.attach(task);

    Arc::new(RawWsConnection {
        endpoint,
        outbound,
        link,
    })
}

async fn run(
    io: &SessionIo,
    endpoint: &PoolKey,
    bind: Request,
    requests: UnboundedReceiver<Request>,
) -> Result<()> {
    let mut socket = io.ctx.pool().acquire(endpoint).await?;
    upgrade(io, endpoint, &mut socket).await?;

    let (mut read, mut write) = tokio::io::split(socket);

    debug!("Sending raw WS {} {}", endpoint, bind);
    let frame = encode_frame(bind.ws_text().as_bytes());
    write.write_all(&frame).await?;
    io.signal(Signal::Bound);

    let outgoing = write_requests(io, &mut write, requests);
    let incoming = count_bytes(io, &mut read);

    pin_mut!(outgoing, incoming);
    match future::select(outgoing, incoming).await {
        Either::Left((Ok(()), incoming)) => incoming.await,
        Either::Left((Err(e), _)) => Err(e),
        Either::Right((result, _)) => result,
    }
}

async fn write_requests<W>(
    io: &SessionIo,
    write: &mut W,
    mut requests: UnboundedReceiver<Request>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(request) = requests.recv().await {
        debug!("Sending raw WS {}", request);
        let frame = encode_frame(request.ws_text().as_bytes());
        write.write_all(&frame).await?;

        if request.kind == RequestKind::Control {
            io.signal(Signal::Subscribed);
        }
    }
    Ok(())
}

async fn count_bytes<R>(io: &SessionIo, read: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        io.count_bytes(n);
    }
}

async fn upgrade(io: &SessionIo, endpoint: &PoolKey, socket: &mut Socket) -> Result<()> {
    let key = STANDARD.encode(Uuid::new_v4().as_bytes());

    let mut head = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         User-Agent: {}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: {}\r\n",
        WS_PATH,
        endpoint.authority(),
        USER_AGENT_VALUE,
        key,
        WS_SUBPROTOCOL,
    );
    if let Some(cookie) = io.cookies.header(&endpoint.host) {
        head.push_str(&format!("Cookie: {}\r\n", cookie));
    }
    head.push_str("\r\n");

    socket.write_all(head.as_bytes()).await?;
    socket.flush().await?;

    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let end = loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::transport("connection closed during WebSocket upgrade"));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(Error::transport("WebSocket upgrade response too large"));
        }
    };

    let response = String::from_utf8_lossy(&buf[..end]);
    let save_cookie = |cookie: &str| io.cookies.save(&endpoint.host, cookie);
    check_upgrade_response(&response, &key, save_cookie)?;

    // Frames the server sent right behind the handshake.
    io.count_bytes(buf.len() - end);
    Ok(())
}

fn check_upgrade_response(
    response: &str,
    key: &str,
    mut save_cookie: impl FnMut(&str),
) -> Result<()> {
    let mut lines = response.split("\r\n");

    let status = lines.next().and_then(|line| line.split_whitespace().nth(1));
    if status != Some("101") {
        return Err(Error::Transport(format!(
            "WebSocket upgrade refused: {}",
            response.lines().next().unwrap_or_default()
        )));
    }

    let mut accepted = false;
    for (name, value) in lines.filter_map(|line| line.split_once(':')) {
        let (name, value) = (name.trim(), value.trim());

        if name.eq_ignore_ascii_case("sec-websocket-accept") {
            accepted = value == accept_key(key);
        } else if name.eq_ignore_ascii_case("set-cookie") {
            save_cookie(value);
        }
    }

    if !accepted {
        return Err(Error::transport("invalid Sec-WebSocket-Accept"));
    }
    Ok(())
}

/// `Sec-WebSocket-Accept` value the server must answer for `key`.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID);
    STANDARD.encode(sha1.finalize())
}

/// Masked text frame with an all-zero mask, so the payload goes out as is.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 14);
    frame.push(0x81);

    match payload.len() {
        len if len <= 125 => frame.push(0x80 | len as u8),
        len if len <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }

    frame.extend_from_slice(&[0; 4]);
    frame.extend_from_slice(payload);
    frame
}
