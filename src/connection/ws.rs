use std::sync::Arc;

use futures::future::{self, Either};
use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{pin_mut, SinkExt, Stream, StreamExt};
use http::header::{HeaderValue, COOKIE, SEC_WEBSOCKET_PROTOCOL, SET_COOKIE};
use log::debug;
use tungstenite::client::IntoClientRequest;
use tungstenite::Message;

use crate::error::{Error, Result};
use crate::message::{Request, RequestKind, WS_PATH, WS_SUBPROTOCOL};
use crate::pool::PoolKey;

use super::{Channel, Connection, FrameReader, Link, SessionIo, Signal};

/// Bound WS-streaming session: the bind stream and every later request share
/// one WebSocket.
#[derive(Debug)]
pub struct WsConnection {
    endpoint: PoolKey,
    outbound: UnboundedSender<Request>,
    link: Arc<Link>,
}

impl WsConnection {
    fn enqueue(&self, request: Request) -> Result<()> {
        self.link.check_writable()?;
        self.outbound
            .unbounded_send(request)
            .map_err(|_| Error::Disconnected)
    }
}

impl Connection for WsConnection {
    fn send_message(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn send_control(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn close(&self) {
        debug!("Closing WebSocket to {}", self.endpoint);
        self.outbound.close_channel();
        self.link.close();
    }

    fn speed_up(&self) {
        self.link.speed_up();
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        self.link.close();
    }
}

pub fn bind(io: SessionIo, endpoint: PoolKey, request: Request) -> Arc<WsConnection> {
    let link = Link::new();
    let (outbound, requests) = unbounded::<Request>();

    let task = {
        let endpoint = endpoint.clone();
        let link = link.clone();

        tokio::spawn(async move {
            match run(&io, &endpoint, request, requests, &link).await {
                Ok(()) => io.signal(Signal::Closed(Channel::Bind)),
                Err(e) => io.signal(Signal::Failed(e)),
            }
        })
    };
    link.attach(task);

    Arc::new(WsConnection {
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
    link: &Link,
) -> Result<()> {
    let socket = io.ctx.pool().acquire(endpoint).await?;

    let scheme = if endpoint.tls { "wss" } else { "ws" };
    let mut upgrade = format!("{}://{}{}", scheme, endpoint.authority(), WS_PATH)
        .as_str()
        .into_client_request()?;
    let headers = upgrade.headers_mut();
    let protocol = HeaderValue::from_static(WS_SUBPROTOCOL);
    headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    if let Some(cookie) = io.cookies.header(&endpoint.host) {
        let value = HeaderValue::from_str(&cookie).map_err(Error::transport)?;
        headers.insert(COOKIE, value);
    }

    let (stream, response) = tokio_tungstenite::client_async(upgrade, socket).await?;
    for cookie in response.headers().get_all(SET_COOKIE) {
        if let Ok(cookie) = cookie.to_str() {
            io.cookies.save(&endpoint.host, cookie);
        }
    }

    let (mut write, mut read) = stream.split();

    debug!("Sending WS {} {}", endpoint, bind);
    write.send(Message::Text(bind.ws_text())).await?;
    if io.ignore_data() {
        io.signal(Signal::Bound);
    }

    let outgoing = async {
        let mut requests = requests;
        while let Some(request) = requests.next().await {
            debug!("Sending WS {} {}", endpoint, request);
            write.send(Message::Text(request.ws_text())).await?;

            if request.kind == RequestKind::Control && io.ignore_data() {
                io.signal(Signal::Subscribed);
            }
        }
        Ok::<_, Error>(())
    };
    let incoming = read_frames(io, &mut read, link);

    pin_mut!(outgoing, incoming);
    match future::select(outgoing, incoming).await {
        // Nothing more to send, keep reading the stream.
        Either::Left((Ok(()), incoming)) => incoming.await,
        Either::Left((Err(e), _)) => Err(e),
        Either::Right((result, _)) => result,
    }
}

async fn read_frames<S>(io: &SessionIo, read: &mut S, link: &Link) -> Result<()>
where
    S: Stream<Item = tungstenite::Result<Message>> + Unpin,
{
    let mut frames = FrameReader::new(Channel::Bind);

    while let Some(message) = read.next().await {
        let data = match message? {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(data) => data,
            Message::Close(frame) => {
                debug!("WebSocket closed by server: {:?}", frame);
                break;
            }
            _ => continue,
        };

        io.count_bytes(data.len());
        if !io.ignore_data() && !link.is_sped_up() {
            frames.feed(&data, io);
        }
    }

    Ok(())
}
