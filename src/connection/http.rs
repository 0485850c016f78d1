use std::sync::Arc;

use futures::StreamExt;
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, SET_COOKIE, USER_AGENT};
use hyper::{Body, StatusCode};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::message::{Request, RequestKind};
use crate::pool::PoolKey;

use super::{Channel, Connection, FrameReader, Link, SessionIo, Signal};

pub const USER_AGENT_VALUE: &str = concat!("streamload/", env!("CARGO_PKG_VERSION"));
pub const CONTENT_TYPE_VALUE: &str = "text/plain; charset=UTF-8";

/// Bound HTTP-streaming session. The stream runs on its own socket; control
/// and message requests are separate exchanges on pooled sockets, issued one
/// at a time in submission order.
#[derive(Debug)]
pub struct HttpConnection {
    endpoint: PoolKey,
    outbound: UnboundedSender<Request>,
    link: Arc<Link>,
}

impl HttpConnection {
    fn enqueue(&self, request: Request) -> Result<()> {
        self.link.check_writable()?;
        self.outbound.send(request).map_err(|_| Error::Disconnected)
    }
}

impl Connection for HttpConnection {
    fn send_message(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn send_control(&self, request: Request) -> Result<()> {
        self.enqueue(request)
    }

    fn close(&self) {
        debug!("Closing HTTP stream to {}", self.endpoint);
        self.link.close();
    }

    fn speed_up(&self) {
        self.link.speed_up();
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.link.close();
    }
}

/// Posts `create_session` and reports its frames on the create channel.
pub fn create_session(io: SessionIo, endpoint: PoolKey, request: Request) -> JoinHandle<()> {
    tokio::spawn(async move {
        match exchange(&io, &endpoint, &request, Channel::Create, None).await {
            Ok(()) => io.signal(Signal::Closed(Channel::Create)),
            Err(e) => io.signal(Signal::Failed(e)),
        }
    })
}

/// Opens the bind stream. The returned connection accepts requests right away.
pub fn bind(io: SessionIo, endpoint: PoolKey, request: Request) -> Arc<HttpConnection> {
    let link = Link::new();
    let (outbound, requests) = unbounded_channel();

    let stream = tokio::spawn(stream(io.clone(), endpoint.clone(), request, link.clone()));
    link.attach(stream);

    let writer = tokio::spawn(write_requests(io, endpoint.clone(), requests));
    link.attach(writer);

    Arc::new(HttpConnection {
        endpoint,
        outbound,
        link,
    })
}

async fn stream(io: SessionIo, endpoint: PoolKey, request: Request, link: Arc<Link>) {
    let result = if io.ignore_data() {
        count_only(&io, &endpoint, &request).await
    } else {
        exchange(&io, &endpoint, &request, Channel::Bind, Some(&*link)).await
    };

    match result {
        Ok(()) => io.signal(Signal::Closed(Channel::Bind)),
        Err(e) => io.signal(Signal::Failed(e)),
    }
}

/// Writes the bind request by hand and only counts what comes back.
async fn count_only(io: &SessionIo, endpoint: &PoolKey, request: &Request) -> Result<()> {
    let mut socket = io.ctx.pool().acquire(endpoint).await?;

    debug!("Sending HTTP {} {}", endpoint, request);
    socket
        .write_all(encode_request(endpoint, request, &io.cookies).as_bytes())
        .await?;
    socket.flush().await?;
    io.signal(Signal::Bound);

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        io.count_bytes(n);
    }
}

async fn write_requests(io: SessionIo, endpoint: PoolKey, requests: UnboundedReceiver<Request>) {
    let mut requests = UnboundedReceiverStream::new(requests);

    while let Some(request) = requests.next().await {
        if let Err(e) = exchange(&io, &endpoint, &request, Channel::Control, None).await {
            io.signal(Signal::Failed(e));
            return;
        }

        if request.kind == RequestKind::Control && io.ignore_data() {
            io.signal(Signal::Subscribed);
        }
    }
}

/// One request/response exchange on a pooled socket.
///
/// Response frames are signalled on `channel`. The socket goes back to the pool
/// once the response body is complete, unless the server asked to close it.
pub(crate) async fn exchange(
    io: &SessionIo,
    endpoint: &PoolKey,
    request: &Request,
    channel: Channel,
    link: Option<&Link>,
) -> Result<()> {
    let socket = io.ctx.pool().acquire(endpoint).await?;
    let (mut sender, conn) = hyper::client::conn::handshake(socket).await?;
    let conn = tokio::spawn(conn.without_shutdown());

    debug!("Sending HTTP {} {}", endpoint, request);
    let response = sender
        .send_request(build_request(endpoint, request, &io.cookies)?)
        .await?;
    drop(sender);

    if response.status() != StatusCode::OK {
        return Err(Error::Transport(format!(
            "HTTP status: {}",
            response.status().as_u16()
        )));
    }

    for cookie in response.headers().get_all(SET_COOKIE) {
        if let Ok(cookie) = cookie.to_str() {
            io.cookies.save(&endpoint.host, cookie);
        }
    }

    let keep_alive = !response
        .headers()
        .get(CONNECTION)
        .map_or(false, |v| v.as_bytes().eq_ignore_ascii_case(b"close"));

    let mut frames = FrameReader::new(channel);
    let mut body = response.into_body();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if channel == Channel::Bind {
            io.count_bytes(chunk.len());
        }
        if link.map_or(false, Link::is_sped_up) {
            continue;
        }
        frames.feed(&chunk, io);
    }

    match conn.await {
        Ok(Ok(parts)) => {
            let healthy = keep_alive && parts.read_buf.is_empty();
            io.ctx.pool().release(endpoint, parts.io, healthy);
        }
        Ok(Err(e)) => debug!("HTTP connection to {} ended with {}", endpoint, e),
        Err(e) => debug!("HTTP connection task to {} failed: {}", endpoint, e),
    }

    Ok(())
}

fn build_request(
    endpoint: &PoolKey,
    request: &Request,
    cookies: &CookieJar,
) -> Result<hyper::Request<Body>> {
    let body = request.http_body();

    let mut builder = hyper::Request::post(request.kind.http_path())
        .header(HOST, endpoint.authority())
        .header(USER_AGENT, USER_AGENT_VALUE)
        .header(CONTENT_TYPE, CONTENT_TYPE_VALUE)
        .header(CONTENT_LENGTH, body.len());

    if let Some(cookie) = cookies.header(&endpoint.host) {
        builder = builder.header(COOKIE, cookie);
    }

    Ok(builder.body(Body::from(body))?)
}

/// The same request as [`build_request`], serialized for a raw socket write.
pub(crate) fn encode_request(endpoint: &PoolKey, request: &Request, cookies: &CookieJar) -> String {
    let body = request.http_body();

    let mut head = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: {}\r\nContent-Type: {}\r\n",
        request.kind.http_path(),
        endpoint.authority(),
        USER_AGENT_VALUE,
        CONTENT_TYPE_VALUE,
    );
    if let Some(cookie) = cookies.header(&endpoint.host) {
        head.push_str(&format!("Cookie: {}\r\n", cookie));
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    head + &body
}
