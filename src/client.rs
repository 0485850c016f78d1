use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::Uri;
use log::info;

use crate::error::{Error, Result};
use crate::metrics::Stats;
use crate::pool::{ConnectionPool, PoolKey, SocketFactory, TcpSocketFactory};
use crate::rotator::{ModularCounter, PortRotator};
use crate::session::{Listeners, ServerErrorHandler, Session, SessionParams, Status, StatusHandler};

/// Subscription ids are unique across every session of the process.
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) fn next_sub_id() -> u64 {
    NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed) + 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    HttpStreaming,
    WsStreaming,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::HttpStreaming => f.write_str("HTTP-STREAMING"),
            Transport::WsStreaming => f.write_str("WS-STREAMING"),
        }
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HTTP-STREAMING" | "HTTP" => Ok(Transport::HttpStreaming),
            "WS-STREAMING" | "WS" => Ok(Transport::WsStreaming),
            other => Err(Error::Config(format!("unknown transport {:?}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Never decode the bind stream, only count its bytes.
    pub ignore_data: bool,
    /// Hand out the most recently released pooled socket first.
    pub lifo: bool,
    pub n_ports: usize,
    pub n_instances: usize,
    /// Bind WebSocket sessions with the hand-written frame writer.
    pub raw_socket: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            ignore_data: false,
            lifo: true,
            n_ports: 1,
            n_instances: 1,
            raw_socket: false,
        }
    }
}

/// Resources shared by all sessions: socket pool, rotators, statistics and
/// the request id counter. Created once and passed to every [`Client`].
#[derive(Debug)]
pub struct ClientContext {
    options: ClientOptions,
    pool: ConnectionPool,
    ports: PortRotator,
    instances: ModularCounter,
    stats: Arc<Stats>,
    next_req_id: AtomicU64,
}

impl ClientContext {
    pub fn new(options: ClientOptions) -> Result<Arc<Self>> {
        Self::with_socket_factory(options, Arc::new(TcpSocketFactory::new()))
    }

    pub fn with_socket_factory(
        options: ClientOptions,
        factory: Arc<dyn SocketFactory>,
    ) -> Result<Arc<Self>> {
        info!(
            "Client context: ignore_data={} lifo={} ports={} instances={} raw_socket={}",
            options.ignore_data,
            options.lifo,
            options.n_ports,
            options.n_instances,
            options.raw_socket
        );

        Ok(Arc::new(Self {
            pool: ConnectionPool::new(factory, options.lifo),
            ports: PortRotator::new(options.n_ports),
            instances: ModularCounter::new(options.n_instances),
            stats: Arc::new(Stats::new()?),
            next_req_id: AtomicU64::new(0),
            options,
        }))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn ports(&self) -> &PortRotator {
        &self.ports
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub(crate) fn next_instance(&self) -> usize {
        self.instances.next()
    }

    pub(crate) fn next_req_id(&self) -> u64 {
        self.next_req_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Connection settings and listeners for one logical session.
///
/// ```no_run
/// # async fn run(ctx: std::sync::Arc<streamload::client::ClientContext>) -> streamload::error::Result<()> {
/// use streamload::client::{Client, Transport};
/// use streamload::subscription::Subscription;
///
/// let session = Client::new(ctx, "http://localhost:8080", "DEMO")
///     .with_transport(Transport::WsStreaming)
///     .on_status_change(|status| println!("{}", status))
///     .connect()?;
///
/// session
///     .subscribe(Subscription::new("MERGE").with_items(["i1"]).with_fields(["f1"]))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    ctx: Arc<ClientContext>,
    server_url: String,
    adapter_set: String,
    user: Option<String>,
    password: Option<String>,
    transport: Transport,
    on_status_change: Option<StatusHandler>,
    on_server_error: Option<ServerErrorHandler>,
}

impl Client {
    pub fn new(
        ctx: Arc<ClientContext>,
        server_url: impl Into<String>,
        adapter_set: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            server_url: server_url.into(),
            adapter_set: adapter_set.into(),
            user: None,
            password: None,
            transport: Transport::WsStreaming,
            on_status_change: None,
            on_server_error: None,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn on_status_change<F>(mut self, handler: F) -> Self
    where
        F: Fn(Status) + Send + Sync + 'static,
    {
        self.on_status_change = Some(Box::new(handler));
        self
    }

    pub fn on_server_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(i32, &str) + Send + Sync + 'static,
    {
        self.on_server_error = Some(Box::new(handler));
        self
    }

    /// Starts the session: the create request is issued right away and the
    /// returned handle accepts operations immediately, queueing them until bound.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(self) -> Result<Session> {
        let server = parse_server_url(&self.server_url, self.ctx.next_instance())?;

        let params = SessionParams {
            server,
            adapter_set: self.adapter_set,
            user: self.user,
            password: self.password,
            transport: self.transport,
        };

        let listeners = Listeners {
            on_status_change: self.on_status_change,
            on_server_error: self.on_server_error,
        };

        Ok(Session::start(self.ctx, params, listeners))
    }
}

fn parse_server_url(url: &str, instance: usize) -> Result<PoolKey> {
    let uri: Uri = url
        .parse()
        .map_err(|e| Error::Config(format!("invalid server url {:?}: {}", url, e)))?;

    let tls = match uri.scheme_str() {
        Some("http") | Some("ws") => false,
        Some("https") | Some("wss") => true,
        _ => return Err(Error::Config(format!("unsupported scheme in {:?}", url))),
    };

    let host = uri
        .host()
        .ok_or_else(|| Error::Config(format!("missing host in {:?}", url)))?;
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    Ok(PoolKey::new(host, port, tls, instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_server_url() {
        assert_eq!(
            parse_server_url("http://push.example.com:8080", 2).unwrap(),
            PoolKey::new("push.example.com", 8080, false, 2)
        );
        assert_eq!(
            parse_server_url("https://push.example.com", 0).unwrap(),
            PoolKey::new("push.example.com", 443, true, 0)
        );
        assert!(matches!(
            parse_server_url("ftp://x", 0),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            parse_server_url("not a url", 0),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_transport_names() {
        assert_eq!(
            "HTTP-STREAMING".parse::<Transport>().unwrap(),
            Transport::HttpStreaming
        );
        assert_eq!(Transport::WsStreaming.to_string(), "WS-STREAMING");
        assert!("POLLING".parse::<Transport>().is_err());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ctx = ClientContext::new(ClientOptions::default()).unwrap();

        assert_eq!(ctx.next_req_id(), 1);
        assert_eq!(ctx.next_req_id(), 2);

        let a = next_sub_id();
        let b = next_sub_id();
        assert!(b > a);
    }

    #[test]
    fn test_instances_rotate() {
        let ctx = ClientContext::new(ClientOptions {
            n_instances: 2,
            ..Default::default()
        })
        .unwrap();

        let seen: Vec<usize> = (0..4).map(|_| ctx.next_instance()).collect();
        assert_eq!(seen, vec![0, 1, 0, 1]);
    }
}
