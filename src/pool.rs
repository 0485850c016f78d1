//! Keyed pool of client sockets.
//!
//! One idle queue is kept per [`PoolKey`]. A socket handed out by
//! [`ConnectionPool::acquire`] is owned by the caller until it gives it back
//! with [`ConnectionPool::release`]; streaming connections simply never do.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::FutureExt;
use log::debug;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, OwnedTrustAnchor, RootCertStore, ServerName};
use tokio_rustls::{client::TlsStream, TlsConnector};

/// Destination of a pooled socket. Sessions sharing a key share sockets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Shard index spreading sessions over separate pools for the same address.
    pub instance: usize,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, tls: bool, instance: usize) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
            instance,
        }
    }

    /// `host:port`, as sent in the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(
            f,
            "{}://{}:{}#{}",
            scheme, self.host, self.port, self.instance
        )
    }
}

#[derive(Debug)]
pub enum Socket {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Socket {
    fn tcp(&self) -> &TcpStream {
        match self {
            Socket::Plain(tcp) => tcp,
            Socket::Tls(tls) => tls.get_ref().0,
        }
    }

    /// True when the peer has neither closed the socket nor sent unsolicited data.
    pub fn is_reusable(&self) -> bool {
        let mut byte = [0u8; 1];
        // Pending means no EOF, no error and nothing buffered.
        self.tcp().peek(&mut byte).now_or_never().is_none()
    }
}

impl AsyncRead for Socket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Socket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_flush(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Socket::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Socket::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Opens new sockets for the pool.
#[async_trait]
pub trait SocketFactory: Send + Sync + fmt::Debug {
    async fn open(&self, key: &PoolKey) -> io::Result<Socket>;
}

/// TCP connect followed by a rustls handshake when the key asks for TLS.
#[derive(Clone)]
pub struct TcpSocketFactory {
    tls: TlsConnector,
}

impl TcpSocketFactory {
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));

        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self::with_tls_config(config)
    }

    pub fn with_tls_config(config: rustls::ClientConfig) -> Self {
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TcpSocketFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TcpSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TcpSocketFactory")
    }
}

#[async_trait]
impl SocketFactory for TcpSocketFactory {
    async fn open(&self, key: &PoolKey) -> io::Result<Socket> {
        let tcp = TcpStream::connect((key.host.as_str(), key.port)).await?;
        tcp.set_nodelay(true)?;

        if !key.tls {
            return Ok(Socket::Plain(tcp));
        }

        let server_name = ServerName::try_from(key.host.as_str())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tls = self.tls.connect(server_name, tcp).await?;

        Ok(Socket::Tls(Box::new(tls)))
    }
}

pub struct ConnectionPool {
    factory: Arc<dyn SocketFactory>,
    idle: Mutex<HashMap<PoolKey, VecDeque<Socket>>>,
    /// Reuse the most recently released socket first.
    lifo: bool,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn SocketFactory>, lifo: bool) -> Self {
        Self {
            factory,
            idle: Mutex::new(HashMap::new()),
            lifo,
        }
    }

    /// Hands out a live idle socket for `key`, or opens a new one.
    pub async fn acquire(&self, key: &PoolKey) -> io::Result<Socket> {
        while let Some(socket) = self.take_idle(key) {
            if socket.is_reusable() {
                debug!("Reusing pooled socket for {}", key);
                return Ok(socket);
            }
            debug!("Discarding stale pooled socket for {}", key);
        }

        debug!("Opening socket for {}", key);
        self.factory.open(key).await
    }

    /// Returns a socket after a completed exchange. Unhealthy sockets are dropped.
    pub fn release(&self, key: &PoolKey, socket: Socket, healthy: bool) {
        if !healthy {
            debug!("Closing unhealthy socket for {}", key);
            return;
        }

        self.idle
            .lock()
            .entry(key.clone())
            .or_default()
            .push_back(socket);
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.idle.lock().get(key).map_or(0, VecDeque::len)
    }

    fn take_idle(&self, key: &PoolKey) -> Option<Socket> {
        let mut idle = self.idle.lock();
        let queue = idle.get_mut(key)?;

        if self.lifo {
            queue.pop_back()
        } else {
            queue.pop_front()
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("factory", &self.factory)
            .field("lifo", &self.lifo)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[derive(Debug, Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl SocketFactory for CountingFactory {
        async fn open(&self, key: &PoolKey) -> io::Result<Socket> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            TcpSocketFactory::new().open(key).await
        }
    }

    /// Accepts connections and keeps them open, or closes them right away.
    async fn listener(close_immediately: bool) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut stream, _)) = listener.accept().await {
                if close_immediately {
                    let _ = stream.shutdown().await;
                } else {
                    held.push(stream);
                }
            }
        });

        addr
    }

    fn key_for(addr: SocketAddr) -> PoolKey {
        PoolKey::new("127.0.0.1", addr.port(), false, 0)
    }

    #[tokio::test]
    async fn test_released_socket_is_reused() {
        let key = key_for(listener(false).await);
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory.clone(), true);

        let socket = pool.acquire(&key).await.unwrap();
        pool.release(&key, socket, true);
        assert_eq!(pool.idle_count(&key), 1);

        let _socket = pool.acquire(&key).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(&key), 0);
    }

    #[tokio::test]
    async fn test_unhealthy_release_discards() {
        let key = key_for(listener(false).await);
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory.clone(), true);

        let socket = pool.acquire(&key).await.unwrap();
        pool.release(&key, socket, false);
        assert_eq!(pool.idle_count(&key), 0);

        let _socket = pool.acquire(&key).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_closed_socket_is_not_reused() {
        let key = key_for(listener(true).await);
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory.clone(), false);

        let socket = pool.acquire(&key).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!socket.is_reusable());

        pool.release(&key, socket, true);
        let _socket = pool.acquire(&key).await.unwrap();
        assert_eq!(factory.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_keys_are_separate_pools() {
        let addr = listener(false).await;
        let pool = ConnectionPool::new(Arc::new(TcpSocketFactory::new()), true);

        let shard0 = key_for(addr);
        let shard1 = PoolKey::new("127.0.0.1", addr.port(), false, 1);

        let socket = pool.acquire(&shard0).await.unwrap();
        pool.release(&shard0, socket, true);

        assert_eq!(pool.idle_count(&shard0), 1);
        assert_eq!(pool.idle_count(&shard1), 0);
    }
}
