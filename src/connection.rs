use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::client::ClientContext;
use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::message::{Event, Request};
use crate::protocol::{decode, LineAssembler};

pub mod http;
pub mod raw;
pub mod ws;

/// A bound stream connection, as seen by its session.
///
/// Sends only enqueue: each transport has a single writer task that issues
/// requests in submission order and reports failures back as [`Signal::Failed`].
pub trait Connection: Send + Sync + fmt::Debug {
    fn send_message(&self, request: Request) -> Result<()>;

    fn send_control(&self, request: Request) -> Result<()>;

    fn close(&self);

    /// Stops decoding the stream for good; afterwards bytes are only counted
    /// and every send fails with [`Error::SpedUp`].
    fn speed_up(&self);
}

/// Which request a frame was read in response to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Create,
    Bind,
    Control,
}

/// Notifications from transport tasks to the owning session.
#[derive(Debug)]
pub enum Signal {
    Frame(Channel, Event),
    /// Bind written in ignore-data mode; no acknowledgement will be decoded.
    Bound,
    /// Subscription written in ignore-data mode; no SUBOK will be decoded.
    Subscribed,
    /// The server ended the stream of this channel.
    Closed(Channel),
    Failed(Error),
}

/// What transport tasks need from the session they work for.
#[derive(Clone)]
pub struct SessionIo {
    pub ctx: Arc<ClientContext>,
    pub cookies: Arc<CookieJar>,
    signals: UnboundedSender<Signal>,
}

impl SessionIo {
    pub fn new(
        ctx: Arc<ClientContext>,
        cookies: Arc<CookieJar>,
        signals: UnboundedSender<Signal>,
    ) -> Self {
        Self {
            ctx,
            cookies,
            signals,
        }
    }

    pub fn signal(&self, signal: Signal) {
        // The session is gone; nobody is interested any more.
        let _ = self.signals.send(signal);
    }

    pub fn ignore_data(&self) -> bool {
        self.ctx.options().ignore_data
    }

    pub fn count_bytes(&self, n: usize) {
        self.ctx.stats().bytes_read.inc_by(n as u64);
    }
}

/// State shared between a connection handle and its tasks.
#[derive(Debug, Default)]
pub(crate) struct Link {
    sped_up: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, task: JoinHandle<()>) {
        if self.is_closed() {
            task.abort();
        } else {
            self.tasks.lock().push(task);
        }
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.sped_up.load(Ordering::Acquire) {
            Err(Error::SpedUp)
        } else if self.is_closed() {
            Err(Error::Disconnected)
        } else {
            Ok(())
        }
    }

    pub fn is_sped_up(&self) -> bool {
        self.sped_up.load(Ordering::Acquire)
    }

    pub fn speed_up(&self) {
        self.sped_up.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Frame assembly and decoding for one inbound stream.
pub(crate) struct FrameReader {
    channel: Channel,
    assembler: LineAssembler,
}

impl FrameReader {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            assembler: LineAssembler::new(),
        }
    }

    pub fn feed(&mut self, chunk: &[u8], io: &SessionIo) {
        for frame in self.assembler.push(chunk) {
            debug!("Receiving {:?}: {}", self.channel, String::from_utf8_lossy(&frame));

            if let Some(event) = decode(&frame) {
                io.signal(Signal::Frame(self.channel, event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientContext, ClientOptions};
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_frame_reader_signals_known_frames_in_order() {
        let ctx = ClientContext::new(ClientOptions::default()).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let io = SessionIo::new(ctx, Arc::new(CookieJar::new()), tx);

        let mut reader = FrameReader::new(Channel::Bind);
        reader.feed(b"CONOK,S1,50000,5000,*\r\nPROBE\r\nSUBOK,1,", &io);
        reader.feed(b"1,2\r\n", &io);

        assert!(matches!(
            rx.recv().await,
            Some(Signal::Frame(Channel::Bind, Event::SessionOk { .. }))
        ));
        assert!(matches!(
            rx.recv().await,
            Some(Signal::Frame(Channel::Bind, Event::SubscribeOk { .. }))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_link_aborts_tasks_and_refuses_sends() {
        let link = Link::new();
        let task = tokio::spawn(futures::future::pending::<()>());
        link.attach(task);

        assert!(link.check_writable().is_ok());
        link.close();
        assert!(matches!(link.check_writable(), Err(Error::Disconnected)));

        let late = tokio::spawn(futures::future::pending::<()>());
        link.attach(late);
        assert!(link.tasks.lock().is_empty());
    }

    #[test]
    fn test_speed_up_is_sticky() {
        let link = Link::new();
        link.speed_up();

        assert!(link.is_sped_up());
        assert!(matches!(link.check_writable(), Err(Error::SpedUp)));
    }
}
