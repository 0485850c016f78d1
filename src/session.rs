use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc::{channel, unbounded_channel, Receiver, Sender, UnboundedReceiver};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::client::{next_sub_id, ClientContext, Transport};
use crate::connection::{self, Channel, Connection, SessionIo, Signal};
use crate::cookies::CookieJar;
use crate::error::{Error, Result};
use crate::message::{Event, Request};
use crate::pool::PoolKey;
use crate::protocol::FieldValue;
use crate::subscription::Subscription;

pub type StatusHandler = Box<dyn Fn(Status) + Send + Sync>;
pub type ServerErrorHandler = Box<dyn Fn(i32, &str) + Send + Sync>;

/// Status reported to the status-change listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    StreamSensing,
    HttpStreaming,
    WsStreaming,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Disconnected => "DISCONNECTED",
            Status::Connecting => "CONNECTING",
            Status::StreamSensing => "CONNECTED:STREAM-SENSING",
            Status::HttpStreaming => "CONNECTED:HTTP-STREAMING",
            Status::WsStreaming => "CONNECTED:WS-STREAMING",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
    Binding,
    Bound,
}

pub(crate) struct SessionParams {
    pub server: PoolKey,
    pub adapter_set: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub transport: Transport,
}

#[derive(Default)]
pub(crate) struct Listeners {
    pub on_status_change: Option<StatusHandler>,
    pub on_server_error: Option<ServerErrorHandler>,
}

#[derive(Debug)]
enum Op {
    Bind,
    Disconnect,
    WhenBound(Deferred),
}

/// Operations that need the bound stream connection.
#[derive(Debug)]
enum Deferred {
    Subscribe(Arc<Subscription>),
    SendMessage(String),
    SpeedUp,
}

type Reply = oneshot::Sender<Result<()>>;

#[derive(Debug)]
struct Command {
    op: Op,
    result: Reply,
}

#[derive(Debug, Default)]
struct Shared {
    status: Mutex<Option<Status>>,
    id: Mutex<Option<String>>,
}

/// Handle to a running session.
///
/// Every operation is forwarded to the session task, which is the only
/// writer of the session state. Clones share the same session; when the last
/// one is dropped the session disconnects.
#[derive(Clone)]
pub struct Session {
    commands: Sender<Command>,
    shared: Arc<Shared>,
}

impl Session {
    pub(crate) fn start(
        ctx: Arc<ClientContext>,
        params: SessionParams,
        listeners: Listeners,
    ) -> Self {
        let (commands, command_rx) = channel(64);
        let (signals, signal_rx) = unbounded_channel();
        let shared = Arc::new(Shared::default());

        let io = SessionIo::new(ctx.clone(), Arc::new(CookieJar::new()), signals);
        let control = params.server.clone();

        let actor = SessionActor {
            ctx,
            params,
            listeners,
            shared: shared.clone(),
            io,
            state: State::Disconnected,
            id: String::new(),
            control,
            create_task: None,
            binding: None,
            stream: None,
            bind_requests: Vec::new(),
            pending: VecDeque::new(),
            subscription: None,
            create_start: Instant::now(),
            bind_start: Instant::now(),
            sub_start: Instant::now(),
        };
        actor.run(command_rx, signal_rx);

        Self { commands, shared }
    }

    /// Sends the subscription once the stream is bound.
    ///
    /// Only one subscription per session is supported.
    pub async fn subscribe(&self, subscription: impl Into<Arc<Subscription>>) -> Result<()> {
        self.request(Op::WhenBound(Deferred::Subscribe(subscription.into())))
            .await
    }

    pub async fn send_message(&self, message: impl Into<String>) -> Result<()> {
        self.request(Op::WhenBound(Deferred::SendMessage(message.into())))
            .await
    }

    /// Switches the bound stream to byte counting only. Irreversible.
    pub async fn speed_up(&self) -> Result<()> {
        self.request(Op::WhenBound(Deferred::SpeedUp)).await
    }

    /// Binds now instead of waiting for the server to ask for it.
    pub async fn bind(&self) -> Result<()> {
        self.request(Op::Bind).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        match self.request(Op::Disconnect).await {
            Err(Error::Disconnected) => Ok(()),
            other => other,
        }
    }

    pub fn status(&self) -> Status {
        self.shared.status.lock().unwrap_or(Status::Disconnected)
    }

    /// Server assigned id, once the session has been created.
    pub fn id(&self) -> Option<String> {
        self.shared.id.lock().clone()
    }

    async fn request(&self, op: Op) -> Result<()> {
        let (result, rx) = oneshot::channel();

        self.commands
            .send(Command { op, result })
            .await
            .map_err(|_| Error::Disconnected)?;

        rx.await.map_err(|_| Error::Disconnected)?
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}

struct ActiveSubscription {
    sub_id: String,
    req_id: String,
    subscription: Arc<Subscription>,
}

struct SessionActor {
    ctx: Arc<ClientContext>,
    params: SessionParams,
    listeners: Listeners,
    shared: Arc<Shared>,
    io: SessionIo,
    state: State,
    id: String,
    /// Bind target: the server address, or the control link it redirected us to.
    control: PoolKey,
    create_task: Option<JoinHandle<()>>,
    binding: Option<Arc<dyn Connection>>,
    stream: Option<Arc<dyn Connection>>,
    /// `bind()` calls made before the session was created.
    bind_requests: Vec<Reply>,
    pending: VecDeque<(Deferred, Reply)>,
    subscription: Option<ActiveSubscription>,
    create_start: Instant,
    bind_start: Instant,
    sub_start: Instant,
}

impl SessionActor {
    fn run(mut self, mut commands: Receiver<Command>, mut signals: UnboundedReceiver<Signal>) {
        tokio::spawn(async move {
            self.connect();

            loop {
                tokio::select! {
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            self.disconnect();
                            break;
                        }
                    },
                    Some(signal) = signals.recv() => self.handle_signal(signal),
                }
            }

            debug!("[{}] Session task finished", self.id);
        });
    }

    // Operations

    fn connect(&mut self) {
        self.state = State::Connecting;
        self.ctx.stats().create_pending.inc();
        self.create_start = Instant::now();
        self.set_status(Status::Connecting);

        let request = Request::create_session(
            &self.params.adapter_set,
            self.params.user.as_deref(),
            self.params.password.as_deref(),
        );
        debug!("Creating session on {}", self.params.server);

        self.create_task = Some(connection::http::create_session(
            self.io.clone(),
            self.params.server.clone(),
            request,
        ));
    }

    fn bind(&mut self) {
        self.state = State::Binding;
        self.ctx.stats().bind_pending.inc();
        self.bind_start = Instant::now();

        let request = Request::bind_session(&self.id);
        let io = self.io.clone();
        let target = self.control.clone();
        debug!(
            "[{}] Binding on {} via {}",
            self.id, target, self.params.transport
        );

        let conn: Arc<dyn Connection> = match self.params.transport {
            Transport::HttpStreaming => connection::http::bind(io, target, request),
            Transport::WsStreaming if self.ctx.options().raw_socket => {
                connection::raw::bind(io, target, request)
            }
            Transport::WsStreaming => connection::ws::bind(io, target, request),
        };
        self.binding = Some(conn);
    }

    fn disconnect(&mut self) {
        if self.state != State::Disconnected {
            info!("[{}] Disconnecting", self.id);
            self.state = State::Disconnected;
            self.shutdown();
            self.set_status(Status::Disconnected);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        let Command { op, result } = cmd;

        let outcome = match op {
            Op::Disconnect => {
                self.disconnect();
                Ok(())
            }
            Op::Bind => match self.state {
                State::Connected => {
                    self.bind();
                    Ok(())
                }
                State::Binding | State::Bound => Ok(()),
                State::Connecting => {
                    self.bind_requests.push(result);
                    return;
                }
                State::Disconnected => Err(Error::Disconnected),
            },
            Op::WhenBound(deferred) => match self.state {
                State::Bound => self.execute(deferred),
                State::Disconnected => Err(Error::Disconnected),
                _ => {
                    self.pending.push_back((deferred, result));
                    return;
                }
            },
        };

        let _ = result.send(outcome);
    }

    fn execute(&mut self, op: Deferred) -> Result<()> {
        let conn = match &self.stream {
            Some(conn) => conn.clone(),
            None => return Err(Error::Disconnected),
        };

        match op {
            Deferred::Subscribe(subscription) => self.subscribe(conn.as_ref(), subscription),
            Deferred::SendMessage(message) => {
                let request = Request::message(self.ctx.next_req_id(), &message, &self.id);
                debug!("[{}] Sending {}", self.id, request);
                conn.send_message(request)
            }
            Deferred::SpeedUp => {
                conn.speed_up();
                Ok(())
            }
        }
    }

    fn subscribe(&mut self, conn: &dyn Connection, subscription: Arc<Subscription>) -> Result<()> {
        if self.subscription.is_some() {
            return Err(Error::Usage("only one subscription per session is supported"));
        }

        self.ctx.stats().sub_pending.inc();
        self.sub_start = Instant::now();

        let sub_id = next_sub_id().to_string();
        let req_id = self.ctx.next_req_id();
        let request = Request::subscribe(req_id, &sub_id, &subscription, &self.id);
        debug!("[{}] Sending {}", self.id, request);

        self.subscription = Some(ActiveSubscription {
            sub_id,
            req_id: req_id.to_string(),
            subscription,
        });

        conn.send_control(request)
    }

    // Events coming from the transports

    fn handle_signal(&mut self, signal: Signal) {
        if self.state == State::Disconnected {
            debug!(
                "[{}] Ignoring {:?} on a disconnected session",
                self.id, signal
            );
            return;
        }

        match signal {
            Signal::Frame(channel, event) => self.handle_frame(channel, event),
            Signal::Bound => self.on_bound(),
            Signal::Subscribed => self.on_subscription(-1, -1),
            Signal::Closed(Channel::Create) => match self.state {
                State::Connecting => {
                    self.on_connection_error(Error::transport("create stream closed before CONOK"))
                }
                State::Connected => self.bind(),
                _ => {}
            },
            Signal::Closed(Channel::Bind) => {
                self.on_connection_error(Error::transport("stream closed by server"))
            }
            Signal::Closed(Channel::Control) => {}
            Signal::Failed(err) => self.on_connection_error(err),
        }
    }

    fn handle_frame(&mut self, channel: Channel, event: Event) {
        let unexpected = match event {
            Event::ParseError { cause, frame } => {
                let message = format!("{} (frame: {:?})", cause, frame);
                self.on_session_error(-1, &message);
                return;
            }
            Event::RequestError {
                req_id,
                code,
                message,
            } => {
                self.on_request_error(&req_id, code, &message);
                return;
            }
            event => match channel {
                Channel::Create => self.on_create_frame(event),
                Channel::Bind => self.on_bind_frame(event),
                Channel::Control => Some(event),
            },
        };

        if let Some(event) = unexpected {
            warn!(
                "[{}] {} not expected on {:?} channel",
                self.id,
                event.kind(),
                channel
            );
            self.on_session_error(-1, "Message not expected");
        }
    }

    /// Handles a frame of the create stream, handing back any out of place.
    fn on_create_frame(&mut self, event: Event) -> Option<Event> {
        match (self.state, event) {
            (
                State::Connecting,
                Event::SessionOk {
                    session_id,
                    control_link,
                    ..
                },
            ) => self.on_connected(session_id, control_link),
            (State::Connected, Event::Rebind) => self.bind(),
            // bind() got there first
            (State::Binding | State::Bound, Event::Rebind) => {
                debug!("[{}] LOOP after explicit bind ignored", self.id)
            }
            (_, Event::SessionError { code, message }) => self.on_session_error(code, &message),
            (_, event) => return Some(event),
        }
        None
    }

    fn on_bind_frame(&mut self, event: Event) -> Option<Event> {
        match event {
            Event::SessionOk { .. } if self.state == State::Binding => self.on_bound(),
            Event::SubscribeOk {
                sub_id,
                total_items,
                total_fields,
            } if self.is_current(&sub_id) => self.on_subscription(total_items, total_fields),
            Event::Update {
                sub_id,
                item,
                values,
            } if self.is_current(&sub_id) => self.on_update(item, &values),
            Event::SessionError { code, message } => self.on_session_error(code, &message),
            event => return Some(event),
        }
        None
    }

    fn on_request_error(&mut self, req_id: &str, code: i32, message: &str) {
        if let Some(active) = &self.subscription {
            if active.req_id == req_id {
                active.subscription.fire_subscription_error(code, message);
            }
        }
        self.on_session_error(code, message);
    }

    fn is_current(&self, sub_id: &str) -> bool {
        self.subscription
            .as_ref()
            .map_or(false, |active| active.sub_id == sub_id)
    }

    fn on_connected(&mut self, session_id: String, control_link: Option<String>) {
        self.state = State::Connected;
        let stats = self.ctx.stats();
        stats.create_done.inc();
        stats.notify_create_delay(self.create_start.elapsed());

        self.id = session_id;
        *self.shared.id.lock() = Some(self.id.clone());

        if let Some(link) = control_link {
            if link != self.params.server.host {
                debug!("[{}] Control link redirects to {}", self.id, link);
                self.control.host = link;
            }
        }
        self.control.port = self
            .ctx
            .ports()
            .port_for(&self.control.host, self.params.server.port);

        self.set_status(Status::StreamSensing);

        if !self.bind_requests.is_empty() {
            self.bind();
            for result in self.bind_requests.drain(..) {
                let _ = result.send(Ok(()));
            }
        }
    }

    fn on_bound(&mut self) {
        if self.state != State::Binding {
            return;
        }

        self.state = State::Bound;
        let stats = self.ctx.stats();
        stats.bind_done.inc();
        stats.notify_bind_delay(self.bind_start.elapsed());
        self.stream = self.binding.take();

        self.set_status(match self.params.transport {
            Transport::HttpStreaming => Status::HttpStreaming,
            Transport::WsStreaming => Status::WsStreaming,
        });

        while let Some((op, result)) = self.pending.pop_front() {
            let outcome = self.execute(op);
            let _ = result.send(outcome);
        }
    }

    fn on_subscription(&mut self, total_items: i32, total_fields: i32) {
        let stats = self.ctx.stats();
        stats.sub_done.inc();
        stats.notify_sub_delay(self.sub_start.elapsed());

        if let Some(active) = &self.subscription {
            let subscription = &active.subscription;
            subscription.fire_subscription(total_items, total_fields);
        }
    }

    fn on_update(&self, item: u32, values: &[FieldValue]) {
        let active = match &self.subscription {
            Some(active) => active,
            None => return,
        };

        let expected = active.subscription.fields().len();
        if values.len() != expected {
            warn!(
                "[{}] Update for item {} has {} values, schema has {} fields",
                self.id,
                item,
                values.len(),
                expected
            );
        }

        active.subscription.fire_item_update(item, values);
    }

    // Failures

    fn on_connection_error(&mut self, err: Error) {
        if self.state == State::Disconnected {
            return;
        }

        self.ctx.stats().conn_errors.inc();
        error!("[{}] {}", self.id, err);
        self.terminate(err.code(), &err.to_string());
    }

    fn on_session_error(&mut self, code: i32, message: &str) {
        if self.state == State::Disconnected {
            return;
        }

        self.ctx.stats().socket_errors.inc();
        error!("[{}] Error: {} {}", self.id, code, message);
        self.terminate(code, message);
    }

    fn terminate(&mut self, code: i32, message: &str) {
        self.state = State::Disconnected;
        self.shutdown();
        self.set_status(Status::Disconnected);

        if let Some(handler) = &self.listeners.on_server_error {
            handler(code, message);
        }
    }

    /// Closes every connection and fails whatever was waiting for the stream.
    fn shutdown(&mut self) {
        if let Some(task) = self.create_task.take() {
            task.abort();
        }
        for conn in self.binding.take().into_iter().chain(self.stream.take()) {
            conn.close();
        }
        for result in self.bind_requests.drain(..) {
            let _ = result.send(Err(Error::Disconnected));
        }
        for (_, result) in self.pending.drain(..) {
            let _ = result.send(Err(Error::Disconnected));
        }
    }

    fn set_status(&self, status: Status) {
        *self.shared.status.lock() = Some(status);

        if let Some(handler) = &self.listeners.on_status_change {
            handler(status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        let names = [
            (Status::Connecting, "CONNECTING"),
            (Status::StreamSensing, "CONNECTED:STREAM-SENSING"),
            (Status::HttpStreaming, "CONNECTED:HTTP-STREAMING"),
            (Status::WsStreaming, "CONNECTED:WS-STREAMING"),
            (Status::Disconnected, "DISCONNECTED"),
        ];

        for (status, name) in names {
            assert_eq!(status.to_string(), name);
        }
    }
}
