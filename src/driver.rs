//! Load driver: opens the configured number of sessions, subscribes each one to
//! its share of items and keeps them streaming for the test duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;

use crate::client::{Client, ClientContext, Transport};
use crate::config::ClientConfig;
use crate::error::Result;
use crate::metrics::{Stats, StatsSnapshot};
use crate::session::{Session, Status};
use crate::subscription::Subscription;

pub const ITEM_PREFIX: &str = "i";
pub const FIELD_PREFIX: &str = "f";

const LOG_STEP: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct Batch {
    new_sessions: u64,
    terminated_sessions: u64,
    total_sessions: u64,
    new_subscriptions: u64,
    total_subscriptions: u64,
    failed_sessions: u64,
    total_failed_sessions: u64,
    failed_subscriptions: u64,
    total_failed_subscriptions: u64,
}

/// Collects session outcomes and logs them, together with the client
/// statistics, once per [`LOG_STEP`].
#[derive(Debug)]
pub struct BatchLogger {
    items_per_session: u64,
    batch: Mutex<Batch>,
}

impl BatchLogger {
    pub fn new(items_per_session: u32) -> Self {
        Self {
            items_per_session: items_per_session as u64,
            batch: Mutex::new(Batch::default()),
        }
    }

    pub fn on_new_session(&self) {
        self.batch.lock().new_sessions += 1;
    }

    pub fn on_terminated_session(&self) {
        self.batch.lock().terminated_sessions += 1;
    }

    pub fn on_subscription(&self) {
        self.batch.lock().new_subscriptions += 1;
    }

    pub fn on_failed_session(&self) {
        self.batch.lock().failed_sessions += 1;
    }

    pub fn on_failed_subscription(&self) {
        self.batch.lock().failed_subscriptions += 1;
    }

    pub fn flush(&self, stats: &Stats) {
        {
            let mut b = self.batch.lock();
            let items = self.items_per_session;

            if b.new_sessions > 0 || b.terminated_sessions > 0 {
                let opened = b.total_sessions + b.new_sessions;
                b.total_sessions = opened.saturating_sub(b.terminated_sessions);
                info!(
                    "New sessions created: {}; terminated: {} (total sessions: {})",
                    b.new_sessions, b.terminated_sessions, b.total_sessions
                );
                b.new_sessions = 0;
                b.terminated_sessions = 0;
            }

            if b.new_subscriptions > 0 {
                b.total_subscriptions += b.new_subscriptions;
                info!(
                    "New subscriptions: {} (total subscriptions: {}) - new items: {} (total items: {})",
                    b.new_subscriptions,
                    b.total_subscriptions,
                    b.new_subscriptions * items,
                    b.total_subscriptions * items
                );
                b.new_subscriptions = 0;
            }

            if b.failed_sessions > 0 {
                b.total_failed_sessions += b.failed_sessions;
                error!(
                    "New failed sessions: {} (total failed sessions: {})",
                    b.failed_sessions, b.total_failed_sessions
                );
                b.failed_sessions = 0;
            }

            if b.failed_subscriptions > 0 {
                b.total_failed_subscriptions += b.failed_subscriptions;
                error!(
                    "New failed subscriptions: {} (total failed subscriptions: {})",
                    b.failed_subscriptions, b.total_failed_subscriptions
                );
                b.failed_subscriptions = 0;
            }
        }

        log_stats(&stats.snapshot());
    }
}

fn ratio(done: u64, pending: u64) -> f64 {
    if pending == 0 {
        0.0
    } else {
        done as f64 / pending as f64
    }
}

fn log_stats(s: &StatsSnapshot) {
    info!(
        ">>> createPending: {} createDone: {} % {:.2} maxDelay: {}",
        s.create_pending,
        s.create_done,
        ratio(s.create_done, s.create_pending),
        s.max_create_delay_ms
    );
    info!(
        "    bindPending: {} bindDone: {} % {:.2} maxDelay: {}",
        s.bind_pending,
        s.bind_done,
        ratio(s.bind_done, s.create_pending),
        s.max_bind_delay_ms
    );
    info!(
        "    subPending: {} subDone: {} % {:.2} maxDelay: {}",
        s.sub_pending,
        s.sub_done,
        ratio(s.sub_done, s.create_pending),
        s.max_sub_delay_ms
    );
    info!(
        "    connErrors: {} socketErrors: {}",
        s.conn_errors, s.socket_errors
    );
    info!("    bytes received: {}", s.bytes_read);
}

pub struct Driver {
    config: ClientConfig,
    ctx: Arc<ClientContext>,
    transport: Transport,
    schema: Vec<String>,
    batch: Arc<BatchLogger>,
}

impl Driver {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let ctx = ClientContext::new(config.client_options())?;
        Self::with_context(config, ctx)
    }

    pub fn with_context(config: ClientConfig, ctx: Arc<ClientContext>) -> Result<Self> {
        let transport = config.transport()?;
        let schema = (1..=config.number_of_fields)
            .map(|n| format!("{}{}", FIELD_PREFIX, n))
            .collect();
        let batch = Arc::new(BatchLogger::new(config.items_per_session));

        Ok(Self {
            config,
            ctx,
            transport,
            schema,
            batch,
        })
    }

    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    /// Runs the whole test and returns the final statistics.
    pub async fn run(self) -> Result<StatsSnapshot> {
        let stats = self.ctx.stats().clone();
        info!(
            "Starting {} sessions against {} via {}",
            self.config.number_of_sessions,
            self.config.server_url(),
            self.transport
        );

        let reporter = {
            let batch = self.batch.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(LOG_STEP);
                loop {
                    interval.tick().await;
                    batch.flush(&stats);
                }
            })
        };

        let delay = Duration::from_millis(self.config.delay_session_start_millis);
        let mut sessions = Vec::with_capacity(self.config.number_of_sessions as usize);

        for id in 1..=self.config.number_of_sessions {
            if let Some(running) = self.start_session(id) {
                sessions.push(running);
            }
            tokio::time::sleep(delay).await;
        }

        tokio::time::sleep(Duration::from_secs(self.config.session_duration_seconds)).await;

        for (session, task) in &sessions {
            task.abort();
            if let Err(e) = session.disconnect().await {
                debug!("Disconnect failed: {}", e);
            }
        }

        reporter.abort();
        self.batch.flush(&stats);
        info!("All sessions terminated. Exiting...");

        Ok(stats.snapshot())
    }

    fn start_session(&self, id: u32) -> Option<(Session, JoinHandle<()>)> {
        let streaming = Arc::new(AtomicBool::new(false));
        let batch = self.batch.clone();
        let batch_errors = self.batch.clone();

        debug!("Creating session {}...", id);
        let url = self.config.server_url();
        let session = Client::new(self.ctx.clone(), url, &self.config.adapter_set_name)
            .with_transport(self.transport)
            .on_status_change(move |status| match status {
                Status::HttpStreaming | Status::WsStreaming => {
                    streaming.store(true, Ordering::Relaxed);
                    batch.on_new_session();
                    debug!("Session {} created", id);
                }
                Status::Disconnected if streaming.swap(false, Ordering::Relaxed) => {
                    batch.on_terminated_session();
                }
                _ => {}
            })
            .on_server_error(move |code, message| {
                debug!("Session {} failed: {} {}", id, code, message);
                batch_errors.on_failed_session();
            });
        let session = match self.config.user.as_deref() {
            Some(user) => session.with_user(user),
            None => session,
        };
        let session = match self.config.password.as_deref() {
            Some(password) => session.with_password(password),
            None => session,
        };

        let session = match session.connect() {
            Ok(session) => session,
            Err(e) => {
                debug!("Session {} could not start: {}", id, e);
                self.batch.on_failed_session();
                return None;
            }
        };

        let (subscribed_tx, mut subscribed) = unbounded_channel();
        let batch = self.batch.clone();
        let batch_errors = self.batch.clone();

        let items = self.items_for(id);
        debug!(
            "Subscribing to items for session {} ({})",
            id,
            items.join(" ")
        );

        let subscription = self
            .subscription(items)
            .on_subscription(move |_, _| {
                batch.on_subscription();
                let _ = subscribed_tx.send(());
            })
            .on_subscription_error(move |code, message| {
                debug!(
                    "Subscription failed for session {}: {} {}",
                    id, code, message
                );
                batch_errors.on_failed_subscription();
            });

        let task = {
            let session = session.clone();
            let batch = self.batch.clone();
            let speed_up = self.config.speed_up_reading;

            tokio::spawn(async move {
                if let Err(e) = session.subscribe(subscription).await {
                    debug!("Subscription failed for session {}: {}", id, e);
                    batch.on_failed_subscription();
                    return;
                }

                if speed_up && subscribed.recv().await.is_some() {
                    if let Err(e) = session.speed_up().await {
                        debug!("Speed up failed for session {}: {}", id, e);
                    }
                }
            })
        };

        Some((session, task))
    }

    fn subscription(&self, items: Vec<String>) -> Subscription {
        let mut sub = Subscription::new(&self.config.subscription_mode)
            .with_items(items)
            .with_fields(self.schema.iter())
            .with_snapshot(false);

        if let Some(adapter) = &self.config.data_adapter_name {
            sub = sub.with_data_adapter(adapter);
        }

        if self.config.unfiltered_subscription {
            sub = sub.with_requested_max_frequency("unfiltered");
        } else {
            if let Some(frequency) = self.config.resampling_frequency.filter(|&f| f > 0.0) {
                sub = sub.with_requested_max_frequency(frequency.to_string());
            }
            if let Some(size) = self.config.resampling_buffer_size.filter(|&n| n > 0) {
                sub = sub.with_requested_buffer_size(size);
            }
        }

        sub
    }

    pub fn items_for(&self, id: u32) -> Vec<String> {
        let (first, last) = self.config.item_range();

        if self.config.item_random_extraction {
            random_items(first, last, self.config.items_per_session)
        } else {
            items_at_same_distance(id, first, last, self.config.items_per_session)
        }
    }
}

/// Items spread evenly over `first..=last`, starting at an offset given by the
/// session id. With 500 items and 5 per session, session 1 gets
/// `i1 i101 i201 i301 i401` and session 2 gets `i2 i102 ...`.
pub fn items_at_same_distance(id: u32, first: u32, last: u32, per_session: u32) -> Vec<String> {
    let available = last - first + 1;
    let step = available / per_session.max(1);

    let mut item = (id.saturating_sub(1) % available) + first;
    let mut items = Vec::with_capacity(per_session as usize);
    items.push(format!("{}{}", ITEM_PREFIX, item));

    for _ in 1..per_session {
        item += step;
        if item > last {
            item -= available;
        }
        items.push(format!("{}{}", ITEM_PREFIX, item));
    }

    items
}

pub fn random_items(first: u32, last: u32, per_session: u32) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..per_session)
        .map(|_| format!("{}{}", ITEM_PREFIX, rng.gen_range(first..=last)))
        .collect()
}
