//! The client session: configuration, the I/O driver and the public
//! operations applications call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connection::{ConnectionState, Lifecycle};
use crate::constants::{IO_WAIT, MAX_APPLICATION_ID_SIZE, MAX_RECONNECT_DELAY, MIN_RECONNECT_DELAY};
use crate::error::{Result, RpcError};
use crate::events::EventHandlers;
use crate::pipe::PlatformPipe;
use crate::rpc::RpcConnection;
use crate::serialization::{write_join_reply, write_rich_presence, Reply, RichPresence};
use crate::shared::{Shared, StatsSnapshot};
use crate::transport::Transport;

/// Only one session may exist per process.
static LIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    /// A background thread drives the connection.
    #[default]
    Managed,
    /// The application drives it with [`Session::update_connection`].
    Manual,
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub application_id: String,
    pub io_mode: IoMode,
    pub min_reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Longest sleep of the background thread between ticks.
    pub io_wait: Duration,
    /// Directory with the host's Unix sockets; `None` picks it from the
    /// environment. Ignored on Windows.
    pub ipc_dir: Option<PathBuf>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            application_id: String::new(),
            io_mode: IoMode::Managed,
            min_reconnect_delay: MIN_RECONNECT_DELAY,
            max_reconnect_delay: MAX_RECONNECT_DELAY,
            io_wait: IO_WAIT,
            ipc_dir: None,
        }
    }
}

impl RpcOptions {
    pub fn new(application_id: impl Into<String>) -> Self {
        Self {
            application_id: application_id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let len = self.application_id.len();
        if len == 0 || len >= MAX_APPLICATION_ID_SIZE {
            return Err(RpcError::InvalidApplicationId {
                len,
                max: MAX_APPLICATION_ID_SIZE - 1,
            });
        }
        if self.min_reconnect_delay > self.max_reconnect_delay {
            return Err(RpcError::InvalidBackoff);
        }
        Ok(())
    }
}

enum Driver {
    Managed(Mutex<Option<JoinHandle<Lifecycle>>>),
    Manual(Mutex<Option<Lifecycle>>),
}

pub struct Session {
    shared: Arc<Shared>,
    handlers: Mutex<Option<Arc<EventHandlers>>>,
    driver: Driver,
    running: Arc<AtomicBool>,
    released: AtomicBool,
}

impl Session {
    /// Starts a session that talks to the host over the platform pipe.
    pub fn initialize(options: RpcOptions, handlers: EventHandlers) -> Result<Self> {
        options.validate()?;
        let pipe = PlatformPipe::new(options.ipc_dir.clone());
        let transport = RpcConnection::new(pipe, &options.application_id);
        Self::with_transport(options, handlers, transport)
    }

    /// Starts a session over a caller-supplied transport.
    pub fn with_transport<T: Transport + 'static>(
        options: RpcOptions,
        handlers: EventHandlers,
        transport: T,
    ) -> Result<Self> {
        options.validate()?;
        if LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcError::AlreadyInitialized);
        }

        let shared = Arc::new(Shared::new(handlers.subscriptions(), std::process::id()));
        let lifecycle = Lifecycle::new(
            Box::new(transport),
            Backoff::new(options.min_reconnect_delay, options.max_reconnect_delay),
        );
        let running = Arc::new(AtomicBool::new(true));

        let driver = match options.io_mode {
            IoMode::Manual => Driver::Manual(Mutex::new(Some(lifecycle))),
            IoMode::Managed => {
                let join_shared = shared.clone();
                let join_running = running.clone();
                let io_wait = options.io_wait;
                let spawned = thread::Builder::new()
                    .name("discord-rpc-io".into())
                    .spawn(move || io_worker(lifecycle, join_shared, join_running, io_wait));
                match spawned {
                    Ok(join) => Driver::Managed(Mutex::new(Some(join))),
                    Err(err) => {
                        warn!(%err, "cannot start the i/o thread");
                        LIVE.store(false, Ordering::Release);
                        return Err(RpcError::io(&err, "spawning the i/o thread"));
                    }
                }
            }
        };

        info!(
            application_id = %options.application_id,
            mode = ?options.io_mode,
            handlers = ?handlers,
            "session initialized"
        );
        Ok(Self {
            shared,
            handlers: Mutex::new(Some(Arc::new(handlers))),
            driver,
            running,
            released: AtomicBool::new(false),
        })
    }

    /// Queues a SET_ACTIVITY with `presence`. `false` when it was dropped.
    pub fn update_presence(&self, presence: &RichPresence) -> bool {
        self.queue_presence(Some(presence))
    }

    /// Queues a SET_ACTIVITY that clears the presence.
    pub fn clear_presence(&self) -> bool {
        self.queue_presence(None)
    }

    fn queue_presence(&self, presence: Option<&RichPresence>) -> bool {
        if !self.is_running() {
            return false;
        }
        let pid = self.shared.pid;
        self.shared
            .enqueue(|buf, nonce| write_rich_presence(buf, nonce, pid, presence))
            .is_ok()
    }

    /// Answers a join request. Only sent while connected; `Ignore` sends
    /// nothing.
    pub fn respond(&self, user_id: &str, reply: Reply) -> bool {
        if !self.is_running() || reply == Reply::Ignore {
            return false;
        }
        if !self.shared.is_connected() {
            debug!(user_id, ?reply, "join reply dropped: {}", RpcError::NotConnected);
            return false;
        }
        self.shared
            .enqueue(|buf, nonce| write_join_reply(buf, nonce, user_id, reply))
            .is_ok()
    }

    /// Invokes the handler of every pending event on the calling thread.
    /// Returns how many handlers ran.
    ///
    /// A handler may call [`Session::shutdown`] and the rest of the pass is
    /// skipped. From another thread, shutdown must not race a pass in
    /// progress: the handler already being started still runs.
    pub fn run_callbacks(&self) -> usize {
        let handlers = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handlers) = handlers else {
            return 0;
        };
        self.shared.mailboxes.dispatch(&handlers, || self.is_running())
    }

    /// One I/O tick in manual mode; in managed mode the background thread
    /// owns the connection and this does nothing.
    pub fn update_connection(&self) {
        match &self.driver {
            Driver::Manual(lifecycle) => {
                let mut lifecycle = lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(lifecycle) = lifecycle.as_mut() {
                    lifecycle.tick(&self.shared);
                }
            }
            Driver::Managed(_) => debug!("update_connection ignored in managed mode"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Lifecycle state as published by the driver's last tick, in either
    /// mode. `Disconnected` means a connection attempt is due.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state_at(Instant::now())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Stops the driver, releases the transport and forgets the handlers.
    /// Safe to call more than once; later calls do nothing.
    pub fn shutdown(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.running.store(false, Ordering::Release);
        self.shared.notify_io();

        let lifecycle = match &self.driver {
            Driver::Managed(join) => {
                let handle = join.lock().unwrap_or_else(PoisonError::into_inner).take();
                handle.and_then(|h| match h.join() {
                    Ok(lifecycle) => Some(lifecycle),
                    Err(_) => {
                        warn!("i/o thread panicked");
                        None
                    }
                })
            }
            Driver::Manual(lifecycle) => lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        };
        if let Some(lifecycle) = lifecycle {
            lifecycle.shutdown();
        }

        *self.handlers.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.mailboxes.clear();
        self.shared.set_connected(false);
        LIVE.store(false, Ordering::Release);
        info!(stats = ?self.stats(), "session shut down");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn io_worker(
    mut lifecycle: Lifecycle,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    io_wait: Duration,
) -> Lifecycle {
    debug!("i/o thread started");
    while running.load(Ordering::Acquire) {
        lifecycle.tick(&shared);
        shared.wait_io(io_wait);
    }
    debug!("i/o thread stopped");
    lifecycle
}

/// Sessions are process-wide; tests that create one take this lock.
#[cfg(test)]
pub(crate) static SESSION_LOCK: Mutex<()> = Mutex::new(());
