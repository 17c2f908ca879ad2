//! Inbound event classification and polled dispatch to user handlers.
//!
//! The I/O side classifies frames into per-kind [`Mailbox`]es; the
//! application drains them with [`Mailboxes::dispatch`] on its own thread.

use tracing::{debug, trace};

use crate::constants::{
    EVENT_ERROR, EVENT_JOIN_GAME, EVENT_PRESENCE_REQUESTED, EVENT_SPECTATE_GAME, MAX_TEXT_SIZE,
};
use crate::mailbox::{BoundedStr, Mailbox};
use crate::serialization::InboundMessage;

pub type Text = BoundedStr<MAX_TEXT_SIZE>;

/// Code and message attached to an error response or a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: i32,
    pub message: Text,
}

impl ErrorInfo {
    pub fn new(code: i32, message: &str) -> Self {
        Self {
            code,
            message: Text::new(message),
        }
    }
}

/// Optional callbacks, one per event kind. Invoked only from
/// [`crate::Session::run_callbacks`], on the thread that calls it.
#[derive(Default)]
pub struct EventHandlers {
    pub ready: Option<Box<dyn Fn() + Send + Sync>>,
    pub disconnected: Option<Box<dyn Fn(i32, &str) + Send + Sync>>,
    pub errored: Option<Box<dyn Fn(i32, &str) + Send + Sync>>,
    pub presence_requested: Option<Box<dyn Fn() + Send + Sync>>,
    pub join_game: Option<Box<dyn Fn(&str) + Send + Sync>>,
    pub spectate_game: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl EventHandlers {
    /// Host events worth subscribing to, given which handlers exist.
    pub fn subscriptions(&self) -> Subscriptions {
        Subscriptions {
            presence_requested: self.presence_requested.is_some(),
            join_game: self.join_game.is_some(),
            spectate_game: self.spectate_game.is_some(),
        }
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("ready", &self.ready.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("errored", &self.errored.is_some())
            .field("presence_requested", &self.presence_requested.is_some())
            .field("join_game", &self.join_game.is_some())
            .field("spectate_game", &self.spectate_game.is_some())
            .finish()
    }
}

/// Snapshot of registered handler kinds, taken at initialization so the
/// I/O side never touches the handler table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub presence_requested: bool,
    pub join_game: bool,
    pub spectate_game: bool,
}

impl Subscriptions {
    pub fn events(&self) -> impl Iterator<Item = &'static str> {
        [
            (self.presence_requested, EVENT_PRESENCE_REQUESTED),
            (self.join_game, EVENT_JOIN_GAME),
            (self.spectate_game, EVENT_SPECTATE_GAME),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
    }
}

/// Which mailbox a frame landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Error,
    PresenceRequested,
    JoinGame,
    SpectateGame,
    /// Response to one of our requests with nothing to report.
    Response,
    Ignored,
}

#[derive(Default)]
pub struct Mailboxes {
    pub error: Mailbox<ErrorInfo>,
    pub disconnected: Mailbox<ErrorInfo>,
    pub connected: Mailbox<()>,
    pub presence_requested: Mailbox<()>,
    pub join_game: Mailbox<Text>,
    pub spectate_game: Mailbox<Text>,
}

impl Mailboxes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&self, message: &InboundMessage) -> Classified {
        let evt = message.evt.as_deref();

        if message.nonce.is_some() {
            // responses carry our nonce; only errors are acted upon
            if evt == Some(EVENT_ERROR) {
                let info = ErrorInfo::new(
                    message.data_i32("code").unwrap_or(0),
                    message.data_str("message").unwrap_or(""),
                );
                debug!(code = info.code, message = %info.message, "error response");
                self.error.post(info);
                return Classified::Error;
            }
            return Classified::Response;
        }

        let Some(evt) = evt else {
            trace!("dropping message without nonce or event");
            return Classified::Ignored;
        };

        match evt {
            EVENT_PRESENCE_REQUESTED => {
                self.presence_requested.post(());
                Classified::PresenceRequested
            }
            EVENT_JOIN_GAME => {
                self.join_game
                    .post(Text::new(message.data_str("secret").unwrap_or("")));
                Classified::JoinGame
            }
            EVENT_SPECTATE_GAME => {
                self.spectate_game
                    .post(Text::new(message.data_str("secret").unwrap_or("")));
                Classified::SpectateGame
            }
            other => {
                trace!(event = other, "ignoring unknown event");
                Classified::Ignored
            }
        }
    }

    /// Drains every set mailbox, in priority order, into `handlers`.
    ///
    /// Must not run concurrently with itself. Never blocks, never does I/O.
    /// `keep_going` is checked before each invocation so a handler that shuts
    /// the session down stops the rest of the pass. Returns how many handlers
    /// were invoked.
    pub fn dispatch(&self, handlers: &EventHandlers, keep_going: impl Fn() -> bool) -> usize {
        let mut invoked = 0;
        let mut fire = |f: &dyn Fn()| {
            if keep_going() {
                f();
                invoked += 1;
            }
        };

        if let Some(info) = self.error.take() {
            if let Some(cb) = &handlers.errored {
                fire(&|| cb(info.code, info.message.as_str()));
            }
        }
        if let Some(info) = self.disconnected.take() {
            if let Some(cb) = &handlers.disconnected {
                fire(&|| cb(info.code, info.message.as_str()));
            }
        }
        if self.connected.take().is_some() {
            if let Some(cb) = &handlers.ready {
                fire(&|| cb());
            }
        }
        if self.presence_requested.take().is_some() {
            if let Some(cb) = &handlers.presence_requested {
                fire(&|| cb());
            }
        }
        if let Some(secret) = self.join_game.take() {
            if let Some(cb) = &handlers.join_game {
                fire(&|| cb(secret.as_str()));
            }
        }
        if let Some(secret) = self.spectate_game.take() {
            if let Some(cb) = &handlers.spectate_game {
                fire(&|| cb(secret.as_str()));
            }
        }

        invoked
    }

    /// Drops all undelivered events.
    pub fn clear(&self) {
        self.error.take();
        self.disconnected.take();
        self.connected.take();
        self.presence_requested.take();
        self.join_game.take();
        self.spectate_game.take();
    }
}
