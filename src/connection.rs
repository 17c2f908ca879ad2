//! Connection lifecycle: reconnect scheduling, inbound read pass and the
//! outbound drain, driven one tick at a time.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::backoff::Backoff;
use crate::events::{Classified, ErrorInfo};
use crate::shared::Shared;
use crate::transport::{ConnectionListener, Silent, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and a new attempt is due.
    Disconnected,
    /// Not connected, waiting out the reconnect delay or the handshake.
    Connecting,
    Open,
}

pub struct Lifecycle {
    transport: Box<dyn Transport>,
    backoff: Backoff,
    next_connect: Instant,
}

impl Lifecycle {
    pub fn new(transport: Box<dyn Transport>, backoff: Backoff) -> Self {
        Self {
            transport,
            backoff,
            next_connect: Instant::now(),
        }
    }

    pub fn tick(&mut self, shared: &Shared) {
        self.tick_at(shared, Instant::now());
    }

    /// One pass of the I/O loop. While closed only a due connection attempt
    /// is made; once open, every buffered inbound message is classified and
    /// then the outbound queue is drained in order.
    pub fn tick_at(&mut self, shared: &Shared, now: Instant) {
        let Lifecycle {
            transport,
            backoff,
            next_connect,
        } = self;
        let mut link = Link {
            shared,
            backoff,
            next_connect,
            now,
        };

        if !transport.is_open() {
            if now >= *link.next_connect {
                link.schedule_reconnect();
                trace!("connection attempt");
                transport.open(&mut link);
            }
            return;
        }

        while let Some(message) = transport.read(&mut link) {
            shared.stats.received_messages.fetch_add(1, Ordering::Relaxed);
            if let Classified::Ignored = shared.mailboxes.classify(&message) {
                trace!(cmd = ?message.cmd, evt = ?message.evt, "message ignored");
            }
        }

        if let Some(mut consumer) = shared.queue.consumer() {
            let sent = consumer.drain(|frame| transport.write(frame, &mut link));
            if sent > 0 {
                shared
                    .stats
                    .sent_messages
                    .fetch_add(sent as u64, Ordering::Relaxed);
                trace!(sent, "queue drained");
            }
        }
    }

    /// Closes the transport without reporting anything and releases it.
    pub fn shutdown(mut self) {
        self.transport.close(&mut Silent);
        debug!("transport released");
    }
}

/// Connects transport notifications to the shared state during one tick.
struct Link<'a> {
    shared: &'a Shared,
    backoff: &'a mut Backoff,
    next_connect: &'a mut Instant,
    now: Instant,
}

impl Link<'_> {
    fn schedule_reconnect(&mut self) {
        let delay: Duration = self.backoff.next_delay();
        *self.next_connect = self.now + delay;
        self.shared.set_next_connect(*self.next_connect);
    }
}

impl ConnectionListener for Link<'_> {
    fn on_connect(&mut self) {
        self.backoff.reset();
        self.shared.set_connected(true);
        self.shared.stats.connects.fetch_add(1, Ordering::Relaxed);
        self.shared.mailboxes.connected.post(());
        for event in self.shared.subscriptions.events() {
            // отказ уже посчитан в статистике
            let _ = self.shared.enqueue_subscribe(event);
        }
        info!("session ready");
    }

    fn on_disconnect(&mut self, code: i32, message: &str) {
        self.shared.set_connected(false);
        self.shared.stats.disconnects.fetch_add(1, Ordering::Relaxed);
        self.shared
            .mailboxes
            .disconnected
            .post(ErrorInfo::new(code, message));
        self.schedule_reconnect();
        debug!(code, message, retry_in = ?self.next_connect.saturating_duration_since(self.now), "reconnect scheduled");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::{CMD_SUBSCRIBE, EVENT_JOIN_GAME, EVENT_SPECTATE_GAME};
    use crate::events::Subscriptions;
    use crate::serialization::InboundMessage;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Transport whose behaviour is scripted by the test.
    #[derive(Default)]
    pub(crate) struct Script {
        pub accept: bool,
        pub open: bool,
        pub opens: u32,
        pub inbound: VecDeque<InboundMessage>,
        pub written: Vec<Vec<u8>>,
        /// Hang up with this code and message on the next read.
        pub hangup: Option<(i32, String)>,
        pub closes: u32,
        pub drops: u32,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ScriptedTransport(pub Arc<Mutex<Script>>);

    impl ScriptedTransport {
        pub fn accepting() -> Self {
            let transport = Self::default();
            transport.0.lock().unwrap().accept = true;
            transport
        }

        pub fn push(&self, value: Value) {
            self.0.lock().unwrap().inbound.push_back(value.into());
        }

        pub fn written(&self) -> Vec<Value> {
            self.0
                .lock()
                .unwrap()
                .written
                .iter()
                .map(|frame| serde_json::from_slice(frame).unwrap())
                .collect()
        }
    }

    impl Transport for ScriptedTransport {
        fn open(&mut self, listener: &mut dyn ConnectionListener) {
            let accepted = {
                let mut script = self.0.lock().unwrap();
                script.opens += 1;
                script.open = script.accept;
                script.open
            };
            if accepted {
                listener.on_connect();
            }
        }

        fn is_open(&self) -> bool {
            self.0.lock().unwrap().open
        }

        fn read(&mut self, listener: &mut dyn ConnectionListener) -> Option<InboundMessage> {
            let mut script = self.0.lock().unwrap();
            if let Some((code, message)) = script.hangup.take() {
                script.open = false;
                drop(script);
                listener.on_disconnect(code, &message);
                return None;
            }
            script.inbound.pop_front()
        }

        fn write(&mut self, frame: &[u8], _listener: &mut dyn ConnectionListener) {
            self.0.lock().unwrap().written.push(frame.to_vec());
        }

        fn close(&mut self, _listener: &mut dyn ConnectionListener) {
            let mut script = self.0.lock().unwrap();
            script.open = false;
            script.closes += 1;
        }
    }

    impl Drop for ScriptedTransport {
        fn drop(&mut self) {
            if let Ok(mut script) = self.0.lock() {
                script.drops += 1;
            }
        }
    }

    fn lifecycle(transport: &ScriptedTransport) -> Lifecycle {
        Lifecycle::new(
            Box::new(transport.clone()),
            Backoff::new(Duration::from_millis(500), Duration::from_secs(60)),
        )
    }

    fn shared(subscriptions: Subscriptions) -> Shared {
        Shared::new(subscriptions, 42)
    }

    fn queue_text(shared: &Shared, text: &str) {
        shared
            .enqueue(|buf, _| {
                buf[..text.len()].copy_from_slice(text.as_bytes());
                Ok(text.len())
            })
            .unwrap();
    }

    #[test]
    fn first_tick_connects_immediately() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);

        life.tick(&shared);
        assert_eq!(transport.0.lock().unwrap().opens, 1);
        assert!(shared.is_connected());
        assert!(shared.mailboxes.connected.is_set());
        assert_eq!(shared.state_at(Instant::now()), ConnectionState::Open);
    }

    #[test]
    fn reconnect_waits_for_delay() {
        let transport = ScriptedTransport::default();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);

        let t0 = Instant::now();
        life.tick_at(&shared, t0);
        assert_eq!(transport.0.lock().unwrap().opens, 1);
        let due = life.next_connect;
        assert_eq!(due - t0, Duration::from_millis(500));
        assert_eq!(shared.state_at(t0), ConnectionState::Connecting);

        life.tick_at(&shared, due - Duration::from_millis(1));
        assert_eq!(transport.0.lock().unwrap().opens, 1);
        assert_eq!(shared.state_at(due), ConnectionState::Disconnected);

        life.tick_at(&shared, due);
        assert_eq!(transport.0.lock().unwrap().opens, 2);
        assert!(life.next_connect - due >= Duration::from_millis(500));
    }

    #[test]
    fn writes_leave_in_queue_order() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);
        life.tick(&shared);

        for text in ["\"a\"", "\"b\"", "\"c\""] {
            queue_text(&shared, text);
        }
        life.tick(&shared);

        assert_eq!(transport.written(), vec![json!("a"), json!("b"), json!("c")]);
        assert!(shared.queue.is_empty());
        assert_eq!(shared.stats.snapshot().sent_messages, 3);
    }

    #[test]
    fn nothing_is_sent_while_closed() {
        let transport = ScriptedTransport::default();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);

        queue_text(&shared, "\"x\"");
        life.tick(&shared);
        assert!(transport.written().is_empty());
        assert_eq!(shared.queue.pending(), 1);
    }

    #[test]
    fn connect_subscribes_to_handled_events() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions {
            presence_requested: false,
            join_game: true,
            spectate_game: true,
        });
        let mut life = lifecycle(&transport);

        life.tick(&shared);
        life.tick(&shared);

        let written = transport.written();
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|v| v["cmd"] == CMD_SUBSCRIBE));
        assert_eq!(written[0]["evt"], EVENT_JOIN_GAME);
        assert_eq!(written[1]["evt"], EVENT_SPECTATE_GAME);
    }

    #[test]
    fn inbound_messages_reach_mailboxes() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);
        life.tick(&shared);

        transport.push(json!({"cmd": "DISPATCH", "evt": "JOIN_GAME", "data": {"secret": "s1"}}));
        transport.push(json!({"cmd": "SET_ACTIVITY", "evt": "ERROR", "nonce": "3", "data": {"code": 4000, "message": "bad"}}));
        life.tick(&shared);

        assert_eq!(shared.mailboxes.join_game.take().unwrap().as_str(), "s1");
        let error = shared.mailboxes.error.take().unwrap();
        assert_eq!(error.code, 4000);
        assert_eq!(error.message.as_str(), "bad");
        assert_eq!(shared.stats.snapshot().received_messages, 2);
    }

    #[test]
    fn disconnect_advances_backoff_without_reset() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);

        let t0 = Instant::now();
        life.tick_at(&shared, t0);
        assert!(shared.is_connected());
        // первая попытка уже взяла задержку 500 мс, connect сбросил её
        transport.0.lock().unwrap().hangup = Some((1, "Pipe closed".into()));

        let t1 = t0 + Duration::from_secs(1);
        life.tick_at(&shared, t1);
        assert!(!shared.is_connected());
        let info = shared.mailboxes.disconnected.take().unwrap();
        assert_eq!(info.code, 1);
        assert_eq!(info.message.as_str(), "Pipe closed");
        let due = life.next_connect;
        assert_eq!(due - t1, Duration::from_millis(500));
        assert_eq!(shared.state_at(t1), ConnectionState::Connecting);

        transport.0.lock().unwrap().accept = false;
        life.tick_at(&shared, due - Duration::from_millis(1));
        assert_eq!(transport.0.lock().unwrap().opens, 1);

        life.tick_at(&shared, due);
        assert_eq!(transport.0.lock().unwrap().opens, 2);
        // no connection in between, so the next failure waits longer
        assert!(life.next_connect - due >= Duration::from_millis(500));
        assert_eq!(shared.stats.snapshot().disconnects, 1);
    }

    #[test]
    fn shutdown_closes_silently_and_releases_once() {
        let transport = ScriptedTransport::accepting();
        let shared = shared(Subscriptions::default());
        let mut life = lifecycle(&transport);
        life.tick(&shared);
        shared.mailboxes.clear();

        life.shutdown();
        let script = transport.0.lock().unwrap();
        assert_eq!(script.closes, 1);
        assert_eq!(script.drops, 1);
        assert!(!shared.mailboxes.disconnected.is_set());
    }
}
