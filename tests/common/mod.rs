#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use discord_rpc::{ConnectionListener, InboundMessage, Transport};
use serde_json::Value;

/// Sessions are process-wide, so tests in one binary take turns.
pub static SESSION_LOCK: Mutex<()> = Mutex::new(());

pub fn serial() -> MutexGuard<'static, ()> {
    SESSION_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct HostState {
    pub accept: bool,
    pub open: bool,
    pub opens: u32,
    pub inbound: VecDeque<InboundMessage>,
    pub written: Vec<Value>,
    pub hangup: Option<(i32, String)>,
}

/// In-memory host: accepts when told to, records every frame it gets.
#[derive(Clone, Default)]
pub struct MockHost(pub Arc<Mutex<HostState>>);

impl MockHost {
    pub fn accepting() -> Self {
        let host = Self::default();
        host.state().accept = true;
        host
    }

    pub fn state(&self) -> MutexGuard<'_, HostState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, value: Value) {
        self.state().inbound.push_back(value.into());
    }

    pub fn written(&self) -> Vec<Value> {
        self.state().written.clone()
    }
}

impl Transport for MockHost {
    fn open(&mut self, listener: &mut dyn ConnectionListener) {
        let accepted = {
            let mut state = self.state();
            state.opens += 1;
            state.open = state.accept;
            state.open
        };
        if accepted {
            listener.on_connect();
        }
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn read(&mut self, listener: &mut dyn ConnectionListener) -> Option<InboundMessage> {
        let mut state = self.state();
        if let Some((code, message)) = state.hangup.take() {
            state.open = false;
            drop(state);
            listener.on_disconnect(code, &message);
            return None;
        }
        state.inbound.pop_front()
    }

    fn write(&mut self, frame: &[u8], _listener: &mut dyn ConnectionListener) {
        let value = serde_json::from_slice(frame).expect("frame is JSON");
        self.state().written.push(value);
    }

    fn close(&mut self, _listener: &mut dyn ConnectionListener) {
        self.state().open = false;
    }
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
