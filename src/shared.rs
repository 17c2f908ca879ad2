use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::connection::ConnectionState;
use crate::error::{Result, RpcError};
use crate::events::{Mailboxes, Subscriptions};
use crate::queue::{SendQueue, SlotWriter};
use crate::serialization::write_subscribe;

/// State shared between the application threads and the I/O driver.
pub struct Shared {
    pub queue: SendQueue,
    pub mailboxes: Mailboxes,
    pub subscriptions: Subscriptions,
    pub pid: u32,
    pub stats: Stats,
    connected: AtomicBool,
    /// Следующая попытка подключения, наносекунды от `epoch`.
    next_connect: AtomicU64,
    epoch: Instant,
    nonce: AtomicU32,
    wake: IoSignal,
}

impl Shared {
    pub fn new(subscriptions: Subscriptions, pid: u32) -> Self {
        Self {
            queue: SendQueue::new(),
            mailboxes: Mailboxes::new(),
            subscriptions,
            pid,
            stats: Stats::default(),
            connected: AtomicBool::new(false),
            next_connect: AtomicU64::new(0),
            epoch: Instant::now(),
            nonce: AtomicU32::new(1),
            wake: IoSignal::default(),
        }
    }

    pub fn next_nonce(&self) -> u32 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn set_next_connect(&self, at: Instant) {
        let nanos = at.saturating_duration_since(self.epoch).as_nanos();
        self.next_connect
            .store(u64::try_from(nanos).unwrap_or(u64::MAX), Ordering::Release);
    }

    /// Lifecycle state as last published by the I/O driver, evaluated at `now`.
    pub fn state_at(&self, now: Instant) -> ConnectionState {
        if self.is_connected() {
            return ConnectionState::Open;
        }
        let due = self.epoch + Duration::from_nanos(self.next_connect.load(Ordering::Acquire));
        if now < due {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Encodes one message straight into a free queue slot and wakes the
    /// I/O driver. Waits out another producer's encode; the message is dropped
    /// only on a full queue or an encode failure.
    pub fn enqueue(&self, encode: impl FnOnce(&mut [u8], u32) -> Result<usize>) -> Result<()> {
        let result = self.try_enqueue(encode);
        if let Err(err) = &result {
            self.stats.dropped_messages.fetch_add(1, Ordering::Relaxed);
            debug!(%err, "message dropped");
        }
        result
    }

    fn try_enqueue(&self, encode: impl FnOnce(&mut [u8], u32) -> Result<usize>) -> Result<()> {
        let mut slot = self.reserve()?;
        let length = encode(slot.buffer(), self.next_nonce())?;
        slot.commit(length);
        self.wake.notify();
        Ok(())
    }

    /// Роль producer занята только на время одной записи, поэтому ждём её.
    fn reserve(&self) -> Result<SlotWriter<'_>> {
        let mut spins = 0u32;
        loop {
            match self.queue.try_reserve() {
                Err(RpcError::ProducerBusy) => {
                    spins = spins.wrapping_add(1);
                    if spins & 63 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                other => return other,
            }
        }
    }

    /// Subscription request from the I/O side on connect.
    pub(crate) fn enqueue_subscribe(&self, event: &str) -> Result<()> {
        self.enqueue(|buf, nonce| write_subscribe(buf, nonce, event))?;
        trace!(event, "subscription queued");
        Ok(())
    }

    pub fn notify_io(&self) {
        self.wake.notify();
    }

    pub fn wait_io(&self, timeout: Duration) {
        self.wake.wait(timeout);
    }
}

/// Wake-up signal for the background loop. A notify that lands while the
/// loop is busy ticking is remembered and cuts the next wait short.
#[derive(Default)]
struct IoSignal {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl IoSignal {
    fn notify(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        *pending = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut pending, _) = self
            .cond
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap_or_else(PoisonError::into_inner);
        *pending = false;
    }
}

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_messages: u64,
    pub dropped_messages: u64,
    pub received_messages: u64,
    pub connects: u64,
    pub disconnects: u64,
}

#[derive(Default)]
pub struct Stats {
    pub(crate) sent_messages: AtomicU64,
    pub(crate) dropped_messages: AtomicU64,
    pub(crate) received_messages: AtomicU64,
    pub(crate) connects: AtomicU64,
    pub(crate) disconnects: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_messages: self.sent_messages.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
            received_messages: self.received_messages.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::QUEUE_CAPACITY;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn fill(shared: &Shared, byte: u8) -> Result<()> {
        shared.enqueue(|buf, _| {
            buf[0] = byte;
            Ok(1)
        })
    }

    #[test]
    fn saturation_drops_and_counts() {
        let shared = Shared::new(Subscriptions::default(), 1);
        for i in 0..QUEUE_CAPACITY {
            fill(&shared, i as u8).unwrap();
        }
        assert_eq!(fill(&shared, 0), Err(RpcError::QueueFull));
        assert_eq!(shared.stats.snapshot().dropped_messages, 1);
        assert_eq!(shared.queue.pending() as usize, QUEUE_CAPACITY);
    }

    #[test]
    fn encode_failure_publishes_nothing() {
        let shared = Shared::new(Subscriptions::default(), 1);
        let result = shared.enqueue(|_, _| Err(RpcError::MessageTooLarge { max: 1 }));
        assert!(result.is_err());
        assert!(shared.queue.is_empty());
        fill(&shared, 9).unwrap();
        assert_eq!(shared.queue.pending(), 1);
    }

    #[test]
    fn busy_producer_is_waited_out_not_dropped() {
        let shared = Shared::new(Subscriptions::default(), 1);
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        std::thread::scope(|s| {
            let shared = &shared;
            s.spawn(move || {
                let slot = shared.queue.try_reserve().unwrap();
                held_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                drop(slot);
            });
            held_rx.recv().unwrap();

            let writer = s.spawn(move || fill(shared, 7));
            std::thread::sleep(Duration::from_millis(30));
            assert!(!writer.is_finished());
            assert!(shared.queue.is_empty());

            release_tx.send(()).unwrap();
            assert_eq!(writer.join().unwrap(), Ok(()));
        });

        assert_eq!(shared.queue.pending(), 1);
        assert_eq!(shared.stats.snapshot().dropped_messages, 0);
    }

    #[test]
    fn state_follows_published_deadline() {
        let shared = Shared::new(Subscriptions::default(), 1);
        let now = Instant::now();
        assert_eq!(shared.state_at(now), ConnectionState::Disconnected);

        shared.set_next_connect(now + Duration::from_millis(500));
        assert_eq!(shared.state_at(now), ConnectionState::Connecting);
        assert_eq!(
            shared.state_at(now + Duration::from_millis(500)),
            ConnectionState::Disconnected
        );

        shared.set_connected(true);
        assert_eq!(shared.state_at(now), ConnectionState::Open);
    }

    #[test]
    fn nonces_increase() {
        let shared = Shared::new(Subscriptions::default(), 1);
        let mut seen = Vec::new();
        for _ in 0..3 {
            shared
                .enqueue(|_, nonce| {
                    seen.push(nonce);
                    Ok(0)
                })
                .unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn notify_before_wait_is_not_lost() {
        let shared = Shared::new(Subscriptions::default(), 1);
        shared.notify_io();
        let start = Instant::now();
        shared.wait_io(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn enqueue_wakes_a_waiting_loop() {
        let shared = Arc::new(Shared::new(Subscriptions::default(), 1));
        let waiter = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                shared.wait_io(Duration::from_secs(5));
                start.elapsed()
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        fill(&shared, 1).unwrap();
        assert!(waiter.join().unwrap() < Duration::from_secs(1));
    }

    #[test]
    fn wait_times_out_without_signal() {
        let shared = Shared::new(Subscriptions::default(), 1);
        let start = Instant::now();
        shared.wait_io(Duration::from_millis(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
