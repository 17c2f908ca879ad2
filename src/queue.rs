//! Lock-free очередь отправки фиксированной ёмкости.
//!
//! Восемь слотов по [`MAX_MESSAGE_SIZE`] байт и три счётчика:
//! `next_add`, `next_send`, `pending`. Индекс слота = счётчик % ёмкость.
//!
//! Единственная защита от перезаписи неотправленного слота: проверка
//! `pending >= capacity` на стороне producer. Она корректна только при одном
//! активном producer и одном активном consumer, поэтому обе роли захватываются
//! флагами: [`SendQueue::try_reserve`] и [`SendQueue::consumer`] не блокируют,
//! а отказывают, если роль уже занята.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::constants::{MAX_MESSAGE_SIZE, QUEUE_CAPACITY};
use crate::error::{Result, RpcError};

struct QueuedMessage {
    length: usize,
    buffer: Box<[u8]>,
}

impl QueuedMessage {
    fn new() -> Self {
        Self {
            length: 0,
            buffer: vec![0u8; MAX_MESSAGE_SIZE].into_boxed_slice(),
        }
    }
}

pub struct SendQueue {
    slots: Box<[UnsafeCell<QueuedMessage>]>,
    next_add: AtomicU32,
    next_send: AtomicU32,
    pending: AtomicU32,
    producing: AtomicBool,
    consuming: AtomicBool,
}

// Слот `next_add` принадлежит владельцу SlotWriter, слоты
// `next_send..next_send + pending` принадлежат Consumer. Пересечения нет,
// пока pending < capacity на момент резервирования.
unsafe impl Sync for SendQueue {}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            slots: (0..QUEUE_CAPACITY)
                .map(|_| UnsafeCell::new(QueuedMessage::new()))
                .collect(),
            next_add: AtomicU32::new(0),
            next_send: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            producing: AtomicBool::new(false),
            consuming: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    fn slot_index(counter: u32) -> usize {
        counter as usize % QUEUE_CAPACITY
    }

    /// Захватывает следующий слот для записи.
    ///
    /// `QueueFull`, если потребитель отстаёт на всю ёмкость: сообщение
    /// отбрасывается. `ProducerBusy`, если другой поток держит свой
    /// SlotWriter: занятость длится одну запись, вызывающий повторяет.
    pub fn try_reserve(&self) -> Result<SlotWriter<'_>> {
        if self.producing.swap(true, Ordering::Acquire) {
            return Err(RpcError::ProducerBusy);
        }

        // если отстаём, выходим
        if self.pending.load(Ordering::Acquire) as usize >= QUEUE_CAPACITY {
            self.producing.store(false, Ordering::Release);
            return Err(RpcError::QueueFull);
        }

        let index = Self::slot_index(self.next_add.load(Ordering::Relaxed));
        Ok(SlotWriter { queue: self, index })
    }

    /// Захватывает роль потребителя. `None`, если она уже занята.
    pub fn consumer(&self) -> Option<Consumer<'_>> {
        if self.consuming.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(Consumer { queue: self })
    }
}

/// Эксклюзивный доступ к резервируемому слоту до `commit`.
///
/// Dropped without commit, the slot stays free and nothing is published.
pub struct SlotWriter<'a> {
    queue: &'a SendQueue,
    index: usize,
}

impl SlotWriter<'_> {
    pub fn buffer(&mut self) -> &mut [u8] {
        // SAFETY: слот index не виден потребителю до commit.
        unsafe { &mut (*self.queue.slots[self.index].get()).buffer }
    }

    /// Публикует первые `length` байт буфера для потребителя.
    pub fn commit(self, length: usize) {
        debug_assert!(length <= MAX_MESSAGE_SIZE);
        // SAFETY: см. buffer().
        unsafe {
            (*self.queue.slots[self.index].get()).length = length.min(MAX_MESSAGE_SIZE);
        }
        self.queue.next_add.fetch_add(1, Ordering::Relaxed);
        // Release: содержимое слота видно потребителю, прочитавшему pending.
        self.queue.pending.fetch_add(1, Ordering::Release);
    }
}

impl Drop for SlotWriter<'_> {
    fn drop(&mut self) {
        self.queue.producing.store(false, Ordering::Release);
    }
}

/// Роль потребителя: забирает сообщения строго в порядке commit.
pub struct Consumer<'a> {
    queue: &'a SendQueue,
}

impl Consumer<'_> {
    /// Передаёт следующее сообщение в `send` и освобождает его слот.
    /// Возвращает `false`, если очередь пуста.
    pub fn take_next(&mut self, send: impl FnOnce(&[u8])) -> bool {
        if self.queue.pending.load(Ordering::Acquire) == 0 {
            return false;
        }
        let index = SendQueue::slot_index(self.queue.next_send.load(Ordering::Relaxed));
        {
            // SAFETY: слот опубликован (pending > 0) и не может быть
            // перезаписан, пока мы не уменьшим pending.
            let message = unsafe { &*self.queue.slots[index].get() };
            send(&message.buffer[..message.length]);
        }
        self.queue.next_send.fetch_add(1, Ordering::Relaxed);
        // Release: producer увидит слот свободным только после чтения.
        self.queue.pending.fetch_sub(1, Ordering::Release);
        true
    }

    /// Забирает всё, что накопилось, в порядке FIFO.
    pub fn drain(&mut self, mut send: impl FnMut(&[u8])) -> usize {
        let mut count = 0;
        while self.take_next(&mut send) {
            count += 1;
        }
        count
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        self.queue.consuming.store(false, Ordering::Release);
    }
}
