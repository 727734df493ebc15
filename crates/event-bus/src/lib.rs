//! Observer-style fan-out used between the pieces of a consultation session.
//!
//! Every subscriber gets its own unbounded queue, so a slow consumer never
//! causes another one to miss an event and every subscriber sees events in
//! publish order.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus closed")]
    Closed,
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus<E>: Send + Sync {
    fn subscribe(&self) -> Subscription<E>;
    /// Delivers `event` to every live subscriber and returns how many got it.
    fn publish(&self, event: E) -> BusResult<usize>;
}

/// Receiving half handed out by [`Bus::subscribe`].
#[derive(Debug)]
pub struct Subscription<E> {
    rx: mpsc::UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    /// Waits for the next event; `None` once the bus is closed and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// In-process bus backed by one queue per subscriber.
#[derive(Debug)]
pub struct LocalBus<E> {
    inner: Mutex<BusState<E>>,
}

#[derive(Debug)]
struct BusState<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
    /// Events held for the first subscriber; `None` once it has arrived or
    /// when the bus was not built with [`LocalBus::buffered`].
    held: Option<VecDeque<E>>,
    closed: bool,
}

impl<E> Default for LocalBus<E> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(BusState {
                subscribers: Vec::new(),
                held: None,
                closed: false,
            }),
        }
    }
}

impl<E: Clone + Send + 'static> LocalBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that keeps everything published before anyone subscribes and
    /// hands it to the first subscriber, closing events included.
    pub fn buffered() -> Self {
        let bus = Self::default();
        bus.inner.lock().held = Some(VecDeque::new());
        bus
    }

    pub fn subscriber_count(&self) -> usize {
        let mut guard = self.inner.lock();
        guard.subscribers.retain(|tx| !tx.is_closed());
        guard.subscribers.len()
    }

    /// Drops every subscriber queue; pending events stay readable, later
    /// publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        let mut guard = self.inner.lock();
        guard.closed = true;
        guard.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<E: Clone + Send + 'static> Bus<E> for LocalBus<E> {
    fn subscribe(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut guard = self.inner.lock();
        if let Some(held) = guard.held.take() {
            for event in held {
                let _ = tx.send(event);
            }
        }
        if !guard.closed {
            guard.subscribers.push(tx);
        }
        Subscription { rx }
    }

    fn publish(&self, event: E) -> BusResult<usize> {
        let mut guard = self.inner.lock();
        if guard.closed {
            return Err(BusError::Closed);
        }
        if let Some(held) = guard.held.as_mut() {
            held.push_back(event);
            return Ok(0);
        }
        guard.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(guard.subscribers.len())
    }
}
