//! Log fan-out bus
//!
//! Broadcasts formatted log records to any number of subscribers (WebSocket
//! streams, in-process inspectors) without ever blocking the producer. Each
//! subscriber owns a bounded queue; when it is full, records are dropped for
//! that subscriber only. A small replay buffer gives new subscribers the most
//! recent history.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

/// Number of recent records replayed to a new subscriber.
const REPLAY_BUFFER_SIZE: usize = 100;

/// Default queue capacity for a subscriber.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A handle to one subscription on the bus.
///
/// Dropping the receiver is enough to stop delivery; `LogBus::unsubscribe`
/// additionally releases the sender side eagerly.
pub struct LogSubscriber {
    pub id: u64,
    pub rx: mpsc::Receiver<Bytes>,
}

struct BusInner {
    next_id: u64,
    listeners: HashMap<u64, mpsc::Sender<Bytes>>,
    buffer: VecDeque<Bytes>,
}

/// Non-blocking broadcast bus for log records.
pub struct LogBus {
    inner: Mutex<BusInner>,
}

impl LogBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                listeners: HashMap::new(),
                buffer: VecDeque::with_capacity(REPLAY_BUFFER_SIZE),
            }),
        })
    }

    /// Register a subscriber with the given queue capacity and replay the
    /// buffered history into its queue.
    pub fn subscribe(&self, capacity: usize) -> LogSubscriber {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        for record in &inner.buffer {
            // Replay is best-effort: a capacity smaller than the buffer
            // simply gets the most recent prefix that fits.
            let _ = tx.try_send(record.clone());
        }
        inner.listeners.insert(id, tx);

        LogSubscriber { id, rx }
    }

    /// Detach a subscriber. No further records are delivered to it.
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().listeners.remove(&id);
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Broadcast one record. The caller keeps ownership of `p`; the bus
    /// copies it before fan-out. Never blocks and never fails: a full
    /// subscriber queue drops the record for that subscriber only.
    pub fn write_record(&self, p: &[u8]) -> usize {
        let record = Bytes::copy_from_slice(p);

        // Snapshot the subscriber set under the lock; deliver outside it so
        // no per-subscriber state is ever held while another write runs.
        let targets: Vec<(u64, mpsc::Sender<Bytes>)> = {
            let mut inner = self.inner.lock();
            if inner.buffer.len() >= REPLAY_BUFFER_SIZE {
                inner.buffer.pop_front();
            }
            inner.buffer.push_back(record.clone());
            inner
                .listeners
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Queue full: shed for this subscriber only.
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(id),
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock();
            for id in dead {
                inner.listeners.remove(&id);
            }
        }

        p.len()
    }

    /// A `MakeWriter` feeding the tracing fmt layer into this bus.
    pub fn make_writer(self: &Arc<Self>) -> BusMakeWriter {
        BusMakeWriter {
            bus: Arc::clone(self),
        }
    }
}

/// tracing-subscriber writer factory backed by a [`LogBus`].
#[derive(Clone)]
pub struct BusMakeWriter {
    bus: Arc<LogBus>,
}

impl<'a> MakeWriter<'a> for BusMakeWriter {
    type Writer = BusWriter;

    fn make_writer(&'a self) -> Self::Writer {
        BusWriter {
            bus: Arc::clone(&self.bus),
        }
    }
}

pub struct BusWriter {
    bus: Arc<LogBus>,
}

impl io::Write for BusWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.bus.write_record(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
