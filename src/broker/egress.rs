//! Per-subscriber egress queues.
//!
//! Each attached subscriber gets a bounded queue drained by its own writer
//! thread. The core pushes with `try_send` and never blocks: on overflow
//! the oldest queued notification is dropped (or the newest, when
//! configured), and the overflow counter is bumped.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, warn};

use crate::notification::Notification;
use crate::stats::BrokerStats;
use crate::wire::frame::write_envelope;
use crate::wire::{Envelope, Payload};

/// Outcome of a queue push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Push {
    /// Enqueued for delivery.
    Queued,
    /// The queue was full and the notification was dropped.
    Dropped,
    /// The subscriber is gone; the caller should discard the queue.
    Closed,
}

/// Core-side handle to one subscriber's queue.
#[derive(Debug)]
pub(crate) struct SubscriberQueue {
    tx: Sender<Notification>,
    rx: Receiver<Notification>,
    closed: Arc<AtomicBool>,
    drop_oldest: bool,
}

/// Writer-side handle draining the queue onto the socket.
#[derive(Debug)]
pub(crate) struct SubscriberDrain {
    rx: Receiver<Notification>,
    closed: Arc<AtomicBool>,
}

/// Creates a queue pair with the given capacity.
pub(crate) fn subscriber_queue(
    capacity: usize,
    drop_oldest: bool,
) -> (SubscriberQueue, SubscriberDrain) {
    let (tx, rx) = bounded::<Notification>(capacity.max(1));
    let closed = Arc::new(AtomicBool::new(false));
    (
        SubscriberQueue {
            tx,
            rx: rx.clone(),
            closed: Arc::clone(&closed),
            drop_oldest,
        },
        SubscriberDrain { rx, closed },
    )
}

impl SubscriberQueue {
    /// Enqueues a notification without blocking.
    pub(crate) fn push(&self, notification: Notification, stats: &BrokerStats) -> Push {
        if self.is_closed() {
            return Push::Closed;
        }
        match self.tx.try_send(notification) {
            Ok(()) => Push::Queued,
            Err(TrySendError::Full(notification)) => {
                stats.incr_notifications_dropped_overflow();
                if self.drop_oldest {
                    let _ = self.rx.try_recv();
                    match self.tx.try_send(notification) {
                        Ok(()) => Push::Queued,
                        Err(_) => Push::Dropped,
                    }
                } else {
                    Push::Dropped
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.close();
                Push::Closed
            }
        }
    }

    /// Marks the queue closed; the writer thread exits on its next poll.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Drains a subscriber queue onto its socket until the queue closes, the
/// broker shuts down, or a write fails. Pending notifications are dropped
/// on the way out.
pub(crate) fn run_writer(
    mut stream: TcpStream,
    drain: SubscriberDrain,
    subscriber_id: String,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) || drain.closed.load(Ordering::Relaxed) {
            break;
        }
        match drain.rx.recv_timeout(Duration::from_millis(250)) {
            Ok(notification) => {
                let env = Envelope::new(Payload::Notification(notification));
                if let Err(err) = write_envelope(&mut stream, &env) {
                    warn!(subscriber_id = %subscriber_id, error = %err, "egress write failed; closing queue");
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drain.closed.store(true, Ordering::Relaxed);
    debug!(subscriber_id = %subscriber_id, "egress writer stopped");
}
