//! Subscriber client.
//!
//! A subscriber holds one egress connection (notifications in) and opens
//! short-lived management connections for subscribe/unsubscribe
//! request-reply. Registered subscriptions are kept in a local registry so
//! they can be replayed after a reconnect; missed notifications are not
//! replayed.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rand::thread_rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{BusResult, ExecutionError, TransportError};
use crate::event::now_ms;
use crate::generate;
use crate::notification::Notification;
use crate::subscription::{Subscription, SubscriptionKind};
use crate::wire::frame::{read_envelope_or_stop, write_envelope};
use crate::wire::{Envelope, Payload, SubscribeAck};

const NOTIFICATION_BUFFER: usize = 1024;
const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    latency_sum_ms: AtomicU64,
    latency_max_ms: AtomicU64,
}

/// Point-in-time subscriber metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SubscriberSnapshot {
    /// Notifications received on the egress connection.
    pub notifications_received: u64,
    /// Mean delivery latency (emission to receipt) in milliseconds.
    pub latency_avg_ms: f64,
    /// Worst observed latency in milliseconds.
    pub latency_max_ms: u64,
}

/// A subscriber connected to one broker.
pub struct Subscriber {
    subscriber_id: String,
    management_addr: SocketAddr,
    registry: Mutex<HashMap<String, Subscription>>,
    notifications: Receiver<Notification>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    /// Connects to a broker: attaches the egress stream (identified by
    /// `subscriber_id`) and remembers the management endpoint.
    pub fn connect(
        management_addr: SocketAddr,
        egress_addr: SocketAddr,
        subscriber_id: &str,
    ) -> BusResult<Self> {
        let mut stream =
            TcpStream::connect(egress_addr).map_err(|e| TransportError::ConnectionFailed {
                endpoint: egress_addr.to_string(),
                message: e.to_string(),
            })?;
        stream
            .set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(TransportError::Io)?;

        // Identify this connection. The hello is a bare subscription
        // carrying only the subscriber id; it is never registered.
        let hello = Subscription {
            subscription_id: String::new(),
            subscriber_id: subscriber_id.to_string(),
            kind: SubscriptionKind::Simple,
            conditions: Vec::new(),
            window: None,
            home_broker_id: None,
        };
        write_envelope(&mut stream, &Envelope::new(Payload::Subscribe(hello)))?;

        let (tx, rx) = bounded::<Notification>(NOTIFICATION_BUFFER);
        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let reader = std::thread::Builder::new()
            .name(format!("marketbus-subscriber-{subscriber_id}"))
            .spawn({
                let counters = Arc::clone(&counters);
                let stop = Arc::clone(&stop);
                let subscriber_id = subscriber_id.to_string();
                move || run_reader(stream, &subscriber_id, &tx, &counters, &stop)
            })
            .map_err(TransportError::Io)?;

        Ok(Self {
            subscriber_id: subscriber_id.to_string(),
            management_addr,
            registry: Mutex::new(HashMap::new()),
            notifications: rx,
            counters,
            stop,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// This subscriber's id.
    #[must_use]
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Registers a subscription, returning the broker-assigned id.
    pub fn subscribe(&self, mut subscription: Subscription) -> BusResult<String> {
        subscription.subscriber_id = self.subscriber_id.clone();
        let ack = self.management_request(Payload::Subscribe(subscription.clone()))?;
        if !ack.ok {
            return Err(TransportError::Rejected { reason: ack.error }.into());
        }
        subscription.subscription_id = ack.subscription_id.clone();
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ack.subscription_id.clone(), subscription);
        Ok(ack.subscription_id)
    }

    /// Unregisters a subscription.
    pub fn unsubscribe(&self, subscription_id: &str) -> BusResult<()> {
        let ack = self.management_request(Payload::Unsubscribe {
            subscription_id: subscription_id.to_string(),
            subscriber_id: self.subscriber_id.clone(),
        })?;
        if !ack.ok {
            return Err(TransportError::Rejected { reason: ack.error }.into());
        }
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(subscription_id);
        Ok(())
    }

    /// Registers `n` random simple subscriptions.
    pub fn subscribe_simple(&self, n: usize) -> BusResult<Vec<String>> {
        let mut rng = thread_rng();
        (0..n)
            .map(|_| self.subscribe(generate::simple_subscription(&mut rng, &self.subscriber_id)))
            .collect()
    }

    /// Registers `n` random complex (windowed) subscriptions.
    pub fn subscribe_complex(&self, n: usize) -> BusResult<Vec<String>> {
        let mut rng = thread_rng();
        (0..n)
            .map(|_| self.subscribe(generate::complex_subscription(&mut rng, &self.subscriber_id)))
            .collect()
    }

    /// Registers `n` subscriptions on a fixed field where `ratio` of the
    /// conditions use `EQ` and the rest draw uniformly from the remaining
    /// operators.
    pub fn subscribe_with_equality_ratio(&self, n: usize, ratio: f64) -> BusResult<Vec<String>> {
        let mut rng = thread_rng();
        (0..n)
            .map(|_| {
                self.subscribe(generate::equality_ratio_subscription(
                    &mut rng,
                    &self.subscriber_id,
                    ratio,
                ))
            })
            .collect()
    }

    /// Re-registers everything in the local registry, after reconnecting
    /// to a restarted broker. Returns the number replayed.
    pub fn replay_subscriptions(&self) -> BusResult<usize> {
        let snapshot: Vec<Subscription> = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        let mut replayed = 0;
        for sub in snapshot {
            match self.management_request(Payload::Subscribe(sub)) {
                Ok(ack) if ack.ok => replayed += 1,
                Ok(_) | Err(_) => {}
            }
        }
        Ok(replayed)
    }

    /// Receives the next notification, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> BusResult<Notification> {
        self.notifications.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ExecutionError::Timeout {
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }
            .into(),
            RecvTimeoutError::Disconnected => ExecutionError::Disconnected {
                path: "subscriber_stream".to_string(),
            }
            .into(),
        })
    }

    /// Returns a queued notification without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Notification> {
        self.notifications.try_recv().ok()
    }

    /// Subscription ids currently in the local registry.
    #[must_use]
    pub fn registered_ids(&self) -> Vec<String> {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SubscriberSnapshot {
        let received = self.counters.received.load(Ordering::Relaxed);
        let sum = self.counters.latency_sum_ms.load(Ordering::Relaxed);
        SubscriberSnapshot {
            notifications_received: received,
            latency_avg_ms: if received == 0 {
                0.0
            } else {
                sum as f64 / received as f64
            },
            latency_max_ms: self.counters.latency_max_ms.load(Ordering::Relaxed),
        }
    }

    fn management_request(&self, payload: Payload) -> BusResult<SubscribeAck> {
        let mut stream = TcpStream::connect_timeout(&self.management_addr, MANAGEMENT_TIMEOUT)
            .map_err(|e| TransportError::ConnectionFailed {
                endpoint: self.management_addr.to_string(),
                message: e.to_string(),
            })?;
        stream
            .set_read_timeout(Some(MANAGEMENT_TIMEOUT))
            .map_err(TransportError::Io)?;

        write_envelope(&mut stream, &Envelope::new(payload))?;
        let reply = crate::wire::frame::read_envelope(&mut stream)?;
        match reply.payload {
            Payload::SubscribeAck(ack) => Ok(ack),
            _ => Err(crate::error::BusError::internal(
                "management reply was not an ack",
            )),
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Ok(mut guard) = self.reader.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_reader(
    mut stream: TcpStream,
    subscriber_id: &str,
    tx: &Sender<Notification>,
    counters: &Counters,
    stop: &AtomicBool,
) {
    loop {
        match read_envelope_or_stop(&mut stream, stop) {
            Ok(None) => return,
            Ok(Some(env)) => {
                let Payload::Notification(notification) = env.payload else {
                    continue;
                };
                if notification.subscriber_id != subscriber_id {
                    // Shared-channel brokers fan out everything; filter here.
                    continue;
                }
                let latency = (now_ms() - notification.timestamp).max(0) as u64;
                counters.received.fetch_add(1, Ordering::Relaxed);
                counters.latency_sum_ms.fetch_add(latency, Ordering::Relaxed);
                counters.latency_max_ms.fetch_max(latency, Ordering::Relaxed);
                if tx.try_send(notification).is_err() {
                    debug!(subscriber_id = %subscriber_id, "local notification buffer full; dropped");
                }
            }
            Err(crate::error::BusError::Wire(crate::error::WireError::FrameTooLarge {
                ..
            })) => return,
            Err(err) if err.is_wire() => {
                debug!(error = %err, "undecodable notification; skipped");
            }
            Err(err) => {
                if !stop.load(Ordering::Relaxed) {
                    warn!(subscriber_id = %subscriber_id, error = %err, "egress connection lost");
                }
                return;
            }
        }
    }
}
