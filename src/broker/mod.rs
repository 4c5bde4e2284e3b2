//! The broker node.
//!
//! A broker exposes four TCP endpoints: publisher ingress, subscriber
//! egress, management (subscribe/unsubscribe request-reply), and the peer
//! mesh. Every endpoint gets an acceptor thread; every connection gets its
//! own reader or writer thread; all of them funnel into the single core
//! task that owns the matcher (see [`core`]).
//!
//! Backpressure is explicit everywhere: ingress stops reading while the
//! event queue is above 80% occupancy, egress queues drop the oldest
//! notification on overflow, and peer queues drop announcements rather
//! than stall the core.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{BusError, BusResult, TransportError, WireError};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::wire::frame::{read_envelope_or_stop, write_envelope};
use crate::wire::{Envelope, Heartbeat, Payload, SubscribeAck, STATUS_UP};

pub(crate) mod core;
pub(crate) mod egress;
pub mod peers;

pub use peers::LinkState;

use self::core::{ControlMsg, PeerSlot};

const CONTROL_QUEUE_CAP: usize = 1024;
const PEER_QUEUE_CAP: usize = 1024;
const MANAGEMENT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound addresses of a running broker. Configured ports of 0 bind
/// ephemerally, so tests read the real ports from here.
#[derive(Debug, Clone, Copy)]
pub struct BrokerAddrs {
    /// Publisher ingress.
    pub publisher: SocketAddr,
    /// Subscriber egress.
    pub subscriber: SocketAddr,
    /// Management (subscribe/unsubscribe).
    pub management: SocketAddr,
    /// Peer mesh.
    pub peer: SocketAddr,
}

/// A running broker node.
///
/// Dropping the broker shuts it down: intake stops, the core drains up to
/// its deadline, a final `SHUTDOWN` heartbeat goes to the peers, and all
/// owned threads are joined.
pub struct Broker {
    cfg: BrokerConfig,
    stats: Arc<BrokerStats>,
    shutdown: Arc<AtomicBool>,
    control_tx: Sender<ControlMsg>,
    addrs: BrokerAddrs,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Broker {
    /// Binds all endpoints and starts the broker's tasks.
    pub fn start(cfg: BrokerConfig) -> BusResult<Self> {
        let stats = Arc::new(BrokerStats::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let publisher = bind(&cfg.bind_addr, cfg.publisher_port)?;
        let subscriber = bind(&cfg.bind_addr, cfg.subscriber_port)?;
        // With an ephemeral egress port the +1000 convention has no anchor;
        // the management port goes ephemeral too.
        let management_port = if cfg.subscriber_port == 0 {
            0
        } else {
            cfg.management_port()
        };
        let management = bind(&cfg.bind_addr, management_port)?;
        let peer = bind(&cfg.bind_addr, cfg.peer_port)?;

        let addrs = BrokerAddrs {
            publisher: publisher.local_addr().map_err(TransportError::Io)?,
            subscriber: subscriber.local_addr().map_err(TransportError::Io)?,
            management: management.local_addr().map_err(TransportError::Io)?,
            peer: peer.local_addr().map_err(TransportError::Io)?,
        };

        let (control_tx, control_rx) = bounded::<ControlMsg>(CONTROL_QUEUE_CAP);
        let (event_tx, event_rx) = bounded::<Envelope>(cfg.ingress_queue_cap.max(1));

        let mut threads = Vec::new();
        let mut peer_slots = Vec::new();
        for (index, endpoint) in cfg.peer_endpoints.iter().enumerate() {
            let (out_tx, out_rx) = bounded::<Envelope>(PEER_QUEUE_CAP);
            peer_slots.push(PeerSlot::new(endpoint.clone(), out_tx));
            let handle = spawn_named(
                format!("marketbus-peer-{index}"),
                {
                    let endpoint = endpoint.clone();
                    let control_tx = control_tx.clone();
                    let shutdown = Arc::clone(&shutdown);
                    move || peers::run_outbound_link(index, endpoint, control_tx, out_rx, shutdown)
                },
            );
            threads.push(handle);
        }

        threads.push(spawn_named("marketbus-core".to_string(), {
            let cfg = cfg.clone();
            let stats = Arc::clone(&stats);
            move || self::core::run_core(cfg, stats, peer_slots, control_rx, event_rx)
        }));

        threads.push(spawn_named("marketbus-ingress".to_string(), {
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&shutdown);
            let cap = cfg.ingress_queue_cap.max(1);
            move || {
                let conn_stats = Arc::clone(&stats);
                let conn_shutdown = Arc::clone(&shutdown);
                accept_loop(&publisher, &shutdown, move |stream| {
                    let event_tx = event_tx.clone();
                    let stats = Arc::clone(&conn_stats);
                    let shutdown = Arc::clone(&conn_shutdown);
                    spawn_detached("marketbus-ingress-conn", move || {
                        run_ingress_conn(stream, event_tx, stats, shutdown, cap);
                    });
                });
            }
        }));

        threads.push(spawn_named("marketbus-management".to_string(), {
            let control_tx = control_tx.clone();
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&shutdown);
            move || {
                let conn_stats = Arc::clone(&stats);
                let conn_shutdown = Arc::clone(&shutdown);
                accept_loop(&management, &shutdown, move |stream| {
                    let control_tx = control_tx.clone();
                    let stats = Arc::clone(&conn_stats);
                    let shutdown = Arc::clone(&conn_shutdown);
                    spawn_detached("marketbus-management-conn", move || {
                        run_management_conn(stream, control_tx, stats, shutdown);
                    });
                });
            }
        }));

        threads.push(spawn_named("marketbus-egress".to_string(), {
            let control_tx = control_tx.clone();
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&shutdown);
            let egress_cap = cfg.egress_queue_cap.max(1);
            let drop_oldest = cfg.drop_oldest_on_overflow;
            move || {
                let conn_stats = Arc::clone(&stats);
                let conn_shutdown = Arc::clone(&shutdown);
                accept_loop(&subscriber, &shutdown, move |stream| {
                    let control_tx = control_tx.clone();
                    let stats = Arc::clone(&conn_stats);
                    let shutdown = Arc::clone(&conn_shutdown);
                    spawn_detached("marketbus-egress-conn", move || {
                        run_egress_conn(stream, control_tx, stats, shutdown, egress_cap, drop_oldest);
                    });
                });
            }
        }));

        threads.push(spawn_named("marketbus-peer-accept".to_string(), {
            let control_tx = control_tx.clone();
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&shutdown);
            let broker_id = cfg.broker_id.clone();
            move || {
                let conn_stats = Arc::clone(&stats);
                let conn_shutdown = Arc::clone(&shutdown);
                accept_loop(&peer, &shutdown, move |stream| {
                    let control_tx = control_tx.clone();
                    let stats = Arc::clone(&conn_stats);
                    let shutdown = Arc::clone(&conn_shutdown);
                    let broker_id = broker_id.clone();
                    spawn_detached("marketbus-peer-conn", move || {
                        run_peer_conn(stream, control_tx, stats, shutdown, broker_id);
                    });
                });
            }
        }));

        info!(
            broker_id = %cfg.broker_id,
            publisher = %addrs.publisher,
            subscriber = %addrs.subscriber,
            management = %addrs.management,
            peer = %addrs.peer,
            "broker started"
        );

        Ok(Self {
            cfg,
            stats,
            shutdown,
            control_tx,
            addrs,
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
        })
    }

    /// The broker's id within the overlay.
    #[must_use]
    pub fn broker_id(&self) -> &str {
        &self.cfg.broker_id
    }

    /// Bound endpoint addresses.
    #[must_use]
    pub const fn addrs(&self) -> &BrokerAddrs {
        &self.addrs
    }

    /// Snapshot of the broker's counters.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Orderly shutdown: stop intake, drain the core up to its deadline,
    /// emit a final heartbeat, close queues, join threads. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(broker_id = %self.cfg.broker_id, "broker shutting down");

        // Let the core drain before the link threads notice the flag and
        // stop flushing.
        let _ = self
            .control_tx
            .send_timeout(ControlMsg::Shutdown, Duration::from_secs(1));
        self.shutdown.store(true, Ordering::SeqCst);

        // Wake acceptors blocked in accept().
        for addr in [
            self.addrs.publisher,
            self.addrs.subscriber,
            self.addrs.management,
            self.addrs.peer,
        ] {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(100));
        }

        let handles = {
            let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bind(host: &str, port: u16) -> BusResult<TcpListener> {
    TcpListener::bind((host, port)).map_err(|e| {
        TransportError::ConnectionFailed {
            endpoint: format!("{host}:{port}"),
            message: e.to_string(),
        }
        .into()
    })
}

fn spawn_named(name: String, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .expect("failed to spawn marketbus thread")
}

fn spawn_detached(name: &str, f: impl FnOnce() + Send + 'static) {
    let _ = thread::Builder::new().name(name.to_string()).spawn(f);
}

fn accept_loop(listener: &TcpListener, shutdown: &AtomicBool, mut on_conn: impl FnMut(TcpStream)) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                on_conn(stream);
            }
            Err(err) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                warn!(error = %err, "accept failed");
            }
        }
    }
}

/// True when the connection cannot continue: I/O failure or a corrupt
/// length prefix. A clean body-decode failure leaves the stream aligned
/// and is skippable.
fn is_fatal_read(err: &BusError) -> bool {
    matches!(
        err,
        BusError::Transport(_) | BusError::Wire(WireError::FrameTooLarge { .. })
    )
}

fn run_ingress_conn(
    mut stream: TcpStream,
    event_tx: Sender<Envelope>,
    stats: Arc<BrokerStats>,
    shutdown: Arc<AtomicBool>,
    queue_cap: usize,
) {
    if stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .is_err()
    {
        return;
    }

    loop {
        // Flow control: refuse reads while the matcher queue is >80% full.
        while event_tx.len() * 5 > queue_cap * 4 {
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }

        match read_envelope_or_stop(&mut stream, &shutdown) {
            Ok(None) => return,
            Ok(Some(env)) => match env.payload {
                Payload::Event(_) => {
                    if event_tx.send(env).is_err() {
                        return;
                    }
                }
                _ => debug!("non-event message on ingress; dropped"),
            },
            Err(err) if is_fatal_read(&err) => return,
            Err(_) => stats.incr_decode_errors(),
        }
    }
}

fn run_management_conn(
    mut stream: TcpStream,
    control_tx: Sender<ControlMsg>,
    stats: Arc<BrokerStats>,
    shutdown: Arc<AtomicBool>,
) {
    if stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .is_err()
    {
        return;
    }

    loop {
        let env = match read_envelope_or_stop(&mut stream, &shutdown) {
            Ok(None) => return,
            Ok(Some(env)) => env,
            Err(err) if is_fatal_read(&err) => return,
            Err(err) => {
                stats.incr_decode_errors();
                // A malformed subscription still deserves a synchronous
                // rejection so the subscriber is not left waiting.
                let ack = SubscribeAck {
                    subscription_id: String::new(),
                    ok: false,
                    error: err.to_string(),
                };
                if write_envelope(&mut stream, &Envelope::new(Payload::SubscribeAck(ack))).is_err() {
                    return;
                }
                continue;
            }
        };

        let ack = match env.payload {
            Payload::Subscribe(mut subscription) => {
                if subscription.subscription_id.is_empty() {
                    subscription.subscription_id = format!("sub-{}", Uuid::new_v4());
                }
                let id = subscription.subscription_id.clone();
                match request(&control_tx, |reply| ControlMsg::Register {
                    subscription,
                    reply,
                }) {
                    Ok(registered_id) => SubscribeAck {
                        subscription_id: registered_id,
                        ok: true,
                        error: String::new(),
                    },
                    Err(err) => SubscribeAck {
                        subscription_id: id,
                        ok: false,
                        error: err.to_string(),
                    },
                }
            }
            Payload::Unsubscribe {
                subscription_id, ..
            } => {
                let id = subscription_id.clone();
                match request(&control_tx, |reply| ControlMsg::Unregister {
                    subscription_id,
                    reply,
                }) {
                    Ok(()) => SubscribeAck {
                        subscription_id: id,
                        ok: true,
                        error: String::new(),
                    },
                    Err(err) => SubscribeAck {
                        subscription_id: id,
                        ok: false,
                        error: err.to_string(),
                    },
                }
            }
            _ => {
                debug!("unexpected message on management; dropped");
                continue;
            }
        };

        if write_envelope(&mut stream, &Envelope::new(Payload::SubscribeAck(ack))).is_err() {
            return;
        }
    }
}

/// Sends a control request with a reply channel and waits for the answer.
fn request<T>(
    control_tx: &Sender<ControlMsg>,
    build: impl FnOnce(crossbeam_channel::Sender<BusResult<T>>) -> ControlMsg,
) -> BusResult<T> {
    let (reply_tx, reply_rx) = bounded::<BusResult<T>>(1);
    control_tx
        .send_timeout(build(reply_tx), MANAGEMENT_REPLY_TIMEOUT)
        .map_err(|_| {
            BusError::from(crate::error::ExecutionError::Disconnected {
                path: "broker_control".to_string(),
            })
        })?;
    reply_rx
        .recv_timeout(MANAGEMENT_REPLY_TIMEOUT)
        .map_err(|_| {
            BusError::from(crate::error::ExecutionError::Timeout {
                duration_ms: MANAGEMENT_REPLY_TIMEOUT.as_millis() as u64,
            })
        })?
}

fn run_egress_conn(
    mut stream: TcpStream,
    control_tx: Sender<ControlMsg>,
    stats: Arc<BrokerStats>,
    shutdown: Arc<AtomicBool>,
    queue_cap: usize,
    drop_oldest: bool,
) {
    if stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .is_err()
    {
        return;
    }

    // The first frame identifies the subscriber attaching to this
    // connection: a subscription hello carrying only `subscriber_id`.
    let subscriber_id = match read_envelope_or_stop(&mut stream, &shutdown) {
        Ok(Some(Envelope {
            payload: Payload::Subscribe(sub),
            ..
        })) if !sub.subscriber_id.is_empty() => sub.subscriber_id,
        Ok(_) => {
            debug!("egress connection without a valid hello; closing");
            return;
        }
        Err(err) => {
            if !is_fatal_read(&err) {
                stats.incr_decode_errors();
            }
            return;
        }
    };

    let (queue, drain) = egress::subscriber_queue(queue_cap, drop_oldest);
    if control_tx
        .send(ControlMsg::Attach {
            subscriber_id: subscriber_id.clone(),
            queue,
        })
        .is_err()
    {
        return;
    }
    egress::run_writer(stream, drain, subscriber_id, shutdown);
}

fn run_peer_conn(
    mut stream: TcpStream,
    control_tx: Sender<ControlMsg>,
    stats: Arc<BrokerStats>,
    shutdown: Arc<AtomicBool>,
    broker_id: String,
) {
    if stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .is_err()
    {
        return;
    }

    // Identification hello: tells the dialing peer who answered, so it can
    // route notifications for our locally homed subscriptions back to us.
    let hello = Envelope::new(Payload::Heartbeat(Heartbeat {
        broker_id,
        status: STATUS_UP.to_string(),
        active_subscriptions: stats.active_subscriptions() as i64,
        processed_events: stats.events_ingested() as i64,
    }));
    if write_envelope(&mut stream, &hello).is_err() {
        return;
    }

    loop {
        match read_envelope_or_stop(&mut stream, &shutdown) {
            Ok(None) => return,
            Ok(Some(envelope)) => {
                if control_tx.send(ControlMsg::PeerInbound { envelope }).is_err() {
                    return;
                }
            }
            Err(err) if is_fatal_read(&err) => return,
            Err(_) => stats.incr_decode_errors(),
        }
    }
}
