//! The broker core task.
//!
//! Every mutation of the subscription index, the window state, the dedup
//! cache, and the routing tables happens on this one thread; ingress,
//! management, egress, and peer threads talk to it over bounded channels.
//! Registration requests carry a reply channel so management connections
//! can answer synchronously.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::dedup::DedupCache;
use crate::error::BusResult;
use crate::matcher::SubscriptionMatcher;
use crate::notification::Notification;
use crate::stats::BrokerStats;
use crate::subscription::Subscription;
use crate::wire::{Envelope, Heartbeat, Payload, STATUS_SHUTDOWN, STATUS_UP};

use super::egress::{Push, SubscriberQueue};
use super::peers::LinkState;

/// How long the core keeps draining queued events after a shutdown signal.
const DRAIN_DEADLINE: Duration = Duration::from_secs(2);

/// Control messages into the core task.
pub(crate) enum ControlMsg {
    /// Register a locally homed subscription; replies with the id.
    Register {
        subscription: Subscription,
        reply: Sender<BusResult<String>>,
    },
    /// Unregister a subscription.
    Unregister {
        subscription_id: String,
        reply: Sender<BusResult<()>>,
    },
    /// Bind a subscriber's egress queue.
    Attach {
        subscriber_id: String,
        queue: SubscriberQueue,
    },
    /// A message received from some peer.
    PeerInbound { envelope: Envelope },
    /// Outbound link lifecycle report.
    PeerLink {
        index: usize,
        transition: LinkTransition,
    },
    /// Begin the orderly drain.
    Shutdown,
}

/// Reported by outbound link threads.
pub(crate) enum LinkTransition {
    Connecting,
    Connected {
        remote_id: String,
        /// Receives the local summaries to announce.
        reply: Sender<Vec<Subscription>>,
    },
    Lost,
}

/// Core-side view of one peer link.
pub(crate) struct PeerSlot {
    pub endpoint: String,
    pub out_tx: Sender<Envelope>,
    pub state: LinkState,
    pub last_seen: Option<Instant>,
    pub remote_id: Option<String>,
}

impl PeerSlot {
    pub(crate) fn new(endpoint: String, out_tx: Sender<Envelope>) -> Self {
        Self {
            endpoint,
            out_tx,
            state: LinkState::Disconnected,
            last_seen: None,
            remote_id: None,
        }
    }
}

pub(crate) struct Core {
    cfg: BrokerConfig,
    stats: Arc<BrokerStats>,
    matcher: SubscriptionMatcher,
    dedup: DedupCache,
    subscribers: HashMap<String, SubscriberQueue>,
    peers: Vec<PeerSlot>,
    last_heartbeat: Instant,
}

/// Runs the core loop to completion (shutdown or channel teardown).
pub(crate) fn run_core(
    cfg: BrokerConfig,
    stats: Arc<BrokerStats>,
    peers: Vec<PeerSlot>,
    control_rx: Receiver<ControlMsg>,
    event_rx: Receiver<Envelope>,
) {
    let mut core = Core {
        dedup: DedupCache::new(cfg.dedup_cache_size),
        cfg,
        stats,
        matcher: SubscriptionMatcher::new(),
        subscribers: HashMap::new(),
        peers,
        last_heartbeat: Instant::now(),
    };

    let ticker = tick(Duration::from_millis(250));
    let mut control_closed = false;
    let mut events_closed = false;

    loop {
        select! {
            recv(control_rx) -> msg => match msg {
                Ok(ControlMsg::Shutdown) => break,
                Ok(msg) => core.handle_control(msg),
                Err(_) => control_closed = true,
            },
            recv(event_rx) -> msg => match msg {
                Ok(env) => core.handle_event_envelope(env),
                Err(_) => events_closed = true,
            },
            recv(ticker) -> _ => core.on_tick(),
        }
        if control_closed && events_closed {
            break;
        }
    }

    core.drain(&event_rx);
    core.finish();
}

impl Core {
    fn handle_control(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::Register { subscription, reply } => {
                let result = self.register_local(subscription);
                let _ = reply.send(result);
            }
            ControlMsg::Unregister { subscription_id, reply } => {
                let result = self.unregister_local(&subscription_id);
                let _ = reply.send(result);
            }
            ControlMsg::Attach { subscriber_id, queue } => {
                if let Some(old) = self.subscribers.insert(subscriber_id.clone(), queue) {
                    old.close();
                }
                debug!(subscriber_id = %subscriber_id, "egress queue attached");
            }
            ControlMsg::PeerInbound { envelope } => self.handle_peer_inbound(envelope),
            ControlMsg::PeerLink { index, transition } => self.handle_link(index, transition),
            ControlMsg::Shutdown => unreachable!("handled in run_core"),
        }
    }

    fn register_local(&mut self, subscription: Subscription) -> BusResult<String> {
        let id = subscription.subscription_id.clone();
        self.matcher.register(subscription.clone())?;
        self.stats
            .set_active_subscriptions(self.matcher.local_count() as u64);

        // Announce the summary so peers can match events that arrive there.
        let mut summary = subscription;
        summary.home_broker_id = Some(self.cfg.broker_id.clone());
        self.broadcast_to_peers(Payload::Subscribe(summary));
        Ok(id)
    }

    fn unregister_local(&mut self, subscription_id: &str) -> BusResult<()> {
        let removed = self.matcher.unregister(subscription_id)?;
        self.stats
            .set_active_subscriptions(self.matcher.local_count() as u64);
        if removed.home_broker_id.is_none() {
            self.broadcast_to_peers(Payload::Unsubscribe {
                subscription_id: subscription_id.to_string(),
                subscriber_id: removed.subscriber_id,
            });
        }
        Ok(())
    }

    fn handle_event_envelope(&mut self, env: Envelope) {
        let Payload::Event(event) = env.payload else {
            debug!("non-event payload on the event path; dropping");
            return;
        };
        if !self.dedup.insert(&env.message_id) {
            return;
        }
        self.stats.incr_events_ingested();

        let notifications = self.matcher.match_event(&event);
        if !notifications.is_empty() {
            self.stats.incr_events_matched();
        }
        for notification in notifications {
            self.route_notification(notification);
        }
    }

    fn route_notification(&mut self, notification: Notification) {
        let home = self
            .matcher
            .subscription(&notification.subscription_id)
            .and_then(|s| s.home_broker_id.clone());

        match home {
            None => self.deliver_local(notification),
            Some(home_id) if home_id == self.cfg.broker_id => self.deliver_local(notification),
            Some(home_id) => self.forward_to_home(&home_id, notification),
        }
    }

    fn deliver_local(&mut self, notification: Notification) {
        let subscriber_id = notification.subscriber_id.clone();
        match self.subscribers.get(&subscriber_id) {
            Some(queue) => match queue.push(notification, &self.stats) {
                Push::Queued => self.stats.incr_notifications_sent(),
                Push::Dropped => {}
                Push::Closed => {
                    self.subscribers.remove(&subscriber_id);
                    debug!(subscriber_id = %subscriber_id, "dropped closed egress queue");
                }
            },
            None => {
                debug!(subscriber_id = %subscriber_id, "no egress attached; notification dropped");
            }
        }
    }

    fn forward_to_home(&mut self, home_id: &str, notification: Notification) {
        let slot = self
            .peers
            .iter()
            .find(|p| p.remote_id.as_deref() == Some(home_id));
        match slot {
            Some(slot) if slot.state == LinkState::Up => {
                let env = Envelope::new(Payload::Notification(notification));
                if slot.out_tx.try_send(env).is_ok() {
                    self.stats.incr_notifications_sent();
                } else {
                    self.stats.incr_notifications_dropped_overflow();
                }
            }
            _ => {
                // Peer down or unknown: retained summaries keep matching,
                // but deliveries to it are dropped until it comes back.
                self.stats.incr_notifications_dropped_overflow();
                debug!(home = %home_id, "home broker unavailable; notification dropped");
            }
        }
    }

    fn handle_peer_inbound(&mut self, envelope: Envelope) {
        match envelope.payload {
            Payload::Event(_) => {
                // Conforming peers match events locally instead of
                // forwarding them, but an event that does arrive is safe to
                // run through the normal (deduplicated) path.
                self.handle_event_envelope(envelope);
            }
            Payload::Subscribe(sub) => {
                if !self.dedup.insert(&envelope.message_id) {
                    return;
                }
                if sub.home_broker_id.as_deref() == Some(self.cfg.broker_id.as_str()) {
                    return;
                }
                let id = sub.subscription_id.clone();
                // Re-announcements after a reconnect are expected; a
                // duplicate id is not an error here.
                if let Err(err) = self.matcher.register(sub) {
                    debug!(subscription_id = %id, error = %err, "peer summary not registered");
                }
            }
            Payload::Unsubscribe { subscription_id, .. } => {
                if !self.dedup.insert(&envelope.message_id) {
                    return;
                }
                if self.matcher.unregister(&subscription_id).is_ok() {
                    debug!(subscription_id = %subscription_id, "peer summary unregistered");
                }
            }
            Payload::Notification(notification) => {
                if !self.dedup.insert(&envelope.message_id) {
                    return;
                }
                // We are the home broker for this notification; anything
                // else is a routing mistake and is dropped here (never
                // re-forwarded, so a routing loop cannot form).
                let is_home = self
                    .matcher
                    .subscription(&notification.subscription_id)
                    .map(|s| s.home_broker_id.is_none())
                    .unwrap_or(false);
                if is_home {
                    self.deliver_local(notification);
                } else {
                    debug!(subscription_id = %notification.subscription_id, "notification for foreign subscription dropped");
                }
            }
            Payload::Heartbeat(hb) => self.handle_peer_heartbeat(&hb),
            Payload::SubscribeAck(_) => {}
        }
    }

    fn handle_peer_heartbeat(&mut self, hb: &Heartbeat) {
        let Some(slot) = self
            .peers
            .iter_mut()
            .find(|p| p.remote_id.as_deref() == Some(hb.broker_id.as_str()))
        else {
            return;
        };
        slot.last_seen = Some(Instant::now());
        if hb.status == STATUS_SHUTDOWN {
            info!(peer = %hb.broker_id, "peer announced shutdown");
            slot.state = LinkState::Down;
        } else if slot.state == LinkState::Down {
            info!(peer = %hb.broker_id, "peer is back up");
            slot.state = LinkState::Up;
        }
    }

    fn handle_link(&mut self, index: usize, transition: LinkTransition) {
        let Some(slot) = self.peers.get_mut(index) else {
            return;
        };
        match transition {
            LinkTransition::Connecting => {
                if slot.state != LinkState::Closed {
                    slot.state = LinkState::Connecting;
                }
            }
            LinkTransition::Connected { remote_id, reply } => {
                slot.state = LinkState::Up;
                slot.remote_id = Some(remote_id);
                slot.last_seen = Some(Instant::now());
                let summaries: Vec<Subscription> = self
                    .matcher
                    .subscriptions()
                    .into_iter()
                    .filter(|s| s.home_broker_id.is_none())
                    .cloned()
                    .map(|mut s| {
                        s.home_broker_id = Some(self.cfg.broker_id.clone());
                        s
                    })
                    .collect();
                let _ = reply.send(summaries);
            }
            LinkTransition::Lost => {
                if slot.state != LinkState::Closed {
                    slot.state = LinkState::Disconnected;
                }
            }
        }
    }

    fn on_tick(&mut self) {
        // Dead peer detection: three missed heartbeats.
        let timeout = Duration::from_millis(self.cfg.peer_timeout_ms);
        for slot in &mut self.peers {
            if slot.state == LinkState::Up {
                let silent_for = slot.last_seen.map(|t| t.elapsed()).unwrap_or(timeout);
                if silent_for >= timeout {
                    warn!(endpoint = %slot.endpoint, "peer missed heartbeats; marking DOWN");
                    slot.state = LinkState::Down;
                }
            }
        }

        let up = self.peers.iter().filter(|p| p.state == LinkState::Up).count();
        let down = self.peers.iter().filter(|p| p.state == LinkState::Down).count();
        self.stats.set_peer_gauges(up as u64, down as u64);

        // Reap egress queues whose writer died.
        self.subscribers.retain(|_, queue| !queue.is_closed());

        if self.last_heartbeat.elapsed() >= Duration::from_millis(self.cfg.heartbeat_interval_ms) {
            self.last_heartbeat = Instant::now();
            self.send_heartbeats(STATUS_UP);
        }
    }

    fn send_heartbeats(&self, status: &str) {
        for slot in &self.peers {
            if slot.state == LinkState::Closed {
                continue;
            }
            let env = Envelope::new(Payload::Heartbeat(Heartbeat {
                broker_id: self.cfg.broker_id.clone(),
                status: status.to_string(),
                active_subscriptions: self.matcher.local_count() as i64,
                processed_events: self.stats.events_ingested() as i64,
            }));
            let _ = slot.out_tx.try_send(env);
        }
    }

    fn broadcast_to_peers(&self, payload: Payload) {
        for slot in &self.peers {
            if slot.state == LinkState::Closed {
                continue;
            }
            let env = Envelope::new(payload.clone());
            if slot.out_tx.try_send(env).is_err() {
                debug!(endpoint = %slot.endpoint, "peer outbound queue full; announcement dropped");
            }
        }
    }

    /// Processes already-queued events, bounded by the drain deadline.
    fn drain(&mut self, event_rx: &Receiver<Envelope>) {
        let deadline = Instant::now() + DRAIN_DEADLINE;
        while Instant::now() < deadline {
            match event_rx.try_recv() {
                Ok(env) => self.handle_event_envelope(env),
                Err(_) => break,
            }
        }
    }

    fn finish(&mut self) {
        self.send_heartbeats(STATUS_SHUTDOWN);
        for slot in &mut self.peers {
            slot.state = LinkState::Closed;
        }
        for queue in self.subscribers.values() {
            queue.close();
        }
        info!(broker_id = %self.cfg.broker_id, "broker core stopped");
    }
}
