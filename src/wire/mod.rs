//! Wire codec: protobuf-schema messages and the framed envelope.
//!
//! Domain types never cross a socket directly; they are converted to the
//! [`pb`] messages (whose field numbers are the wire contract) and framed
//! with a 32-bit big-endian length prefix. Decoding is tolerant of unknown
//! fields and strict about everything else: a missing oneof payload or an
//! out-of-range enum discards the message.

use prost::Message as _;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusResult, WireError};
use crate::event::{now_ms, Event, EventBody};
use crate::notification::{Notification, NotificationBody};
use crate::subscription::{
    Aggregation, ComparisonOperator, FilterCondition, Subscription, SubscriptionKind, WindowSpec,
};

pub mod frame;
pub mod pb;

/// Heartbeat status while a broker is serving.
pub const STATUS_UP: &str = "UP";
/// Heartbeat status sent once during orderly shutdown.
pub const STATUS_SHUTDOWN: &str = "SHUTDOWN";

/// Periodic liveness report exchanged between peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Reporting broker.
    pub broker_id: String,
    /// `UP` or `SHUTDOWN`.
    pub status: String,
    /// Locally homed subscriptions.
    pub active_subscriptions: i64,
    /// Events ingested since start.
    pub processed_events: i64,
}

/// Synchronous management reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAck {
    /// The registered (or unregistered) subscription id.
    pub subscription_id: String,
    /// Whether the request was accepted.
    pub ok: bool,
    /// Rejection reason when `ok` is false.
    pub error: String,
}

/// Decoded envelope payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A published event.
    Event(Event),
    /// A registration request or peer summary announcement.
    Subscribe(Subscription),
    /// An unregistration request or announcement.
    Unsubscribe {
        /// Subscription to remove.
        subscription_id: String,
        /// Requesting subscriber.
        subscriber_id: String,
    },
    /// A match result.
    Notification(Notification),
    /// Peer liveness.
    Heartbeat(Heartbeat),
    /// Management reply.
    SubscribeAck(SubscribeAck),
}

/// A framed message with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Unique per message; the duplicate-suppression key.
    pub message_id: String,
    /// Milliseconds since epoch at send.
    pub timestamp: i64,
    /// The payload.
    pub payload: Payload,
}

impl Envelope {
    /// Wraps a payload with a fresh message id and the current time.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            payload,
        }
    }

    /// Encodes to protobuf bytes (unframed).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        pb::BrokerMessage::from(self).encode_to_vec()
    }

    /// Decodes from protobuf bytes (unframed).
    pub fn decode(bytes: &[u8]) -> BusResult<Self> {
        let msg = pb::BrokerMessage::decode(bytes).map_err(WireError::from)?;
        Self::try_from(msg)
    }
}

// ---------------------------------------------------------------------------
// domain -> wire
// ---------------------------------------------------------------------------

impl From<&ComparisonOperator> for pb::ComparisonOperator {
    fn from(op: &ComparisonOperator) -> Self {
        match op {
            ComparisonOperator::Eq => Self::Eq,
            ComparisonOperator::Ne => Self::Ne,
            ComparisonOperator::Gt => Self::Gt,
            ComparisonOperator::Ge => Self::Ge,
            ComparisonOperator::Lt => Self::Lt,
            ComparisonOperator::Le => Self::Le,
        }
    }
}

impl From<&FilterCondition> for pb::FilterCondition {
    fn from(c: &FilterCondition) -> Self {
        Self {
            field_name: c.field_name.clone(),
            operator: pb::ComparisonOperator::from(&c.operator) as i32,
            value: c.value.clone(),
            is_windowed: c.is_windowed,
        }
    }
}

impl From<&Event> for pb::Event {
    fn from(ev: &Event) -> Self {
        let (event_type, payload) = match &ev.body {
            EventBody::Purchase {
                user_id,
                product_id,
                category,
                price,
                quantity,
                warehouse_id,
            } => (
                pb::EventType::Purchase,
                pb::event::Payload::Purchase(pb::Purchase {
                    user_id: user_id.clone(),
                    product_id: product_id.clone(),
                    category: category.clone(),
                    price: *price,
                    quantity: *quantity,
                    warehouse_id: warehouse_id.clone(),
                }),
            ),
            EventBody::ProductView {
                user_id,
                product_id,
                category,
                view_duration,
                source,
            } => (
                pb::EventType::ProductView,
                pb::event::Payload::ProductView(pb::ProductView {
                    user_id: user_id.clone(),
                    product_id: product_id.clone(),
                    category: category.clone(),
                    view_duration: *view_duration,
                    source: source.clone(),
                }),
            ),
            EventBody::InventoryUpdate {
                product_id,
                category,
                stock_level,
                warehouse_id,
                operation,
            } => (
                pb::EventType::InventoryUpdate,
                pb::event::Payload::InventoryUpdate(pb::InventoryUpdate {
                    product_id: product_id.clone(),
                    category: category.clone(),
                    stock_level: *stock_level,
                    warehouse_id: warehouse_id.clone(),
                    operation: operation.clone(),
                }),
            ),
            EventBody::UserRating {
                user_id,
                product_id,
                category,
                rating,
                review_text,
            } => (
                pb::EventType::UserRating,
                pb::event::Payload::UserRating(pb::UserRating {
                    user_id: user_id.clone(),
                    product_id: product_id.clone(),
                    category: category.clone(),
                    rating: *rating,
                    review_text: review_text.clone(),
                }),
            ),
        };
        Self {
            event_id: ev.event_id.clone(),
            timestamp: ev.timestamp,
            event_type: event_type as i32,
            payload: Some(payload),
        }
    }
}

impl From<&Subscription> for pb::Subscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.subscription_id.clone(),
            subscriber_id: sub.subscriber_id.clone(),
            r#type: match sub.kind {
                SubscriptionKind::Simple => pb::SubscriptionType::Simple as i32,
                SubscriptionKind::Complex => pb::SubscriptionType::Complex as i32,
            },
            conditions: sub.conditions.iter().map(pb::FilterCondition::from).collect(),
            window_config: sub.window.map(|w| pb::WindowConfig {
                window_size: w.window_size as i32,
                aggregation_type: w.aggregation.as_str().to_string(),
            }),
            action: pb::SubscriptionAction::Register as i32,
            home_broker_id: sub.home_broker_id.clone().unwrap_or_default(),
        }
    }
}

impl From<&Notification> for pb::Notification {
    fn from(n: &Notification) -> Self {
        let payload = match &n.body {
            NotificationBody::Simple { event } => {
                pb::notification::Payload::Simple(pb::SimpleNotification {
                    matched_event: Some(pb::Event::from(event)),
                })
            }
            NotificationBody::Complex {
                category,
                field_name,
                aggregated_value,
                window_size,
                condition_met,
            } => pb::notification::Payload::Complex(pb::ComplexNotification {
                category: category.clone(),
                field_name: field_name.clone(),
                aggregated_value: *aggregated_value,
                window_size: *window_size as i32,
                condition_met: *condition_met,
            }),
        };
        Self {
            notification_id: n.notification_id.clone(),
            subscription_id: n.subscription_id.clone(),
            subscriber_id: n.subscriber_id.clone(),
            timestamp: n.timestamp,
            payload: Some(payload),
        }
    }
}

impl From<&Envelope> for pb::BrokerMessage {
    fn from(env: &Envelope) -> Self {
        let (r#type, body) = match &env.payload {
            Payload::Event(ev) => (
                pb::MessageType::Event,
                pb::broker_message::Body::Event(pb::Event::from(ev)),
            ),
            Payload::Subscribe(sub) => (
                pb::MessageType::Subscription,
                pb::broker_message::Body::Subscription(pb::Subscription::from(sub)),
            ),
            Payload::Unsubscribe {
                subscription_id,
                subscriber_id,
            } => (
                pb::MessageType::Subscription,
                pb::broker_message::Body::Subscription(pb::Subscription {
                    subscription_id: subscription_id.clone(),
                    subscriber_id: subscriber_id.clone(),
                    action: pb::SubscriptionAction::Unregister as i32,
                    ..Default::default()
                }),
            ),
            Payload::Notification(n) => (
                pb::MessageType::Notification,
                pb::broker_message::Body::Notification(pb::Notification::from(n)),
            ),
            Payload::Heartbeat(hb) => (
                pb::MessageType::Heartbeat,
                pb::broker_message::Body::Heartbeat(pb::BrokerHeartbeat {
                    broker_id: hb.broker_id.clone(),
                    status: hb.status.clone(),
                    active_subscriptions: hb.active_subscriptions,
                    processed_events: hb.processed_events,
                }),
            ),
            Payload::SubscribeAck(ack) => (
                pb::MessageType::Subscription,
                pb::broker_message::Body::SubscribeAck(pb::SubscribeAck {
                    subscription_id: ack.subscription_id.clone(),
                    ok: ack.ok,
                    error: ack.error.clone(),
                }),
            ),
        };
        Self {
            message_id: env.message_id.clone(),
            timestamp: env.timestamp,
            r#type: r#type as i32,
            body: Some(body),
        }
    }
}

// ---------------------------------------------------------------------------
// wire -> domain
// ---------------------------------------------------------------------------

fn operator_from_wire(raw: i32) -> Result<ComparisonOperator, WireError> {
    let op = pb::ComparisonOperator::try_from(raw).map_err(|_| WireError::UnknownEnumValue {
        field: "FilterCondition.operator",
        value: raw,
    })?;
    Ok(match op {
        pb::ComparisonOperator::Eq => ComparisonOperator::Eq,
        pb::ComparisonOperator::Ne => ComparisonOperator::Ne,
        pb::ComparisonOperator::Gt => ComparisonOperator::Gt,
        pb::ComparisonOperator::Ge => ComparisonOperator::Ge,
        pb::ComparisonOperator::Lt => ComparisonOperator::Lt,
        pb::ComparisonOperator::Le => ComparisonOperator::Le,
    })
}

impl TryFrom<pb::Event> for Event {
    type Error = crate::error::BusError;

    fn try_from(ev: pb::Event) -> BusResult<Self> {
        let payload = ev.payload.ok_or(WireError::MissingPayload {
            message_id: ev.event_id.clone(),
        })?;
        let body = match payload {
            pb::event::Payload::Purchase(p) => EventBody::Purchase {
                user_id: p.user_id,
                product_id: p.product_id,
                category: p.category,
                price: p.price,
                quantity: p.quantity,
                warehouse_id: p.warehouse_id,
            },
            pb::event::Payload::ProductView(p) => EventBody::ProductView {
                user_id: p.user_id,
                product_id: p.product_id,
                category: p.category,
                view_duration: p.view_duration,
                source: p.source,
            },
            pb::event::Payload::InventoryUpdate(p) => EventBody::InventoryUpdate {
                product_id: p.product_id,
                category: p.category,
                stock_level: p.stock_level,
                warehouse_id: p.warehouse_id,
                operation: p.operation,
            },
            pb::event::Payload::UserRating(p) => EventBody::UserRating {
                user_id: p.user_id,
                product_id: p.product_id,
                category: p.category,
                rating: p.rating,
                review_text: p.review_text,
            },
        };
        Ok(Self {
            event_id: ev.event_id,
            timestamp: ev.timestamp,
            body,
        })
    }
}

impl TryFrom<pb::Subscription> for Subscription {
    type Error = crate::error::BusError;

    fn try_from(sub: pb::Subscription) -> BusResult<Self> {
        let kind = match pb::SubscriptionType::try_from(sub.r#type) {
            Ok(pb::SubscriptionType::Simple) => SubscriptionKind::Simple,
            Ok(pb::SubscriptionType::Complex) => SubscriptionKind::Complex,
            Err(_) => {
                return Err(WireError::UnknownEnumValue {
                    field: "Subscription.type",
                    value: sub.r#type,
                }
                .into())
            }
        };

        let mut conditions = Vec::with_capacity(sub.conditions.len());
        for c in sub.conditions {
            conditions.push(FilterCondition {
                field_name: c.field_name,
                operator: operator_from_wire(c.operator)?,
                value: c.value,
                is_windowed: c.is_windowed,
            });
        }

        let window = match sub.window_config {
            Some(w) => Some(WindowSpec {
                window_size: w.window_size.max(0) as usize,
                aggregation: Aggregation::parse(&w.aggregation_type)?,
            }),
            None => None,
        };

        Ok(Self {
            subscription_id: sub.subscription_id,
            subscriber_id: sub.subscriber_id,
            kind,
            conditions,
            window,
            home_broker_id: if sub.home_broker_id.is_empty() {
                None
            } else {
                Some(sub.home_broker_id)
            },
        })
    }
}

impl TryFrom<pb::Notification> for Notification {
    type Error = crate::error::BusError;

    fn try_from(n: pb::Notification) -> BusResult<Self> {
        let payload = n.payload.ok_or(WireError::MissingPayload {
            message_id: n.notification_id.clone(),
        })?;
        let body = match payload {
            pb::notification::Payload::Simple(s) => {
                let event = s.matched_event.ok_or(WireError::MissingPayload {
                    message_id: n.notification_id.clone(),
                })?;
                NotificationBody::Simple {
                    event: Event::try_from(event)?,
                }
            }
            pb::notification::Payload::Complex(c) => NotificationBody::Complex {
                category: c.category,
                field_name: c.field_name,
                aggregated_value: c.aggregated_value,
                window_size: c.window_size.max(0) as usize,
                condition_met: c.condition_met,
            },
        };
        Ok(Self {
            notification_id: n.notification_id,
            subscription_id: n.subscription_id,
            subscriber_id: n.subscriber_id,
            timestamp: n.timestamp,
            body,
        })
    }
}

impl TryFrom<pb::BrokerMessage> for Envelope {
    type Error = crate::error::BusError;

    fn try_from(msg: pb::BrokerMessage) -> BusResult<Self> {
        let body = msg.body.ok_or(WireError::MissingPayload {
            message_id: msg.message_id.clone(),
        })?;
        let payload = match body {
            pb::broker_message::Body::Event(ev) => Payload::Event(Event::try_from(ev)?),
            pb::broker_message::Body::Subscription(sub) => {
                match pb::SubscriptionAction::try_from(sub.action) {
                    Ok(pb::SubscriptionAction::Unregister) => Payload::Unsubscribe {
                        subscription_id: sub.subscription_id,
                        subscriber_id: sub.subscriber_id,
                    },
                    // Unknown action values decode as register so that newer
                    // peers degrade to the default rather than dropping.
                    _ => Payload::Subscribe(Subscription::try_from(sub)?),
                }
            }
            pb::broker_message::Body::Notification(n) => {
                Payload::Notification(Notification::try_from(n)?)
            }
            pb::broker_message::Body::Heartbeat(hb) => Payload::Heartbeat(Heartbeat {
                broker_id: hb.broker_id,
                status: hb.status,
                active_subscriptions: hb.active_subscriptions,
                processed_events: hb.processed_events,
            }),
            pb::broker_message::Body::SubscribeAck(ack) => Payload::SubscribeAck(SubscribeAck {
                subscription_id: ack.subscription_id,
                ok: ack.ok,
                error: ack.error,
            }),
        };
        Ok(Self {
            message_id: msg.message_id,
            timestamp: msg.timestamp,
            payload,
        })
    }
}
