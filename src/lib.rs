//! # marketbus - content-based pub/sub for e-commerce events
//!
//! marketbus routes typed events (purchases, product views, inventory
//! updates, user ratings) from publishers to subscribers by evaluating
//! per-subscription predicates, including windowed predicates that
//! aggregate a tumbling stream of numeric observations. Two or three
//! brokers form a peer overlay: subscriptions registered anywhere are
//! announced everywhere, events are matched where they arrive, and
//! notifications are routed back to the subscription's home broker.
//!
//! ## Core pieces
//!
//! - **Matcher**: indexes subscriptions by pinned category plus a wildcard
//!   bucket and evaluates events in registration order
//! - **Window manager**: per-(subscription, category, field) tumbling
//!   windows with avg/max/min/sum/count aggregates
//! - **Broker**: TCP endpoints for publishers, subscribers, management,
//!   and peers, all funneling into one single-writer core task
//! - **Wire codec**: field-tagged, varint-encoded messages framed with a
//!   big-endian length prefix, tolerant of unknown fields
//!
//! ## Usage
//!
//! ```rust,ignore
//! use marketbus::{Broker, BrokerConfig, Publisher, Subscriber};
//! use marketbus::{ComparisonOperator, FilterCondition, Subscription};
//!
//! let broker = Broker::start(BrokerConfig::default())?;
//!
//! let subscriber = Subscriber::connect(
//!     broker.addrs().management,
//!     broker.addrs().subscriber,
//!     "client-1",
//! )?;
//! subscriber.subscribe(Subscription::simple(
//!     "",
//!     "client-1",
//!     vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Electronics")],
//! ))?;
//!
//! let mut publisher = Publisher::connect(broker.addrs().publisher)?;
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod generate;
pub mod matcher;
pub mod notification;
pub mod stats;
pub mod subscription;
pub mod window;
pub mod wire;

// Re-export primary types at crate root for convenience
pub use broker::{Broker, BrokerAddrs, LinkState};
pub use client::{EventSource, Publisher, Subscriber, SubscriberSnapshot};
pub use config::BrokerConfig;
pub use dedup::DedupCache;
pub use error::{BusError, BusResult, ExecutionError, TransportError, ValidationError, WireError};
pub use event::{now_ms, Event, EventBody, FieldValue};
pub use generate::RandomEventSource;
pub use matcher::SubscriptionMatcher;
pub use notification::{Notification, NotificationBody};
pub use stats::{BrokerStats, StatsSnapshot};
pub use subscription::{
    Aggregation, ComparisonOperator, FilterCondition, Subscription, SubscriptionKind, WindowSpec,
};
pub use window::WindowManager;
pub use wire::{Envelope, Heartbeat, Payload, SubscribeAck, STATUS_SHUTDOWN, STATUS_UP};
