//! Publisher and subscriber clients.

pub mod publisher;
pub mod subscriber;

pub use publisher::{EventSource, Publisher};
pub use subscriber::{Subscriber, SubscriberSnapshot};
