//! Wire message definitions.
//!
//! Field numbers are load-bearing: they are the on-the-wire contract and
//! must not be renumbered. Messages are derived by hand instead of being
//! generated from a .proto so the numbering is explicit in source; prost's
//! decoder skips unknown tags, which keeps minor versions wire-compatible
//! in both directions.

/// Envelope for every exchange between nodes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BrokerMessage {
    #[prost(string, tag = "1")]
    pub message_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(enumeration = "MessageType", tag = "3")]
    pub r#type: i32,
    #[prost(oneof = "broker_message::Body", tags = "4, 5, 6, 7, 8")]
    pub body: Option<broker_message::Body>,
}

/// Nested types for [`BrokerMessage`].
pub mod broker_message {
    /// The envelope payload.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "4")]
        Event(super::Event),
        #[prost(message, tag = "5")]
        Subscription(super::Subscription),
        #[prost(message, tag = "6")]
        Notification(super::Notification),
        #[prost(message, tag = "7")]
        Heartbeat(super::BrokerHeartbeat),
        /// Management reply. Additive field; older decoders skip it.
        #[prost(message, tag = "8")]
        SubscribeAck(super::SubscribeAck),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    Event = 0,
    Subscription = 1,
    Notification = 2,
    Heartbeat = 3,
}

/// A published event.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub event_id: String,
    #[prost(int64, tag = "2")]
    pub timestamp: i64,
    #[prost(enumeration = "EventType", tag = "3")]
    pub event_type: i32,
    #[prost(oneof = "event::Payload", tags = "4, 5, 6, 7")]
    pub payload: Option<event::Payload>,
}

/// Nested types for [`Event`].
pub mod event {
    /// The event payload.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "4")]
        Purchase(super::Purchase),
        #[prost(message, tag = "5")]
        ProductView(super::ProductView),
        #[prost(message, tag = "6")]
        InventoryUpdate(super::InventoryUpdate),
        #[prost(message, tag = "7")]
        UserRating(super::UserRating),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum EventType {
    Purchase = 0,
    ProductView = 1,
    InventoryUpdate = 2,
    UserRating = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Purchase {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub product_id: String,
    #[prost(string, tag = "3")]
    pub category: String,
    #[prost(double, tag = "4")]
    pub price: f64,
    #[prost(int32, tag = "5")]
    pub quantity: i32,
    #[prost(string, tag = "6")]
    pub warehouse_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProductView {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub product_id: String,
    #[prost(string, tag = "3")]
    pub category: String,
    #[prost(int32, tag = "4")]
    pub view_duration: i32,
    #[prost(string, tag = "5")]
    pub source: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InventoryUpdate {
    #[prost(string, tag = "1")]
    pub product_id: String,
    #[prost(string, tag = "2")]
    pub category: String,
    #[prost(int32, tag = "3")]
    pub stock_level: i32,
    #[prost(string, tag = "4")]
    pub warehouse_id: String,
    #[prost(string, tag = "5")]
    pub operation: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserRating {
    #[prost(string, tag = "1")]
    pub user_id: String,
    #[prost(string, tag = "2")]
    pub product_id: String,
    #[prost(string, tag = "3")]
    pub category: String,
    #[prost(double, tag = "4")]
    pub rating: f64,
    #[prost(string, tag = "5")]
    pub review_text: String,
}

/// A subscription, also used for peer summary announcements (fields 6 and 7
/// are additive extensions).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscription {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    #[prost(string, tag = "2")]
    pub subscriber_id: String,
    #[prost(enumeration = "SubscriptionType", tag = "3")]
    pub r#type: i32,
    #[prost(message, repeated, tag = "4")]
    pub conditions: Vec<FilterCondition>,
    #[prost(message, optional, tag = "5")]
    pub window_config: Option<WindowConfig>,
    /// Register (default) or unregister. Additive field.
    #[prost(enumeration = "SubscriptionAction", tag = "6")]
    pub action: i32,
    /// Broker the subscription is homed at. Additive field, set on peer
    /// announcements only.
    #[prost(string, tag = "7")]
    pub home_broker_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionType {
    Simple = 0,
    Complex = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum SubscriptionAction {
    Register = 0,
    Unregister = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FilterCondition {
    #[prost(string, tag = "1")]
    pub field_name: String,
    #[prost(enumeration = "ComparisonOperator", tag = "2")]
    pub operator: i32,
    #[prost(string, tag = "3")]
    pub value: String,
    #[prost(bool, tag = "4")]
    pub is_windowed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ComparisonOperator {
    Eq = 0,
    Ne = 1,
    Gt = 2,
    Ge = 3,
    Lt = 4,
    Le = 5,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WindowConfig {
    #[prost(int32, tag = "1")]
    pub window_size: i32,
    #[prost(string, tag = "2")]
    pub aggregation_type: String,
}

/// A match result bound for one subscriber.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Notification {
    #[prost(string, tag = "1")]
    pub notification_id: String,
    #[prost(string, tag = "2")]
    pub subscription_id: String,
    #[prost(string, tag = "3")]
    pub subscriber_id: String,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(oneof = "notification::Payload", tags = "5, 6")]
    pub payload: Option<notification::Payload>,
}

/// Nested types for [`Notification`].
pub mod notification {
    /// The notification payload.
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "5")]
        Simple(super::SimpleNotification),
        #[prost(message, tag = "6")]
        Complex(super::ComplexNotification),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SimpleNotification {
    #[prost(message, optional, tag = "1")]
    pub matched_event: Option<Event>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ComplexNotification {
    #[prost(string, tag = "1")]
    pub category: String,
    #[prost(string, tag = "2")]
    pub field_name: String,
    #[prost(double, tag = "3")]
    pub aggregated_value: f64,
    #[prost(int32, tag = "4")]
    pub window_size: i32,
    #[prost(bool, tag = "5")]
    pub condition_met: bool,
}

/// Periodic broker liveness report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BrokerHeartbeat {
    #[prost(string, tag = "1")]
    pub broker_id: String,
    #[prost(string, tag = "2")]
    pub status: String,
    #[prost(int64, tag = "3")]
    pub active_subscriptions: i64,
    #[prost(int64, tag = "4")]
    pub processed_events: i64,
}

/// Synchronous management reply. Additive envelope field.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscribeAck {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    #[prost(bool, tag = "2")]
    pub ok: bool,
    #[prost(string, tag = "3")]
    pub error: String,
}
