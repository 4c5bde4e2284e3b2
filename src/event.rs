//! Event types routed through the bus.
//!
//! An [`Event`] carries exactly one payload variant; the enum makes the
//! invariant structural. Filter conditions reach into payloads through a
//! closed field registry ([`Event::field`]) keyed on (variant, field name):
//! unknown names resolve to `None` and the condition evaluates false, so a
//! typo in a subscription can never fail an event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A typed value extracted from an event payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    /// String-typed field; supports equality operators only.
    Str(&'a str),
    /// Integer-typed field; compared in f64.
    Int(i64),
    /// Float-typed field.
    Float(f64),
}

impl FieldValue<'_> {
    /// Numeric view of the value, if it has one.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// String view of the value, if it has one.
    #[must_use]
    pub const fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// The payload variants an event can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    /// A completed purchase.
    Purchase {
        user_id: String,
        product_id: String,
        category: String,
        price: f64,
        quantity: i32,
        warehouse_id: String,
    },

    /// A product page view.
    ProductView {
        user_id: String,
        product_id: String,
        category: String,
        view_duration: i32,
        source: String,
    },

    /// A warehouse stock change.
    InventoryUpdate {
        product_id: String,
        category: String,
        stock_level: i32,
        warehouse_id: String,
        operation: String,
    },

    /// A user review with a rating in [1, 5].
    UserRating {
        user_id: String,
        product_id: String,
        category: String,
        rating: f64,
        review_text: String,
    },
}

/// An immutable event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub event_id: String,
    /// Milliseconds since epoch, stamped by the publisher at send.
    pub timestamp: i64,
    /// The single payload.
    pub body: EventBody,
}

impl Event {
    /// Creates an event with a fresh id and the current timestamp.
    #[must_use]
    pub fn new(body: EventBody) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            body,
        }
    }

    /// The event category. Present in every payload variant.
    #[must_use]
    pub fn category(&self) -> &str {
        match &self.body {
            EventBody::Purchase { category, .. }
            | EventBody::ProductView { category, .. }
            | EventBody::InventoryUpdate { category, .. }
            | EventBody::UserRating { category, .. } => category,
        }
    }

    /// Resolves a field by name against this event's variant.
    ///
    /// The registry is closed: only the fields declared on the variant are
    /// addressable, and each carries its declared type. Names absent from
    /// the variant return `None`.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<FieldValue<'_>> {
        use FieldValue::{Float, Int, Str};
        match &self.body {
            EventBody::Purchase {
                user_id,
                product_id,
                category,
                price,
                quantity,
                warehouse_id,
            } => match name {
                "user_id" => Some(Str(user_id)),
                "product_id" => Some(Str(product_id)),
                "category" => Some(Str(category)),
                "price" => Some(Float(*price)),
                "quantity" => Some(Int(i64::from(*quantity))),
                "warehouse_id" => Some(Str(warehouse_id)),
                _ => None,
            },
            EventBody::ProductView {
                user_id,
                product_id,
                category,
                view_duration,
                source,
            } => match name {
                "user_id" => Some(Str(user_id)),
                "product_id" => Some(Str(product_id)),
                "category" => Some(Str(category)),
                "view_duration" => Some(Int(i64::from(*view_duration))),
                "source" => Some(Str(source)),
                _ => None,
            },
            EventBody::InventoryUpdate {
                product_id,
                category,
                stock_level,
                warehouse_id,
                operation,
            } => match name {
                "product_id" => Some(Str(product_id)),
                "category" => Some(Str(category)),
                "stock_level" => Some(Int(i64::from(*stock_level))),
                "warehouse_id" => Some(Str(warehouse_id)),
                "operation" => Some(Str(operation)),
                _ => None,
            },
            EventBody::UserRating {
                user_id,
                product_id,
                category,
                rating,
                review_text,
            } => match name {
                "user_id" => Some(Str(user_id)),
                "product_id" => Some(Str(product_id)),
                "category" => Some(Str(category)),
                "rating" => Some(Float(*rating)),
                "review_text" => Some(Str(review_text)),
                _ => None,
            },
        }
    }

    /// Short name of the payload variant, used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match &self.body {
            EventBody::Purchase { .. } => "purchase",
            EventBody::ProductView { .. } => "product_view",
            EventBody::InventoryUpdate { .. } => "inventory_update",
            EventBody::UserRating { .. } => "user_rating",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn purchase(category: &str, price: f64) -> Event {
        Event::new(EventBody::Purchase {
            user_id: "u-1".to_string(),
            product_id: "p-1".to_string(),
            category: category.to_string(),
            price,
            quantity: 2,
            warehouse_id: "w-1".to_string(),
        })
    }

    #[test]
    fn category_is_extractable_from_every_variant() {
        let events = [
            purchase("Electronics", 10.0),
            Event::new(EventBody::ProductView {
                user_id: "u".into(),
                product_id: "p".into(),
                category: "Books".into(),
                view_duration: 30,
                source: "search".into(),
            }),
            Event::new(EventBody::InventoryUpdate {
                product_id: "p".into(),
                category: "Home".into(),
                stock_level: 4,
                warehouse_id: "w".into(),
                operation: "restock".into(),
            }),
            Event::new(EventBody::UserRating {
                user_id: "u".into(),
                product_id: "p".into(),
                category: "Sports".into(),
                rating: 4.5,
                review_text: "ok".into(),
            }),
        ];
        let categories: Vec<&str> = events.iter().map(Event::category).collect();
        assert_eq!(categories, ["Electronics", "Books", "Home", "Sports"]);
    }

    #[test]
    fn field_registry_is_typed() {
        let ev = purchase("Electronics", 99.5);
        assert_eq!(ev.field("price"), Some(FieldValue::Float(99.5)));
        assert_eq!(ev.field("quantity"), Some(FieldValue::Int(2)));
        assert_eq!(ev.field("category"), Some(FieldValue::Str("Electronics")));
        assert_eq!(ev.field("price").unwrap().as_f64(), Some(99.5));
        assert_eq!(ev.field("quantity").unwrap().as_f64(), Some(2.0));
        assert_eq!(ev.field("category").unwrap().as_f64(), None);
    }

    #[test]
    fn unknown_field_resolves_to_none() {
        let ev = purchase("Electronics", 1.0);
        assert!(ev.field("rating").is_none());
        assert!(ev.field("no_such_field").is_none());
    }

    #[test]
    fn events_get_unique_ids() {
        let a = purchase("Books", 1.0);
        let b = purchase("Books", 1.0);
        assert_ne!(a.event_id, b.event_id);
    }
}
