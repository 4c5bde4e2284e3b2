//! Notifications emitted to subscribers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{now_ms, Event};
use crate::subscription::Subscription;

/// Notification payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationBody {
    /// A single event matched a simple subscription.
    Simple {
        /// The matched event, carried by value.
        event: Event,
    },

    /// A tumbling window closed and its aggregate satisfied the condition.
    Complex {
        /// Category of the events that filled the window.
        category: String,
        /// Condition field name as registered (e.g. "avg_rating").
        field_name: String,
        /// The aggregate computed on close.
        aggregated_value: f64,
        /// Window size the aggregate was computed over.
        window_size: usize,
        /// Always true; complex notifications are only emitted on a
        /// satisfied condition.
        condition_met: bool,
    },
}

/// A notification bound for one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Fresh unique id per emission.
    pub notification_id: String,
    /// Subscription that matched.
    pub subscription_id: String,
    /// Subscriber to deliver to.
    pub subscriber_id: String,
    /// Milliseconds since epoch at emission; subscribers derive latency
    /// from it.
    pub timestamp: i64,
    /// Simple or complex payload.
    pub body: NotificationBody,
}

impl Notification {
    /// Builds a simple notification for a matched event.
    #[must_use]
    pub fn simple(subscription: &Subscription, event: Event) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            subscription_id: subscription.subscription_id.clone(),
            subscriber_id: subscription.subscriber_id.clone(),
            timestamp: now_ms(),
            body: NotificationBody::Simple { event },
        }
    }

    /// Builds a complex notification for a closed, satisfied window.
    #[must_use]
    pub fn complex(
        subscription: &Subscription,
        category: &str,
        field_name: &str,
        aggregated_value: f64,
        window_size: usize,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4().to_string(),
            subscription_id: subscription.subscription_id.clone(),
            subscriber_id: subscription.subscriber_id.clone(),
            timestamp: now_ms(),
            body: NotificationBody::Complex {
                category: category.to_string(),
                field_name: field_name.to_string(),
                aggregated_value,
                window_size,
                condition_met: true,
            },
        }
    }

    /// The matched event, for simple notifications.
    #[must_use]
    pub const fn matched_event(&self) -> Option<&Event> {
        match &self.body {
            NotificationBody::Simple { event } => Some(event),
            NotificationBody::Complex { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::subscription::{ComparisonOperator, FilterCondition};

    #[test]
    fn simple_notification_references_the_event() {
        let sub = Subscription::simple(
            "s1",
            "c1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Books")],
        );
        let event = Event::new(EventBody::ProductView {
            user_id: "u".into(),
            product_id: "p".into(),
            category: "Books".into(),
            view_duration: 12,
            source: "search".into(),
        });
        let event_id = event.event_id.clone();

        let n = Notification::simple(&sub, event);
        assert_eq!(n.subscription_id, "s1");
        assert_eq!(n.subscriber_id, "c1");
        assert_eq!(n.matched_event().unwrap().event_id, event_id);
    }

    #[test]
    fn emissions_get_fresh_notification_ids() {
        let sub = Subscription::simple(
            "s1",
            "c1",
            vec![FilterCondition::simple("category", ComparisonOperator::Eq, "Books")],
        );
        let a = Notification::complex(&sub, "Books", "avg_rating", 4.2, 3);
        let b = Notification::complex(&sub, "Books", "avg_rating", 4.2, 3);
        assert_ne!(a.notification_id, b.notification_id);
        assert!(matches!(
            a.body,
            NotificationBody::Complex { condition_met: true, .. }
        ));
    }
}
