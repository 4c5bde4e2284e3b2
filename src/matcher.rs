//! Content-based subscription matching.
//!
//! The matcher owns the subscription index and all window state. It is
//! synchronous and non-blocking; the broker funnels every event through a
//! single matcher task, which keeps the index single-writer without locks.
//!
//! Indexing: subscriptions that pin a category with an `EQ` predicate live
//! in a per-category bucket; everything else is a wildcard. Candidates for
//! an event are the event's category bucket plus the wildcards, evaluated
//! in registration order.

use std::collections::{HashMap, HashSet};

use crate::error::{BusResult, ExecutionError};
use crate::event::Event;
use crate::notification::Notification;
use crate::subscription::{FilterCondition, Subscription};
use crate::window::WindowManager;

#[derive(Debug)]
struct Registered {
    seq: u64,
    subscription: Subscription,
}

/// Indexes subscriptions and evaluates events against them.
#[derive(Debug, Default)]
pub struct SubscriptionMatcher {
    subs: HashMap<String, Registered>,
    by_category: HashMap<String, HashSet<String>>,
    wildcard: HashSet<String>,
    windows: WindowManager,
    next_seq: u64,
}

impl SubscriptionMatcher {
    /// Creates an empty matcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscription.
    ///
    /// Rejects invalid subscriptions (see [`Subscription::validate`]) and
    /// duplicate ids.
    pub fn register(&mut self, subscription: Subscription) -> BusResult<()> {
        subscription.validate()?;
        if self.subs.contains_key(&subscription.subscription_id) {
            return Err(ExecutionError::DuplicateSubscription {
                subscription_id: subscription.subscription_id,
            }
            .into());
        }

        let id = subscription.subscription_id.clone();
        match subscription.pinned_category() {
            Some(category) => {
                self.by_category
                    .entry(category.to_string())
                    .or_default()
                    .insert(id.clone());
            }
            None => {
                self.wildcard.insert(id.clone());
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.subs.insert(id, Registered { seq, subscription });
        Ok(())
    }

    /// Unregisters a subscription, returning it. Its windows are destroyed
    /// with it.
    pub fn unregister(&mut self, subscription_id: &str) -> BusResult<Subscription> {
        let Some(entry) = self.subs.remove(subscription_id) else {
            return Err(ExecutionError::SubscriptionNotFound {
                subscription_id: subscription_id.to_string(),
            }
            .into());
        };

        match entry.subscription.pinned_category() {
            Some(category) => {
                if let Some(bucket) = self.by_category.get_mut(category) {
                    bucket.remove(subscription_id);
                    if bucket.is_empty() {
                        self.by_category.remove(category);
                    }
                }
            }
            None => {
                self.wildcard.remove(subscription_id);
            }
        }
        self.windows.remove_subscription(subscription_id);
        Ok(entry.subscription)
    }

    /// Evaluates one event and returns the notifications it produced, in
    /// subscription-registration order.
    pub fn match_event(&mut self, event: &Event) -> Vec<Notification> {
        let category = event.category();

        let mut candidates: Vec<(u64, String)> = Vec::new();
        if let Some(bucket) = self.by_category.get(category) {
            for id in bucket {
                if let Some(entry) = self.subs.get(id) {
                    candidates.push((entry.seq, id.clone()));
                }
            }
        }
        for id in &self.wildcard {
            if let Some(entry) = self.subs.get(id) {
                candidates.push((entry.seq, id.clone()));
            }
        }
        candidates.sort_unstable_by_key(|(seq, _)| *seq);

        let mut out = Vec::new();
        for (_, id) in candidates {
            let Some(entry) = self.subs.get(&id) else {
                continue;
            };
            let sub = &entry.subscription;

            let (windowed, plain): (Vec<&FilterCondition>, Vec<&FilterCondition>) =
                sub.conditions.iter().partition(|c| c.is_windowed);

            if !plain.iter().all(|c| c.matches(event)) {
                continue;
            }

            if windowed.is_empty() {
                out.push(Notification::simple(sub, event.clone()));
                continue;
            }

            let Some(spec) = sub.window else {
                // Unreachable for validated subscriptions; skip rather than
                // emit an unchecked aggregate.
                continue;
            };

            // Each windowed field keeps its own window. The subscription
            // fires only when every window closes in this same tick and
            // every aggregate satisfies its operator.
            let mut closed: Vec<(&FilterCondition, f64)> = Vec::with_capacity(windowed.len());
            let mut all_closed = true;
            for cond in &windowed {
                let Some(value) = event.field(cond.base_field()).and_then(|f| f.as_f64()) else {
                    all_closed = false;
                    continue;
                };
                match self.windows.observe(
                    &sub.subscription_id,
                    category,
                    cond.base_field(),
                    value,
                    &spec,
                ) {
                    Some(aggregate) => closed.push((cond, aggregate)),
                    None => all_closed = false,
                }
            }

            if all_closed && closed.iter().all(|(cond, agg)| cond.accepts_aggregate(*agg)) {
                for (cond, aggregate) in closed {
                    out.push(Notification::complex(
                        sub,
                        category,
                        &cond.field_name,
                        aggregate,
                        spec.window_size,
                    ));
                }
            }
        }
        out
    }

    /// Looks up a registered subscription.
    #[must_use]
    pub fn subscription(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subs.get(subscription_id).map(|e| &e.subscription)
    }

    /// All registered subscriptions in registration order.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<&Subscription> {
        let mut entries: Vec<&Registered> = self.subs.values().collect();
        entries.sort_unstable_by_key(|e| e.seq);
        entries.iter().map(|e| &e.subscription).collect()
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Number of locally homed subscriptions (no `home_broker_id`).
    #[must_use]
    pub fn local_count(&self) -> usize {
        self.subs
            .values()
            .filter(|e| e.subscription.home_broker_id.is_none())
            .count()
    }

    /// True when no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    /// Number of live windows, for stats and tests.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.window_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBody;
    use crate::notification::NotificationBody;
    use crate::subscription::{Aggregation, ComparisonOperator, SubscriptionKind, WindowSpec};

    fn purchase(category: &str, price: f64) -> Event {
        Event::new(EventBody::Purchase {
            user_id: "u".into(),
            product_id: "p".into(),
            category: category.into(),
            price,
            quantity: 1,
            warehouse_id: "w".into(),
        })
    }

    fn rating(category: &str, rating: f64) -> Event {
        Event::new(EventBody::UserRating {
            user_id: "u".into(),
            product_id: "p".into(),
            category: category.into(),
            rating,
            review_text: "r".into(),
        })
    }

    fn category_eq(category: &str) -> FilterCondition {
        FilterCondition::simple("category", ComparisonOperator::Eq, category)
    }

    #[test]
    fn simple_equality_match_fires_once() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::simple("s1", "c1", vec![category_eq("Electronics")]))
            .unwrap();

        let hit = purchase("Electronics", 99.0);
        let out = matcher.match_event(&hit);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].subscription_id, "s1");
        assert_eq!(out[0].matched_event().unwrap().event_id, hit.event_id);

        assert!(matcher.match_event(&purchase("Books", 99.0)).is_empty());
    }

    #[test]
    fn range_and_category_conjunction() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::simple(
                "s1",
                "c1",
                vec![
                    FilterCondition::simple("price", ComparisonOperator::Gt, "50"),
                    category_eq("Electronics"),
                ],
            ))
            .unwrap();

        assert!(matcher.match_event(&purchase("Electronics", 49.99)).is_empty());
        assert_eq!(matcher.match_event(&purchase("Electronics", 50.01)).len(), 1);

        // ProductView has no `price`; the condition is false, not an error.
        let view = Event::new(EventBody::ProductView {
            user_id: "u".into(),
            product_id: "p".into(),
            category: "Electronics".into(),
            view_duration: 5,
            source: "ad".into(),
        });
        assert!(matcher.match_event(&view).is_empty());
    }

    #[test]
    fn wildcard_subscription_sees_all_categories() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::simple(
                "s1",
                "c1",
                vec![FilterCondition::simple("price", ComparisonOperator::Gt, "1000")],
            ))
            .unwrap();

        assert_eq!(matcher.match_event(&purchase("Electronics", 1200.0)).len(), 1);
        assert_eq!(matcher.match_event(&purchase("Automotive", 1500.0)).len(), 1);
        assert!(matcher.match_event(&purchase("Books", 20.0)).is_empty());
    }

    #[test]
    fn notifications_follow_registration_order() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::simple(
                "late-wildcard",
                "c1",
                vec![FilterCondition::simple("price", ComparisonOperator::Gt, "0")],
            ))
            .unwrap();
        matcher
            .register(Subscription::simple("pinned", "c1", vec![category_eq("Books")]))
            .unwrap();

        // Swap registration order relative to bucket iteration order.
        let out = matcher.match_event(&purchase("Books", 5.0));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subscription_id, "late-wildcard");
        assert_eq!(out[1].subscription_id, "pinned");
    }

    #[test]
    fn unregister_stops_matching_and_drops_windows() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::complex(
                "s1",
                "c1",
                vec![
                    category_eq("Electronics"),
                    FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "0"),
                ],
                WindowSpec {
                    window_size: 5,
                    aggregation: Aggregation::Avg,
                },
            ))
            .unwrap();

        assert!(matcher.match_event(&rating("Electronics", 4.0)).is_empty());
        assert_eq!(matcher.window_count(), 1);

        let removed = matcher.unregister("s1").unwrap();
        assert_eq!(removed.kind, SubscriptionKind::Complex);
        assert_eq!(matcher.window_count(), 0);
        assert!(matcher.match_event(&rating("Electronics", 4.0)).is_empty());

        assert!(matcher.unregister("s1").is_err());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut matcher = SubscriptionMatcher::new();
        let sub = Subscription::simple("s1", "c1", vec![category_eq("Books")]);
        matcher.register(sub.clone()).unwrap();
        assert!(matcher.register(sub).is_err());
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn tumbling_average_window_scenario() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::complex(
                "s1",
                "c1",
                vec![
                    category_eq("Electronics"),
                    FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "4.0"),
                ],
                WindowSpec {
                    window_size: 3,
                    aggregation: Aggregation::Avg,
                },
            ))
            .unwrap();

        assert!(matcher.match_event(&rating("Electronics", 3.0)).is_empty());
        assert!(matcher.match_event(&rating("Electronics", 5.0)).is_empty());

        let out = matcher.match_event(&rating("Electronics", 5.0));
        assert_eq!(out.len(), 1);
        let NotificationBody::Complex {
            aggregated_value,
            window_size,
            ref field_name,
            ref category,
            condition_met,
        } = out[0].body
        else {
            panic!("expected complex notification");
        };
        assert!((aggregated_value - 13.0 / 3.0).abs() < 1e-9);
        assert_eq!(window_size, 3);
        assert_eq!(field_name, "avg_rating");
        assert_eq!(category, "Electronics");
        assert!(condition_met);

        // Fourth event lands in a fresh window.
        assert!(matcher.match_event(&rating("Electronics", 4.0)).is_empty());
    }

    #[test]
    fn window_does_not_observe_when_prefix_fails() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::complex(
                "s1",
                "c1",
                vec![
                    category_eq("Electronics"),
                    FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "0"),
                ],
                WindowSpec {
                    window_size: 2,
                    aggregation: Aggregation::Avg,
                },
            ))
            .unwrap();

        matcher.match_event(&rating("Electronics", 5.0));
        // Wrong category: must not advance the Electronics window.
        matcher.match_event(&rating("Books", 5.0));
        let out = matcher.match_event(&rating("Electronics", 5.0));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn closed_window_below_threshold_stays_silent_and_tumbles() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::complex(
                "s1",
                "c1",
                vec![FilterCondition::windowed("avg_rating", ComparisonOperator::Gt, "4.5")],
                WindowSpec {
                    window_size: 2,
                    aggregation: Aggregation::Avg,
                },
            ))
            .unwrap();

        matcher.match_event(&rating("Electronics", 1.0));
        // Closes at avg 1.5, below threshold: no emission, window cleared.
        assert!(matcher.match_event(&rating("Electronics", 2.0)).is_empty());

        matcher.match_event(&rating("Electronics", 5.0));
        let out = matcher.match_event(&rating("Electronics", 5.0));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn multiple_windowed_fields_fire_only_on_joint_close() {
        let mut matcher = SubscriptionMatcher::new();
        matcher
            .register(Subscription::complex(
                "s1",
                "c1",
                vec![
                    FilterCondition::windowed("avg_price", ComparisonOperator::Gt, "0"),
                    FilterCondition::windowed("sum_quantity", ComparisonOperator::Gt, "0"),
                ],
                WindowSpec {
                    window_size: 2,
                    aggregation: Aggregation::Avg,
                },
            ))
            .unwrap();

        assert!(matcher.match_event(&purchase("Books", 10.0)).is_empty());
        // Both per-field windows close on the same tick: two notifications,
        // one per closed window.
        let out = matcher.match_event(&purchase("Books", 20.0));
        assert_eq!(out.len(), 2);
    }
}
