//! Random workload generators.
//!
//! Backs the subscriber's `subscribe_*` helpers and gives publishers a
//! default [`EventSource`] for load tests. Everything here draws from a
//! small fixed catalog so generated subscriptions actually match generated
//! events.

use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::client::publisher::EventSource;
use crate::event::{Event, EventBody};
use crate::subscription::{
    Aggregation, ComparisonOperator, FilterCondition, Subscription, WindowSpec,
};

/// Product categories in the demo catalog.
pub const CATEGORIES: [&str; 8] = [
    "Electronics",
    "Books",
    "Clothing",
    "Home",
    "Sports",
    "Automotive",
    "Beauty",
    "Toys",
];

const VIEW_SOURCES: [&str; 4] = ["search", "recommendation", "advertisement", "direct"];
const OPERATIONS: [&str; 4] = ["restock", "sale", "return", "adjustment"];

const NON_EQ_OPERATORS: [ComparisonOperator; 5] = [
    ComparisonOperator::Ne,
    ComparisonOperator::Gt,
    ComparisonOperator::Ge,
    ComparisonOperator::Lt,
    ComparisonOperator::Le,
];

/// Numeric fields eligible for windowed conditions.
const WINDOWED_FIELDS: [&str; 3] = ["rating", "price", "quantity"];

fn pick<'a>(rng: &mut impl Rng, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or(items[0])
}

/// Generates random catalog events, roughly uniform over the four
/// variants.
pub struct RandomEventSource {
    rng: StdRng,
}

impl RandomEventSource {
    /// Generator with an entropy-seeded RNG.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic generator for reproducible runs.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for RandomEventSource {
    fn next_event(&mut self) -> Event {
        let rng = &mut self.rng;
        let category = pick(rng, &CATEGORIES).to_string();
        let user_id = format!("user-{}", rng.gen_range(1..=500));
        let product_id = format!("prod-{}", rng.gen_range(1..=200));

        let body = match rng.gen_range(0..4) {
            0 => EventBody::Purchase {
                user_id,
                product_id,
                category,
                price: rng.gen_range(1.0..2000.0),
                quantity: rng.gen_range(1..=5),
                warehouse_id: format!("wh-{}", rng.gen_range(1..=10)),
            },
            1 => EventBody::ProductView {
                user_id,
                product_id,
                category,
                view_duration: rng.gen_range(1..=600),
                source: pick(rng, &VIEW_SOURCES).to_string(),
            },
            2 => EventBody::InventoryUpdate {
                product_id,
                category,
                stock_level: rng.gen_range(0..=500),
                warehouse_id: format!("wh-{}", rng.gen_range(1..=10)),
                operation: pick(rng, &OPERATIONS).to_string(),
            },
            _ => EventBody::UserRating {
                user_id,
                product_id,
                category,
                rating: rng.gen_range(1.0..=5.0),
                review_text: "generated review".to_string(),
            },
        };
        Event::new(body)
    }
}

fn fresh_id() -> String {
    format!("sub-{}", Uuid::new_v4())
}

/// A random simple subscription: a category pin, sometimes with a price
/// range on top.
pub fn simple_subscription(rng: &mut impl Rng, subscriber_id: &str) -> Subscription {
    let mut conditions = vec![FilterCondition::simple(
        "category",
        ComparisonOperator::Eq,
        pick(rng, &CATEGORIES),
    )];
    if rng.gen_bool(0.5) {
        let threshold = rng.gen_range(10.0..1500.0);
        let operator = if rng.gen_bool(0.5) {
            ComparisonOperator::Gt
        } else {
            ComparisonOperator::Lt
        };
        conditions.push(FilterCondition::simple(
            "price",
            operator,
            &format!("{threshold:.2}"),
        ));
    }
    Subscription::simple(&fresh_id(), subscriber_id, conditions)
}

/// A random complex subscription: a category pin plus one windowed
/// aggregate condition.
pub fn complex_subscription(rng: &mut impl Rng, subscriber_id: &str) -> Subscription {
    let aggregation = *[
        Aggregation::Avg,
        Aggregation::Max,
        Aggregation::Min,
        Aggregation::Sum,
        Aggregation::Count,
    ]
    .choose(rng)
    .unwrap_or(&Aggregation::Avg);
    let field = pick(rng, &WINDOWED_FIELDS);
    let operator = if rng.gen_bool(0.5) {
        ComparisonOperator::Gt
    } else {
        ComparisonOperator::Lt
    };
    let threshold = match field {
        "rating" => rng.gen_range(1.0..5.0),
        "quantity" => rng.gen_range(1.0..10.0),
        _ => rng.gen_range(10.0..1500.0),
    };

    let conditions = vec![
        FilterCondition::simple("category", ComparisonOperator::Eq, pick(rng, &CATEGORIES)),
        FilterCondition::windowed(
            &format!("{}_{field}", aggregation.as_str()),
            operator,
            &format!("{threshold:.2}"),
        ),
    ];
    Subscription::complex(
        &fresh_id(),
        subscriber_id,
        conditions,
        WindowSpec {
            window_size: rng.gen_range(2..=10),
            aggregation,
        },
    )
}

/// A subscription with a single condition on `price` where the operator is
/// `EQ` with probability `ratio` and otherwise drawn uniformly from the
/// remaining operators.
pub fn equality_ratio_subscription(
    rng: &mut impl Rng,
    subscriber_id: &str,
    ratio: f64,
) -> Subscription {
    let operator = if rng.gen_bool(ratio.clamp(0.0, 1.0)) {
        ComparisonOperator::Eq
    } else {
        *NON_EQ_OPERATORS.choose(rng).unwrap_or(&ComparisonOperator::Gt)
    };
    let value = format!("{:.2}", rng.gen_range(1.0..2000.0));
    Subscription::simple(
        &fresh_id(),
        subscriber_id,
        vec![FilterCondition::simple("price", operator, &value)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn generated_events_carry_catalog_categories() {
        let mut source = RandomEventSource::with_seed(7);
        for _ in 0..50 {
            let ev = source.next_event();
            assert!(CATEGORIES.contains(&ev.category()));
            assert!(!ev.event_id.is_empty());
        }
    }

    #[test]
    fn generated_subscriptions_validate() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            simple_subscription(&mut rng, "c1").validate().unwrap();
            complex_subscription(&mut rng, "c1").validate().unwrap();
            equality_ratio_subscription(&mut rng, "c1", 0.7)
                .validate()
                .unwrap();
        }
    }

    #[test]
    fn equality_ratio_zero_and_one_are_exact() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..20 {
            let all_eq = equality_ratio_subscription(&mut rng, "c1", 1.0);
            assert_eq!(all_eq.conditions[0].operator, ComparisonOperator::Eq);

            let none_eq = equality_ratio_subscription(&mut rng, "c1", 0.0);
            assert_ne!(none_eq.conditions[0].operator, ComparisonOperator::Eq);
        }
    }

    #[test]
    fn ratings_stay_in_range() {
        let mut source = RandomEventSource::with_seed(3);
        for _ in 0..200 {
            if let EventBody::UserRating { rating, .. } = source.next_event().body {
                assert!((1.0..=5.0).contains(&rating));
            }
        }
    }
}
