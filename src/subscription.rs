//! Subscriptions and their filter conditions.
//!
//! A subscription is a conjunction of conditions. Non-windowed conditions
//! evaluate against single events; windowed conditions evaluate against the
//! aggregate of a tumbling window maintained by the window manager. The
//! string `value` of a condition is coerced to the field's declared type at
//! evaluation time; any coercion failure fails the condition, never the
//! event.

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, BusResult};
use crate::event::{Event, FieldValue};

/// Comparison operators. Closed set; evaluation is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOperator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl ComparisonOperator {
    /// Numeric comparison.
    #[must_use]
    pub fn compare_f64(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
        }
    }

    /// String comparison. Ordered operators are undefined on strings and
    /// return `None`, which callers treat as a failed condition.
    #[must_use]
    pub fn compare_str(self, lhs: &str, rhs: &str) -> Option<bool> {
        match self {
            Self::Eq => Some(lhs == rhs),
            Self::Ne => Some(lhs != rhs),
            Self::Gt | Self::Ge | Self::Lt | Self::Le => None,
        }
    }
}

/// Window aggregation functions. All computed in f64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Avg,
    Max,
    Min,
    Sum,
    Count,
}

impl Aggregation {
    /// Parses the wire spelling ("avg", "max", ...).
    pub fn parse(name: &str) -> Result<Self, ValidationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "avg" => Ok(Self::Avg),
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "sum" => Ok(Self::Sum),
            "count" => Ok(Self::Count),
            _ => Err(ValidationError::UnknownAggregation {
                name: name.to_string(),
            }),
        }
    }

    /// The wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Avg => "avg",
            Self::Max => "max",
            Self::Min => "min",
            Self::Sum => "sum",
            Self::Count => "count",
        }
    }

    /// Applies the aggregation to a closed window of observations.
    #[must_use]
    pub fn apply(self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => {
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            }
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Sum => values.iter().sum(),
            Self::Count => values.len() as f64,
        }
    }
}

/// Tumbling window configuration for a complex subscription.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Observations per window; at least 1.
    pub window_size: usize,
    /// Aggregation applied when the window closes.
    pub aggregation: Aggregation,
}

/// A single filter condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    /// Field the condition reads. Windowed conditions may carry an
    /// aggregation prefix ("avg_rating"); see [`FilterCondition::base_field`].
    pub field_name: String,
    /// Comparison operator.
    pub operator: ComparisonOperator,
    /// Right-hand side, coerced to the field's type at evaluation time.
    pub value: String,
    /// Whether the condition evaluates against a window aggregate.
    pub is_windowed: bool,
}

const AGGREGATION_PREFIXES: [&str; 5] = ["avg_", "max_", "min_", "sum_", "count_"];

impl FilterCondition {
    /// Builds a non-windowed condition.
    #[must_use]
    pub fn simple(field_name: &str, operator: ComparisonOperator, value: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            operator,
            value: value.to_string(),
            is_windowed: false,
        }
    }

    /// Builds a windowed condition.
    #[must_use]
    pub fn windowed(field_name: &str, operator: ComparisonOperator, value: &str) -> Self {
        Self {
            field_name: field_name.to_string(),
            operator,
            value: value.to_string(),
            is_windowed: true,
        }
    }

    /// The event field this condition observes.
    ///
    /// Windowed conditions are conventionally named after their aggregate
    /// ("avg_rating" aggregating `rating`); the prefix is stripped when the
    /// remainder still names a field. Non-windowed conditions use the name
    /// as-is.
    #[must_use]
    pub fn base_field(&self) -> &str {
        if !self.is_windowed {
            return &self.field_name;
        }
        for prefix in AGGREGATION_PREFIXES {
            if let Some(rest) = self.field_name.strip_prefix(prefix) {
                if !rest.is_empty() {
                    return rest;
                }
            }
        }
        &self.field_name
    }

    /// Evaluates this condition against a single event.
    ///
    /// Only meaningful for non-windowed conditions; a missing field, an
    /// ordered operator on a string field, or an unparsable right-hand side
    /// all evaluate false.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let Some(field) = event.field(&self.field_name) else {
            return false;
        };
        match field {
            FieldValue::Str(lhs) => self
                .operator
                .compare_str(lhs, &self.value)
                .unwrap_or(false),
            FieldValue::Int(_) | FieldValue::Float(_) => {
                let Some(lhs) = field.as_f64() else {
                    return false;
                };
                match self.value.trim().parse::<f64>() {
                    Ok(rhs) => self.operator.compare_f64(lhs, rhs),
                    Err(_) => false,
                }
            }
        }
    }

    /// Evaluates this condition against a closed window aggregate.
    #[must_use]
    pub fn accepts_aggregate(&self, aggregate: f64) -> bool {
        match self.value.trim().parse::<f64>() {
            Ok(rhs) => self.operator.compare_f64(aggregate, rhs),
            Err(_) => false,
        }
    }

    /// The category this condition pins, if it is a `category EQ` predicate.
    #[must_use]
    pub fn pinned_category(&self) -> Option<&str> {
        if !self.is_windowed
            && self.field_name == "category"
            && self.operator == ComparisonOperator::Eq
        {
            Some(&self.value)
        } else {
            None
        }
    }
}

/// Subscription kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Conjunction of non-windowed conditions over single events.
    Simple,
    /// At least one windowed condition over a tumbling aggregate.
    Complex,
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Unique subscription id.
    pub subscription_id: String,
    /// Owning subscriber.
    pub subscriber_id: String,
    /// Simple or complex.
    pub kind: SubscriptionKind,
    /// Conjunctive conditions.
    pub conditions: Vec<FilterCondition>,
    /// Window configuration; required when `kind` is complex.
    pub window: Option<WindowSpec>,
    /// Broker the subscription was registered at. `None` for local
    /// registrations; peers announce summaries with this set so match
    /// results can be routed home.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_broker_id: Option<String>,
}

impl Subscription {
    /// Builds a simple subscription.
    #[must_use]
    pub fn simple(
        subscription_id: &str,
        subscriber_id: &str,
        conditions: Vec<FilterCondition>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            kind: SubscriptionKind::Simple,
            conditions,
            window: None,
            home_broker_id: None,
        }
    }

    /// Builds a complex (windowed) subscription.
    #[must_use]
    pub fn complex(
        subscription_id: &str,
        subscriber_id: &str,
        conditions: Vec<FilterCondition>,
        window: WindowSpec,
    ) -> Self {
        Self {
            subscription_id: subscription_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            kind: SubscriptionKind::Complex,
            conditions,
            window: Some(window),
            home_broker_id: None,
        }
    }

    /// Checks the registration invariants.
    pub fn validate(&self) -> BusResult<()> {
        if self.conditions.is_empty() {
            return Err(ValidationError::EmptyConditions {
                subscription_id: self.subscription_id.clone(),
            }
            .into());
        }

        let windowed = self.conditions.iter().filter(|c| c.is_windowed).count();
        match self.kind {
            SubscriptionKind::Simple => {
                if windowed > 0 {
                    return Err(ValidationError::UnexpectedWindowedCondition {
                        subscription_id: self.subscription_id.clone(),
                    }
                    .into());
                }
            }
            SubscriptionKind::Complex => {
                if windowed == 0 {
                    return Err(ValidationError::MissingWindowedCondition {
                        subscription_id: self.subscription_id.clone(),
                    }
                    .into());
                }
                let Some(window) = self.window else {
                    return Err(ValidationError::MissingWindowConfig {
                        subscription_id: self.subscription_id.clone(),
                    }
                    .into());
                };
                if window.window_size < 1 {
                    return Err(ValidationError::WindowTooSmall {
                        window_size: window.window_size as i64,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The category pinned by an `EQ` predicate, if any. Subscriptions
    /// without one live in the matcher's wildcard bucket.
    #[must_use]
    pub fn pinned_category(&self) -> Option<&str> {
        self.conditions.iter().find_map(FilterCondition::pinned_category)
    }
}
