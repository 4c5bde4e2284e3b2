//! Tumbling-window state for complex subscriptions.
//!
//! Windows are keyed by (subscription, category, field) and created lazily
//! on the first matching observation. A window closes when it reaches its
//! configured size: the aggregate is computed, the buffer is cleared, and
//! the next observation starts a fresh window. Nothing is persisted; a
//! restart clears all windows.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::subscription::WindowSpec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey {
    subscription_id: String,
    category: String,
    field_name: String,
}

#[derive(Debug)]
struct WindowState {
    values: VecDeque<f64>,
}

/// Owns all window state for one matcher.
#[derive(Debug, Default)]
pub struct WindowManager {
    windows: HashMap<WindowKey, WindowState>,
}

impl WindowManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an observation to the window identified by
    /// (`subscription_id`, `category`, `field_name`).
    ///
    /// Returns `Some(aggregate)` exactly when the observation closes the
    /// window; the window is cleared before returning (tumbling
    /// semantics). With `window_size == 1` every observation closes.
    pub fn observe(
        &mut self,
        subscription_id: &str,
        category: &str,
        field_name: &str,
        value: f64,
        spec: &WindowSpec,
    ) -> Option<f64> {
        let key = WindowKey {
            subscription_id: subscription_id.to_string(),
            category: category.to_string(),
            field_name: field_name.to_string(),
        };
        let window_size = spec.window_size.max(1);
        let state = self.windows.entry(key).or_insert_with(|| WindowState {
            values: VecDeque::with_capacity(window_size),
        });

        state.values.push_back(value);
        if state.values.len() < window_size {
            return None;
        }

        let values: Vec<f64> = state.values.iter().copied().collect();
        state.values.clear();
        Some(spec.aggregation.apply(&values))
    }

    /// Drops every window belonging to a subscription.
    pub fn remove_subscription(&mut self, subscription_id: &str) {
        self.windows
            .retain(|key, _| key.subscription_id != subscription_id);
    }

    /// Number of live windows.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Aggregation;

    fn spec(size: usize, aggregation: Aggregation) -> WindowSpec {
        WindowSpec {
            window_size: size,
            aggregation,
        }
    }

    #[test]
    fn window_closes_at_size_and_tumbles() {
        let mut wm = WindowManager::new();
        let spec = spec(3, Aggregation::Avg);

        assert_eq!(wm.observe("s", "Electronics", "rating", 3.0, &spec), None);
        assert_eq!(wm.observe("s", "Electronics", "rating", 5.0, &spec), None);
        let closed = wm.observe("s", "Electronics", "rating", 5.0, &spec).unwrap();
        assert!((closed - 13.0 / 3.0).abs() < 1e-9);

        // The fourth observation starts a fresh window.
        assert_eq!(wm.observe("s", "Electronics", "rating", 4.0, &spec), None);
    }

    #[test]
    fn windows_are_isolated_by_category() {
        let mut wm = WindowManager::new();
        let spec = spec(2, Aggregation::Sum);

        assert_eq!(wm.observe("s", "Books", "price", 1.0, &spec), None);
        assert_eq!(wm.observe("s", "Electronics", "price", 10.0, &spec), None);
        assert_eq!(wm.observe("s", "Books", "price", 2.0, &spec), Some(3.0));
        assert_eq!(wm.observe("s", "Electronics", "price", 20.0, &spec), Some(30.0));
    }

    #[test]
    fn windows_are_isolated_by_field() {
        let mut wm = WindowManager::new();
        let spec = spec(2, Aggregation::Max);

        assert_eq!(wm.observe("s", "Books", "price", 7.0, &spec), None);
        assert_eq!(wm.observe("s", "Books", "quantity", 1.0, &spec), None);
        assert_eq!(wm.observe("s", "Books", "price", 9.0, &spec), Some(9.0));
    }

    #[test]
    fn size_one_window_closes_every_observation() {
        let mut wm = WindowManager::new();
        let spec = spec(1, Aggregation::Min);
        assert_eq!(wm.observe("s", "Books", "price", 4.0, &spec), Some(4.0));
        assert_eq!(wm.observe("s", "Books", "price", 2.0, &spec), Some(2.0));
    }

    #[test]
    fn count_aggregation_equals_window_size_on_close() {
        let mut wm = WindowManager::new();
        let spec = spec(4, Aggregation::Count);
        for _ in 0..3 {
            assert_eq!(wm.observe("s", "Books", "price", 1.0, &spec), None);
        }
        assert_eq!(wm.observe("s", "Books", "price", 1.0, &spec), Some(4.0));
    }

    #[test]
    fn remove_subscription_drops_all_its_windows() {
        let mut wm = WindowManager::new();
        let spec = spec(3, Aggregation::Avg);
        wm.observe("s1", "Books", "price", 1.0, &spec);
        wm.observe("s1", "Electronics", "price", 1.0, &spec);
        wm.observe("s2", "Books", "price", 1.0, &spec);
        assert_eq!(wm.window_count(), 3);

        wm.remove_subscription("s1");
        assert_eq!(wm.window_count(), 1);

        // s1's half-filled window is gone; a new one starts from scratch.
        assert_eq!(wm.observe("s1", "Books", "price", 2.0, &spec), None);
    }
}
