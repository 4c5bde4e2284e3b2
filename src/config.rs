//! Broker configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BusResult, TransportError};

/// Configuration for one broker node.
///
/// All fields have working defaults; deployments usually override the ports,
/// the broker id, and the peer endpoints. Ports set to 0 bind ephemerally,
/// which the test suite relies on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Unique broker id within the overlay.
    pub broker_id: String,
    /// Interface to bind all listeners on.
    pub bind_addr: String,
    /// Publisher ingress port.
    pub publisher_port: u16,
    /// Subscriber egress port.
    pub subscriber_port: u16,
    /// Peer mesh listening port.
    pub peer_port: u16,
    /// Peer endpoints (`host:port`) dialed at startup.
    pub peer_endpoints: Vec<String>,
    /// Heartbeat emission interval.
    pub heartbeat_interval_ms: u64,
    /// A peer silent for this long is marked DOWN (three heartbeats).
    pub peer_timeout_ms: u64,
    /// Capacity of the duplicate message-id cache.
    pub dedup_cache_size: usize,
    /// Ingress event queue capacity; reads pause above 80% occupancy.
    pub ingress_queue_cap: usize,
    /// Per-subscriber egress queue capacity.
    pub egress_queue_cap: usize,
    /// Drop the oldest queued notification on egress overflow (drop the
    /// newest when false).
    pub drop_oldest_on_overflow: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            broker_id: "broker-0".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            publisher_port: 5557,
            subscriber_port: 5554,
            peer_port: 5560,
            peer_endpoints: Vec::new(),
            heartbeat_interval_ms: 5000,
            peer_timeout_ms: 15_000,
            dedup_cache_size: 10_000,
            ingress_queue_cap: 65_536,
            egress_queue_cap: 4096,
            drop_oldest_on_overflow: true,
        }
    }
}

impl BrokerConfig {
    /// The management (subscribe/unsubscribe) port: egress port + 1000.
    #[must_use]
    pub const fn management_port(&self) -> u16 {
        self.subscriber_port + 1000
    }

    /// Loads a configuration from a JSON file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> BusResult<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(TransportError::Io)?;
        let cfg: Self = serde_json::from_slice(&bytes).map_err(|e| {
            crate::error::BusError::internal(format!(
                "invalid broker config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_ports() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.publisher_port, 5557);
        assert_eq!(cfg.subscriber_port, 5554);
        assert_eq!(cfg.management_port(), 6554);
        assert_eq!(cfg.heartbeat_interval_ms, 5000);
        assert_eq!(cfg.peer_timeout_ms, 15_000);
        assert_eq!(cfg.dedup_cache_size, 10_000);
        assert!(cfg.drop_oldest_on_overflow);
    }

    #[test]
    fn partial_json_takes_defaults_for_the_rest() {
        let cfg: BrokerConfig =
            serde_json::from_str(r#"{"broker_id":"b2","subscriber_port":5555}"#).unwrap();
        assert_eq!(cfg.broker_id, "b2");
        assert_eq!(cfg.subscriber_port, 5555);
        assert_eq!(cfg.management_port(), 6555);
        assert_eq!(cfg.ingress_queue_cap, 65_536);
    }
}
