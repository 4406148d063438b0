//! Counters shared by the QoS components.
//!
//! A [`Stats`] is created by the server context and handed to each component as an
//! `Arc`, so independent brokers (or tests) in one process never share counts.

use serde::{Deserialize, Serialize};
use serde_json::json;

use mqflow_utils::Counter;

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    /// Outbound QoS 1/2 publishes written and awaiting acknowledgment.
    pub out_inflights: Counter,
    /// Outbound publishes waiting for a free in-flight slot.
    pub out_queued: Counter,
    /// Inbound QoS 1/2 flows not yet acknowledged to the client.
    pub in_inflights: Counter,
}

impl Stats {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections.count": self.connections.count(),
            "connections.max": self.connections.max(),
            "out_inflights.count": self.out_inflights.count(),
            "out_inflights.max": self.out_inflights.max(),
            "out_queued.count": self.out_queued.count(),
            "out_queued.max": self.out_queued.max(),
            "in_inflights.count": self.in_inflights.count(),
            "in_inflights.max": self.in_inflights.max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_reports_count_and_high_water_mark() {
        let stats = Stats::new();
        stats.connections.inc();
        stats.connections.inc();
        stats.connections.dec();
        stats.out_queued.incs(3);
        let json = stats.to_json();
        assert_eq!(json["connections.count"], 1);
        assert_eq!(json["connections.max"], 2);
        assert_eq!(json["out_queued.count"], 3);
        assert_eq!(json["in_inflights.max"], 0);
    }
}
