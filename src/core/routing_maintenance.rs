//! Routing table maintenance logic.

use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::{Id, RoutingTable};

/// Interval after which an unchanged bucket is refreshed, and the table is repopulated.
pub const REFRESH_TABLE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const PING_TABLE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Routing table maintenance state
#[derive(Debug)]
pub struct RoutingMaintenance {
    last_table_refresh: Instant,
    last_table_ping: Instant,
}

/// Decisions about routing table maintenance
#[derive(Debug, Default)]
pub struct MaintenanceDecisions {
    /// Whether to populate the routing table (bootstrap)
    pub should_bootstrap: bool,

    /// Node IDs purged from the routing table
    pub purged: Vec<Id>,

    /// Node addresses to ping
    pub nodes_to_ping: Vec<SocketAddrV4>,

    /// Random ids in idle buckets, to look up with `find_node`
    pub buckets_to_refresh: Vec<Id>,
}

impl RoutingMaintenance {
    /// Create new routing maintenance tracker
    pub fn new() -> Self {
        RoutingMaintenance {
            last_table_refresh: Instant::now(),
            last_table_ping: Instant::now(),
        }
    }

    /// Determine what maintenance operations should be performed,
    /// purging stale nodes along the way.
    ///
    /// Resets internal timers when intervals elapse.
    pub fn periodic_maintenance(&mut self, routing_table: &mut RoutingTable) -> MaintenanceDecisions {
        self.periodic_maintenance_at(Instant::now(), routing_table)
    }

    fn periodic_maintenance_at(
        &mut self,
        now: Instant,
        routing_table: &mut RoutingTable,
    ) -> MaintenanceDecisions {
        let refresh_is_due = now.saturating_duration_since(self.last_table_refresh)
            >= REFRESH_TABLE_INTERVAL;
        let ping_is_due =
            now.saturating_duration_since(self.last_table_ping) >= PING_TABLE_INTERVAL;

        let mut decisions = MaintenanceDecisions {
            should_bootstrap: routing_table.is_empty() || refresh_is_due,
            ..Default::default()
        };

        if ping_is_due {
            self.last_table_ping = now;

            decisions.purged = routing_table.remove_stale();
            decisions.nodes_to_ping = routing_table
                .nodes()
                .filter(|node| node.should_ping())
                .map(|node| node.address())
                .collect();
        }

        if refresh_is_due {
            self.last_table_refresh = now;

            decisions.buckets_to_refresh =
                routing_table.buckets_to_refresh(now, REFRESH_TABLE_INTERVAL);
        }

        decisions
    }
}

impl Default for RoutingMaintenance {
    fn default() -> Self {
        Self::new()
    }
}
