//! Distance-vector mesh routing between neighboring gateways
//!
//! Routes are learned passively: every MIC-verified uplink observed on the
//! radio refreshes the entry for its source device. The table is a bounded
//! array with linear scans and in-place compaction; entries older than
//! [`MESH_TIMEOUT_MS`] are swept each tick.
//!
//! Forwarded frames carry their relay depth in the mesh hop octet
//! (`FOpts[0]`). Rewriting the octet changes the MIC input, so the forwarder
//! recomputes the MIC with the source session's NwkSKey before handing the
//! frame back to the radio.

use tracing::debug;

use crate::lorawan::keys::Session;
use crate::lorawan::DataFrame;
use crate::mac;

pub const MAX_HOPS: u8 = 5;
pub const MESH_TIMEOUT_MS: u64 = 2000;
pub const TABLE_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    /// Originating device the route leads back to.
    pub source: u32,
    /// Destination the device was addressing when the route was learned.
    pub dest: u32,
    /// Neighbor to relay through; equals `source` for devices heard directly.
    pub next_hop: u32,
    pub last_seen_ms: u64,
    pub hop_count: u8,
}

#[derive(Debug)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
    capacity: usize,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::with_capacity(TABLE_CAPACITY)
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { entries: Vec::with_capacity(capacity), capacity }
    }

    /// Learn from an observed frame. The entry for `source` is replaced when
    /// the new route is strictly shorter or the incumbent has gone stale;
    /// equal-cost routes keep the incumbent so paths do not flap.
    pub fn observe(
        &mut self,
        source: u32,
        dest: u32,
        next_hop: u32,
        hop_count: u8,
        now_ms: u64,
    ) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.source == source) {
            let stale = now_ms.saturating_sub(entry.last_seen_ms) > MESH_TIMEOUT_MS;
            if hop_count < entry.hop_count || stale {
                entry.dest = dest;
                entry.next_hop = next_hop;
                entry.hop_count = hop_count;
            }
            entry.last_seen_ms = now_ms;
            return;
        }

        if self.entries.len() >= self.capacity {
            // Try to reclaim a stale slot before refusing the observation.
            self.age(now_ms);
            if self.entries.len() >= self.capacity {
                debug!(source = format_args!("{source:08X}"), "routing table full, observation dropped");
                return;
            }
        }

        self.entries.push(RouteEntry { source, dest, next_hop, last_seen_ms: now_ms, hop_count });
    }

    /// Next hop toward a device, if a live route exists.
    pub fn lookup(&self, dest: u32) -> Option<u32> {
        self.entries.iter().find(|e| e.source == dest).map(|e| e.next_hop)
    }

    /// Sweep entries not refreshed within [`MESH_TIMEOUT_MS`].
    pub fn age(&mut self, now_ms: u64) {
        self.entries.retain(|e| now_ms.saturating_sub(e.last_seen_ms) <= MESH_TIMEOUT_MS);
    }

    /// Rewrite the hop octet and re-sign the frame for relaying. Returns the
    /// wire bytes to transmit, or `None` when the frame has reached its relay
    /// depth limit.
    ///
    /// `fcnt` is the extended counter the frame verified against; the MIC is
    /// recomputed with the source session because `FOpts` changed.
    pub fn forward(
        &self,
        frame: &DataFrame,
        fcnt: u32,
        session: &Session,
    ) -> Option<Vec<u8>> {
        let hops = frame.hop_count();
        if hops >= MAX_HOPS {
            debug!(
                dev_addr = format_args!("{:08X}", frame.dev_addr),
                hops, "max hop count reached, not forwarding"
            );
            return None;
        }

        let mut relayed = frame.clone();
        if relayed.f_opts.is_empty() {
            relayed.f_opts.push(hops + 1);
        } else {
            relayed.f_opts[0] = hops + 1;
        }
        relayed.mic = mac::uplink_mic(&relayed, fcnt, session);

        Some(relayed.encode())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }
}
