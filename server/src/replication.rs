//! Snapshot replication to connected peers
//!
//! Runs on the game thread after each frame's physics results are available.
//! It polls the world's state registry for every tick produced since the last
//! poll and decides, per tick, whether to send it:
//! - Every `snapshot_send_cadence` ticks as routine, unreliable traffic
//! - Immediately and reliably when an entry carries events or a final state
//!
//! The peer that owns a model receives its full encoding so it can reconcile;
//! every other peer receives the reduced encoding for display. The latest
//! authority tick is also broadcast periodically so observers can estimate
//! their tick offset.

use log::{debug, info, trace};
use shared::config::PredictionConfig;
use shared::state_manager::{ModelId, StateManager};
use shared::tick::Tick;
use shared::transport::{PacketSink, Reliability};
use shared::Packet;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u32);

struct Connection {
    id: ConnectionId,
    /// Models this peer controls and therefore receives in full
    owned: BTreeSet<ModelId>,
    sink: Box<dyn PacketSink>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplicationStats {
    pub ticks_sent: u64,
    pub ticks_skipped: u64,
    pub reliable_states: u64,
    pub server_tick_broadcasts: u64,
}

pub struct ReplicationManager {
    cadence: i32,
    broadcast_period: i32,
    connections: Vec<Connection>,
    next_connection_id: u32,
    last_broadcast: Option<Tick>,
    stats: ReplicationStats,
}

impl ReplicationManager {
    pub fn new(config: &PredictionConfig) -> Self {
        Self {
            cadence: config.snapshot_send_cadence.max(1),
            broadcast_period: config.server_tick_broadcast_period.max(1),
            connections: Vec::new(),
            next_connection_id: 1,
            last_broadcast: None,
            stats: ReplicationStats::default(),
        }
    }

    pub fn add_connection(&mut self, sink: Box<dyn PacketSink>, owned: impl IntoIterator<Item = ModelId>) -> ConnectionId {
        let id = ConnectionId(self.next_connection_id);
        self.next_connection_id += 1;

        let owned: BTreeSet<ModelId> = owned.into_iter().collect();
        info!("Connection {:?} added, owning {:?}", id, owned);
        self.connections.push(Connection { id, owned, sink });
        id
    }

    pub fn remove_connection(&mut self, id: ConnectionId) -> bool {
        let before = self.connections.len();
        self.connections.retain(|connection| connection.id != id);
        let removed = before != self.connections.len();
        if removed {
            info!("Connection {:?} removed", id);
        }
        removed
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Sends everything produced up to `latest_tick` and releases it from the
    /// registry. Returns the number of ticks sent.
    pub fn replicate(&mut self, states: &mut StateManager, latest_tick: Option<Tick>) -> usize {
        let Some(latest) = latest_tick else {
            return 0;
        };

        states.produce_data(latest);
        let ticks = states.produced_ticks();
        let mut sent = 0;

        for &tick in &ticks {
            let full = states.produced_data_for_tick(tick, true);
            let short = states.produced_data_for_tick(tick, false);
            let any_reliable = full.iter().any(|(_, _, reliable)| *reliable);

            if tick % self.cadence != 0 && !any_reliable {
                trace!("Skipping routine tick {}", tick);
                self.stats.ticks_skipped += 1;
                continue;
            }

            for connection in &mut self.connections {
                for ((model, full_bytes, reliable), (_, short_bytes, _)) in full.iter().zip(&short) {
                    let owner = connection.owned.contains(model);
                    let bytes = if owner { full_bytes } else { short_bytes };
                    let reliability = if *reliable {
                        Reliability::Reliable
                    } else {
                        Reliability::Unreliable
                    };

                    connection.sink.send(
                        Packet::AuthorityState {
                            model: *model,
                            full: owner,
                            bytes: bytes.clone(),
                        },
                        reliability,
                    );
                }
            }

            if any_reliable {
                debug!("Sent tick {} reliably", tick);
                self.stats.reliable_states += 1;
            }
            self.stats.ticks_sent += 1;
            sent += 1;
        }

        if let Some(&last) = ticks.last() {
            states.release_produced_data(last);
        }

        self.broadcast_server_tick(latest);
        sent
    }

    fn broadcast_server_tick(&mut self, latest: Tick) {
        let due = self
            .last_broadcast
            .map_or(true, |last| latest - last >= self.broadcast_period);
        if !due {
            return;
        }

        for connection in &mut self.connections {
            connection
                .sink
                .send(Packet::ServerTick { tick: latest }, Reliability::Unreliable);
        }
        self.last_broadcast = Some(latest);
        self.stats.server_tick_broadcasts += 1;
    }
}
