/*!
 * The storage boundary the engine works against.
 *
 * The engine only ever reads pending positions and the clusters for one terminal, then commits
 * the outcome for one position at a time. [VisitDatabase](crate::VisitDatabase) is the
 * persistent implementation, [MemoryStore] keeps everything in process.
 */

use crate::{
    cluster::{Cluster, ClusterAssociation},
    error::GeoVisitResult,
    geo::Coord,
    position::PositionEvent,
    ClusterId, PositionId, TerminalId,
};
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap as HashMap;

/// Source of raw positions.
pub trait PositionStore {
    /// Up to `limit` unprocessed positions for `terminal`, oldest first.
    ///
    /// Rows with missing or out of range values come after every usable row.
    fn pending_positions(
        &mut self,
        terminal: TerminalId,
        limit: usize,
    ) -> GeoVisitResult<Vec<PositionEvent>>;

    /// Every terminal with at least one unprocessed position.
    fn terminals_with_pending_positions(&mut self) -> GeoVisitResult<Vec<TerminalId>>;
}

/// Home of the clusters.
pub trait ClusterStore {
    /// All the clusters that belong to `terminal`.
    fn clusters_for_terminal(&mut self, terminal: TerminalId) -> GeoVisitResult<Vec<Cluster>>;
}

/// What happens to a cluster when a position is committed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterChange {
    /// Create a cluster anchored at the position.
    Create {
        terminal_id: TerminalId,
        anchor: Coord,
        occurred_at: DateTime<Utc>,
    },
    /// Store the new visit count and last visited time on an existing cluster.
    RegisterVisit {
        cluster_id: ClusterId,
        visit_count: u32,
        last_visited_at: DateTime<Utc>,
    },
    /// Leave the cluster as it is.
    Merge { cluster_id: ClusterId },
}

/// Everything that has to be written, all or nothing, to finish one position.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionCommit {
    pub position_id: PositionId,
    pub change: ClusterChange,
    pub accepted: bool,
}

/// A store that can commit the outcome for a position atomically.
pub trait VisitStore: PositionStore + ClusterStore {
    /// Apply the cluster change, record the association, and mark the position processed.
    ///
    /// Either all of it is durable when this returns `Ok`, or none of it is. Returns the id of the
    /// cluster the position was associated with.
    fn commit(&mut self, commit: &PositionCommit) -> GeoVisitResult<ClusterId>;
}

/// A store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: HashMap<PositionId, PositionEvent>,
    clusters: HashMap<ClusterId, Cluster>,
    associations: Vec<ClusterAssociation>,
    next_position_id: PositionId,
    next_cluster_id: ClusterId,
}

impl MemoryStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw position, returns its id.
    pub fn add_position(
        &mut self,
        terminal_id: TerminalId,
        coord: Option<Coord>,
        occurred_at: Option<DateTime<Utc>>,
    ) -> PositionId {
        self.next_position_id += 1;
        let id = self.next_position_id;

        self.positions.insert(
            id,
            PositionEvent {
                id,
                terminal_id,
                coord,
                occurred_at,
                processed: false,
            },
        );

        id
    }

    /// Look up a position.
    pub fn position(&self, id: PositionId) -> Option<&PositionEvent> {
        self.positions.get(&id)
    }

    /// Look up a cluster.
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(&id)
    }

    /// All clusters in the store, ordered by id.
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut clusters: Vec<_> = self.clusters.values().cloned().collect();
        clusters.sort_unstable_by_key(|c| c.id());
        clusters
    }

    /// All associations in the order they were committed.
    pub fn associations(&self) -> &[ClusterAssociation] {
        &self.associations
    }
}

impl PositionStore for MemoryStore {
    fn pending_positions(
        &mut self,
        terminal: TerminalId,
        limit: usize,
    ) -> GeoVisitResult<Vec<PositionEvent>> {
        let mut pending: Vec<_> = self
            .positions
            .values()
            .filter(|p| p.terminal_id == terminal && !p.processed)
            .cloned()
            .collect();

        crate::position::sort_for_folding(&mut pending);
        pending.truncate(limit);

        Ok(pending)
    }

    fn terminals_with_pending_positions(&mut self) -> GeoVisitResult<Vec<TerminalId>> {
        let mut terminals: Vec<_> = self
            .positions
            .values()
            .filter(|p| !p.processed)
            .map(|p| p.terminal_id)
            .collect();

        terminals.sort_unstable();
        terminals.dedup();

        Ok(terminals)
    }
}

impl ClusterStore for MemoryStore {
    fn clusters_for_terminal(&mut self, terminal: TerminalId) -> GeoVisitResult<Vec<Cluster>> {
        let mut clusters: Vec<_> = self
            .clusters
            .values()
            .filter(|c| c.terminal_id() == terminal)
            .cloned()
            .collect();

        clusters.sort_unstable_by_key(|c| c.id());

        Ok(clusters)
    }
}

impl VisitStore for MemoryStore {
    fn commit(&mut self, commit: &PositionCommit) -> GeoVisitResult<ClusterId> {
        // Check everything before touching anything, so a failure leaves no trace.
        match self.positions.get(&commit.position_id) {
            Some(p) if p.processed => {
                return Err(format!("position {} already processed", commit.position_id).into())
            }
            Some(_) => {}
            None => return Err(format!("no such position {}", commit.position_id).into()),
        }

        let cluster_id = match commit.change {
            ClusterChange::Create {
                terminal_id,
                anchor,
                occurred_at,
            } => {
                self.next_cluster_id += 1;
                let id = self.next_cluster_id;
                self.clusters.insert(
                    id,
                    Cluster::from_parts(id, terminal_id, anchor, 1, occurred_at),
                );
                id
            }
            ClusterChange::RegisterVisit {
                cluster_id,
                visit_count,
                last_visited_at,
            } => {
                let cluster = self
                    .clusters
                    .get_mut(&cluster_id)
                    .ok_or_else(|| format!("no such cluster {}", cluster_id))?;

                *cluster = Cluster::from_parts(
                    cluster_id,
                    cluster.terminal_id(),
                    cluster.anchor(),
                    visit_count,
                    last_visited_at,
                );
                cluster_id
            }
            ClusterChange::Merge { cluster_id } => {
                if !self.clusters.contains_key(&cluster_id) {
                    return Err(format!("no such cluster {}", cluster_id).into());
                }
                cluster_id
            }
        };

        self.associations.push(ClusterAssociation {
            cluster_id,
            position_id: commit.position_id,
            accepted: commit.accepted,
        });

        if let Some(p) = self.positions.get_mut(&commit.position_id) {
            p.processed = true;
        }

        Ok(cluster_id)
    }
}
