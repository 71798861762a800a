/*!
 * Fold a terminal's pending positions into its visit clusters.
 *
 * Each pending position is compared against the fixed anchor of every cluster the terminal
 * already has. A position with no cluster within the spatial threshold starts a new cluster. A
 * position near a cluster either merges into the current visit there, or, if it is far enough in
 * time from the last registered visit, counts as a new visit.
 *
 * Positions are committed one at a time, so a call can be stopped between any two positions and
 * picked up again later without leaving anything half done.
 */

use crate::{
    cluster::{AssociationKind, Cluster},
    error::AssociationError,
    geo::Coord,
    lock::TerminalLocks,
    position::{sort_for_folding, PositionEvent},
    store::{ClusterChange, PositionCommit, VisitStore},
    PositionId, TerminalId,
};
use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use std::{
    fmt::{self, Display},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Pings closer than this to a cluster anchor, in meters, belong to that cluster.
pub const DEFAULT_SPATIAL_THRESHOLD_METERS: f64 = 200.0;
/// Pings at a cluster more than this many minutes from the last visit start a new visit.
pub const DEFAULT_TEMPORAL_THRESHOLD_MINUTES: i64 = 30;

static_assertions::const_assert!(DEFAULT_TEMPORAL_THRESHOLD_MINUTES > 0);

/// The thresholds that control clustering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssociationConfig {
    /// Maximum distance in meters from a cluster anchor, inclusive.
    pub spatial_threshold_meters: f64,
    /// A gap longer than this since the last visit starts a new one.
    pub temporal_threshold: Duration,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        AssociationConfig {
            spatial_threshold_meters: DEFAULT_SPATIAL_THRESHOLD_METERS,
            temporal_threshold: Duration::minutes(DEFAULT_TEMPORAL_THRESHOLD_MINUTES),
        }
    }
}

impl AssociationConfig {
    /// Build a checked configuration from a distance in meters and a gap in whole minutes.
    pub fn from_minutes(
        spatial_threshold_meters: f64,
        temporal_threshold_minutes: i64,
    ) -> Result<Self, AssociationError> {
        let temporal_threshold = Duration::try_minutes(temporal_threshold_minutes).ok_or(
            AssociationError::Config("temporal threshold is out of range"),
        )?;

        let config = AssociationConfig {
            spatial_threshold_meters,
            temporal_threshold,
        };
        config.validate()?;

        Ok(config)
    }

    /// Check the thresholds make sense.
    pub fn validate(&self) -> Result<(), AssociationError> {
        if !self.spatial_threshold_meters.is_finite() || self.spatial_threshold_meters <= 0.0 {
            return Err(AssociationError::Config(
                "spatial threshold must be a positive number of meters",
            ));
        }

        if self.temporal_threshold <= Duration::zero() {
            return Err(AssociationError::Config(
                "temporal threshold must be a positive duration",
            ));
        }

        Ok(())
    }
}

/// What a single call to [ClusterAssociationEngine::associate_for_terminal] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssociationSummary {
    /// Pending positions loaded from the store.
    pub fetched: usize,
    /// Positions associated with a cluster and marked processed.
    pub processed: usize,
    /// Positions that created a cluster.
    pub new_clusters: usize,
    /// Positions that registered a new visit at an existing cluster.
    pub new_visits: usize,
    /// Positions merged into an ongoing visit.
    pub merges: usize,
    /// Positions left pending because their data was bad.
    pub skipped: usize,
    /// The call stopped early because it was asked to.
    pub cancelled: bool,
}

impl AssociationSummary {
    /// The number of positions that were folded in a given way.
    pub fn count_of(&self, kind: AssociationKind) -> usize {
        match kind {
            AssociationKind::NewCluster => self.new_clusters,
            AssociationKind::NewVisit => self.new_visits,
            AssociationKind::Merge => self.merges,
        }
    }

    /// Add the counts from another summary into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.fetched += other.fetched;
        self.processed += other.processed;
        self.new_clusters += other.new_clusters;
        self.new_visits += other.new_visits;
        self.merges += other.merges;
        self.skipped += other.skipped;
        self.cancelled |= other.cancelled;
    }

    fn record(&mut self, kind: AssociationKind) {
        self.processed += 1;
        match kind {
            AssociationKind::NewCluster => self.new_clusters += 1,
            AssociationKind::NewVisit => self.new_visits += 1,
            AssociationKind::Merge => self.merges += 1,
        }
    }
}

impl Display for AssociationSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        write!(
            f,
            "fetched = {} processed = {} new clusters = {} new visits = {} merged = {} skipped = {}",
            self.fetched,
            self.processed,
            self.new_clusters,
            self.new_visits,
            self.merges,
            self.skipped
        )?;

        if self.cancelled {
            write!(f, " (cancelled)")?;
        }

        Ok(())
    }
}

/// Incrementally clusters the positions of one terminal at a time.
pub struct ClusterAssociationEngine<S> {
    store: S,
    config: AssociationConfig,
    locks: TerminalLocks,
    cancel: Option<Arc<AtomicBool>>,
    skipped: Vec<PositionId>,
}

impl<S: VisitStore> ClusterAssociationEngine<S> {
    /// Create an engine working against `store`.
    ///
    /// Every engine that may run at the same time as this one must share `locks`.
    pub fn new(store: S, config: AssociationConfig, locks: TerminalLocks) -> Self {
        ClusterAssociationEngine {
            store,
            config,
            locks,
            cancel: None,
            skipped: vec![],
        }
    }

    /// Stop between positions once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &AssociationConfig {
        &self.config
    }

    /// Get access to the store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Give the store back.
    pub fn into_store(self) -> S {
        self.store
    }

    /// The ids of the positions the last call skipped for bad data.
    pub fn skipped_positions(&self) -> &[PositionId] {
        &self.skipped
    }

    /**
     * Fold up to `max_batch_size` of a terminal's pending positions into its clusters.
     *
     * Positions are handled oldest first. Each one is committed, together with the cluster it
     * creates or updates, before the next one is looked at.
     *
     * #Returns
     * A summary of what was done. Positions with bad data are skipped and counted, they don't
     * cause an error.
     *
     * #Errors
     * * `TerminalBusy` if another call holds the terminal, nothing was done.
     * * `Config` if the thresholds are unusable, nothing was done.
     * * `Persistence` if the store failed. Positions before the failure are committed, the rest
     *   are still pending.
     */
    pub fn associate_for_terminal(
        &mut self,
        terminal: TerminalId,
        max_batch_size: usize,
    ) -> Result<AssociationSummary, AssociationError> {
        self.skipped.clear();
        self.config.validate()?;

        let _guard = self
            .locks
            .try_lock(terminal)
            .ok_or(AssociationError::TerminalBusy(terminal))?;

        let mut summary = AssociationSummary::default();
        if max_batch_size == 0 {
            return Ok(summary);
        }

        let mut pending = self.store.pending_positions(terminal, max_batch_size)?;
        summary.fetched = pending.len();
        if pending.is_empty() {
            debug!(target: "engine", "terminal {} has nothing pending", terminal);
            return Ok(summary);
        }

        sort_for_folding(&mut pending);

        let mut clusters = self.store.clusters_for_terminal(terminal)?;

        for position in &pending {
            if self.is_cancelled() {
                info!(target: "engine", "terminal {} cancelled after {} positions", terminal,
                    summary.processed);
                summary.cancelled = true;
                break;
            }

            let (coord, occurred_at) = match position.sample() {
                Ok(sample) => sample,
                Err(err) => {
                    warn!(target: "engine", "skipping position {} for terminal {}: {}",
                        position.id, terminal, err);
                    summary.skipped += 1;
                    self.skipped.push(position.id);
                    continue;
                }
            };

            let kind = match self.fold(terminal, position, coord, occurred_at, &mut clusters) {
                Ok(kind) => kind,
                Err(err) => {
                    error!(target: "engine",
                        "failed to commit position {} for terminal {} after {} positions: {}",
                        position.id, terminal, summary.processed, err);
                    return Err(err);
                }
            };

            summary.record(kind);
        }

        info!(target: "engine", "terminal {}: {}", terminal, summary);

        Ok(summary)
    }

    /// Decide what a single position does, commit it, then bring `clusters` up to date.
    fn fold(
        &mut self,
        terminal: TerminalId,
        position: &PositionEvent,
        coord: Coord,
        occurred_at: DateTime<Utc>,
        clusters: &mut Vec<Cluster>,
    ) -> Result<AssociationKind, AssociationError> {
        let candidate = nearest_cluster(clusters, coord, self.config.spatial_threshold_meters);

        let (kind, change, updated) = match candidate {
            None => (
                AssociationKind::NewCluster,
                ClusterChange::Create {
                    terminal_id: terminal,
                    anchor: coord,
                    occurred_at,
                },
                None,
            ),
            Some(idx) => {
                let cluster = &clusters[idx];
                match cluster.classify(occurred_at, self.config.temporal_threshold) {
                    AssociationKind::NewVisit => {
                        let mut updated = cluster.clone();
                        updated.register_visit(occurred_at);
                        (
                            AssociationKind::NewVisit,
                            ClusterChange::RegisterVisit {
                                cluster_id: updated.id(),
                                visit_count: updated.visit_count(),
                                last_visited_at: updated.last_visited_at(),
                            },
                            Some((idx, updated)),
                        )
                    }
                    _ => (
                        AssociationKind::Merge,
                        ClusterChange::Merge {
                            cluster_id: cluster.id(),
                        },
                        None,
                    ),
                }
            }
        };

        let cluster_id = self.store.commit(&PositionCommit {
            position_id: position.id,
            change,
            accepted: true,
        })?;

        // Only touch the working copy once the store has it.
        match (kind, updated) {
            (AssociationKind::NewCluster, _) => {
                clusters.push(Cluster::from_parts(
                    cluster_id,
                    terminal,
                    coord,
                    1,
                    occurred_at,
                ));
            }
            (AssociationKind::NewVisit, Some((idx, updated))) => clusters[idx] = updated,
            _ => {}
        }

        debug!(target: "engine", "position {} at {} {} -> cluster {}", position.id, coord,
            kind, cluster_id);

        Ok(kind)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }
}

/// The index of the cluster nearest to `coord` within `threshold` meters.
///
/// When two anchors are exactly the same distance away, the older cluster (lower id) wins.
fn nearest_cluster(clusters: &[Cluster], coord: Coord, threshold: f64) -> Option<usize> {
    clusters
        .iter()
        .enumerate()
        .map(|(idx, cluster)| (idx, cluster.id(), cluster.distance_to(coord)))
        .filter(|&(_, _, dist)| dist <= threshold)
        .min_by(|(_, left_id, left_dist), (_, right_id, right_dist)| {
            left_dist
                .total_cmp(right_dist)
                .then_with(|| left_id.cmp(right_id))
        })
        .map(|(idx, _, _)| idx)
}
