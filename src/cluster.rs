/*!
 * Types for working with visit clusters.
 *
 * A cluster is a candidate "frequent place" for a single terminal. It is anchored at the
 * coordinates of the ping that created it, and keeps count of how many distinct visits have been
 * made there.
 */

use crate::{geo::Coord, ClusterId, PositionId, TerminalId};
use chrono::{DateTime, Duration, Utc};
use std::fmt::{self, Display};
use strum::{EnumIter, IntoStaticStr};

/**
 * A place a terminal has been seen at.
 *
 * The anchor is fixed when the cluster is created and is never averaged or moved afterwards, so
 * the reported location of a cluster can't drift as noisy pings pile up on it.
 */
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Row id from the store.
    id: ClusterId,
    /// The terminal this cluster belongs to.
    terminal_id: TerminalId,
    /// The coordinates of the ping that created this cluster.
    anchor: Coord,
    /// Number of distinct visits, always at least 1.
    visit_count: u32,
    /// The time of the ping that registered the most recent visit. Merged pings don't move it.
    last_visited_at: DateTime<Utc>,
}

impl Cluster {
    /// Rebuild a cluster from the values in a store.
    pub fn from_parts(
        id: ClusterId,
        terminal_id: TerminalId,
        anchor: Coord,
        visit_count: u32,
        last_visited_at: DateTime<Utc>,
    ) -> Self {
        debug_assert!(visit_count >= 1);

        Cluster {
            id,
            terminal_id,
            anchor,
            visit_count,
            last_visited_at,
        }
    }

    /// Get the id number of the cluster.
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Get the terminal this cluster belongs to.
    pub fn terminal_id(&self) -> TerminalId {
        self.terminal_id
    }

    /// Get the fixed location of this cluster.
    pub fn anchor(&self) -> Coord {
        self.anchor
    }

    /// Get the number of distinct visits to this cluster.
    pub fn visit_count(&self) -> u32 {
        self.visit_count
    }

    /// Get the time the most recent visit was registered.
    pub fn last_visited_at(&self) -> DateTime<Utc> {
        self.last_visited_at
    }

    /// Distance in meters from the anchor to a coordinate.
    pub fn distance_to(&self, coord: Coord) -> f64 {
        self.anchor.distance_to(coord)
    }

    /// Decide if a ping at `when` starts a new visit or merges into the last one.
    ///
    /// The gap is always measured from the last registered visit, not from the last ping that was
    /// merged, so a slow trickle of pings can't hold a visit open forever.
    pub fn classify(&self, when: DateTime<Utc>, temporal_threshold: Duration) -> AssociationKind {
        if crate::geo::time_delta(when, self.last_visited_at) > temporal_threshold {
            AssociationKind::NewVisit
        } else {
            AssociationKind::Merge
        }
    }

    /// Count a new visit at `when`.
    ///
    /// The last visited time never goes backwards. A late arriving ping from well before the
    /// current visit still counts as a visit, but leaves the time alone.
    pub(crate) fn register_visit(&mut self, when: DateTime<Utc>) {
        self.visit_count += 1;
        if when > self.last_visited_at {
            self.last_visited_at = when;
        }
    }
}

impl Display for Cluster {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        writeln!(f, "             ID: {:9}", self.id)?;
        writeln!(f, "       Terminal: {:9}", self.terminal_id)?;
        writeln!(f, "         Anchor: {:.6},{:.6}", self.anchor.lat, self.anchor.lon)?;
        writeln!(f, "         Visits: {:9}", self.visit_count)?;
        writeln!(f, "Last Visited At: {}", self.last_visited_at)
    }
}

/// Links a position to the single cluster it was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterAssociation {
    pub cluster_id: ClusterId,
    pub position_id: PositionId,
    /// Always true for now. Kept so data quality filtering can reject associations later.
    pub accepted: bool,
}

/// How a position was folded into the clusters of its terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, IntoStaticStr, EnumIter)]
pub enum AssociationKind {
    /// No cluster was close enough, so the position created one.
    #[strum(serialize = "new cluster")]
    NewCluster,
    /// Close to an existing cluster, and long enough since the last visit to count as another.
    #[strum(serialize = "new visit")]
    NewVisit,
    /// Close to an existing cluster during an ongoing visit.
    #[strum(serialize = "merge")]
    Merge,
}
