//! Cluster the geoposition pings of terminals into frequently visited places.
//!
//! Every terminal is handled on its own. Its pending positions are folded, oldest first, into a
//! small set of clusters, each anchored where it was first seen, that count how many distinct
//! visits the terminal has made there.

pub use cluster::{AssociationKind, Cluster, ClusterAssociation};
pub use database::{VisitDatabase, VisitDatabaseAddPositions};
pub use driver::{drain_terminal, BatchDriver, BatchOptions, BatchSummary, TerminalReport};
pub use engine::{
    AssociationConfig, AssociationSummary, ClusterAssociationEngine,
    DEFAULT_SPATIAL_THRESHOLD_METERS, DEFAULT_TEMPORAL_THRESHOLD_MINUTES,
};
pub use error::{AssociationError, GeoVisitResult, PositionDataError};
pub use geo::{great_circle_distance, time_delta, Coord};
pub use lock::{TerminalGuard, TerminalLocks};
pub use position::PositionEvent;
pub use store::{ClusterChange, ClusterStore, MemoryStore, PositionCommit, PositionStore, VisitStore};

/// Identifies a terminal (an installation of the app on a device).
pub type TerminalId = i64;
/// Row id of a position.
pub type PositionId = i64;
/// Row id of a cluster.
pub type ClusterId = i64;

/**************************************************************************************************
 * Private Implementation
 *************************************************************************************************/
mod cluster;
mod database;
mod driver;
mod engine;
mod error;
mod geo;
mod lock;
mod position;
mod store;
