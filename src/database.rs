use crate::{
    cluster::{Cluster, ClusterAssociation},
    error::GeoVisitResult,
    geo::Coord,
    position::PositionEvent,
    store::{ClusterChange, ClusterStore, PositionCommit, PositionStore, VisitStore},
    ClusterId, PositionId, TerminalId,
};
use chrono::{DateTime, Utc};
use log::warn;
use rusqlite::{Connection, OpenFlags, ToSql, TransactionBehavior};
use std::path::Path;

/// Represents a connection to the database where positions, clusters, and associations live.
pub struct VisitDatabase {
    conn: Connection,
}

static_assertions::assert_impl_all!(VisitDatabase: Send);

impl VisitDatabase {
    /// Initialize a database.
    ///
    /// Initialize a database to make sure it exists and is set up properly. This should be run in
    /// the main thread before any other threads open a connection to the database to ensure
    /// consistency.
    pub fn initialize<P: AsRef<Path>>(path: P) -> GeoVisitResult<()> {
        let path = path.as_ref();

        let _conn = Self::open_database_to_write(path)?;
        Ok(())
    }

    /// Open a connection to the database.
    pub fn connect<P: AsRef<Path>>(path: P) -> GeoVisitResult<Self> {
        let path = path.as_ref();

        let conn = Self::open_database_to_write(path)?;
        Ok(VisitDatabase { conn })
    }

    /// Open a private, in memory database. Handy for testing and one off runs.
    pub fn connect_in_memory() -> GeoVisitResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::set_up(&conn)?;

        Ok(VisitDatabase { conn })
    }

    fn open_database_to_write(path: &Path) -> GeoVisitResult<Connection> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        Self::set_up(&conn)?;

        Ok(conn)
    }

    fn set_up(conn: &Connection) -> GeoVisitResult<()> {
        // Several workers write at once, but each transaction is a single position, so if we wait
        // this long something has gone terribly wrong.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        const QUERY: &str = include_str!("database/create_visit_db.sql");
        conn.execute_batch(QUERY)?;

        Ok(())
    }

    /// Prepare to add raw position rows to the database.
    ///
    /// All rows added with the handle are committed together when it is dropped.
    pub fn prepare_to_add_positions(&self) -> GeoVisitResult<VisitDatabaseAddPositions<'_>> {
        const QUERY: &str = include_str!("database/add_position.sql");

        let stmt = self.conn.prepare(QUERY)?;
        self.conn.execute_batch("BEGIN TRANSACTION")?;

        Ok(VisitDatabaseAddPositions {
            stmt,
            conn: &self.conn,
        })
    }

    /// Get the associations of a terminal's positions that have the given `accepted` flag.
    pub fn associations_for_terminal(
        &self,
        terminal: TerminalId,
        accepted: bool,
    ) -> GeoVisitResult<Vec<ClusterAssociation>> {
        const QUERY: &str = include_str!("database/query_terminal_associations.sql");
        let mut stmt = self.conn.prepare_cached(QUERY)?;

        let rows = stmt
            .query_and_then(
                [&terminal as &dyn ToSql, &accepted],
                |row| -> rusqlite::Result<ClusterAssociation> {
                    Ok(ClusterAssociation {
                        cluster_id: row.get(0)?,
                        position_id: row.get(1)?,
                        accepted: row.get(2)?,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }
}

pub struct VisitDatabaseAddPositions<'a> {
    stmt: rusqlite::Statement<'a>,
    conn: &'a Connection,
}

impl<'a> VisitDatabaseAddPositions<'a> {
    /// Add a position with good data.
    pub fn add(
        &mut self,
        terminal: TerminalId,
        coord: Coord,
        occurred_at: DateTime<Utc>,
    ) -> GeoVisitResult<PositionId> {
        self.add_raw(terminal, Some(coord.lat), Some(coord.lon), Some(occurred_at))
    }

    /// Add a position exactly as it arrived, missing values and all.
    pub fn add_raw(
        &mut self,
        terminal: TerminalId,
        lat: Option<f64>,
        lon: Option<f64>,
        occurred_at: Option<DateTime<Utc>>,
    ) -> GeoVisitResult<PositionId> {
        let occurred_at = occurred_at.map(|t| t.timestamp());

        self.stmt
            .execute([&terminal as &dyn ToSql, &lat, &lon, &occurred_at])?;

        Ok(self.conn.last_insert_rowid())
    }
}

impl<'a> Drop for VisitDatabaseAddPositions<'a> {
    fn drop(&mut self) {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            warn!(target: "database", "Error committing positions: {}", err);
        }
    }
}

impl PositionStore for VisitDatabase {
    fn pending_positions(
        &mut self,
        terminal: TerminalId,
        limit: usize,
    ) -> GeoVisitResult<Vec<PositionEvent>> {
        const QUERY: &str = include_str!("database/query_pending_positions.sql");
        let mut stmt = self.conn.prepare_cached(QUERY)?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = stmt
            .query_and_then(
                [&terminal as &dyn ToSql, &limit],
                |row| -> rusqlite::Result<PositionEvent> {
                    // Bad values in these columns are a problem with the position, not the
                    // database, so they come back as missing and the engine sorts it out.
                    let lat: Option<f64> = row.get(2).ok().flatten();
                    let lon: Option<f64> = row.get(3).ok().flatten();
                    let occurred_at: Option<i64> = row.get(4).ok().flatten();

                    let coord = match (lat, lon) {
                        (Some(lat), Some(lon)) => Some(Coord { lat, lon }),
                        _ => None,
                    };

                    Ok(PositionEvent {
                        id: row.get(0)?,
                        terminal_id: row.get(1)?,
                        coord,
                        occurred_at: occurred_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                        processed: false,
                    })
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    fn terminals_with_pending_positions(&mut self) -> GeoVisitResult<Vec<TerminalId>> {
        const QUERY: &str = include_str!("database/query_pending_terminals.sql");
        let mut stmt = self.conn.prepare_cached(QUERY)?;

        let terminals = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<TerminalId>, _>>()?;

        Ok(terminals)
    }
}

impl ClusterStore for VisitDatabase {
    fn clusters_for_terminal(&mut self, terminal: TerminalId) -> GeoVisitResult<Vec<Cluster>> {
        const QUERY: &str = include_str!("database/query_terminal_clusters.sql");
        let mut stmt = self.conn.prepare_cached(QUERY)?;

        let clusters = stmt
            .query_and_then([terminal], |row| -> GeoVisitResult<Cluster> {
                let id: ClusterId = row.get(0)?;
                let terminal_id: TerminalId = row.get(1)?;
                let lat: f64 = row.get(2)?;
                let lon: f64 = row.get(3)?;
                let visit_count: u32 = row.get(4)?;
                let last_visited_at: DateTime<Utc> = DateTime::from_timestamp(row.get(5)?, 0)
                    .ok_or_else(|| format!("invalid last_visited_at for cluster {}", id))?;

                Ok(Cluster::from_parts(
                    id,
                    terminal_id,
                    Coord { lat, lon },
                    visit_count,
                    last_visited_at,
                ))
            })?
            .collect::<GeoVisitResult<Vec<_>>>()?;

        Ok(clusters)
    }
}

impl VisitStore for VisitDatabase {
    fn commit(&mut self, commit: &PositionCommit) -> GeoVisitResult<ClusterId> {
        const ADD_CLUSTER: &str = include_str!("database/add_cluster.sql");
        const UPDATE_CLUSTER: &str = include_str!("database/update_cluster_visit.sql");
        const ADD_ASSOCIATION: &str = include_str!("database/add_association.sql");
        const MARK_PROCESSED: &str = include_str!("database/mark_position_processed.sql");

        // Dropping the transaction without committing rolls it back, so every early return below
        // leaves the database as it was.
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let cluster_id = match commit.change {
            ClusterChange::Create {
                terminal_id,
                anchor,
                occurred_at,
            } => {
                tx.prepare_cached(ADD_CLUSTER)?.execute([
                    &terminal_id as &dyn ToSql,
                    &anchor.lat,
                    &anchor.lon,
                    &occurred_at.timestamp(),
                ])?;
                tx.last_insert_rowid()
            }
            ClusterChange::RegisterVisit {
                cluster_id,
                visit_count,
                last_visited_at,
            } => {
                let num_updated = tx.prepare_cached(UPDATE_CLUSTER)?.execute([
                    &visit_count as &dyn ToSql,
                    &last_visited_at.timestamp(),
                    &cluster_id,
                    &visit_count,
                ])?;

                if num_updated != 1 {
                    return Err(format!(
                        "cluster {} missing or already has {} visits",
                        cluster_id, visit_count
                    )
                    .into());
                }
                cluster_id
            }
            ClusterChange::Merge { cluster_id } => cluster_id,
        };

        tx.prepare_cached(ADD_ASSOCIATION)?.execute([
            &cluster_id as &dyn ToSql,
            &commit.position_id,
            &commit.accepted,
        ])?;

        let num_marked = tx
            .prepare_cached(MARK_PROCESSED)?
            .execute([commit.position_id])?;

        if num_marked != 1 {
            return Err(format!(
                "position {} missing or already processed",
                commit.position_id
            )
            .into());
        }

        tx.commit()?;

        Ok(cluster_id)
    }
}
