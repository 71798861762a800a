/*!
 * Raw geoposition pings reported by a terminal.
 *
 * A PositionEvent is created by the ingestion side of the system, which is not part of this
 * crate. Nothing is trusted about the row until [PositionEvent::sample] checks it.
 */

use crate::{error::PositionDataError, geo::Coord, PositionId, TerminalId};
use chrono::{DateTime, Utc};

/// A single geoposition ping for a terminal.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    /// Row id from the store.
    pub id: PositionId,
    /// The terminal (device installation) that reported the ping.
    pub terminal_id: TerminalId,
    /// Where the terminal was, if the row had both coordinates.
    pub coord: Option<Coord>,
    /// When the terminal was there.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Set once the ping has been associated with a cluster, and never unset.
    pub processed: bool,
}

impl PositionEvent {
    /// Create a new, unprocessed position with good data.
    pub fn new(
        id: PositionId,
        terminal_id: TerminalId,
        coord: Coord,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        PositionEvent {
            id,
            terminal_id,
            coord: Some(coord),
            occurred_at: Some(occurred_at),
            processed: false,
        }
    }

    /// Get the location and time of this ping, checking that both are usable.
    pub fn sample(&self) -> Result<(Coord, DateTime<Utc>), PositionDataError> {
        let coord = self.coord.ok_or(PositionDataError {
            msg: "missing coordinates",
        })?;

        if !coord.lat.is_finite() || !coord.lon.is_finite() {
            return Err(PositionDataError {
                msg: "coordinates are not finite numbers",
            });
        }

        if !coord.is_valid() {
            return Err(PositionDataError {
                msg: "coordinates out of range",
            });
        }

        let occurred_at = self.occurred_at.ok_or(PositionDataError {
            msg: "missing or invalid timestamp",
        })?;

        Ok((coord, occurred_at))
    }
}

/// Put positions in the order they must be folded in, oldest first.
///
/// Positions that [PositionEvent::sample] rejects sort to the end, behind every usable position,
/// so a run of bad rows can never fill a batch while good rows wait. The id breaks ties so the
/// order is stable from run to run.
pub(crate) fn sort_for_folding(positions: &mut [PositionEvent]) {
    positions.sort_by_key(|p| (p.sample().is_err(), p.occurred_at, p.id));
}
