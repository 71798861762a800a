use crate::TerminalId;
use std::{
    error::Error,
    fmt::{Display, Formatter},
};

/// The result type used by the stores and the tools built on them.
pub type GeoVisitResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// A position that can't be clustered because its coordinates or time are missing or bogus.
///
/// These are never fatal, the position is left unprocessed and the batch moves on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionDataError {
    pub msg: &'static str,
}

impl Display for PositionDataError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.msg)
    }
}

impl Error for PositionDataError {}

/// Errors that stop a call to
/// [associate_for_terminal](crate::ClusterAssociationEngine::associate_for_terminal).
#[derive(Debug)]
pub enum AssociationError {
    /// Another call is already working on this terminal. Nothing was done.
    TerminalBusy(TerminalId),
    /// The engine configuration is unusable.
    Config(&'static str),
    /// The store failed to load or commit. The position being committed is still pending.
    Persistence(Box<dyn Error + Send + Sync>),
}

impl AssociationError {
    /// Is this the error for a terminal that is locked by somebody else?
    pub fn is_busy(&self) -> bool {
        matches!(self, AssociationError::TerminalBusy(_))
    }
}

impl Display for AssociationError {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        match self {
            AssociationError::TerminalBusy(terminal) => {
                write!(f, "terminal {} is already being processed", terminal)
            }
            AssociationError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            AssociationError::Persistence(err) => write!(f, "store failure: {}", err),
        }
    }
}

impl Error for AssociationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            AssociationError::Persistence(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<Box<dyn Error + Send + Sync>> for AssociationError {
    fn from(err: Box<dyn Error + Send + Sync>) -> Self {
        AssociationError::Persistence(err)
    }
}

impl From<rusqlite::Error> for AssociationError {
    fn from(err: rusqlite::Error) -> Self {
        AssociationError::Persistence(Box::new(err))
    }
}
