use tabula_core::{CellId, ProtectionError};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Why an edit was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The sheet is protected and the cell is locked.
    LockedCell,
    /// The author only has viewer permission.
    ReadOnly,
}

/// Caller-visible failures of the collaboration layer.
///
/// Transport problems are not here: the connector absorbs them and reports
/// them through its observer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollabError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Protection(#[from] ProtectionError),
    #[error("Edit to {sheet}!{cell} rejected: {reason:?}")]
    EditRejected {
        sheet: String,
        cell: CellId,
        reason: RejectReason,
    },
}
