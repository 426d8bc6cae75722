//! # tabula-core — document-side state for collaborative spreadsheets
//!
//! - [`cell`] — A1 cell addressing and the [`CellStore`] seam to the host's
//!   `cells` mapping
//! - [`protection`] — per-sheet protection with optional password and
//!   per-cell lock flags
//!
//! Formula evaluation, rendering and persistence live elsewhere; this crate
//! only answers "may this cell be edited?" and forwards accepted edits.

pub mod cell;
pub mod protection;

pub use cell::{CellId, CellIdError, CellStore, CellValue, MemoryCells};
pub use protection::{
    PasswordVerifier, PlaintextVerifier, ProtectionBook, ProtectionError, SealedPassword,
    SheetProtection, DEFAULT_CELL_LOCKED, MIN_PASSWORD_LEN,
};
