//! Cell addressing and the `cells` mapping owned by the document model.
//!
//! The collaboration layer never evaluates formulas or renders the grid.
//! It only needs to address cells and hand incremental updates to whatever
//! store the host application uses, through [`CellStore`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Zero-based cell coordinate.
///
/// Rendered and parsed in A1 notation (`A1` is row 0, col 0), which is also
/// how it travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellId {
    pub row: u32,
    pub col: u32,
}

impl CellId {
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellIdError {
    #[error("Empty cell reference")]
    Empty,
    #[error("Missing column letters in '{0}'")]
    MissingColumn(String),
    #[error("Missing row number in '{0}'")]
    MissingRow(String),
    #[error("Invalid cell reference '{0}'")]
    Invalid(String),
    #[error("Cell reference out of range: '{0}'")]
    OutOfRange(String),
}

/// Convert a zero-based column index to its letter form (0 → `A`, 26 → `AA`).
fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Row 0 is displayed as 1; widen so u32::MAX doesn't overflow.
        write!(f, "{}{}", column_letters(self.col), u64::from(self.row) + 1)
    }
}

impl FromStr for CellId {
    type Err = CellIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CellIdError::Empty);
        }

        let split = s
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(s.len());
        let (letters, digits) = s.split_at(split);

        if letters.is_empty() {
            return Err(CellIdError::MissingColumn(s.to_string()));
        }
        if digits.is_empty() {
            return Err(CellIdError::MissingRow(s.to_string()));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CellIdError::Invalid(s.to_string()));
        }

        let mut col: u64 = 0;
        for b in letters.bytes() {
            let value = u64::from(b.to_ascii_uppercase() - b'A') + 1;
            col = col * 26 + value;
            if col > u64::from(u32::MAX) + 1 {
                return Err(CellIdError::OutOfRange(s.to_string()));
            }
        }

        let row: u64 = digits
            .parse()
            .map_err(|_| CellIdError::OutOfRange(s.to_string()))?;
        if row == 0 {
            return Err(CellIdError::Invalid(s.to_string()));
        }
        if row - 1 > u64::from(u32::MAX) {
            return Err(CellIdError::OutOfRange(s.to_string()));
        }

        Ok(CellId {
            row: (row - 1) as u32,
            col: (col - 1) as u32,
        })
    }
}

impl TryFrom<String> for CellId {
    type Error = CellIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellId> for String {
    fn from(id: CellId) -> Self {
        id.to_string()
    }
}

/// Raw cell input as typed by a user (`"42"`, `"=SUM(A1:A3)"`).
///
/// `None` clears the cell.
pub type CellValue = Option<String>;

/// The document model's `cells` mapping, seen from the collaboration layer.
///
/// Implemented by the host application. Only reads and whole-value
/// replacement are needed here.
pub trait CellStore {
    /// Current raw content of a cell, if any.
    fn get(&self, sheet: &str, cell: CellId) -> Option<&str>;

    /// Replace (or clear) the content of a cell.
    fn apply(&mut self, sheet: &str, cell: CellId, value: CellValue);
}

/// In-memory [`CellStore`], used by tests and headless sessions.
#[derive(Debug, Default, Clone)]
pub struct MemoryCells {
    cells: HashMap<(String, CellId), String>,
}

impl MemoryCells {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl CellStore for MemoryCells {
    fn get(&self, sheet: &str, cell: CellId) -> Option<&str> {
        self.cells
            .get(&(sheet.to_string(), cell))
            .map(String::as_str)
    }

    fn apply(&mut self, sheet: &str, cell: CellId, value: CellValue) {
        let key = (sheet.to_string(), cell);
        match value {
            Some(raw) => {
                self.cells.insert(key, raw);
            }
            None => {
                self.cells.remove(&key);
            }
        }
    }
}
