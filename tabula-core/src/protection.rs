//! Sheet protection and per-cell lock flags.
//!
//! Protection gates *content* edits only. Lock flags can always be changed,
//! protected or not; they are simply ignored while the sheet is unprotected.
//! Cells are locked by default, so protecting a sheet freezes every cell
//! except the ones explicitly unlocked beforehand.
//!
//! ```text
//!              protect(pw?)                 unprotect(pw?)
//!  Unprotected ────────────▶ Protected ─────────────────────▶ Unprotected
//!      │                        │   wrong pw: AuthorizationError,
//!      │ is_edit_allowed: true  │   state unchanged
//!      ▼                        ▼
//!   any cell              only cells with locked == false
//! ```
//!
//! Passwords are kept behind [`PasswordVerifier`]. The default
//! [`PlaintextVerifier`] stores and compares them verbatim; there is no
//! recovery path if the password is lost.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::cell::CellId;

/// Minimum password length, counted in characters.
pub const MIN_PASSWORD_LEN: usize = 4;

/// Lock state of a cell that was never touched.
pub const DEFAULT_CELL_LOCKED: bool = true;

/// Errors surfaced synchronously to the caller. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtectionError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: password does not match")]
    Authorization,
}

/// A password as held by a protected sheet.
///
/// Opaque to everything except the [`PasswordVerifier`] that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedPassword(String);

impl SealedPassword {
    pub fn new(sealed: impl Into<String>) -> Self {
        Self(sealed.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SealedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealedPassword(..)")
    }
}

/// Turns a password into its stored form and checks candidates against it.
///
/// Swap this out to move from plaintext to a hash-and-compare scheme without
/// touching any call site.
pub trait PasswordVerifier: Send + Sync {
    fn seal(&self, password: &str) -> SealedPassword;
    fn verify(&self, sealed: &SealedPassword, candidate: &str) -> bool;
}

/// Stores the password verbatim and compares byte-for-byte.
///
/// Only acceptable while protection state never leaves this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextVerifier;

impl PasswordVerifier for PlaintextVerifier {
    fn seal(&self, password: &str) -> SealedPassword {
        SealedPassword(password.to_string())
    }

    fn verify(&self, sealed: &SealedPassword, candidate: &str) -> bool {
        sealed.0.as_bytes() == candidate.as_bytes()
    }
}

/// Protection state for one sheet, plus its cell lock flags.
pub struct SheetProtection {
    is_protected: bool,
    password: Option<SealedPassword>,
    locks: HashMap<CellId, bool>,
    verifier: Arc<dyn PasswordVerifier>,
}

impl SheetProtection {
    /// Unprotected sheet, all cells locked, plaintext passwords.
    pub fn new() -> Self {
        Self::with_verifier(Arc::new(PlaintextVerifier))
    }

    pub fn with_verifier(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self {
            is_protected: false,
            password: None,
            locks: HashMap::new(),
            verifier,
        }
    }

    pub fn is_protected(&self) -> bool {
        self.is_protected
    }

    /// Whether a password is currently required to unprotect.
    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    /// Protect the sheet, optionally with a password.
    ///
    /// Fails if a password shorter than [`MIN_PASSWORD_LEN`] is supplied or
    /// the sheet is already protected.
    pub fn protect(&mut self, password: Option<&str>) -> Result<(), ProtectionError> {
        if self.is_protected {
            return Err(ProtectionError::Validation(
                "sheet is already protected".into(),
            ));
        }
        if let Some(pw) = password {
            let len = pw.chars().count();
            if len < MIN_PASSWORD_LEN {
                return Err(ProtectionError::Validation(format!(
                    "password must be at least {MIN_PASSWORD_LEN} characters, got {len}"
                )));
            }
        }

        self.password = password.map(|pw| self.verifier.seal(pw));
        self.is_protected = true;
        log::debug!("Sheet protected (password: {})", self.password.is_some());
        Ok(())
    }

    /// Protect with a confirmation value, as a protect dialog would.
    pub fn protect_with_confirmation(
        &mut self,
        password: Option<&str>,
        confirmation: Option<&str>,
    ) -> Result<(), ProtectionError> {
        if let Some(confirm) = confirmation {
            if password != Some(confirm) {
                return Err(ProtectionError::Validation(
                    "password confirmation does not match".into(),
                ));
            }
        }
        self.protect(password)
    }

    /// Remove protection.
    ///
    /// Without a stored password this always succeeds. With one, the
    /// candidate must match exactly; a missing candidate counts as empty.
    /// Lock flags are left untouched either way.
    pub fn unprotect(&mut self, password: Option<&str>) -> Result<(), ProtectionError> {
        if let Some(sealed) = &self.password {
            let candidate = password.unwrap_or("");
            if !self.verifier.verify(sealed, candidate) {
                log::warn!("Rejected unprotect attempt: wrong password");
                return Err(ProtectionError::Authorization);
            }
        }

        self.is_protected = false;
        self.password = None;
        log::debug!("Sheet unprotected");
        Ok(())
    }

    /// Set a cell's lock flag. Always permitted.
    pub fn set_cell_locked(&mut self, cell: CellId, locked: bool) {
        if locked == DEFAULT_CELL_LOCKED {
            self.locks.remove(&cell);
        } else {
            self.locks.insert(cell, locked);
        }
    }

    pub fn cell_locked(&self, cell: CellId) -> bool {
        self.locks.get(&cell).copied().unwrap_or(DEFAULT_CELL_LOCKED)
    }

    /// The single predicate the mutation path consults before any edit.
    pub fn is_edit_allowed(&self, cell: CellId) -> bool {
        !self.is_protected || !self.cell_locked(cell)
    }

    /// Cells whose lock flag differs from the default.
    pub fn unlocked_cells(&self) -> impl Iterator<Item = CellId> + '_ {
        self.locks
            .iter()
            .filter(|(_, locked)| !**locked)
            .map(|(cell, _)| *cell)
    }
}

impl Default for SheetProtection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SheetProtection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetProtection")
            .field("is_protected", &self.is_protected)
            .field("has_password", &self.password.is_some())
            .field("overridden_locks", &self.locks.len())
            .finish()
    }
}

/// Protection state for every sheet of a workbook, keyed by sheet name.
///
/// Sheets that were never protected or locked have no entry and behave as
/// a fresh [`SheetProtection`].
pub struct ProtectionBook {
    sheets: HashMap<String, SheetProtection>,
    verifier: Arc<dyn PasswordVerifier>,
}

impl ProtectionBook {
    pub fn new() -> Self {
        Self::with_verifier(Arc::new(PlaintextVerifier))
    }

    pub fn with_verifier(verifier: Arc<dyn PasswordVerifier>) -> Self {
        Self {
            sheets: HashMap::new(),
            verifier,
        }
    }

    pub fn sheet(&self, name: &str) -> Option<&SheetProtection> {
        self.sheets.get(name)
    }

    /// Get or create the protection state for a sheet.
    pub fn sheet_mut(&mut self, name: &str) -> &mut SheetProtection {
        let verifier = self.verifier.clone();
        self.sheets
            .entry(name.to_string())
            .or_insert_with(|| SheetProtection::with_verifier(verifier))
    }

    pub fn protect_sheet(&mut self, name: &str, password: Option<&str>) -> Result<(), ProtectionError> {
        self.sheet_mut(name).protect(password)
    }

    pub fn unprotect_sheet(&mut self, name: &str, password: Option<&str>) -> Result<(), ProtectionError> {
        self.sheet_mut(name).unprotect(password)
    }

    pub fn set_cell_locked(&mut self, name: &str, cell: CellId, locked: bool) {
        self.sheet_mut(name).set_cell_locked(cell, locked);
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.sheets.get(name).is_some_and(SheetProtection::is_protected)
    }

    pub fn is_edit_allowed(&self, name: &str, cell: CellId) -> bool {
        self.sheets
            .get(name)
            .map_or(true, |sheet| sheet.is_edit_allowed(cell))
    }
}

impl Default for ProtectionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProtectionBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.sheets.iter()).finish()
    }
}
