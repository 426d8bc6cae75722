//! Remote cursors and their on-screen markers.
//!
//! ```text
//! CursorMove message ──▶ CursorBoard::upsert()      (one entry per user)
//!                               │
//!                               ▼
//!       render_markers(board, geometry)   ◀── CellGeometry::cell_to_screen()
//!                               │
//!                               ▼
//!                     Vec<CursorMarker>  (label + color + x/y)
//! ```
//!
//! Cells the geometry cannot place (scrolled away, out of range) are left
//! out of the output; that is never an error.

use std::collections::BTreeMap;

use crate::protocol::CursorMove;

/// Pixel position of a cell's top-left corner in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
}

impl ScreenPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Maps a cell to the screen. Supplied by the grid renderer.
pub trait CellGeometry {
    fn cell_to_screen(&self, row: u32, col: u32) -> Option<ScreenPoint>;
}

impl<F> CellGeometry for F
where
    F: Fn(u32, u32) -> Option<ScreenPoint>,
{
    fn cell_to_screen(&self, row: u32, col: u32) -> Option<ScreenPoint> {
        self(row, col)
    }
}

/// A remote collaborator's active cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaboratorCursor {
    pub user_id: String,
    pub user_name: String,
    pub row: u32,
    pub col: u32,
    pub color: String,
}

impl From<CursorMove> for CollaboratorCursor {
    fn from(msg: CursorMove) -> Self {
        let color = msg.color.unwrap_or_else(|| cursor_color(&msg.user_id));
        Self {
            user_id: msg.user_id,
            user_name: msg.user_name,
            row: msg.row,
            col: msg.col,
            color,
        }
    }
}

/// Render-ready marker for one cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorMarker {
    pub user_id: String,
    pub label: String,
    pub color: String,
    pub position: ScreenPoint,
}

/// Live cursors, at most one per user. Each move overwrites wholesale.
#[derive(Debug, Default, Clone)]
pub struct CursorBoard {
    cursors: BTreeMap<String, CollaboratorCursor>,
}

impl CursorBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the user's cursor.
    pub fn upsert(&mut self, cursor: CollaboratorCursor) {
        self.cursors.insert(cursor.user_id.clone(), cursor);
    }

    /// Cursor for one user.
    pub fn get(&self, user_id: &str) -> Option<&CollaboratorCursor> {
        self.cursors.get(user_id)
    }

    /// Drop one user's cursor.
    pub fn remove(&mut self, user_id: &str) -> Option<CollaboratorCursor> {
        self.cursors.remove(user_id)
    }

    /// Forget every cursor, e.g. when the connection drops.
    pub fn clear(&mut self) {
        self.cursors.clear();
    }

    /// All cursors, keyed by user id.
    pub fn cursors(&self) -> &BTreeMap<String, CollaboratorCursor> {
        &self.cursors
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Keep only the cursors whose user id passes `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.cursors.retain(|user_id, _| keep(user_id));
    }

    /// Markers for every cursor the geometry can place, ordered by user id.
    pub fn render_markers(&self, geometry: &impl CellGeometry) -> Vec<CursorMarker> {
        render_markers(self.cursors.values(), geometry)
    }
}

/// Build markers from any set of cursors.
pub fn render_markers<'a>(
    cursors: impl IntoIterator<Item = &'a CollaboratorCursor>,
    geometry: &impl CellGeometry,
) -> Vec<CursorMarker> {
    cursors
        .into_iter()
        .filter_map(|cursor| {
            let position = geometry.cell_to_screen(cursor.row, cursor.col)?;
            Some(CursorMarker {
                user_id: cursor.user_id.clone(),
                label: cursor.user_name.clone(),
                color: cursor.color.clone(),
                position,
            })
        })
        .collect()
}

/// Stable, vivid `#rrggbb` color for a user id.
///
/// The hue comes from an FNV-1a hash of the id, so the same user gets the
/// same color in every session and on every peer.
pub fn cursor_color(user_id: &str) -> String {
    let hash = user_id
        .bytes()
        .fold(0x811c_9dc5_u32, |h, byte| (h ^ u32::from(byte)).wrapping_mul(0x0100_0193));

    let [r, g, b] = hsl_to_rgb8((hash % 360) as f32, 0.7, 0.5);
    format!("#{r:02x}{g:02x}{b:02x}")
}

/// HSL to 8-bit RGB. `hue` in degrees `[0, 360)`, the rest in `[0, 1]`.
fn hsl_to_rgb8(hue: f32, saturation: f32, lightness: f32) -> [u8; 3] {
    let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
    let sector = hue / 60.0;
    let second = chroma * (1.0 - (sector % 2.0 - 1.0).abs());

    let (r, g, b) = match sector as u32 {
        0 => (chroma, second, 0.0),
        1 => (second, chroma, 0.0),
        2 => (0.0, chroma, second),
        3 => (0.0, second, chroma),
        4 => (second, 0.0, chroma),
        _ => (chroma, 0.0, second),
    };
    let offset = lightness - chroma / 2.0;
    [r, g, b].map(|channel| ((channel + offset) * 255.0).round() as u8)
}
