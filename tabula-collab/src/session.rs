//! One editing session on a shared workbook.
//!
//! Wires the pieces together in one direction:
//!
//! ```text
//! Connector ──ConnectionEvent──▶ CollabSession::handle_event()
//!                                    │ decode
//!                 ┌──────────────────┼─────────────────────┐
//!                 ▼                  ▼                     ▼
//!          PresenceRegistry     CursorBoard        ProtectionBook gate
//!                 │                  │                     │ allowed
//!                 └──── markers() ◀──┘                     ▼
//!                                                      CellStore
//! ```
//!
//! The session itself is plain single-threaded state. Drive it with
//! [`CollabSession::next_event`] from the UI's event loop.

use std::collections::BTreeMap;
use std::time::Duration;

use tabula_core::{CellId, CellStore, CellValue, ProtectionBook};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::backoff::ConnectorConfig;
use crate::connector::{
    ChannelObserver, ConnectionEvent, ConnectionState, Connector, RetryPlan,
};
use crate::cursor::{CellGeometry, CollaboratorCursor, CursorBoard, CursorMarker};
use crate::error::{CollabError, RejectReason};
use crate::presence::{now_millis, Collaborator, PresenceRegistry, DEFAULT_ACTIVE_WINDOW};
use crate::protocol::{
    CollabMessage, CursorMove, DocumentEdit, Permission, PresenceUpdate, WireFormat,
};
use crate::transport::{Transport, TransportError, WebSocketTransport};

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connector: ConnectorConfig,
    /// Staleness window for the active-collaborator view.
    pub active_window: Duration,
    /// Evict presence entries this far in the past. `None` keeps them all.
    pub presence_retention: Option<Duration>,
    /// Minimum spacing of local cursor broadcasts.
    pub cursor_interval: Duration,
    /// Encoding for outbound messages. Inbound accepts both.
    pub wire_format: WireFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig::default(),
            active_window: DEFAULT_ACTIVE_WINDOW,
            presence_retention: None,
            cursor_interval: Duration::from_millis(33),
            wire_format: WireFormat::Json,
        }
    }
}

impl SessionConfig {
    /// Replace the connector settings.
    #[must_use]
    pub fn with_connector(mut self, connector: ConnectorConfig) -> Self {
        self.connector = connector;
        self
    }

    /// Set the staleness window used by the active views.
    #[must_use]
    pub fn with_active_window(mut self, window: Duration) -> Self {
        self.active_window = window;
        self
    }

    /// Evict presence entries older than `retention`, with their cursors.
    #[must_use]
    pub fn with_presence_retention(mut self, retention: Duration) -> Self {
        self.presence_retention = Some(retention);
        self
    }

    /// Set the cursor broadcast throttle.
    #[must_use]
    pub fn with_cursor_interval(mut self, interval: Duration) -> Self {
        self.cursor_interval = interval;
        self
    }

    /// Choose the outbound encoding.
    #[must_use]
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }
}

/// The user on this end of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    pub user_id: String,
    pub user_name: String,
    pub permission: Permission,
}

impl LocalUser {
    /// A user with a known id.
    pub fn new(user_id: impl Into<String>, user_name: impl Into<String>, permission: Permission) -> Self {
        Self {
            user_id: user_id.into(),
            user_name: user_name.into(),
            permission,
        }
    }

    /// Editor with a freshly generated id.
    pub fn anonymous(user_name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), user_name, Permission::Editor)
    }
}

/// What changed after handling one connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Connected,
    /// Connection lost; remote cursors were cleared.
    Disconnected { next: RetryPlan },
    TransportError(TransportError),
    RetryScheduled { attempt: u32, delay: Duration },
    PresenceChanged { user_id: String },
    CursorMoved { user_id: String },
    RemoteEdit {
        user_id: String,
        sheet: String,
        cell: CellId,
        rejected: Option<RejectReason>,
    },
    /// Undecodable frame or our own echo.
    Ignored,
}

/// A live collaboration session over one sheet store.
pub struct CollabSession<S> {
    local: LocalUser,
    config: SessionConfig,
    connector: Connector,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
    presence: PresenceRegistry,
    cursors: CursorBoard,
    protection: ProtectionBook,
    cells: S,
    last_cursor_broadcast: Option<Instant>,
    rejected_edits: u64,
}

impl<S: CellStore> CollabSession<S> {
    /// Start a session over WebSocket. Must be called inside a Tokio runtime.
    pub fn connect(url: impl Into<String>, local: LocalUser, config: SessionConfig, cells: S) -> Self {
        Self::with_transport(url, local, config, WebSocketTransport::new(), cells)
    }

    /// Start a session over any transport.
    pub fn with_transport<T: Transport>(
        url: impl Into<String>,
        local: LocalUser,
        config: SessionConfig,
        transport: T,
        cells: S,
    ) -> Self {
        let (observer, events) = ChannelObserver::new();
        let connector = Connector::spawn(url, config.connector.clone(), transport, observer);
        log::info!("Session started for {} ({})", local.user_name, local.user_id);

        Self {
            local,
            config,
            connector,
            events,
            presence: PresenceRegistry::new(),
            cursors: CursorBoard::new(),
            protection: ProtectionBook::new(),
            cells,
            last_cursor_broadcast: None,
            rejected_edits: 0,
        }
    }

    /// Wait for the next connection event and apply it.
    ///
    /// Returns `None` once the connector has shut down for good.
    pub async fn next_event(&mut self) -> Option<SessionUpdate> {
        let event = self.events.recv().await?;
        Some(self.handle_event(event, now_millis()))
    }

    /// Apply one connection event, with `now` in epoch milliseconds.
    pub fn handle_event(&mut self, event: ConnectionEvent, now: u64) -> SessionUpdate {
        match event {
            ConnectionEvent::Opened => {
                self.announce();
                SessionUpdate::Connected
            }
            ConnectionEvent::Closed(info) => {
                // Presence goes stale on its own; live cursors do not survive.
                self.cursors.clear();
                SessionUpdate::Disconnected { next: info.next }
            }
            ConnectionEvent::Error(error) => SessionUpdate::TransportError(error),
            ConnectionEvent::RetryScheduled { attempt, delay } => {
                SessionUpdate::RetryScheduled { attempt, delay }
            }
            ConnectionEvent::Message(payload) => match CollabMessage::decode(&payload) {
                Ok(msg) => self.apply_remote(msg, now),
                Err(e) => {
                    log::warn!("Ignoring undecodable frame ({} bytes): {e}", payload.len());
                    SessionUpdate::Ignored
                }
            },
        }
    }

    /// Apply a decoded remote message.
    pub fn apply_remote(&mut self, msg: CollabMessage, now: u64) -> SessionUpdate {
        if msg.user_id() == self.local.user_id {
            return SessionUpdate::Ignored;
        }

        match msg {
            CollabMessage::Presence(update) => {
                let user_id = update.user_id.clone();
                self.presence.upsert(update, now);
                if let Some(retention) = self.config.presence_retention {
                    self.presence.evict_older_than(now, retention);
                    // Covers cursors that arrived after their owner was already evicted.
                    let presence = &self.presence;
                    self.cursors.retain(|id| presence.get(id).is_some());
                }
                SessionUpdate::PresenceChanged { user_id }
            }
            CollabMessage::CursorMove(cursor) => {
                let user_id = cursor.user_id.clone();
                self.presence.touch(&user_id, now);
                self.cursors.upsert(CollaboratorCursor::from(cursor));
                SessionUpdate::CursorMoved { user_id }
            }
            CollabMessage::DocumentEdit(edit) => {
                let rejected = self.check_remote_edit(&edit);
                match rejected {
                    None => self.cells.apply(&edit.sheet, edit.cell, edit.value),
                    Some(reason) => {
                        self.rejected_edits += 1;
                        log::warn!(
                            "Rejected edit from {} to {}!{}: {reason:?}",
                            edit.user_id,
                            edit.sheet,
                            edit.cell
                        );
                    }
                }
                SessionUpdate::RemoteEdit {
                    user_id: edit.user_id,
                    sheet: edit.sheet,
                    cell: edit.cell,
                    rejected,
                }
            }
        }
    }

    fn check_remote_edit(&self, edit: &DocumentEdit) -> Option<RejectReason> {
        let read_only = self
            .presence
            .get(&edit.user_id)
            .is_some_and(|c| !c.permission.can_edit());
        if read_only {
            return Some(RejectReason::ReadOnly);
        }
        if !self.protection.is_edit_allowed(&edit.sheet, edit.cell) {
            return Some(RejectReason::LockedCell);
        }
        None
    }

    fn send(&self, msg: &CollabMessage) -> bool {
        match self.config.wire_format.encode(msg) {
            Ok(payload) => self.connector.send(payload),
            Err(e) => {
                log::error!("Failed to encode outbound message: {e}");
                false
            }
        }
    }

    /// Broadcast our presence. Sent automatically on every (re)connect;
    /// call periodically to stay inside peers' staleness window.
    pub fn announce(&self) -> bool {
        self.send(&CollabMessage::Presence(PresenceUpdate {
            user_id: self.local.user_id.clone(),
            user_name: self.local.user_name.clone(),
            permission: self.local.permission,
            timestamp: Some(now_millis()),
        }))
    }

    /// Broadcast our active cell, throttled to `cursor_interval`.
    ///
    /// Returns `false` if throttled or not sent.
    pub fn move_cursor(&mut self, row: u32, col: u32) -> bool {
        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|last| last.elapsed() < self.config.cursor_interval);
        if throttled {
            return false;
        }
        self.force_cursor(row, col)
    }

    /// Broadcast our active cell regardless of throttling.
    pub fn force_cursor(&mut self, row: u32, col: u32) -> bool {
        self.last_cursor_broadcast = Some(Instant::now());
        self.send(&CollabMessage::CursorMove(CursorMove {
            user_id: self.local.user_id.clone(),
            user_name: self.local.user_name.clone(),
            row,
            col,
            color: None,
        }))
    }

    /// Edit a cell locally and broadcast it.
    ///
    /// The edit goes through the same protection gate as remote edits. It is
    /// applied locally even when the broadcast is dropped for lack of a
    /// connection.
    pub fn apply_local_edit(&mut self, sheet: &str, cell: CellId, value: CellValue) -> Result<(), CollabError> {
        let reason = if !self.local.permission.can_edit() {
            Some(RejectReason::ReadOnly)
        } else if !self.protection.is_edit_allowed(sheet, cell) {
            Some(RejectReason::LockedCell)
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(CollabError::EditRejected {
                sheet: sheet.to_string(),
                cell,
                reason,
            });
        }

        self.cells.apply(sheet, cell, value.clone());
        let sent = self.send(&CollabMessage::DocumentEdit(DocumentEdit {
            user_id: self.local.user_id.clone(),
            sheet: sheet.to_string(),
            cell,
            value,
        }));
        if !sent {
            log::debug!("Local edit to {sheet}!{cell} not broadcast: offline");
        }
        Ok(())
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.connector.is_connected()
    }

    /// Current connector state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connector.state()
    }

    /// Collaborators active at `now` (epoch ms), ordered by user id.
    pub fn active_collaborators(&self, now: u64) -> Vec<&Collaborator> {
        self.presence.active_collaborators(now, self.config.active_window)
    }

    /// Every collaborator seen, active or not.
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// Live remote cursors, keyed by user id.
    pub fn cursors(&self) -> &BTreeMap<String, CollaboratorCursor> {
        self.cursors.cursors()
    }

    /// Render-ready markers. Cursors of collaborators known to be stale are
    /// hidden; cursors from users with no presence yet are shown.
    pub fn markers(&self, now: u64, geometry: &impl CellGeometry) -> Vec<CursorMarker> {
        let window = self.config.active_window;
        let visible = self.cursors.cursors().values().filter(|cursor| {
            self.presence
                .get(&cursor.user_id)
                .map_or(true, |c| c.is_active(now, window))
        });
        crate::cursor::render_markers(visible, geometry)
    }

    /// Protection state consulted for every edit.
    pub fn protection(&self) -> &ProtectionBook {
        &self.protection
    }

    /// Mutable protection state, for protect/unprotect and lock changes.
    pub fn protection_mut(&mut self) -> &mut ProtectionBook {
        &mut self.protection
    }

    /// The host's cell store.
    pub fn cells(&self) -> &S {
        &self.cells
    }

    /// The user this session speaks for.
    pub fn local_user(&self) -> &LocalUser {
        &self.local
    }

    /// The underlying connection handle.
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Remote edits refused by the gate so far.
    pub fn rejected_edits(&self) -> u64 {
        self.rejected_edits
    }

    /// Tear down the connection. Presence is kept; cursors are cleared.
    pub fn stop(&mut self) {
        self.connector.stop();
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::CloseInfo;
    use crate::cursor::ScreenPoint;
    use crate::protocol::Payload;
    use crate::transport::Link;
    use futures_util::future::{self, BoxFuture};
    use futures_util::FutureExt;
    use tabula_core::MemoryCells;

    /// Transport that never finishes connecting; events are injected by hand.
    struct Pending;

    impl Transport for Pending {
        fn connect(&self, _url: &str) -> BoxFuture<'static, Result<Link, TransportError>> {
            future::pending().boxed()
        }
    }

    const NOW: u64 = 1_700_000_000_000;

    fn session() -> CollabSession<MemoryCells> {
        CollabSession::with_transport(
            "ws://test",
            LocalUser::new("me", "Me", Permission::Editor),
            SessionConfig::default(),
            Pending,
            MemoryCells::new(),
        )
    }

    fn frame(msg: CollabMessage) -> ConnectionEvent {
        ConnectionEvent::Message(msg.to_text().unwrap())
    }

    fn presence(user: &str, permission: Permission, timestamp: Option<u64>) -> CollabMessage {
        CollabMessage::Presence(PresenceUpdate {
            user_id: user.into(),
            user_name: format!("{user}-name"),
            permission,
            timestamp,
        })
    }

    fn cursor(user: &str, row: u32, col: u32) -> CollabMessage {
        CollabMessage::CursorMove(CursorMove {
            user_id: user.into(),
            user_name: format!("{user}-name"),
            row,
            col,
            color: None,
        })
    }

    fn edit(user: &str, cell: &str, value: &str) -> CollabMessage {
        CollabMessage::DocumentEdit(DocumentEdit {
            user_id: user.into(),
            sheet: "Sheet1".into(),
            cell: cell.parse().unwrap(),
            value: Some(value.into()),
        })
    }

    fn grid(row: u32, col: u32) -> Option<ScreenPoint> {
        Some(ScreenPoint::new(col as f32 * 80.0, row as f32 * 20.0))
    }

    #[tokio::test]
    async fn test_presence_feeds_registry() {
        let mut s = session();
        let update = s.handle_event(frame(presence("alice", Permission::Editor, None)), NOW);
        assert_eq!(update, SessionUpdate::PresenceChanged { user_id: "alice".into() });

        let active = s.active_collaborators(NOW + 1_000);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].last_active, NOW);
        assert!(s.active_collaborators(NOW + 5 * 60_000).is_empty());
    }

    #[tokio::test]
    async fn test_own_echo_ignored() {
        let mut s = session();
        let update = s.handle_event(frame(presence("me", Permission::Editor, None)), NOW);
        assert_eq!(update, SessionUpdate::Ignored);
        assert!(s.presence().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_ignored() {
        let mut s = session();
        let update = s.handle_event(ConnectionEvent::Message(Payload::from("{nope")), NOW);
        assert_eq!(update, SessionUpdate::Ignored);
    }

    #[tokio::test]
    async fn test_latest_cursor_rendered() {
        let mut s = session();
        s.handle_event(frame(cursor("alice", 1, 1)), NOW);
        s.handle_event(frame(cursor("alice", 4, 2)), NOW);

        let markers = s.markers(NOW, &grid);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].position, ScreenPoint::new(160.0, 80.0));
        assert_eq!(markers[0].label, "alice-name");
    }

    #[tokio::test]
    async fn test_stale_collaborator_cursor_hidden() {
        let mut s = session();
        s.handle_event(frame(presence("bob", Permission::Editor, Some(NOW - 10 * 60_000))), NOW);
        s.handle_event(frame(cursor("bob", 0, 0)), NOW - 10 * 60_000);

        assert_eq!(s.cursors().len(), 1);
        assert!(s.markers(NOW, &grid).is_empty());

        // A cursor move counts as activity for a known collaborator.
        s.handle_event(frame(cursor("bob", 0, 1)), NOW);
        assert_eq!(s.markers(NOW, &grid).len(), 1);
    }

    #[tokio::test]
    async fn test_close_clears_cursors_keeps_presence() {
        let mut s = session();
        s.handle_event(frame(presence("alice", Permission::Editor, None)), NOW);
        s.handle_event(frame(cursor("alice", 2, 2)), NOW);

        let update = s.handle_event(
            ConnectionEvent::Closed(CloseInfo {
                cause: None,
                next: RetryPlan::After(Duration::from_millis(500)),
            }),
            NOW,
        );
        assert_eq!(
            update,
            SessionUpdate::Disconnected { next: RetryPlan::After(Duration::from_millis(500)) }
        );
        assert!(s.cursors().is_empty());
        assert_eq!(s.active_collaborators(NOW).len(), 1);
    }

    #[tokio::test]
    async fn test_remote_edit_applied_when_unprotected() {
        let mut s = session();
        let update = s.handle_event(frame(edit("alice", "B2", "42")), NOW);
        assert!(matches!(update, SessionUpdate::RemoteEdit { rejected: None, .. }));
        assert_eq!(s.cells().get("Sheet1", CellId::new(1, 1)), Some("42"));
    }

    #[tokio::test]
    async fn test_remote_edit_gated_by_protection() {
        let mut s = session();
        s.protection_mut().set_cell_locked("Sheet1", CellId::new(0, 0), false);
        s.protection_mut().protect_sheet("Sheet1", Some("1234")).unwrap();

        let update = s.handle_event(frame(edit("alice", "B2", "nope")), NOW);
        assert!(matches!(
            update,
            SessionUpdate::RemoteEdit { rejected: Some(RejectReason::LockedCell), .. }
        ));
        assert_eq!(s.cells().get("Sheet1", CellId::new(1, 1)), None);
        assert_eq!(s.rejected_edits(), 1);

        s.handle_event(frame(edit("alice", "A1", "ok")), NOW);
        assert_eq!(s.cells().get("Sheet1", CellId::new(0, 0)), Some("ok"));
    }

    #[tokio::test]
    async fn test_remote_edit_from_viewer_rejected() {
        let mut s = session();
        s.handle_event(frame(presence("vic", Permission::Viewer, None)), NOW);
        let update = s.handle_event(frame(edit("vic", "A1", "x")), NOW);
        assert!(matches!(
            update,
            SessionUpdate::RemoteEdit { rejected: Some(RejectReason::ReadOnly), .. }
        ));
        assert!(s.cells().is_empty());
    }

    #[tokio::test]
    async fn test_local_edit_gated_and_applied_offline() {
        let mut s = session();
        s.apply_local_edit("Sheet1", CellId::new(0, 0), Some("1".into())).unwrap();
        assert_eq!(s.cells().get("Sheet1", CellId::new(0, 0)), Some("1"));

        s.protection_mut().protect_sheet("Sheet1", None).unwrap();
        let err = s
            .apply_local_edit("Sheet1", CellId::new(0, 0), Some("2".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            CollabError::EditRejected { reason: RejectReason::LockedCell, .. }
        ));
        assert_eq!(s.cells().get("Sheet1", CellId::new(0, 0)), Some("1"));
    }

    #[tokio::test]
    async fn test_viewer_cannot_edit_locally() {
        let mut s = CollabSession::with_transport(
            "ws://test",
            LocalUser::new("me", "Me", Permission::Viewer),
            SessionConfig::default(),
            Pending,
            MemoryCells::new(),
        );
        let err = s
            .apply_local_edit("Sheet1", CellId::new(0, 0), Some("x".into()))
            .unwrap_err();
        assert!(matches!(err, CollabError::EditRejected { reason: RejectReason::ReadOnly, .. }));
    }

    #[tokio::test]
    async fn test_presence_retention_evicts_and_drops_cursors() {
        let mut s = CollabSession::with_transport(
            "ws://test",
            LocalUser::new("me", "Me", Permission::Editor),
            SessionConfig::default().with_presence_retention(Duration::from_secs(3600)),
            Pending,
            MemoryCells::new(),
        );
        s.handle_event(frame(presence("old", Permission::Editor, Some(NOW - 2 * 3_600_000))), NOW);
        s.handle_event(frame(cursor("old", 0, 0)), NOW);
        assert_eq!(s.cursors().len(), 1);

        // The next presence message triggers the sweep.
        s.handle_event(frame(presence("new", Permission::Editor, None)), NOW);
        assert!(s.presence().get("old").is_none());
        assert!(s.cursors().is_empty());
    }

    #[tokio::test]
    async fn test_retention_sweep_drops_cursor_of_already_evicted_user() {
        let hour = 3_600_000;
        let mut s = CollabSession::with_transport(
            "ws://test",
            LocalUser::new("me", "Me", Permission::Editor),
            SessionConfig::default().with_presence_retention(Duration::from_secs(3600)),
            Pending,
            MemoryCells::new(),
        );
        s.handle_event(frame(presence("live", Permission::Editor, None)), NOW);
        s.handle_event(frame(cursor("live", 1, 1)), NOW);

        // Evicted during its own upsert, before any cursor exists.
        s.handle_event(frame(presence("old", Permission::Editor, Some(NOW - 2 * hour))), NOW);
        assert!(s.presence().get("old").is_none());
        s.handle_event(frame(cursor("old", 0, 0)), NOW);

        s.handle_event(frame(presence("live", Permission::Editor, None)), NOW + 1_000);
        let users: Vec<&str> = s.cursors().keys().map(String::as_str).collect();
        assert_eq!(users, vec!["live"]);

        // Nothing lingers once everyone has gone quiet.
        let later = NOW + 10 * hour;
        s.handle_event(frame(presence("late", Permission::Editor, None)), later);
        assert!(s.cursors().is_empty());
        assert!(s.markers(later, &grid).is_empty());
    }

    #[tokio::test]
    async fn test_not_connected_while_connecting() {
        let s = session();
        assert!(!s.is_connected());
        assert_eq!(s.connection_state(), ConnectionState::Connecting);
        assert!(!s.announce());
    }

    #[test]
    fn test_anonymous_user() {
        let a = LocalUser::anonymous("Guest");
        let b = LocalUser::anonymous("Guest");
        assert_ne!(a.user_id, b.user_id);
        assert_eq!(a.permission, Permission::Editor);
    }
}
