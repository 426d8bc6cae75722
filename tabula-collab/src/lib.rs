//! # tabula-collab — Collaboration resilience layer for Tabula
//!
//! Keeps a spreadsheet session connected to its collaboration endpoint and
//! turns the traffic into presence, remote cursors and gated cell edits.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket    ┌──────────────┐
//! │  Connector   │ ◄────────────► │   endpoint   │
//! │ (backoff,    │  JSON/bincode  │  (relay)     │
//! │  state)      │                └──────────────┘
//! └──────┬───────┘
//!        │ ConnectionEvent
//!        ▼
//! ┌──────────────┐    ┌────────────────┐    ┌────────────────┐
//! │ CollabSession│───►│PresenceRegistry│    │ ProtectionBook │
//! │              │───►│  CursorBoard   │    │  (tabula-core) │
//! └──────┬───────┘    └────────────────┘    └───────┬────────┘
//!        │ DocumentEdit ─────────────── gate ───────┘
//!        ▼
//!   CellStore (host)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Wire messages (JSON text or bincode binary frames)
//! - [`backoff`] — Connector configuration and capped exponential backoff
//! - [`transport`] — Transport seam and the WebSocket implementation
//! - [`connector`] — Reconnecting connection with observer callbacks
//! - [`presence`] — Collaborator registry with a staleness window
//! - [`cursor`] — Remote cursors and render-ready markers
//! - [`session`] — Wires all of the above to a sheet

pub mod backoff;
pub mod connector;
pub mod cursor;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use backoff::{Backoff, ConnectorConfig};
pub use connector::{
    ChannelObserver, CloseInfo, ConnectionEvent, ConnectionObserver, ConnectionState, Connector,
    OfflineQueue, RetryPlan,
};
pub use cursor::{
    cursor_color, render_markers, CellGeometry, CollaboratorCursor, CursorBoard, CursorMarker,
    ScreenPoint,
};
pub use error::{CollabError, RejectReason};
pub use presence::{now_millis, Collaborator, PresenceRegistry, DEFAULT_ACTIVE_WINDOW};
pub use protocol::{
    CollabMessage, CursorMove, DocumentEdit, Payload, Permission, PresenceUpdate, ProtocolError,
    WireFormat,
};
pub use session::{CollabSession, LocalUser, SessionConfig, SessionUpdate};
pub use transport::{Link, LinkEvent, LinkPeer, Transport, TransportError, WebSocketTransport};
