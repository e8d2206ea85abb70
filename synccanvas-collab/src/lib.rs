//! # synccanvas-collab: real-time collaboration core for SyncCanvas
//!
//! Several clients edit the same document at once. Each sees who else is
//! there and where their carets are, edits travel over a per-document
//! pub/sub channel, and a debounced autosave persists the latest snapshot.
//! There is no merge: the last broadcast wins on screen and the last write
//! wins in storage.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   document_change / cursor_move   ┌──────────────┐
//! │ SessionHandle│ ◄───────────────────────────────► │ SessionHandle│
//! │  (client A)  │        presence sync (full)       │  (client B)  │
//! └──────┬───────┘                                   └──────┬───────┘
//!        │  Transport: Hub (in-process) or RelayTransport   │
//!        ▼                                                  ▼
//! ┌──────────────┐                                   ┌──────────────┐
//! │ Cursor       │                                   │ Autosave     │
//! │ Projection   │                                   │ Coordinator  │──► DocumentStore
//! └──────────────┘                                   └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`identity`]: participant identity and cursor colors
//! - [`presence`]: presence entries and the per-topic registry
//! - [`protocol`]: event payloads and the relay wire frames
//! - [`channel`]: the `Transport` seam, channel handlers and disposers
//! - [`hub`]: in-process topics with fan-out and presence
//! - [`cursor`]: remote cursors, position mapping and projection
//! - [`session`]: attach/detach state machine and live state
//! - [`store`]: storage interface and in-memory store
//! - [`autosave`]: debounced snapshot writes
//! - [`document`]: an open document tying it all together
//! - [`relay`]: WebSocket relay server and client transport

pub mod autosave;
pub mod channel;
pub mod cursor;
pub mod document;
pub mod hub;
pub mod identity;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use autosave::{AutosaveCoordinator, SaveNotice};
pub use channel::{
    Channel, ChannelCommand, ChannelError, ChannelEvent, ChannelLink, ChannelSender, ChannelStatus,
    LinkEndpoint, Subscription, Transport,
};
pub use cursor::{
    Assoc, CursorMarker, CursorProjection, Mapping, RemoteCursor, RemoteCursorMap, StepMap, Transaction,
};
pub use document::{OpenDocument, OpenError};
pub use hub::{Hub, HubError, Joined, Topic, TopicMessage, TopicStats};
pub use identity::{ColorParseError, CursorColor, Identity};
pub use presence::{PresenceEntry, PresenceRegistry, PresenceState};
pub use protocol::{
    BroadcastMessage, DocumentChange, DocumentChangeEvent, Frame, ProtocolError, CURSOR_MOVE, DOCUMENT_CHANGE,
};
pub use relay::{RelayConfig, RelayError, RelayServer, RelayStats, RelayTransport};
pub use session::{SessionConfig, SessionHandle, SessionManager, SessionState};
pub use store::{DocumentPatch, DocumentSnapshot, DocumentStore, MemoryStore, StoreError};
