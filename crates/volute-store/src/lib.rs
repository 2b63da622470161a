//! Relational state store for the daemon.
//!
//! One SQLite database holds auth (users, sessions), conversations with
//! their participants and messages, each mind's append-only history trail,
//! the delivery queue for offline minds, and the activity log. A single
//! mutex-guarded connection is the daemon's one writer; WAL mode keeps
//! readers out of its way.

mod conversations;
mod db;
mod error;
mod history;
mod store;
mod types;
mod users;

pub use db::{init_db, open_database};
pub use error::{Result, StoreError};
pub use store::StateStore;
pub use types::{
    ActivityRow, Conversation, DeliveryEntry, DeliveryStatus, HistoryEntry, Participant,
    ParticipantRole, Session, StoredMessage, User,
};
