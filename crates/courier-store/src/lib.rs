//! # courier-store
//!
//! Local persistence for the Courier client.
//!
//! Documents (the outbox and the transfer history) are JSON values kept in a
//! key/value byte store. [`Database`] provides that store on SQLite;
//! [`MemoryKv`] keeps it in memory. The document types themselves are pure
//! snapshots: every mutation returns a new value.

pub mod database;
pub mod kv;
pub mod migrations;
pub mod models;
pub mod outbox;
pub mod transfers;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use kv::{KvStore, MemoryKv};
pub use models::*;
pub use outbox::{load_outbox, save_outbox, OutboxMap};
pub use transfers::{load_transfer_history, save_transfer_history, TransferHistory};
