//! # courier-shared
//!
//! Identifiers, limits and the transport wire protocol shared by the
//! Courier store, client core and command-line tools.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
pub use types::{ConversationKey, ConversationKind, LocalId, PeerId, RoomId, Target};
