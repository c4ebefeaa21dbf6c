//! # courier-client
//!
//! Client-side reliability core of the Courier messenger.
//!
//! - [`Courier`] queues outgoing messages, drains them over a
//!   [`MessageTransport`] and folds server events back into the
//!   conversation logs.
//! - [`download::Downloader`] fetches attachments over HTTP, resuming
//!   interrupted transfers.
//! - [`transfers::TransferTracker`] follows live transfers and keeps their
//!   history.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod download;
pub mod drain;
pub mod events;
pub mod logging;
pub mod reconcile;
pub mod schedule;
pub mod state;
pub mod transfers;

mod courier;
mod error;

pub use crate::courier::{Courier, DrainReport, MessageTransport, SendOptions};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ClientConfig;
pub use error::{CoreError, DownloadError, FetchError, SendError, SinkError};
pub use events::CoreUpdate;
pub use reconcile::Notice;
pub use schedule::{ScheduleGate, ScheduleRejection};
pub use state::CoreState;
