#![warn(missing_docs)]
//! Client role and session driver: joins a host, mirrors its registry, and
//! selects between hosting and joining.

mod client;
mod control;
mod session;
mod sync;

pub use blobsync_server::TickReport;
pub use client::SyncClient;
pub use session::{resolve_host, Session, SessionError, SessionPhase, SessionRole};
pub use sync::{SyncLoop, SyncSettings};
