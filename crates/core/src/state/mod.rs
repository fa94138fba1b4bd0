//! Durable state: the SQLite database, the session archive, and the
//! lifecycle event log.

mod archive;
mod db;

pub use archive::{EventLog, SessionArchive, SessionRecord};
pub use db::SynapseDb;
