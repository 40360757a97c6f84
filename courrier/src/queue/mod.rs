//! Durable per-mailbox message queues.
//!
//! Each mailbox owns one spool directory laid out as a maildir:
//!
//! ```text
//! <path>/tmp   entries being written
//! <path>/new   entries waiting for the next salvo
//! <path>/cur   quarantined entries that will never be retried
//! ```
//!
//! Producers append from any number of tasks; a single worker drains.

pub mod maildir;
pub mod types;

pub use maildir::Maildir;
pub use types::{QueueError, QueuedMessage};
