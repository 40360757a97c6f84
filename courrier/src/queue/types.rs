//! Queue entry and error types.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("spool path is not a directory: {0}")]
    NotDirectory(PathBuf),

    #[error("spool path is not writable: {0}")]
    NotWritable(PathBuf),

    #[error("entry not found: {0}")]
    NotFound(QueuedMessage),
}

impl QueueError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// A message waiting in a spool, identified by its file name in `new/`.
///
/// Names start with a ULID, so sorting them orders entries by submission
/// time to the millisecond.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueuedMessage {
    id: String,
}

impl QueuedMessage {
    pub(crate) fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for QueuedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
