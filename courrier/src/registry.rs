//! Mailbox registry: which worker and sender identity serve which key.
//!
//! Built once at startup and never mutated afterwards. It is shared as an
//! `Arc<Registry>` and has no mutating method, so request handlers look keys
//! up without any locking.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::config::MailboxConfig;
use crate::message::{RenderError, SenderIdentity};
use crate::queue::{Maildir, QueueError};
use crate::relay::Relay;
use crate::worker::Worker;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("mailbox key must not be empty")]
    EmptyKey,

    #[error("mailbox key {0:?} is configured more than once")]
    DuplicateKey(String),

    #[error("spool {path} is shared by mailboxes {first:?} and {second:?}")]
    SharedSpool {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("mailbox {key:?} has an unusable spool: {source}")]
    Spool {
        key: String,
        #[source]
        source: QueueError,
    },

    #[error("mailbox {key:?} has an invalid sender: {source}")]
    Sender {
        key: String,
        #[source]
        source: RenderError,
    },
}

/// A worker together with the identity its messages are sent as.
pub struct RegistryEntry {
    pub worker: Arc<Worker>,
    pub sender: SenderIdentity,
}

pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
    // Configuration order, for deterministic start/stop sequencing.
    order: Vec<String>,
}

impl Registry {
    /// Build the registry, opening every spool.
    ///
    /// Every entry is validated before any spool is touched, so a bad key or
    /// sender fails startup without side effects. Spools are then compared by
    /// canonical path, which catches aliases such as `..` or symlinks. Workers
    /// are created but not started.
    pub async fn build(
        mailboxes: &[MailboxConfig],
        relay: Arc<dyn Relay>,
        flush_interval: Duration,
    ) -> Result<Self, RegistryError> {
        let mut keys = HashSet::new();
        let mut spools: HashMap<&PathBuf, &str> = HashMap::new();
        let mut senders = Vec::with_capacity(mailboxes.len());

        for mailbox in mailboxes {
            let key = mailbox.key.as_str();
            if key.trim().is_empty() {
                return Err(RegistryError::EmptyKey);
            }
            if !keys.insert(key) {
                return Err(RegistryError::DuplicateKey(key.to_string()));
            }
            if let Some(first) = spools.insert(&mailbox.path, key) {
                return Err(RegistryError::SharedSpool {
                    path: mailbox.path.clone(),
                    first: first.to_string(),
                    second: key.to_string(),
                });
            }

            let sender =
                SenderIdentity::try_from(&mailbox.sender).map_err(|source| RegistryError::Sender {
                    key: key.to_string(),
                    source,
                })?;
            senders.push(sender);
        }

        let mut entries = HashMap::with_capacity(mailboxes.len());
        let mut order = Vec::with_capacity(mailboxes.len());
        let mut roots: HashMap<PathBuf, &str> = HashMap::with_capacity(mailboxes.len());

        for (mailbox, sender) in mailboxes.iter().zip(senders) {
            let maildir = Maildir::open(&mailbox.path)
                .await
                .map_err(|source| RegistryError::Spool {
                    key: mailbox.key.clone(),
                    source,
                })?;

            if let Some(first) = roots.insert(maildir.path().to_path_buf(), &mailbox.key) {
                return Err(RegistryError::SharedSpool {
                    path: maildir.path().to_path_buf(),
                    first: first.to_string(),
                    second: mailbox.key.clone(),
                });
            }

            info!(
                mailbox = %mailbox.key,
                spool = %mailbox.path.display(),
                sender = %sender.address,
                "mailbox_registered"
            );

            let worker = Worker::new(mailbox.key.clone(), maildir, Arc::clone(&relay), flush_interval);
            entries.insert(
                mailbox.key.clone(),
                RegistryEntry {
                    worker: Arc::new(worker),
                    sender,
                },
            );
            order.push(mailbox.key.clone());
        }

        Ok(Self { entries, order })
    }

    pub fn lookup(&self, key: &str) -> Option<&RegistryEntry> {
        self.entries.get(key)
    }

    /// Workers in configuration order.
    pub fn workers(&self) -> impl Iterator<Item = &Arc<Worker>> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| &entry.worker)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
