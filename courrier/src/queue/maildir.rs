//! Maildir-backed spool.
//!
//! Writes go to `tmp/` first, are fsynced, and are then renamed into `new/`.
//! A rename within one filesystem is atomic, so a consumer listing `new/`
//! only ever sees complete entries, and concurrent producers never share a
//! file because every entry gets a fresh ULID-based name.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use ulid::Ulid;

use super::types::{QueueError, QueuedMessage};

const TMP: &str = "tmp";
const NEW: &str = "new";
const CUR: &str = "cur";

/// Maildir info suffix marking an entry as trashed.
const QUARANTINE_SUFFIX: &str = ":2,T";

/// A spool directory holding the outbound backlog of one mailbox.
#[derive(Debug)]
pub struct Maildir {
    root: PathBuf,
}

impl Maildir {
    /// Open the spool at `path`, creating `tmp/`, `new/` and `cur/` as needed.
    ///
    /// The root is kept in canonical form, so two spellings of one directory
    /// yield equal [`Maildir::path`]s. Fails when the path exists but is not
    /// a directory, or when nothing can be written into it. Leftovers in `tmp/` from an interrupted writer are
    /// removed; they were never acknowledged to a caller.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, QueueError> {
        let root = path.into();

        match fs::metadata(&root).await {
            Ok(meta) if !meta.is_dir() => return Err(QueueError::NotDirectory(root)),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(QueueError::io(&root, e)),
        }

        for sub in [TMP, NEW, CUR] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| QueueError::io(&dir, e))?;
        }

        let root = fs::canonicalize(&root)
            .await
            .map_err(|e| QueueError::io(&root, e))?;

        let maildir = Self { root };
        maildir.probe_writable().await?;
        maildir.clean_tmp().await?;

        Ok(maildir)
    }

    /// Canonical spool root.
    pub fn path(&self) -> &Path {
        &self.root
    }

    async fn probe_writable(&self) -> Result<(), QueueError> {
        let probe = self.root.join(TMP).join(format!(".probe.{}", Ulid::new()));
        if write_synced(&probe, b"").await.is_err() {
            return Err(QueueError::NotWritable(self.root.clone()));
        }
        let _ = fs::remove_file(&probe).await;
        Ok(())
    }

    async fn clean_tmp(&self) -> Result<(), QueueError> {
        let dir = self.root.join(TMP);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;

        let mut cleaned = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(&dir, e))?
        {
            if fs::remove_file(entry.path()).await.is_ok() {
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!(spool = %self.root.display(), cleaned = cleaned, "spool_tmp_cleaned");
        }
        Ok(())
    }

    /// Durably append a rendered message.
    ///
    /// Returns once the entry is fsynced and visible in `new/`. On failure no
    /// entry is visible to the consumer.
    pub async fn append(&self, message: &[u8]) -> Result<QueuedMessage, QueueError> {
        let id = format!("{}.{}", Ulid::new(), std::process::id());
        let tmp = self.root.join(TMP).join(&id);
        let new = self.root.join(NEW).join(&id);

        if let Err(e) = write_synced(&tmp, message).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(QueueError::io(tmp, e));
        }

        if let Err(e) = fs::rename(&tmp, &new).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(QueueError::io(new, e));
        }

        // The entry is already visible; a failed directory sync only weakens
        // the guarantee across power loss.
        if let Err(e) = sync_dir(&self.root.join(NEW)).await {
            warn!(spool = %self.root.display(), error = %e, "spool_dir_sync_failed");
        }

        debug!(spool = %self.root.display(), entry = %id, bytes = message.len(), "spool_appended");
        Ok(QueuedMessage::new(id))
    }

    /// Snapshot of the entries waiting in `new/`, oldest first.
    pub async fn drain(&self) -> Result<Vec<QueuedMessage>, QueueError> {
        let dir = self.root.join(NEW);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;

        let mut batch = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(&dir, e))?
        {
            let name = entry.file_name();
            match name.to_str() {
                Some(name) if !name.starts_with('.') => batch.push(QueuedMessage::new(name)),
                _ => continue,
            }
        }

        batch.sort();
        Ok(batch)
    }

    /// Number of entries waiting in `new/`.
    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.drain().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Read the raw bytes of a waiting entry.
    pub async fn read(&self, entry: &QueuedMessage) -> Result<Vec<u8>, QueueError> {
        let path = self.new_path(entry);
        fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => QueueError::NotFound(entry.clone()),
            _ => QueueError::io(path, e),
        })
    }

    /// Remove a delivered entry. Acknowledging an entry twice is a no-op.
    pub async fn acknowledge(&self, entry: &QueuedMessage) -> Result<(), QueueError> {
        let path = self.new_path(entry);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(QueueError::io(path, e)),
        }
    }

    /// Move an entry that can never be delivered out of the backlog.
    ///
    /// The bytes are kept under `cur/` for inspection.
    pub async fn quarantine(&self, entry: &QueuedMessage) -> Result<(), QueueError> {
        let from = self.new_path(entry);
        let to = self
            .root
            .join(CUR)
            .join(format!("{}{}", entry.id(), QUARANTINE_SUFFIX));

        fs::rename(&from, &to).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => QueueError::NotFound(entry.clone()),
            _ => QueueError::io(from, e),
        })
    }

    /// Number of quarantined entries under `cur/`.
    pub async fn quarantined(&self) -> Result<usize, QueueError> {
        let dir = self.root.join(CUR);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;

        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(&dir, e))?
        {
            if entry.file_name().to_string_lossy().ends_with(QUARANTINE_SUFFIX) {
                count += 1;
            }
        }
        Ok(count)
    }

    fn new_path(&self, entry: &QueuedMessage) -> PathBuf {
        self.root.join(NEW).join(entry.id())
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(unix)]
async fn sync_dir(path: &Path) -> std::io::Result<()> {
    fs::File::open(path).await?.sync_all().await
}

#[cfg(not(unix))]
async fn sync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
