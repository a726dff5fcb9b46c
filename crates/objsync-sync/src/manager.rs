//! Sync manager - propagates changes between the local root and the object store
//!
//! The [`SyncManager`] is the only component that decides what to transfer:
//!
//! - **Local → remote**: `upload_file` / `update_file` / `delete_file`, driven
//!   by the watch source, gated on write permission, serialized per object
//!   name through [`Queueing::enqueue_keyed`].
//! - **Remote → local**: `on_object_event`, driven by the object store's
//!   change notifications, gated on read permission.
//! - **Reconciliation**: `sync()`, a global task that pauses the watch
//!   source and downloads every remote object whose local copy is missing or
//!   different.
//!
//! ## Per-object lifecycle
//!
//! ```text
//! Unknown ──→ Uploading ──┐
//!    │                    ├──→ Synced ──→ (Uploading | Downloading | Deleted)
//!    └────→ Downloading ──┘
//! ```
//!
//! At most one transition per object name is in flight at a time; the key
//! queue for that name enforces it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use objsync_core::config::Config;
use objsync_core::domain::{
    local_path_for, normalize_object_name, object_name_for, DomainError, IgnoreRules,
    ObjectEvent, ObjectEventKind, Permissions,
};
use objsync_core::ports::{IObjectEventListener, IObjectStore, IWatchControl};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::fingerprint::{is_file_equal, RetryPolicy};
use crate::queueing::{Completion, Queueing};
use crate::watcher::WatchEvent;
use crate::SyncError;

/// Callback invoked after every reconciliation pass
pub type SyncEndCallback = Arc<dyn Fn() + Send + Sync>;

const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 8;

/// Everything a queued task needs, cloned into each task
#[derive(Clone)]
struct SyncContext {
    root: PathBuf,
    store: Arc<dyn IObjectStore>,
    ignore: IgnoreRules,
    retry: RetryPolicy,
    download_concurrency: usize,
}

/// Resumes the watch source when dropped, including on panic
struct ResumeGuard(Arc<dyn IWatchControl>);

impl ResumeGuard {
    fn pause(control: Arc<dyn IWatchControl>) -> Self {
        control.pause();
        Self(control)
    }
}

impl Drop for ResumeGuard {
    fn drop(&mut self) {
        self.0.resume();
    }
}

// ============================================================================
// SyncManager
// ============================================================================

/// Bidirectional sync between a local root and an object store
pub struct SyncManager {
    ctx: SyncContext,
    permissions: Permissions,
    queueing: Queueing,
    on_sync_end: Arc<Mutex<Option<SyncEndCallback>>>,
    watch_control: Mutex<Option<Arc<dyn IWatchControl>>>,
}

impl SyncManager {
    /// Creates a manager with default ignore rules, retry policy and
    /// download concurrency
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(root: PathBuf, store: Arc<dyn IObjectStore>, permissions: Permissions) -> Self {
        Self {
            ctx: SyncContext {
                root,
                store,
                ignore: IgnoreRules::default(),
                retry: RetryPolicy::default(),
                download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            },
            permissions,
            queueing: Queueing::new(),
            on_sync_end: Arc::new(Mutex::new(None)),
            watch_control: Mutex::new(None),
        }
    }

    /// Creates a manager from the `sync`, `permissions` and `fingerprint`
    /// sections of a configuration
    pub fn from_config(root: PathBuf, config: &Config, store: Arc<dyn IObjectStore>) -> Self {
        Self::new(root, store, config.permissions)
            .with_ignore(IgnoreRules::new(config.sync.ignore.iter().cloned()))
            .with_download_concurrency(config.sync.download_concurrency)
            .with_retry_policy(RetryPolicy::new(
                config.fingerprint.retry_attempts,
                std::time::Duration::from_secs(config.fingerprint.retry_step_secs),
            ))
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ctx.ignore = ignore;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.ctx.retry = retry;
        self
    }

    pub fn with_download_concurrency(mut self, n: usize) -> Self {
        self.ctx.download_concurrency = n.max(1);
        self
    }

    /// Register the callback run after each reconciliation pass
    ///
    /// The callback in place when a pass finishes is the one that runs,
    /// including for passes queued before it was set.
    pub fn on_sync_end(&self, callback: impl Fn() + Send + Sync + 'static) {
        *self.on_sync_end.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Wire the watch source so reconciliation can pause it
    pub fn set_watch_control(&self, control: Arc<dyn IWatchControl>) {
        *self.watch_control.lock().unwrap() = Some(control);
    }

    pub fn queueing(&self) -> &Queueing {
        &self.queueing
    }

    pub fn root(&self) -> &Path {
        &self.ctx.root
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    // ========================================================================
    // Local → remote
    // ========================================================================

    /// Normalize `name` and check permission and ignore rules
    ///
    /// Returns `None` when the operation must be skipped.
    fn admit_write(&self, op: &str, name: &str) -> Result<Option<String>, SyncError> {
        if !self.permissions.write {
            info!(op, object = %name, "Write permission denied, skipping");
            return Ok(None);
        }

        let name = normalize_object_name(name);
        if name.is_empty() {
            return Err(DomainError::InvalidObjectName(name).into());
        }
        if self.ctx.ignore.is_ignored_name(&name) {
            debug!(op, object = %name, "Object name is ignored, skipping");
            return Ok(None);
        }
        Ok(Some(name))
    }

    /// Upload `path` as a new object named `name`
    pub fn upload_file(&self, name: &str, path: &Path) -> Result<Option<Completion>, SyncError> {
        let Some(name) = self.admit_write("upload", name)? else {
            return Ok(None);
        };

        let store = Arc::clone(&self.ctx.store);
        let path = path.to_path_buf();
        let key = name.clone();
        Ok(Some(self.queueing.enqueue_keyed(&key, async move {
            debug!(object = %name, "Uploading");
            store.upload(&name, &path).await?;
            info!(object = %name, "Uploaded");
            Ok(())
        })))
    }

    /// Overwrite the existing object `name` with the contents of `path`
    pub fn update_file(&self, name: &str, path: &Path) -> Result<Option<Completion>, SyncError> {
        let Some(name) = self.admit_write("update", name)? else {
            return Ok(None);
        };

        let store = Arc::clone(&self.ctx.store);
        let path = path.to_path_buf();
        let key = name.clone();
        Ok(Some(self.queueing.enqueue_keyed(&key, async move {
            debug!(object = %name, "Updating");
            store.update(&name, &path).await?;
            info!(object = %name, "Updated");
            Ok(())
        })))
    }

    /// Remove the object `name`
    pub fn delete_file(&self, name: &str) -> Result<Option<Completion>, SyncError> {
        let Some(name) = self.admit_write("delete", name)? else {
            return Ok(None);
        };

        let store = Arc::clone(&self.ctx.store);
        let key = name.clone();
        Ok(Some(self.queueing.enqueue_keyed(&key, async move {
            debug!(object = %name, "Deleting");
            store.delete(&name).await?;
            info!(object = %name, "Deleted");
            Ok(())
        })))
    }

    /// Route a settled watch-source event to the matching operation
    ///
    /// A `Changed` file the store does not know yet is uploaded rather than
    /// updated. Directory events and `Ready` are only logged.
    pub async fn handle_local_event(
        &self,
        event: WatchEvent,
    ) -> Result<Option<Completion>, SyncError> {
        match event {
            WatchEvent::Added(path) => {
                let name = object_name_for(&self.ctx.root, &path)?;
                self.upload_file(&name, &path)
            }
            WatchEvent::Changed(path) => {
                let name = object_name_for(&self.ctx.root, &path)?;
                if self.ctx.store.has_object(&normalize_object_name(&name)).await {
                    self.update_file(&name, &path)
                } else {
                    debug!(object = %name, "Changed file unknown to the store, uploading");
                    self.upload_file(&name, &path)
                }
            }
            WatchEvent::Removed(path) => {
                let name = object_name_for(&self.ctx.root, &path)?;
                self.delete_file(&name)
            }
            WatchEvent::DirAdded(path) => {
                debug!(path = %path.display(), "Directory added");
                Ok(None)
            }
            WatchEvent::DirRemoved(path) => {
                debug!(path = %path.display(), "Directory removed");
                Ok(None)
            }
            WatchEvent::Ready => {
                info!("Watch source ready");
                Ok(None)
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Queue a full reconciliation pass
    ///
    /// Returns `Ok(None)` without read permission.
    ///
    /// # Errors
    /// [`SyncError::WatchNotWired`] if no watch control has been set.
    pub fn sync(&self) -> Result<Option<Completion>, SyncError> {
        if !self.permissions.read {
            info!("Read permission denied, skipping reconciliation");
            return Ok(None);
        }

        let control = self
            .watch_control
            .lock()
            .unwrap()
            .clone()
            .ok_or(SyncError::WatchNotWired)?;
        let on_end = self.on_sync_end.clone();
        let ctx = self.ctx.clone();

        Ok(Some(self.queueing.enqueue_global(async move {
            info!(root = %ctx.root.display(), "Reconciliation started");
            let result = {
                let _resume = ResumeGuard::pause(control);
                reconcile(&ctx).await
            };

            match &result {
                Ok(downloaded) => info!(downloaded, "Reconciliation finished"),
                Err(e) => error!(error = %e, "Reconciliation failed"),
            }
            let callback = on_end.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback();
            }

            result.map(|_| ())
        })))
    }

    // ========================================================================
    // Remote → local
    // ========================================================================

    /// Apply a remote change notification
    ///
    /// `Created` downloads the object (unless the local copy is already
    /// equal) through the object's key queue and waits for it. `Deleted`
    /// removes the local file directly when the store still lists the object.
    #[instrument(skip(self, event), fields(kind = %event.kind, object = %event.object_name))]
    pub async fn on_object_event(&self, event: ObjectEvent) -> Result<(), SyncError> {
        if !self.permissions.read {
            info!("Read permission denied, ignoring remote change");
            return Ok(());
        }

        let name = normalize_object_name(&event.object_name);
        if self.ctx.ignore.is_ignored_name(&name) {
            debug!("Object name is ignored, skipping");
            return Ok(());
        }
        let path = local_path_for(&self.ctx.root, &name)?;

        match event.kind {
            ObjectEventKind::Created => {
                let ctx = self.ctx.clone();
                let key = name.clone();
                let completion = self.queueing.enqueue_keyed(&key, async move {
                    download_if_changed(&ctx, &name, &path).await.map(|_| ())
                });
                completion.wait().await
            }
            ObjectEventKind::Deleted => {
                // Not routed through the key queue: a concurrent download of
                // the same name may recreate the file.
                if !self.ctx.store.has_object(&name).await {
                    debug!("Object no longer listed, nothing to delete");
                    return Ok(());
                }
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "Removed local file");
                        Ok(())
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        debug!("Local file already absent");
                        Ok(())
                    }
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl IObjectEventListener for SyncManager {
    async fn on_object_event(&self, event: ObjectEvent) -> anyhow::Result<()> {
        SyncManager::on_object_event(self, event)
            .await
            .map_err(anyhow::Error::from)
    }
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("root", &self.ctx.root)
            .field("permissions", &self.permissions)
            .field("queueing", &self.queueing)
            .finish()
    }
}

/// Download `name` to `path` unless the local copy already matches
///
/// A name the store has no record for is downloaded anyway. Returns whether
/// a download happened.
async fn download_if_changed(
    ctx: &SyncContext,
    name: &str,
    path: &Path,
) -> Result<bool, SyncError> {
    if let Some(record) = ctx.store.get_object(name).await {
        if is_file_equal(path, &record, &ctx.retry).await? {
            debug!(object = %name, "Local copy up to date");
            return Ok(false);
        }
    }

    debug!(object = %name, path = %path.display(), "Downloading");
    ctx.store.download(name, path).await?;
    info!(object = %name, "Downloaded");
    Ok(true)
}

/// Download every remote object whose local copy is missing or different
///
/// Downloads run concurrently, bounded by the context's concurrency limit.
/// Every download is awaited; the first failure observed is returned.
async fn reconcile(ctx: &SyncContext) -> Result<usize, SyncError> {
    let objects = ctx.store.objects().await;
    debug!(objects = objects.len(), "Reconciling object map");

    let semaphore = Arc::new(Semaphore::new(ctx.download_concurrency));
    let mut join_set = JoinSet::new();

    for (name, record) in objects {
        if ctx.ignore.is_ignored_name(&name) {
            debug!(object = %name, "Ignored during reconciliation");
            continue;
        }
        let path = match local_path_for(&ctx.root, &name) {
            Ok(path) => path,
            Err(e) => {
                warn!(object = %name, error = %e, "Skipping object with unusable name");
                continue;
            }
        };

        let ctx = ctx.clone();
        let sem = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = sem
                .acquire_owned()
                .await
                .map_err(|e| SyncError::Store(anyhow::anyhow!("{e}")))?;
            if is_file_equal(&path, &record, &ctx.retry).await? {
                return Ok(false);
            }
            debug!(object = %name, "Downloading");
            ctx.store.download(&name, &path).await?;
            info!(object = %name, "Downloaded");
            Ok::<bool, SyncError>(true)
        });
    }

    let mut downloaded = 0usize;
    let mut first_error: Option<SyncError> = None;

    while let Some(joined) = join_set.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => Err(SyncError::TaskPanicked(join_err.to_string())),
        };
        match outcome {
            Ok(true) => downloaded += 1,
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Download failed during reconciliation");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(downloaded),
    }
}
