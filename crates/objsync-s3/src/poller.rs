//! Remote change poller
//!
//! Re-lists the bucket on a fixed interval and compares the listing with the
//! store's object map. Differences become [`ObjectEvent`]s delivered to the
//! registered listener:
//!
//! 1. **New or changed object**: the record is stored first, then `Created`
//!    is dispatched, so the listener's equality check sees the new ETag.
//! 2. **Vanished object**: `Deleted` is dispatched while the record is still
//!    present, then the record is removed.
//!
//! Names with a local transfer in flight during the listing are left for the
//! next round.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use objsync_core::domain::{ObjectEvent, ObjectMap, ObjectRecord};

use crate::store::{records_match, S3ObjectStore};
use crate::S3Error;

/// A difference between the object map and a fresh listing
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteChange {
    Created(ObjectRecord),
    Deleted(String),
}

/// Compare `known` against `listed`, ignoring names in `skip`
///
/// Results are ordered by object name, creations before deletions.
pub fn diff_listing(
    known: &ObjectMap,
    listed: &ObjectMap,
    skip: &HashSet<String>,
) -> Vec<RemoteChange> {
    let mut created: Vec<&ObjectRecord> = listed
        .iter()
        .filter(|(name, _)| !skip.contains(*name))
        .filter(|(name, record)| match known.get(*name) {
            Some(existing) => !records_match(existing, record),
            None => true,
        })
        .map(|(_, record)| record)
        .collect();
    created.sort_by(|a, b| a.name.cmp(&b.name));

    let mut deleted: Vec<&String> = known
        .keys()
        .filter(|name| !skip.contains(*name) && !listed.contains_key(*name))
        .collect();
    deleted.sort();

    created
        .into_iter()
        .map(|record| RemoteChange::Created(record.clone()))
        .chain(deleted.into_iter().map(|name| RemoteChange::Deleted(name.clone())))
        .collect()
}

/// Polls the bucket until cancelled
pub struct RemotePoller {
    store: Arc<S3ObjectStore>,
    interval: Duration,
    shutdown: CancellationToken,
}

impl RemotePoller {
    pub fn new(store: Arc<S3ObjectStore>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            store,
            interval,
            shutdown,
        }
    }

    /// Poll loop
    ///
    /// A failed listing is logged and retried on the next tick.
    pub async fn run(self) {
        info!(
            bucket = %self.store.bucket(),
            interval_secs = self.interval.as_secs(),
            "Remote poller starting"
        );

        let mut ticker = tokio::time::interval(self.interval);
        // The first tick completes immediately; the map was just loaded by init
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(changes) => debug!(changes, "Remote changes dispatched"),
                        Err(e) => warn!(error = %e, "Remote listing failed"),
                    }
                }
            }
        }

        info!("Remote poller stopped");
    }

    /// List the bucket once and dispatch every difference
    ///
    /// Returns the number of changes found.
    pub async fn poll_once(&self) -> Result<usize, S3Error> {
        self.store.begin_poll();
        let listed = self.store.list_remote().await?;
        let known = self.store.known_objects();
        let skip = self.store.end_poll();

        let changes = diff_listing(&known, &listed, &skip);
        let count = changes.len();
        self.apply(changes).await;
        Ok(count)
    }

    async fn apply(&self, changes: Vec<RemoteChange>) {
        for change in changes {
            match change {
                RemoteChange::Created(record) => {
                    let event = ObjectEvent::created(record.name.clone());
                    self.store.insert_record(record);
                    self.dispatch(event).await;
                }
                RemoteChange::Deleted(name) => {
                    self.dispatch(ObjectEvent::deleted(name.clone())).await;
                    self.store.remove_record(&name);
                }
            }
        }
    }

    async fn dispatch(&self, event: ObjectEvent) {
        let Some(listener) = self.store.listener() else {
            warn!(
                kind = %event.kind,
                object = %event.object_name,
                "No object listener registered, dropping remote change"
            );
            return;
        };

        debug!(kind = %event.kind, object = %event.object_name, "Dispatching remote change");
        let (kind, object) = (event.kind, event.object_name.clone());
        if let Err(e) = listener.on_object_event(event).await {
            warn!(kind = %kind, object = %object, error = %e, "Remote change handler failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, Weak};

    use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
    use objsync_core::config::S3Config;
    use objsync_core::domain::ObjectEventKind;
    use objsync_core::ports::{IObjectEventListener, IObjectStore};

    use super::*;

    fn record(name: &str, size: u64, fp: &str) -> ObjectRecord {
        ObjectRecord::new(name, size, Some(fp.to_string()))
    }

    fn map(records: &[ObjectRecord]) -> ObjectMap {
        records
            .iter()
            .map(|r| (r.name.clone(), r.clone()))
            .collect()
    }

    #[test]
    fn test_diff_detects_new_changed_and_vanished() {
        let known = map(&[record("same", 1, "a"), record("changed", 1, "a"), record("gone", 1, "a")]);
        let listed = map(&[record("same", 1, "a"), record("changed", 1, "b"), record("new", 2, "c")]);

        let changes = diff_listing(&known, &listed, &HashSet::new());
        assert_eq!(
            changes,
            vec![
                RemoteChange::Created(record("changed", 1, "b")),
                RemoteChange::Created(record("new", 2, "c")),
                RemoteChange::Deleted("gone".to_string()),
            ]
        );
    }

    #[test]
    fn test_diff_respects_skip_set() {
        let known = map(&[record("uploading", 1, "a")]);
        let listed = map(&[record("other", 1, "b")]);
        let skip: HashSet<String> = ["uploading".to_string(), "other".to_string()].into();

        assert!(diff_listing(&known, &listed, &skip).is_empty());
    }

    #[test]
    fn test_diff_empty_objects_are_equal() {
        let known = map(&[ObjectRecord::new("e", 0, None)]);
        let listed = map(&[record("e", 0, "d41d8cd98f00b204e9800998ecf8427e")]);
        assert!(diff_listing(&known, &listed, &HashSet::new()).is_empty());
    }

    /// Records each event together with whether the store listed it at that moment
    struct Recorder {
        store: Arc<S3ObjectStore>,
        seen: Mutex<Vec<(ObjectEventKind, String, bool)>>,
    }

    #[async_trait::async_trait]
    impl IObjectEventListener for Recorder {
        async fn on_object_event(&self, event: ObjectEvent) -> anyhow::Result<()> {
            let listed = self.store.has_object(&event.object_name).await;
            self.seen
                .lock()
                .unwrap()
                .push((event.kind, event.object_name, listed));
            Ok(())
        }
    }

    fn offline_store() -> Arc<S3ObjectStore> {
        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .endpoint_url("http://127.0.0.1:1")
            .force_path_style(true)
            .build();
        Arc::new(S3ObjectStore::with_client(
            aws_sdk_s3::Client::from_conf(s3_config),
            &S3Config::default(),
        ))
    }

    #[tokio::test]
    async fn test_apply_orders_map_updates_around_dispatch() {
        let store = offline_store();
        store.insert_record(record("old", 1, "a"));

        let recorder = Arc::new(Recorder {
            store: store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let listener: Arc<dyn IObjectEventListener> = recorder.clone();
        store.set_event_listener(Arc::downgrade(&listener));

        let poller = RemotePoller::new(store.clone(), Duration::from_secs(1), CancellationToken::new());
        poller
            .apply(vec![
                RemoteChange::Created(record("new", 1, "b")),
                RemoteChange::Deleted("old".to_string()),
            ])
            .await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (ObjectEventKind::Created, "new".to_string(), true),
                (ObjectEventKind::Deleted, "old".to_string(), true),
            ]
        );
        assert!(store.has_object("new").await);
        assert!(!store.has_object("old").await);
    }

    #[tokio::test]
    async fn test_apply_without_listener_still_updates_map() {
        let store = offline_store();
        store.set_event_listener(Weak::<Recorder>::new());
        store.insert_record(record("old", 1, "a"));

        let poller = RemotePoller::new(store.clone(), Duration::from_secs(1), CancellationToken::new());
        poller
            .apply(vec![RemoteChange::Deleted("old".to_string())])
            .await;
        assert!(!store.has_object("old").await);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let poller = RemotePoller::new(offline_store(), Duration::from_secs(3600), shutdown.clone());
        let handle = tokio::spawn(poller.run());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
