//! In-memory object store and watch control used by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use objsync_core::domain::{normalize_object_name, ObjectEvent, ObjectMap, ObjectRecord};
use objsync_core::ports::{IObjectEventListener, IObjectStore, IWatchControl};
use objsync_sync::fingerprint::FingerprintBuilder;

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn fingerprint_of(data: &[u8]) -> String {
    let mut builder = FingerprintBuilder::new();
    builder.update(data);
    builder.finalize()
}

/// Object store keeping contents in memory
///
/// Every call is appended to the shared log as `"<op>:<name>"`; slow
/// operations also log `"<op>-start:<name>"` before their delay.
pub struct MemoryStore {
    objects: Mutex<ObjectMap>,
    contents: Mutex<HashMap<String, Vec<u8>>>,
    listener: Mutex<Option<Weak<dyn IObjectEventListener>>>,
    failing: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    pub log: CallLog,
}

impl MemoryStore {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(ObjectMap::new()),
            contents: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
            failing: Mutex::new(HashSet::new()),
            delays: Mutex::new(HashMap::new()),
            log,
        })
    }

    /// Simulate an object created remotely by someone else
    pub fn put_remote(&self, name: &str, data: &[u8]) {
        let record = ObjectRecord::new(name, data.len() as u64, Some(fingerprint_of(data)));
        self.objects.lock().unwrap().insert(name.to_string(), record);
        self.contents
            .lock()
            .unwrap()
            .insert(name.to_string(), data.to_vec());
    }

    pub fn remove_remote(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
        self.contents.lock().unwrap().remove(name);
    }

    /// Drop the listing entry but keep the content downloadable
    pub fn forget_record(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }

    pub fn content(&self, name: &str) -> Option<Vec<u8>> {
        self.contents.lock().unwrap().get(name).cloned()
    }

    /// Make every operation on `name` fail
    pub fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// Make every operation on `name` take `delay`
    pub fn delay_on(&self, name: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(name.to_string(), delay);
    }

    /// Deliver an event to the registered listener, as the adapter's poller would
    pub async fn emit(&self, event: ObjectEvent) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .as_ref()
            .and_then(Weak::upgrade);
        match listener {
            Some(listener) => listener.on_object_event(event).await,
            None => anyhow::bail!("no listener registered"),
        }
    }

    fn record_call(&self, op: &str, name: &str) {
        self.log.lock().unwrap().push(format!("{op}:{name}"));
    }

    async fn enter(&self, op: &str, name: &str) -> anyhow::Result<()> {
        let delay = self.delays.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            self.record_call(&format!("{op}-start"), name);
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(name) {
            self.record_call(&format!("{op}-failed"), name);
            anyhow::bail!("{op} of {name} failed");
        }
        Ok(())
    }

    async fn store_file(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        let data = tokio::fs::read(path).await?;
        self.put_remote(name, &data);
        Ok(())
    }
}

#[async_trait::async_trait]
impl IObjectStore for MemoryStore {
    async fn objects(&self) -> ObjectMap {
        self.objects.lock().unwrap().clone()
    }

    async fn has_object(&self, name: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&normalize_object_name(name))
    }

    async fn get_object(&self, name: &str) -> Option<ObjectRecord> {
        self.objects
            .lock()
            .unwrap()
            .get(&normalize_object_name(name))
            .cloned()
    }

    async fn upload(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        self.enter("upload", name).await?;
        self.store_file(name, path).await?;
        self.record_call("upload", name);
        Ok(())
    }

    async fn update(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        if !self.has_object(name).await {
            anyhow::bail!("cannot update unknown object {name}");
        }
        self.enter("update", name).await?;
        self.store_file(name, path).await?;
        self.record_call("update", name);
        Ok(())
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        if !self.has_object(name).await {
            anyhow::bail!("cannot delete unknown object {name}");
        }
        self.enter("delete", name).await?;
        self.remove_remote(name);
        self.record_call("delete", name);
        Ok(())
    }

    async fn download(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        self.enter("download", name).await?;
        let data = self
            .content(name)
            .ok_or_else(|| anyhow::anyhow!("no such object {name}"))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        self.record_call("download", name);
        Ok(())
    }

    fn set_event_listener(&self, listener: Weak<dyn IObjectEventListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        self.objects.lock().unwrap().clear();
        self.contents.lock().unwrap().clear();
        self.record_call("remove_all", "*");
        Ok(())
    }
}

/// Watch control that records pause/resume into the shared call log
pub struct RecordingControl {
    log: CallLog,
}

impl RecordingControl {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

impl IWatchControl for RecordingControl {
    fn pause(&self) {
        self.log.lock().unwrap().push("pause".to_string());
    }

    fn resume(&self) {
        self.log.lock().unwrap().push("resume".to_string());
    }
}
