//! S3ObjectStore - IObjectStore implementation for S3-compatible services
//!
//! Keeps an in-memory object map (`name → size + fingerprint`) that mirrors
//! the bucket. The map is loaded by [`S3ObjectStore::init`], updated by every
//! upload/delete made through this store, and refreshed by the
//! [`RemotePoller`](crate::poller::RemotePoller).
//!
//! ## Design Notes
//!
//! - Uploads record the new `(size, fingerprint)` before the transfer starts,
//!   so the poller sees our own writes as already known and never echoes them
//!   back as remote changes.
//! - Files larger than one fingerprint chunk go through a multipart upload
//!   with parts of exactly that size, which makes the service-computed ETag
//!   equal to the local fingerprint.
//! - Names with an upload or delete in flight are reported to the poller so
//!   that a listing taken mid-transfer is not mistaken for a remote change.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart,
    CreateBucketConfiguration, Delete, ObjectIdentifier,
};
use aws_sdk_s3::Client;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument, warn};

use objsync_core::config::S3Config;
use objsync_core::domain::{
    normalize_object_name, ObjectMap, ObjectRecord, PARTIAL_DOWNLOAD_SUFFIX,
};
use objsync_core::ports::{IObjectEventListener, IObjectStore};
use objsync_sync::fingerprint::{compute_fingerprint, CHUNK_SIZE};

use crate::S3Error;

/// Region that must not be sent as a bucket location constraint
const DEFAULT_REGION: &str = "us-east-1";

/// Maximum keys accepted by a single `DeleteObjects` request
const DELETE_BATCH: usize = 1000;

/// Characters Windows does not allow in file or directory names
const WINDOWS_INVALID_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '\\'];

// ============================================================================
// Helpers
// ============================================================================

/// ETags are listed with surrounding double quotes
pub fn strip_etag_quotes(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// Whether two records describe the same content
///
/// Two empty objects always match; otherwise sizes and fingerprints must be
/// equal and present.
pub fn records_match(a: &ObjectRecord, b: &ObjectRecord) -> bool {
    if a.size == 0 && b.size == 0 {
        return true;
    }
    a.size == b.size && a.fingerprint.is_some() && a.fingerprint == b.fingerprint
}

/// Whether any path component of `name` cannot exist on Windows
pub fn has_invalid_windows_chars(name: &str) -> bool {
    name.split('/')
        .any(|component| component.contains(WINDOWS_INVALID_CHARS))
}

fn partial_path(path: &Path) -> PathBuf {
    let mut file_name = path.file_name().map(OsString::from).unwrap_or_default();
    file_name.push(PARTIAL_DOWNLOAD_SUFFIX);
    path.with_file_name(file_name)
}

/// Fill `buf` from `file`, returning fewer bytes only at end of file
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Names touched by local transfers, consumed by the poller
#[derive(Default)]
struct Tracking {
    in_flight: HashMap<String, usize>,
    /// Names touched since the current poll started
    touched: HashSet<String>,
}

/// Marks `name` as in flight until dropped
struct InFlight<'a> {
    tracking: &'a Mutex<Tracking>,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut tracking = self.tracking.lock().unwrap();
        if let Some(count) = tracking.in_flight.get_mut(&self.name) {
            *count -= 1;
            if *count == 0 {
                tracking.in_flight.remove(&self.name);
            }
        }
    }
}

// ============================================================================
// S3ObjectStore
// ============================================================================

/// Object store backed by a single S3 / MinIO bucket
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    region: String,
    /// Files larger than this are not uploaded
    max_file_size: Option<u64>,
    objects: Mutex<ObjectMap>,
    listener: Mutex<Option<Weak<dyn IObjectEventListener>>>,
    tracking: Mutex<Tracking>,
}

impl S3ObjectStore {
    /// Build a client for the configured endpoint
    ///
    /// Uses static credentials and path-style addressing, which MinIO and
    /// most self-hosted services require. No request is made until
    /// [`init`](Self::init).
    pub async fn connect(config: &S3Config) -> Result<Self, S3Error> {
        if !(config.endpoint.starts_with("http://") || config.endpoint.starts_with("https://")) {
            return Err(S3Error::InvalidConfig(format!(
                "endpoint must start with http:// or https://, got '{}'",
                config.endpoint
            )));
        }

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "objsync-config",
        );
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .endpoint_url(&config.endpoint)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        info!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            "Connecting to object service"
        );
        Ok(Self::with_client(Client::from_conf(s3_config), config))
    }

    /// Wrap an already configured client
    pub fn with_client(client: Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            max_file_size: config.max_file_size,
            objects: Mutex::new(ObjectMap::new()),
            listener: Mutex::new(None),
            tracking: Mutex::new(Tracking::default()),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Create the bucket if needed and load the object map
    ///
    /// # Errors
    /// Fails if the bucket cannot be created or listed, or if a listed
    /// object has no ETag.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn init(&self) -> Result<(), S3Error> {
        self.ensure_bucket().await?;
        let listed = self.list_remote().await?;
        info!(objects = listed.len(), "Loaded bucket listing");
        *self.objects.lock().unwrap() = listed;
        Ok(())
    }

    async fn ensure_bucket(&self) -> Result<(), S3Error> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                let missing = err.as_service_error().is_some_and(|e| e.is_not_found())
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if !missing {
                    return Err(S3Error::request("head_bucket", err));
                }
            }
        }

        info!("Bucket does not exist, creating it");
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| S3Error::request("create_bucket", e))?;
        Ok(())
    }

    /// List every object in the bucket
    pub async fn list_remote(&self) -> Result<ObjectMap, S3Error> {
        let mut listed = ObjectMap::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| S3Error::request("list_objects_v2", e))?;
            for object in page.contents() {
                let Some(name) = object.key() else {
                    warn!("Listed object without a key, skipping");
                    continue;
                };
                let etag = object
                    .e_tag()
                    .ok_or_else(|| S3Error::MissingETag(name.to_string()))?;
                let size = object.size().unwrap_or(0).max(0) as u64;
                listed.insert(
                    name.to_string(),
                    ObjectRecord::new(name, size, Some(strip_etag_quotes(etag))),
                );
            }
        }

        debug!(objects = listed.len(), "Listed bucket");
        Ok(listed)
    }

    // ========================================================================
    // Object map access for the poller
    // ========================================================================

    pub(crate) fn known_objects(&self) -> ObjectMap {
        self.objects.lock().unwrap().clone()
    }

    pub(crate) fn insert_record(&self, record: ObjectRecord) {
        self.objects
            .lock()
            .unwrap()
            .insert(record.name.clone(), record);
    }

    pub(crate) fn remove_record(&self, name: &str) {
        self.objects.lock().unwrap().remove(name);
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn IObjectEventListener>> {
        self.listener.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Start a poll round: names currently in flight stay excluded
    pub(crate) fn begin_poll(&self) {
        let mut tracking = self.tracking.lock().unwrap();
        tracking.touched = tracking.in_flight.keys().cloned().collect();
    }

    /// Finish a poll round, returning the names it must not report
    pub(crate) fn end_poll(&self) -> HashSet<String> {
        let mut tracking = self.tracking.lock().unwrap();
        let mut skip = std::mem::take(&mut tracking.touched);
        skip.extend(tracking.in_flight.keys().cloned());
        skip
    }

    fn begin_transfer(&self, name: &str) -> InFlight<'_> {
        let mut tracking = self.tracking.lock().unwrap();
        *tracking.in_flight.entry(name.to_string()).or_insert(0) += 1;
        tracking.touched.insert(name.to_string());
        InFlight {
            tracking: &self.tracking,
            name: name.to_string(),
        }
    }

    fn is_known(&self, name: &str) -> bool {
        self.objects.lock().unwrap().contains_key(name)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Record and upload `path` as `name` unless the bucket already holds it
    #[instrument(skip_all, fields(object = %name))]
    async fn put(&self, name: &str, path: &Path) -> Result<(), S3Error> {
        let _in_flight = self.begin_transfer(name);

        let size = tokio::fs::metadata(path).await?.len();
        if let Some(max) = self.max_file_size {
            if size > max {
                info!(size, max, "Skipping file larger than the size limit");
                return Ok(());
            }
        }

        let fingerprint = compute_fingerprint(path).await?;
        let record = ObjectRecord::new(name, size, Some(fingerprint));

        let previous = {
            let mut objects = self.objects.lock().unwrap();
            if let Some(existing) = objects.get(name) {
                if records_match(existing, &record) {
                    debug!(bucket = %self.bucket, "Object already in bucket");
                    return Ok(());
                }
            }
            objects.insert(name.to_string(), record)
        };

        let result = if size > CHUNK_SIZE as u64 {
            self.put_multipart(name, path).await
        } else {
            self.put_single(name, path).await
        };

        if result.is_err() {
            let mut objects = self.objects.lock().unwrap();
            match previous {
                Some(previous) => objects.insert(name.to_string(), previous),
                None => objects.remove(name),
            };
        }
        result
    }

    async fn put_single(&self, name: &str, path: &Path) -> Result<(), S3Error> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| S3Error::request("read_file", e))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(name)
            .body(body)
            .send()
            .await
            .map_err(|e| S3Error::request("put_object", e))?;
        Ok(())
    }

    async fn put_multipart(&self, name: &str, path: &Path) -> Result<(), S3Error> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| S3Error::request("create_multipart_upload", e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| S3Error::MissingUploadId(name.to_string()))?
            .to_string();

        let parts = match self.upload_parts(name, path, &upload_id).await {
            Ok(parts) => parts,
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(name)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        error = %S3Error::request("abort_multipart_upload", abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                return Err(err);
            }
        };

        let part_count = parts.len();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(name)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| S3Error::request("complete_multipart_upload", e))?;

        debug!(parts = part_count, "Multipart upload completed");
        Ok(())
    }

    async fn upload_parts(
        &self,
        name: &str,
        path: &Path,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, S3Error> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut parts = Vec::new();
        let mut part_number: i32 = 1;

        loop {
            let filled = read_chunk(&mut file, &mut buffer).await?;
            if filled == 0 {
                break;
            }

            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(name)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer[..filled].to_vec()))
                .send()
                .await
                .map_err(|e| S3Error::request("upload_part", e))?;

            debug!(part_number, bytes = filled, "Uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            if filled < CHUNK_SIZE {
                break;
            }
        }

        Ok(parts)
    }

    #[instrument(skip_all, fields(object = %name))]
    async fn remove(&self, name: &str) -> Result<(), S3Error> {
        if !self.is_known(name) {
            return Err(S3Error::UnknownObject {
                op: "delete",
                name: name.to_string(),
            });
        }
        let _in_flight = self.begin_transfer(name);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| S3Error::request("delete_object", e))?;
        self.remove_record(name);
        info!(bucket = %self.bucket, "Object deleted");
        Ok(())
    }

    #[instrument(skip_all, fields(object = %name))]
    async fn fetch(&self, name: &str, path: &Path) -> Result<(), S3Error> {
        if cfg!(windows) && has_invalid_windows_chars(name) {
            warn!("Object name contains characters invalid on this platform, skipping");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(name)
            .send()
            .await
            .map_err(|e| S3Error::request("get_object", e))?;

        let partial = partial_path(path);
        if let Err(err) = write_body(output.body, &partial).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err);
        }
        tokio::fs::rename(&partial, path).await?;

        debug!(path = %path.display(), "Object downloaded");
        Ok(())
    }

    async fn clear_bucket(&self) -> Result<(), S3Error> {
        let names: Vec<String> = self.list_remote().await?.into_keys().collect();

        for batch in names.chunks(DELETE_BATCH) {
            let identifiers = batch
                .iter()
                .map(|name| {
                    ObjectIdentifier::builder()
                        .key(name)
                        .build()
                        .map_err(|e| S3Error::request("delete_objects", e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .quiet(true)
                .build()
                .map_err(|e| S3Error::request("delete_objects", e))?;

            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| S3Error::request("delete_objects", e))?;
        }

        self.client
            .delete_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| S3Error::request("delete_bucket", e))?;

        self.objects.lock().unwrap().clear();
        info!(bucket = %self.bucket, objects = names.len(), "Bucket removed");
        Ok(())
    }
}

async fn write_body(mut body: ByteStream, path: &Path) -> Result<(), S3Error> {
    let mut file = tokio::fs::File::create(path).await?;
    while let Some(chunk) = body
        .try_next()
        .await
        .map_err(|e| S3Error::request("get_object", e))?
    {
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

// ============================================================================
// IObjectStore implementation
// ============================================================================

#[async_trait]
impl IObjectStore for S3ObjectStore {
    async fn objects(&self) -> ObjectMap {
        self.known_objects()
    }

    async fn has_object(&self, name: &str) -> bool {
        self.is_known(&normalize_object_name(name))
    }

    async fn get_object(&self, name: &str) -> Option<ObjectRecord> {
        self.objects
            .lock()
            .unwrap()
            .get(&normalize_object_name(name))
            .cloned()
    }

    async fn upload(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        Ok(self.put(&normalize_object_name(name), path).await?)
    }

    async fn update(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        let name = normalize_object_name(name);
        if !self.is_known(&name) {
            return Err(S3Error::UnknownObject { op: "update", name }.into());
        }
        Ok(self.put(&name, path).await?)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        Ok(self.remove(&normalize_object_name(name)).await?)
    }

    async fn download(&self, name: &str, path: &Path) -> anyhow::Result<()> {
        Ok(self.fetch(&normalize_object_name(name), path).await?)
    }

    fn set_event_listener(&self, listener: Weak<dyn IObjectEventListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    async fn remove_all(&self) -> anyhow::Result<()> {
        Ok(self.clear_bucket().await?)
    }
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("max_file_size", &self.max_file_size)
            .finish_non_exhaustive()
    }
}
