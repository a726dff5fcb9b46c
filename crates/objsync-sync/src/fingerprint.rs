//! Content fingerprints and file/record equality
//!
//! The fingerprint matches the ETag an S3-compatible store reports for an
//! object uploaded with 64 MiB parts:
//!
//! - empty input: MD5 of the empty string
//! - one chunk: hex MD5 of the content
//! - N > 1 chunks: hex MD5 of the concatenated raw per-chunk digests,
//!   followed by `-N`
//!
//! Reading a file that another process holds busy/locked is retried with a
//! linear back-off before giving up with an [`AggregateError`].

use std::future::Future;
use std::io::{self, ErrorKind};
use std::path::Path;
use std::time::Duration;

use md5::{Digest, Md5};
use objsync_core::domain::ObjectRecord;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument, warn};

use crate::{AggregateError, SyncError};

/// Chunk size used by S3 multipart uploads and fingerprints
pub const CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Fingerprint of zero bytes
pub const EMPTY_FINGERPRINT: &str = "d41d8cd98f00b204e9800998ecf8427e";

const READ_BUFFER_SIZE: usize = 1024 * 1024;

// ============================================================================
// FingerprintBuilder
// ============================================================================

/// Streaming fingerprint accumulator
///
/// Input may arrive in slices of any size; chunk boundaries are placed at
/// exact multiples of the chunk size regardless of how the input is split.
pub struct FingerprintBuilder {
    chunk_size: usize,
    current: Md5,
    current_len: usize,
    digests: Vec<u8>,
    chunks: usize,
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    /// Builder with a custom chunk size
    ///
    /// # Panics
    /// Panics if `chunk_size` is zero.
    pub fn with_chunk_size(chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Self {
            chunk_size,
            current: Md5::new(),
            current_len: 0,
            digests: Vec::new(),
            chunks: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = self.chunk_size - self.current_len;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take;
            data = &data[take..];

            if self.current_len == self.chunk_size {
                self.close_chunk();
            }
        }
    }

    fn close_chunk(&mut self) {
        let digest = std::mem::replace(&mut self.current, Md5::new()).finalize();
        self.digests.extend_from_slice(&digest);
        self.chunks += 1;
        self.current_len = 0;
    }

    pub fn finalize(mut self) -> String {
        if self.current_len > 0 {
            self.close_chunk();
        }

        match self.chunks {
            0 => EMPTY_FINGERPRINT.to_string(),
            1 => hex::encode(&self.digests),
            n => format!("{}-{n}", hex::encode(Md5::digest(&self.digests))),
        }
    }
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Busy-file retry
// ============================================================================

/// Retry policy for files that are busy or locked by another process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub attempts: u32,
    /// Delay before retry `n` is `n * step`
    pub step: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, step: Duration) -> Self {
        Self { attempts, step }
    }

    /// A single attempt, no retry
    pub fn none() -> Self {
        Self {
            attempts: 1,
            step: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            step: Duration::from_secs(5),
        }
    }
}

/// Whether an I/O error means "busy / locked, try again later"
pub fn is_busy_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock || err.raw_os_error().is_some_and(is_busy_code)
}

#[cfg(unix)]
fn is_busy_code(code: i32) -> bool {
    code == libc::EBUSY || code == libc::ETXTBSY || code == libc::EAGAIN
}

// ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
#[cfg(windows)]
fn is_busy_code(code: i32) -> bool {
    code == 32 || code == 33
}

#[cfg(not(any(unix, windows)))]
fn is_busy_code(_code: i32) -> bool {
    false
}

async fn read_fingerprint(path: &Path, chunk_size: usize) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut builder = FingerprintBuilder::with_chunk_size(chunk_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        builder.update(&buf[..n]);
    }

    Ok(builder.finalize())
}

// ============================================================================
// Public API
// ============================================================================

/// Compute the fingerprint of a file with the default retry policy
pub async fn compute_fingerprint(path: &Path) -> Result<String, SyncError> {
    compute_fingerprint_with(path, &RetryPolicy::default(), CHUNK_SIZE).await
}

/// Compute the fingerprint of a file
///
/// Busy/locked errors are retried per `policy`; any other error fails
/// immediately. When every attempt fails the distinct causes are returned
/// as [`SyncError::Aggregate`].
#[instrument(skip(path, policy), fields(path = %path.display()))]
pub async fn compute_fingerprint_with(
    path: &Path,
    policy: &RetryPolicy,
    chunk_size: usize,
) -> Result<String, SyncError> {
    let fingerprint = retry_busy(policy, || read_fingerprint(path, chunk_size)).await?;
    debug!(fingerprint = %fingerprint, "Fingerprint computed");
    Ok(fingerprint)
}

/// Run `op` until it succeeds, retrying busy/locked errors per `policy`
async fn retry_busy<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut aggregate = AggregateError::new(attempts);

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_busy_error(&err) => {
                aggregate.push(err);
                if attempt < attempts {
                    let delay = policy.step * attempt;
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "File busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            Err(err) => return Err(SyncError::IoError(err)),
        }
    }

    Err(SyncError::Aggregate(aggregate))
}

/// Whether the local file at `path` matches `record`
///
/// A missing file is never equal. Two empty objects are equal without
/// hashing. Otherwise both size and fingerprint must match.
pub async fn is_file_equal(
    path: &Path,
    record: &ObjectRecord,
    policy: &RetryPolicy,
) -> Result<bool, SyncError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(SyncError::IoError(err)),
    };

    if metadata.len() == 0 && record.size == 0 {
        return Ok(true);
    }
    if metadata.len() != record.size {
        return Ok(false);
    }

    let Some(expected) = record.fingerprint.as_deref() else {
        return Ok(false);
    };
    let actual = compute_fingerprint_with(path, policy, CHUNK_SIZE).await?;
    Ok(actual == expected)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(FingerprintBuilder::new().finalize(), EMPTY_FINGERPRINT);
    }

    #[test]
    fn test_single_chunk_is_plain_md5() {
        let mut b = FingerprintBuilder::new();
        b.update(b"hello");
        assert_eq!(b.finalize(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_multi_chunk_suffix() {
        let data = b"abcdefghij";
        let mut b = FingerprintBuilder::with_chunk_size(4);
        b.update(data);
        let fp = b.finalize();

        let mut concat = Vec::new();
        for chunk in data.chunks(4) {
            concat.extend_from_slice(&Md5::digest(chunk));
        }
        let expected = format!("{}-3", hex::encode(Md5::digest(&concat)));
        assert_eq!(fp, expected);
    }

    #[test]
    fn test_exact_chunk_multiple_has_no_empty_tail() {
        let mut b = FingerprintBuilder::with_chunk_size(4);
        b.update(b"abcdefgh");
        assert!(b.finalize().ends_with("-2"));
    }

    #[test]
    fn test_exactly_one_chunk_has_no_suffix() {
        let mut b = FingerprintBuilder::with_chunk_size(4);
        b.update(b"abcd");
        assert_eq!(b.finalize(), hex::encode(Md5::digest(b"abcd")));
    }

    #[test]
    fn test_split_reads_do_not_move_boundaries() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let mut whole = FingerprintBuilder::with_chunk_size(64);
        whole.update(&data);

        let mut pieces = FingerprintBuilder::with_chunk_size(64);
        for piece in data.chunks(37) {
            pieces.update(piece);
        }

        assert_eq!(whole.finalize(), pieces.finalize());
    }

    #[test]
    fn test_busy_error_classification() {
        assert!(is_busy_error(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(!is_busy_error(&io::Error::from(ErrorKind::NotFound)));
        assert!(!is_busy_error(&io::Error::from(ErrorKind::PermissionDenied)));
    }

    #[cfg(unix)]
    #[test]
    fn test_busy_error_raw_codes() {
        assert!(is_busy_error(&io::Error::from_raw_os_error(libc::EBUSY)));
        assert!(is_busy_error(&io::Error::from_raw_os_error(libc::ETXTBSY)));
        assert!(!is_busy_error(&io::Error::from_raw_os_error(libc::ENOENT)));
    }

    #[tokio::test]
    async fn test_compute_fingerprint_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let fp = compute_fingerprint(&path).await.unwrap();
        assert_eq!(fp, "5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn test_compute_fingerprint_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();

        assert_eq!(compute_fingerprint(&path).await.unwrap(), EMPTY_FINGERPRINT);
    }

    #[tokio::test]
    async fn test_missing_file_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let policy = RetryPolicy::new(5, Duration::from_secs(60));

        let start = std::time::Instant::now();
        let err = compute_fingerprint_with(&dir.path().join("nope"), &policy, CHUNK_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IoError(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_is_file_equal_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let record = ObjectRecord::new("a", 0, Some(EMPTY_FINGERPRINT.to_string()));
        let equal = is_file_equal(&dir.path().join("a"), &record, &RetryPolicy::none())
            .await
            .unwrap();
        assert!(!equal);
    }

    #[tokio::test]
    async fn test_is_file_equal_both_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"").await.unwrap();

        // No fingerprint on the record: empty files compare equal without hashing
        let record = ObjectRecord::new("a", 0, None);
        assert!(is_file_equal(&path, &record, &RetryPolicy::none()).await.unwrap());
    }

    #[tokio::test]
    async fn test_is_file_equal_size_and_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let policy = RetryPolicy::none();

        let same = ObjectRecord::new("a", 5, Some("5d41402abc4b2a76b9719d911017c592".into()));
        assert!(is_file_equal(&path, &same, &policy).await.unwrap());

        let other_size = ObjectRecord::new("a", 6, Some("5d41402abc4b2a76b9719d911017c592".into()));
        assert!(!is_file_equal(&path, &other_size, &policy).await.unwrap());

        let other_hash = ObjectRecord::new("a", 5, Some("00000000000000000000000000000000".into()));
        assert!(!is_file_equal(&path, &other_hash, &policy).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_linearly_then_aggregates() {
        let start = tokio::time::Instant::now();
        let mut seen = Vec::new();
        let policy = RetryPolicy::new(4, Duration::from_secs(5));

        let result: Result<(), SyncError> = retry_busy(&policy, || {
            seen.push(start.elapsed());
            let err = if seen.len() == 3 {
                io::Error::new(ErrorKind::WouldBlock, "locked by another process")
            } else {
                io::Error::new(ErrorKind::WouldBlock, "resource busy")
            };
            async move { Err(err) }
        })
        .await;

        assert_eq!(
            seen,
            vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(30),
            ]
        );
        match result {
            Err(SyncError::Aggregate(agg)) => {
                assert_eq!(agg.attempts, 4);
                let causes: Vec<String> = agg.causes.iter().map(ToString::to_string).collect();
                assert_eq!(causes, vec!["resource busy", "locked by another process"]);
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_once_file_is_free() {
        let mut calls = 0u32;
        let policy = RetryPolicy::new(5, Duration::from_secs(5));

        let value = retry_busy(&policy, || {
            calls += 1;
            let outcome = if calls < 3 {
                Err(io::Error::from(ErrorKind::WouldBlock))
            } else {
                Ok(calls)
            };
            async move { outcome }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_other_errors() {
        let mut calls = 0u32;
        let policy = RetryPolicy::new(5, Duration::from_secs(5));

        let result: Result<(), SyncError> = retry_busy(&policy, || {
            calls += 1;
            async { Err(io::Error::from(ErrorKind::PermissionDenied)) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::IoError(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_compute_fingerprint_one_byte_past_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let file = std::fs::File::create(&path).unwrap();
        file.set_len(CHUNK_SIZE as u64 + 1).unwrap();

        let fp = compute_fingerprint(&path).await.unwrap();
        assert_eq!(fp.matches('-').count(), 1);
        assert!(fp.ends_with("-2"));
        assert_eq!(fp.len(), 32 + 2);
    }

    #[tokio::test]
    async fn test_is_file_equal_to_own_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 253) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let fingerprint = compute_fingerprint(&path).await.unwrap();
        let size = tokio::fs::metadata(&path).await.unwrap().len();
        let record = ObjectRecord::new("data.bin", size, Some(fingerprint));

        assert!(is_file_equal(&path, &record, &RetryPolicy::none()).await.unwrap());
    }
}
