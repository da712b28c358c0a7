//! TTL + size bounded cache for bucket and object metadata.

use super::{BucketDetails, BucketSummary, FileInfo};
use slog::{debug, o, Logger};
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// Tuning for the S3 metadata cache.
#[derive(Clone, Copy, Debug)]
pub struct S3CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub cleanup_interval: Duration,
}

impl Default for S3CacheConfig {
    fn default() -> Self {
        S3CacheConfig {
            ttl: Duration::from_secs(300),
            max_entries: 1024,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
}

impl<T> CacheEntry<T> {
    fn new(value: T) -> Self {
        CacheEntry {
            value,
            inserted_at: Instant::now(),
        }
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() >= ttl
    }
}

#[derive(Default)]
struct CacheInner {
    buckets: HashMap<String, CacheEntry<BucketDetails>>,
    files: HashMap<String, CacheEntry<FileInfo>>,
    bucket_list: Option<CacheEntry<Vec<BucketSummary>>>,
}

struct CacheShared {
    inner: Mutex<CacheInner>,
    config: S3CacheConfig,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

/// Caches bucket details, object descriptors and the bucket listing. Entries
/// expire after the TTL and are also swept by a background worker; when a map
/// outgrows the size bound, the oldest-inserted entry is evicted. Cheap to
/// clone; clones share one cache and one sweeper.
#[derive(Clone)]
pub struct S3Cache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for S3Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("S3Cache")
            .field("buckets", &inner.buckets.len())
            .field("files", &inner.files.len())
            .finish()
    }
}

impl S3Cache {
    pub fn new(config: S3CacheConfig, parent_logger: &Logger) -> Self {
        let shared = Arc::new(CacheShared {
            inner: Mutex::new(CacheInner::default()),
            config,
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
            logger: parent_logger.new(o!()),
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        let weak = Arc::downgrade(&shared);
        let interval = config.cleanup_interval;
        let worker = thread::spawn(move || cleanup_worker(weak, stop_rx, interval));

        *shared.stop_tx.lock().unwrap() = Some(stop_tx);
        *shared.worker.lock().unwrap() = Some(worker);

        S3Cache { shared }
    }

    pub fn get_bucket(&self, name: &str) -> Option<BucketDetails> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .buckets
            .get(name)
            .filter(|entry| !entry.expired(self.shared.config.ttl))
            .map(|entry| entry.value.clone())
    }

    pub fn put_bucket(&self, name: &str, details: BucketDetails) {
        let mut inner = self.shared.inner.lock().unwrap();
        let max = self.shared.config.max_entries;
        evict_oldest_if_full(&mut inner.buckets, max);
        inner.buckets.insert(name.to_owned(), CacheEntry::new(details));
    }

    pub fn invalidate_bucket(&self, name: &str) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.buckets.remove(name);
        inner.bucket_list = None;
        // Object entries under the bucket are stale too
        inner.files.retain(|key, _| !key.starts_with(&format!("{name}/")));
    }

    pub fn get_file(&self, bucket: &str, key: &str) -> Option<FileInfo> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .files
            .get(&file_key(bucket, key))
            .filter(|entry| !entry.expired(self.shared.config.ttl))
            .map(|entry| entry.value.clone())
    }

    pub fn put_file(&self, bucket: &str, key: &str, info: FileInfo) {
        let mut inner = self.shared.inner.lock().unwrap();
        let max = self.shared.config.max_entries;
        evict_oldest_if_full(&mut inner.files, max);
        inner.files.insert(file_key(bucket, key), CacheEntry::new(info));
    }

    pub fn invalidate_file(&self, bucket: &str, key: &str) {
        self.shared
            .inner
            .lock()
            .unwrap()
            .files
            .remove(&file_key(bucket, key));
    }

    pub fn get_bucket_list(&self) -> Option<Vec<BucketSummary>> {
        let inner = self.shared.inner.lock().unwrap();
        inner
            .bucket_list
            .as_ref()
            .filter(|entry| !entry.expired(self.shared.config.ttl))
            .map(|entry| entry.value.clone())
    }

    pub fn put_bucket_list(&self, buckets: Vec<BucketSummary>) {
        self.shared.inner.lock().unwrap().bucket_list = Some(CacheEntry::new(buckets));
    }

    /// Drops every expired entry. Runs on the sweeper's tick and from tests.
    pub(crate) fn sweep(&self) {
        sweep_shared(&self.shared);
    }

    pub(crate) fn entry_count(&self) -> usize {
        let inner = self.shared.inner.lock().unwrap();
        inner.buckets.len() + inner.files.len()
    }

    /// Stops the sweeper thread.
    pub fn close(&self) {
        drop(self.shared.stop_tx.lock().unwrap().take());
        if let Some(worker) = self.shared.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for CacheShared {
    fn drop(&mut self) {
        drop(self.stop_tx.lock().unwrap().take());
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn file_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
}

fn evict_oldest_if_full<T>(map: &mut HashMap<String, CacheEntry<T>>, max_entries: usize) {
    if map.len() < max_entries {
        return;
    }
    if let Some(oldest) = map
        .iter()
        .min_by_key(|(_, entry)| entry.inserted_at)
        .map(|(key, _)| key.clone())
    {
        map.remove(&oldest);
    }
}

fn sweep_shared(shared: &CacheShared) {
    let ttl = shared.config.ttl;
    let mut inner = shared.inner.lock().unwrap();
    let before = inner.buckets.len() + inner.files.len();
    inner.buckets.retain(|_, entry| !entry.expired(ttl));
    inner.files.retain(|_, entry| !entry.expired(ttl));
    if let Some(entry) = &inner.bucket_list {
        if entry.expired(ttl) {
            inner.bucket_list = None;
        }
    }
    let after = inner.buckets.len() + inner.files.len();
    if before != after {
        debug!(shared.logger, "swept expired cache entries"; "removed" => before - after);
    }
}

fn cleanup_worker(shared: Weak<CacheShared>, stop_rx: mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => match shared.upgrade() {
                Some(shared) => sweep_shared(&shared),
                None => break,
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::setup_test_logging;

    fn details(name: &str) -> BucketDetails {
        BucketDetails {
            name: name.to_owned(),
            region: None,
            versioning_enabled: false,
            encryption_algorithm: None,
            public_access_blocked: false,
            lifecycle_rule_count: 0,
            policy: None,
            tags: Default::default(),
            logging_target: None,
        }
    }

    fn file(key: &str) -> FileInfo {
        FileInfo {
            bucket: "b".into(),
            key: key.to_owned(),
            size: 1,
            etag: None,
            storage_class: None,
            last_modified: None,
            metadata: Default::default(),
            parts_count: None,
        }
    }

    fn cache_with(ttl: Duration, max_entries: usize) -> S3Cache {
        let logger = setup_test_logging();
        S3Cache::new(
            S3CacheConfig {
                ttl,
                max_entries,
                cleanup_interval: Duration::from_secs(3600),
            },
            &logger,
        )
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = cache_with(Duration::from_millis(20), 16);
        cache.put_bucket("apm-config", details("apm-config"));
        assert!(cache.get_bucket("apm-config").is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get_bucket("apm-config").is_none());

        cache.sweep();
        assert_eq!(cache.entry_count(), 0);
        cache.close();
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let cache = cache_with(Duration::from_secs(60), 2);
        cache.put_file("b", "first", file("first"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put_file("b", "second", file("second"));
        std::thread::sleep(Duration::from_millis(5));
        cache.put_file("b", "third", file("third"));

        assert!(cache.get_file("b", "first").is_none());
        assert!(cache.get_file("b", "second").is_some());
        assert!(cache.get_file("b", "third").is_some());
        cache.close();
    }

    #[test]
    fn bucket_invalidation_clears_contained_files() {
        let cache = cache_with(Duration::from_secs(60), 16);
        cache.put_bucket("apm-config", details("apm-config"));
        cache.put_file("apm-config", "configs/prod/x.json", file("x"));
        cache.put_file("other", "y.json", file("y"));

        cache.invalidate_bucket("apm-config");
        assert!(cache.get_bucket("apm-config").is_none());
        assert!(cache.get_file("apm-config", "configs/prod/x.json").is_none());
        assert!(cache.get_file("other", "y.json").is_some());
        cache.close();
    }

    #[test]
    fn bucket_list_round_trips() {
        let cache = cache_with(Duration::from_secs(60), 16);
        assert!(cache.get_bucket_list().is_none());
        cache.put_bucket_list(vec![BucketSummary {
            name: "apm-config".into(),
            created_at: None,
        }]);
        assert_eq!(cache.get_bucket_list().unwrap().len(), 1);
        cache.close();
    }
}
