//! Per-entity-type cache of last-observed CloudWatch state.

use super::{
    alarms::Alarm, dashboards::Dashboard, events::EventRule, events::SnsTopic, logs::LogGroup,
};
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

/// One entity-type map with insertion timestamps.
#[derive(Debug)]
struct EntityMap<T> {
    entries: HashMap<String, (T, Instant)>,
}

impl<T> Default for EntityMap<T> {
    fn default() -> Self {
        EntityMap {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> EntityMap<T> {
    fn get(&self, key: &str, ttl: Option<Duration>) -> Option<T> {
        self.entries
            .get(key)
            .filter(|(_, inserted_at)| match ttl {
                Some(ttl) => inserted_at.elapsed() < ttl,
                None => true,
            })
            .map(|(value, _)| value.clone())
    }

    fn put(&mut self, key: String, value: T) {
        self.entries.insert(key, (value, Instant::now()));
    }

    /// Rewrites a cached entity in place, keeping its insertion time.
    fn update<F: FnOnce(&mut T)>(&mut self, key: &str, mutate: F) {
        if let Some((value, _)) = self.entries.get_mut(key) {
            mutate(value);
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, (_, inserted_at)| inserted_at.elapsed() < ttl);
        before - self.entries.len()
    }
}

#[derive(Default)]
struct CacheInner {
    dashboards: EntityMap<Dashboard>,
    alarms: EntityMap<Alarm>,
    log_groups: EntityMap<LogGroup>,
    topics: EntityMap<SnsTopic>,
    rules: EntityMap<EventRule>,
}

struct CacheShared {
    inner: Mutex<CacheInner>,
    ttl: Option<Duration>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
}

/// Caches the last observed state of each managed CloudWatch entity. The TTL
/// is optional; without one, entries live until explicitly removed. Cheap to
/// clone; clones share one cache and one sweeper.
#[derive(Clone)]
pub struct CloudWatchCache {
    shared: Arc<CacheShared>,
}

impl std::fmt::Debug for CloudWatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock().unwrap();
        f.debug_struct("CloudWatchCache")
            .field("dashboards", &inner.dashboards.entries.len())
            .field("alarms", &inner.alarms.entries.len())
            .field("log_groups", &inner.log_groups.entries.len())
            .finish()
    }
}

impl CloudWatchCache {
    /// A cache with no expiry and no sweeper.
    pub fn unbounded(parent_logger: &Logger) -> Self {
        Self::build(None, Duration::from_secs(60), parent_logger)
    }

    /// A cache whose entries expire after `ttl`, swept periodically.
    pub fn with_ttl(ttl: Duration, sweep_interval: Duration, parent_logger: &Logger) -> Self {
        Self::build(Some(ttl), sweep_interval, parent_logger)
    }

    fn build(ttl: Option<Duration>, sweep_interval: Duration, parent_logger: &Logger) -> Self {
        let shared = Arc::new(CacheShared {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
            logger: parent_logger.new(o!()),
        });

        if ttl.is_some() {
            let (stop_tx, stop_rx) = mpsc::channel();
            let weak = Arc::downgrade(&shared);
            let worker = thread::spawn(move || sweep_worker(weak, stop_rx, sweep_interval));
            *shared.stop_tx.lock().unwrap() = Some(stop_tx);
            *shared.worker.lock().unwrap() = Some(worker);
        }

        CloudWatchCache { shared }
    }

    pub fn get_dashboard(&self, name: &str) -> Option<Dashboard> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .dashboards
            .get(name, self.shared.ttl)
    }

    pub fn put_dashboard(&self, dashboard: Dashboard) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.dashboards.put(dashboard.name.clone(), dashboard);
    }

    pub fn remove_dashboard(&self, name: &str) {
        self.shared.inner.lock().unwrap().dashboards.remove(name);
    }

    pub fn get_alarm(&self, name: &str) -> Option<Alarm> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .alarms
            .get(name, self.shared.ttl)
    }

    pub fn put_alarm(&self, alarm: Alarm) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.alarms.put(alarm.name.clone(), alarm);
    }

    pub fn update_alarm<F: FnOnce(&mut Alarm)>(&self, name: &str, mutate: F) {
        self.shared.inner.lock().unwrap().alarms.update(name, mutate);
    }

    pub fn remove_alarm(&self, name: &str) {
        self.shared.inner.lock().unwrap().alarms.remove(name);
    }

    pub fn get_log_group(&self, name: &str) -> Option<LogGroup> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .log_groups
            .get(name, self.shared.ttl)
    }

    pub fn put_log_group(&self, group: LogGroup) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.log_groups.put(group.name.clone(), group);
    }

    pub fn remove_log_group(&self, name: &str) {
        self.shared.inner.lock().unwrap().log_groups.remove(name);
    }

    pub fn get_topic(&self, name: &str) -> Option<SnsTopic> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .topics
            .get(name, self.shared.ttl)
    }

    pub fn put_topic(&self, topic: SnsTopic) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.topics.put(topic.name.clone(), topic);
    }

    pub fn get_rule(&self, name: &str) -> Option<EventRule> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .rules
            .get(name, self.shared.ttl)
    }

    pub fn put_rule(&self, rule: EventRule) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.rules.put(rule.name.clone(), rule);
    }

    pub(crate) fn sweep(&self) {
        if let Some(ttl) = self.shared.ttl {
            sweep_shared(&self.shared, ttl);
        }
    }

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

fn sweep_shared(shared: &CacheShared, ttl: Duration) {
    let mut inner = shared.inner.lock().unwrap();
    let removed = inner.dashboards.sweep(ttl)
        + inner.alarms.sweep(ttl)
        + inner.log_groups.sweep(ttl)
        + inner.topics.sweep(ttl)
        + inner.rules.sweep(ttl);
    if removed > 0 {
        debug!(shared.logger, "swept expired observability entries"; "removed" => removed);
    }
}

fn sweep_worker(shared: Weak<CacheShared>, stop_rx: mpsc::Receiver<()>, interval: Duration) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => match shared.upgrade() {
                Some(shared) => {
                    if let Some(ttl) = shared.ttl {
                        sweep_shared(&shared, ttl);
                    }
                }
                None => break,
            },
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudwatch::alarms::AlarmState;
    use crate::logging::setup_test_logging;

    fn alarm(name: &str) -> Alarm {
        Alarm {
            name: name.to_owned(),
            region: "us-east-1".into(),
            namespace: "APM".into(),
            metric_name: "ErrorRate".into(),
            threshold: 5.0,
            comparison_operator: "GreaterThanThreshold".into(),
            state: AlarmState::InsufficientData,
            actions_enabled: true,
            ok_actions: Vec::new(),
            alarm_actions: Vec::new(),
            insufficient_data_actions: Vec::new(),
        }
    }

    #[test]
    fn unbounded_cache_keeps_entries() {
        let cache = CloudWatchCache::unbounded(&setup_test_logging());
        cache.put_alarm(alarm("error-rate"));
        assert!(cache.get_alarm("error-rate").is_some());
        cache.sweep();
        assert!(cache.get_alarm("error-rate").is_some());
        cache.close();
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let cache = CloudWatchCache::with_ttl(
            Duration::from_millis(20),
            Duration::from_secs(3600),
            &setup_test_logging(),
        );
        cache.put_alarm(alarm("error-rate"));
        assert!(cache.get_alarm("error-rate").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get_alarm("error-rate").is_none());
        cache.close();
    }

    #[test]
    fn in_place_update_preserves_entry() {
        let cache = CloudWatchCache::unbounded(&setup_test_logging());
        cache.put_alarm(alarm("error-rate"));
        cache.update_alarm("error-rate", |alarm| alarm.actions_enabled = false);
        assert!(!cache.get_alarm("error-rate").unwrap().actions_enabled);
        cache.close();
    }
}
