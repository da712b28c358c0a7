//! Cached cross-account sessions with background refresh.
//!
//! The [`CrossAccountRoleManager`] owns every session it mints. A session's
//! credentials are only ever updated in place under the session's own lock,
//! so the refresh worker never exposes a half-assumed session to readers.

use crate::{
    cli::CliInvoker,
    credentials::{assume_role, AssumeRoleOptions, Credentials},
    error::{CloudError, ErrorKind},
    logging::event,
    metrics::SessionMetricsCollector,
};
use chrono::{DateTime, Duration, Utc};
use slog::{debug, info, o, warn, Logger};
use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration as StdDuration,
};

/// How often the background worker sweeps for expiring sessions.
const REFRESH_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Deadline for a single background re-assumption.
const REFRESH_TIMEOUT: StdDuration = StdDuration::from_secs(30);

const DEFAULT_SESSION_NAME: &str = "apm-cross-account";

/// A cached role assumption and its metadata.
#[derive(Clone, Debug)]
pub struct CrossAccountSession {
    pub source_arn: Option<String>,
    pub role_arn: String,
    pub session_name: String,
    pub credentials: Credentials,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub refresh_threshold: Duration,
    pub options: AssumeRoleOptions,
    /// Most recent background refresh failure, cleared on success. A failed
    /// refresh annotates the session but does not drop it until true expiry.
    pub last_refresh_error: Option<String>,
}

impl CrossAccountSession {
    fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + self.refresh_threshold >= self.expires_at
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A point-in-time view of a managed session, for callers that want to
/// inspect the cache without holding its locks.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub role_arn: String,
    pub session_name: String,
    pub expires_at: DateTime<Utc>,
    pub last_refresh_error: Option<String>,
}

struct ManagerInner {
    invoker: CliInvoker,
    sessions: Mutex<HashMap<String, Arc<Mutex<CrossAccountSession>>>>,
    stop_tx: Mutex<Option<mpsc::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    logger: Logger,
    metrics: SessionMetricsCollector,
}

/// Mints, caches and refreshes cross-account sessions. Cheap to clone; all
/// clones share one session cache and one refresh worker.
#[derive(Clone)]
pub struct CrossAccountRoleManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for CrossAccountRoleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossAccountRoleManager")
            .field("sessions", &self.inner.sessions.lock().unwrap().len())
            .finish()
    }
}

impl CrossAccountRoleManager {
    pub fn new(
        invoker: CliInvoker,
        parent_logger: &Logger,
        metrics: &SessionMetricsCollector,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            invoker,
            sessions: Mutex::new(HashMap::new()),
            stop_tx: Mutex::new(None),
            worker: Mutex::new(None),
            logger: parent_logger.new(o!()),
            metrics: metrics.clone(),
        });

        let (stop_tx, stop_rx) = mpsc::channel();
        // The worker holds a weak reference so dropping the last manager
        // clone shuts it down instead of leaking the cache forever.
        let weak = Arc::downgrade(&inner);
        let worker = thread::spawn(move || refresh_worker(weak, stop_rx));

        *inner.stop_tx.lock().unwrap() = Some(stop_tx);
        *inner.worker.lock().unwrap() = Some(worker);

        CrossAccountRoleManager { inner }
    }

    /// Returns the cached, non-expired session's credentials for `role_arn`,
    /// or mints a new session.
    pub fn get_session(
        &self,
        role_arn: &str,
        options: &AssumeRoleOptions,
    ) -> Result<Credentials, CloudError> {
        let session_name = options
            .session_name
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_owned());
        let key = session_key(role_arn, &session_name);

        let existing = self.inner.sessions.lock().unwrap().get(&key).cloned();
        if let Some(session) = existing {
            let session = session.lock().unwrap();
            if !session.is_expired(Utc::now()) {
                debug!(
                    self.inner.logger, "returning cached session";
                    event::ROLE_ARN => role_arn,
                );
                return Ok(session.credentials.clone());
            }
        }

        // Mint outside the map lock so a slow STS call cannot stall readers
        // of unrelated sessions.
        let mut options = options.clone();
        options.session_name = Some(session_name.clone());
        let credentials = assume_role(&self.inner.invoker, &self.inner.logger, role_arn, &options)?;
        let expires_at = credentials.expiry.ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::Unknown,
                "GetSession",
                "assumed credentials carried no expiration",
            )
        })?;

        let session = CrossAccountSession {
            source_arn: None,
            role_arn: role_arn.to_owned(),
            session_name,
            credentials: credentials.clone(),
            created_at: Utc::now(),
            expires_at,
            refresh_threshold: options.refresh_threshold(),
            options,
            last_refresh_error: None,
        };

        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(key, Arc::new(Mutex::new(session)));
        self.inner.metrics.sessions_minted.inc();
        info!(
            self.inner.logger, "minted cross-account session";
            event::ROLE_ARN => role_arn,
        );
        Ok(credentials)
    }

    /// Removes the session for `role_arn` (all session names unless one is
    /// given).
    pub fn evict(&self, role_arn: &str, session_name: Option<&str>) {
        let mut sessions = self.inner.sessions.lock().unwrap();
        match session_name {
            Some(name) => {
                sessions.remove(&session_key(role_arn, name));
            }
            None => sessions.retain(|key, _| !key.starts_with(&format!("{role_arn}/"))),
        }
    }

    /// Point-in-time summaries of every managed session.
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .values()
            .map(|session| {
                let session = session.lock().unwrap();
                SessionSummary {
                    role_arn: session.role_arn.clone(),
                    session_name: session.session_name.clone(),
                    expires_at: session.expires_at,
                    last_refresh_error: session.last_refresh_error.clone(),
                }
            })
            .collect()
    }

    /// Runs one refresh sweep immediately, in addition to the periodic tick.
    pub fn refresh_now(&self) {
        refresh_expiring_sessions(&self.inner);
    }

    /// Stops the refresh worker. Outstanding refresh attempts complete or
    /// time out on their own deadline. Sessions are dropped with the manager.
    pub fn close(&self) {
        let stop_tx = self.inner.stop_tx.lock().unwrap().take();
        drop(stop_tx);
        if let Some(worker) = self.inner.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        // The worker only holds a weak reference, so it may already have
        // observed the manager going away; close the channel and reap it.
        drop(self.stop_tx.lock().unwrap().take());
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn session_key(role_arn: &str, session_name: &str) -> String {
    format!("{role_arn}/{session_name}")
}

fn refresh_worker(inner: Weak<ManagerInner>, stop_rx: mpsc::Receiver<()>) {
    loop {
        match stop_rx.recv_timeout(REFRESH_INTERVAL) {
            Err(RecvTimeoutError::Timeout) => match inner.upgrade() {
                Some(inner) => refresh_expiring_sessions(&inner),
                None => break,
            },
            // A message or a closed channel both mean shut down
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Re-assumes every auto-refresh session within its refresh threshold. Each
/// session refreshes on its own thread, bounded by the refresh deadline;
/// failures annotate the session and leave it in place until true expiry.
fn refresh_expiring_sessions(inner: &Arc<ManagerInner>) {
    let now = Utc::now();
    let due: Vec<Arc<Mutex<CrossAccountSession>>> = inner
        .sessions
        .lock()
        .unwrap()
        .values()
        .filter(|session| {
            let session = session.lock().unwrap();
            session.options.enable_auto_refresh && session.needs_refresh(now)
        })
        .cloned()
        .collect();

    if due.is_empty() {
        return;
    }
    debug!(inner.logger, "refreshing expiring sessions"; "count" => due.len());

    let mut workers = Vec::with_capacity(due.len());
    for session in due {
        let invoker = inner.invoker.with_timeout(REFRESH_TIMEOUT);
        let logger = inner.logger.clone();
        let metrics = inner.metrics.clone();
        workers.push(thread::spawn(move || {
            let (role_arn, options) = {
                let session = session.lock().unwrap();
                (session.role_arn.clone(), session.options.clone())
            };
            match assume_role(&invoker, &logger, &role_arn, &options) {
                Ok(credentials) => {
                    let expires_at = match credentials.expiry {
                        Some(expiry) => expiry,
                        None => {
                            warn!(
                                logger, "refreshed credentials carried no expiration";
                                event::ROLE_ARN => &role_arn,
                            );
                            metrics.session_refreshes.with_label_values(&["error"]).inc();
                            return;
                        }
                    };
                    // Atomic swap under the session's own lock
                    let mut session = session.lock().unwrap();
                    session.credentials = credentials;
                    session.expires_at = expires_at;
                    session.last_refresh_error = None;
                    metrics.session_refreshes.with_label_values(&["ok"]).inc();
                }
                Err(e) => {
                    warn!(
                        logger, "session refresh failed";
                        event::ROLE_ARN => &role_arn,
                        "error" => e.to_string(),
                    );
                    session.lock().unwrap().last_refresh_error = Some(e.to_string());
                    metrics.session_refreshes.with_label_values(&["error"]).inc();
                }
            }
        }));
    }
    for worker in workers {
        let _ = worker.join();
    }
}
