//! Bounded-concurrency batch transfers.

use super::{S3Manager, UploadOptions};
use crate::{error::CloudError, work_queue::WorkQueue};
use slog::{info, o, Logger};
use std::{
    path::PathBuf,
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

/// A counting semaphore over transfer slots, with visible active/waiting
/// counters for introspection.
#[derive(Clone, Debug)]
pub struct S3ConnectionPool {
    state: Arc<(Mutex<PoolState>, Condvar)>,
    slots: usize,
}

#[derive(Debug, Default)]
struct PoolState {
    active: usize,
    waiting: usize,
}

/// A held pool slot, released on drop.
pub struct PoolPermit {
    state: Arc<(Mutex<PoolState>, Condvar)>,
}

impl S3ConnectionPool {
    pub fn new(slots: usize) -> Self {
        S3ConnectionPool {
            state: Arc::new((Mutex::new(PoolState::default()), Condvar::new())),
            slots: slots.max(1),
        }
    }

    /// Blocks until a slot is free and claims it.
    pub fn acquire(&self) -> PoolPermit {
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.waiting += 1;
        while state.active >= self.slots {
            state = condvar.wait(state).unwrap();
        }
        state.waiting -= 1;
        state.active += 1;
        PoolPermit {
            state: Arc::clone(&self.state),
        }
    }

    pub fn active(&self) -> usize {
        self.state.0.lock().unwrap().active
    }

    pub fn waiting(&self) -> usize {
        self.state.0.lock().unwrap().waiting
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.active -= 1;
        condvar.notify_one();
    }
}

/// One heterogeneous batch operation.
#[derive(Clone, Debug)]
pub enum BatchOperation {
    Upload {
        local_path: PathBuf,
        bucket: String,
        key: String,
    },
    Download {
        bucket: String,
        key: String,
        local_path: PathBuf,
    },
    Delete {
        bucket: String,
        key: String,
    },
    Copy {
        src_bucket: String,
        src_key: String,
        dst_bucket: String,
        dst_key: String,
    },
}

impl BatchOperation {
    fn describe(&self) -> String {
        match self {
            BatchOperation::Upload { bucket, key, .. } => format!("upload s3://{bucket}/{key}"),
            BatchOperation::Download { bucket, key, .. } => {
                format!("download s3://{bucket}/{key}")
            }
            BatchOperation::Delete { bucket, key } => format!("delete s3://{bucket}/{key}"),
            BatchOperation::Copy {
                src_bucket,
                src_key,
                dst_bucket,
                dst_key,
            } => format!("copy s3://{src_bucket}/{src_key} -> s3://{dst_bucket}/{dst_key}"),
        }
    }
}

/// Tuning for one batch run.
#[derive(Clone, Copy, Debug)]
pub struct BatchOptions {
    pub concurrency: usize,
    /// Operations not yet started by this deadline are reported as timed
    /// out; in-flight operations run to completion.
    pub timeout: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            concurrency: 4,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Per-operation result of a batch run.
#[derive(Clone, Debug)]
pub struct BatchOutcome {
    pub operation: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Dispatches heterogeneous S3 operations over a worker pool bounded by an
/// [`S3ConnectionPool`].
#[derive(Clone, Debug)]
pub struct S3BatchProcessor {
    manager: S3Manager,
    pool: S3ConnectionPool,
    logger: Logger,
}

impl S3BatchProcessor {
    pub fn new(manager: S3Manager, pool: S3ConnectionPool, parent_logger: &Logger) -> Self {
        S3BatchProcessor {
            manager,
            pool,
            logger: parent_logger.new(o!()),
        }
    }

    /// Runs every operation, returning one outcome per operation in
    /// completion order.
    pub fn process(&self, batch: Vec<BatchOperation>, options: BatchOptions) -> Vec<BatchOutcome> {
        let total = batch.len();
        let deadline = Instant::now() + options.timeout;
        let queue: WorkQueue<BatchOperation, BatchOutcome> = WorkQueue::new(batch);

        let workers: Vec<_> = (0..options.concurrency.min(total).max(1))
            .map(|_| {
                let queue = queue.clone();
                let manager = self.manager.clone();
                let pool = self.pool.clone();
                thread::spawn(move || {
                    while let Some(operation) = queue.dequeue_job() {
                        let description = operation.describe();
                        if Instant::now() >= deadline {
                            queue.push_result(BatchOutcome {
                                operation: description,
                                success: false,
                                error: Some("batch timeout expired before dispatch".to_owned()),
                                duration: Duration::ZERO,
                            });
                            continue;
                        }

                        let _permit = pool.acquire();
                        let started = Instant::now();
                        let result = run_operation(&manager, &operation);
                        queue.push_result(BatchOutcome {
                            operation: description,
                            success: result.is_ok(),
                            error: result.err().map(|e| e.to_string()),
                            duration: started.elapsed(),
                        });
                    }
                })
            })
            .collect();
        for worker in workers {
            let _ = worker.join();
        }

        let outcomes = queue.into_results().unwrap_or_default();
        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(
            self.logger, "batch finished";
            "operations" => total,
            "failed" => failed,
        );
        outcomes
    }
}

fn run_operation(manager: &S3Manager, operation: &BatchOperation) -> Result<(), CloudError> {
    match operation {
        BatchOperation::Upload {
            local_path,
            bucket,
            key,
        } => manager
            .upload_file(local_path, bucket, key, &UploadOptions::default())
            .map(|_| ()),
        BatchOperation::Download {
            bucket,
            key,
            local_path,
        } => manager.download_to(bucket, key, local_path),
        BatchOperation::Delete { bucket, key } => manager.delete_file(bucket, key),
        BatchOperation::Copy {
            src_bucket,
            src_key,
            dst_bucket,
            dst_key,
        } => manager.copy_file(src_bucket, src_key, dst_bucket, dst_key, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cli::CliInvoker,
        logging::setup_test_logging,
        metrics::{CliMetricsCollector, TransferMetricsCollector},
        s3::{S3Cache, S3CacheConfig},
        test_utils::FakeCli,
    };
    use std::io::Write;

    fn processor_for(fake: &FakeCli, metric_name: &str, slots: usize) -> S3BatchProcessor {
        let logger = setup_test_logging();
        let cli_metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let transfer_metrics =
            TransferMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &cli_metrics);
        let cache = S3Cache::new(S3CacheConfig::default(), &logger);
        let manager = S3Manager::new(invoker, cache, &transfer_metrics, &logger);
        S3BatchProcessor::new(manager, S3ConnectionPool::new(slots), &logger)
    }

    #[test]
    fn pool_bounds_concurrency() {
        let pool = S3ConnectionPool::new(2);
        let first = pool.acquire();
        let second = pool.acquire();
        assert_eq!(pool.active(), 2);

        let pool_clone = pool.clone();
        let waiter = thread::spawn(move || {
            let _permit = pool_clone.acquire();
        });
        // The third acquire parks until a permit frees up
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.active(), 2);
        assert_eq!(pool.waiting(), 1);

        drop(first);
        waiter.join().unwrap();
        drop(second);
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn batch_reports_mixed_outcomes() {
        let fake = FakeCli::new(
            r#"case "$2" in
delete-object) echo 'An error occurred (AccessDenied)' 1>&2; exit 1;;
put-object) echo '{"ETag":"\"x\""}';;
*) echo '{}';;
esac"#,
        );
        let processor = processor_for(&fake, "batch_mixed", 2);

        let mut payload = tempfile::NamedTempFile::new().unwrap();
        payload.write_all(b"data").unwrap();
        payload.flush().unwrap();

        let outcomes = processor.process(
            vec![
                BatchOperation::Upload {
                    local_path: payload.path().to_owned(),
                    bucket: "apm-config".into(),
                    key: "a".into(),
                },
                BatchOperation::Delete {
                    bucket: "apm-config".into(),
                    key: "b".into(),
                },
                BatchOperation::Copy {
                    src_bucket: "apm-config".into(),
                    src_key: "a".into(),
                    dst_bucket: "apm-config".into(),
                    dst_key: "c".into(),
                },
            ],
            BatchOptions::default(),
        );

        assert_eq!(outcomes.len(), 3);
        let failed: Vec<&BatchOutcome> = outcomes.iter().filter(|o| !o.success).collect();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].operation.starts_with("delete"));
        assert!(failed[0].error.as_deref().unwrap().contains("ACCESS_DENIED"));
        processor.manager.cache().close();
    }

    #[test]
    fn expired_batch_deadline_skips_remaining_operations() {
        let fake = FakeCli::new("echo '{}'");
        let processor = processor_for(&fake, "batch_deadline", 1);

        let outcomes = processor.process(
            vec![
                BatchOperation::Delete {
                    bucket: "apm-config".into(),
                    key: "a".into(),
                },
                BatchOperation::Delete {
                    bucket: "apm-config".into(),
                    key: "b".into(),
                },
            ],
            BatchOptions {
                concurrency: 1,
                timeout: Duration::ZERO,
            },
        );

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
        assert!(outcomes
            .iter()
            .all(|o| o.error.as_deref().unwrap().contains("timeout")));
        processor.manager.cache().close();
    }
}
