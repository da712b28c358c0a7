//! Log groups, streams and event batching.

use super::cache::CloudWatchCache;
use crate::{cli::CliInvoker, error::CloudError, logging::event};
use serde::Deserialize;
use slog::{info, o, warn, Logger};

/// Inputs for log group creation.
#[derive(Clone, Debug, Default)]
pub struct LogGroupConfig {
    pub name: String,
    pub retention_days: Option<i64>,
    pub kms_key_id: Option<String>,
}

/// A cached log group descriptor.
#[derive(Clone, Debug)]
pub struct LogGroup {
    pub name: String,
    pub region: String,
    pub retention_days: Option<i64>,
    pub kms_key_id: Option<String>,
}

/// One event in a `put-log-events` batch.
#[derive(Clone, Debug)]
pub struct LogEvent {
    pub timestamp_ms: i64,
    pub message: String,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct DescribeLogGroupsOutput {
        #[serde(default)]
        pub log_groups: Vec<LogGroup>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct LogGroup {
        pub log_group_name: String,
        pub retention_in_days: Option<i64>,
        pub kms_key_id: Option<String>,
    }
}

/// Manages log groups and ships event batches.
#[derive(Clone, Debug)]
pub struct LogsManager {
    invoker: CliInvoker,
    region: String,
    cache: CloudWatchCache,
    logger: Logger,
}

impl LogsManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        cache: CloudWatchCache,
        parent_logger: &Logger,
    ) -> Self {
        LogsManager {
            invoker,
            region: region.into(),
            cache,
            logger: parent_logger.new(o!()),
        }
    }

    /// Creates a log group. Retention and KMS association are applied
    /// best-effort afterwards; their failures are logged but do not fail
    /// the creation.
    pub fn create_log_group(&self, config: &LogGroupConfig) -> Result<LogGroup, CloudError> {
        self.invoker.run(
            "CreateLogGroup",
            &[
                "logs",
                "create-log-group",
                "--log-group-name",
                &config.name,
                "--region",
                &self.region,
            ],
        )?;

        let mut applied_retention = None;
        if let Some(retention_days) = config.retention_days {
            let retention = retention_days.to_string();
            match self.invoker.run(
                "PutRetentionPolicy",
                &[
                    "logs",
                    "put-retention-policy",
                    "--log-group-name",
                    &config.name,
                    "--retention-in-days",
                    &retention,
                    "--region",
                    &self.region,
                ],
            ) {
                Ok(_) => applied_retention = Some(retention_days),
                Err(e) => warn!(
                    self.logger, "failed to set retention policy";
                    event::LOG_GROUP => &config.name,
                    "error" => e.to_string(),
                ),
            }
        }

        let mut applied_kms = None;
        if let Some(kms_key_id) = &config.kms_key_id {
            match self.invoker.run(
                "AssociateKmsKey",
                &[
                    "logs",
                    "associate-kms-key",
                    "--log-group-name",
                    &config.name,
                    "--kms-key-id",
                    kms_key_id,
                    "--region",
                    &self.region,
                ],
            ) {
                Ok(_) => applied_kms = Some(kms_key_id.clone()),
                Err(e) => warn!(
                    self.logger, "failed to associate KMS key";
                    event::LOG_GROUP => &config.name,
                    "error" => e.to_string(),
                ),
            }
        }

        let group = LogGroup {
            name: config.name.clone(),
            region: self.region.clone(),
            retention_days: applied_retention,
            kms_key_id: applied_kms,
        };
        self.cache.put_log_group(group.clone());
        info!(self.logger, "created log group"; event::LOG_GROUP => &config.name);
        Ok(group)
    }

    pub fn create_log_stream(&self, group: &str, stream: &str) -> Result<(), CloudError> {
        self.invoker
            .run(
                "CreateLogStream",
                &[
                    "logs",
                    "create-log-stream",
                    "--log-group-name",
                    group,
                    "--log-stream-name",
                    stream,
                    "--region",
                    &self.region,
                ],
            )
            .map(|_| ())
    }

    /// Ships a batch of events in a single call.
    pub fn put_log_events(
        &self,
        group: &str,
        stream: &str,
        events: &[LogEvent],
    ) -> Result<(), CloudError> {
        let rendered: Vec<serde_json::Value> = events
            .iter()
            .map(|event| {
                serde_json::json!({"timestamp": event.timestamp_ms, "message": event.message})
            })
            .collect();
        let batch = serde_json::Value::Array(rendered).to_string();

        self.invoker
            .run(
                "PutLogEvents",
                &[
                    "logs",
                    "put-log-events",
                    "--log-group-name",
                    group,
                    "--log-stream-name",
                    stream,
                    "--log-events",
                    &batch,
                    "--region",
                    &self.region,
                ],
            )
            .map(|_| ())
    }

    pub fn list_log_groups(&self, prefix: Option<&str>) -> Result<Vec<LogGroup>, CloudError> {
        let mut args = vec![
            "logs",
            "describe-log-groups",
            "--region",
            &self.region,
            "--output",
            "json",
        ];
        if let Some(prefix) = prefix {
            args.push("--log-group-name-prefix");
            args.push(prefix);
        }
        let output: wire::DescribeLogGroupsOutput =
            self.invoker.run_json("DescribeLogGroups", &args)?;
        Ok(output
            .log_groups
            .into_iter()
            .map(|group| LogGroup {
                name: group.log_group_name,
                region: self.region.clone(),
                retention_days: group.retention_in_days,
                kms_key_id: group.kms_key_id,
            })
            .collect())
    }

    pub fn delete_log_group(&self, name: &str) -> Result<(), CloudError> {
        self.invoker.run(
            "DeleteLogGroup",
            &[
                "logs",
                "delete-log-group",
                "--log-group-name",
                name,
                "--region",
                &self.region,
            ],
        )?;
        self.cache.remove_log_group(name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};

    fn manager_for(fake: &FakeCli, metric_name: &str) -> (LogsManager, CloudWatchCache) {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        let cache = CloudWatchCache::unbounded(&logger);
        (
            LogsManager::new(invoker, "us-east-1", cache.clone(), &logger),
            cache,
        )
    }

    #[test]
    fn failed_retention_does_not_fail_creation() {
        let fake = FakeCli::new(
            r#"case "$2" in
put-retention-policy) echo 'An error occurred (AccessDenied)' 1>&2; exit 1;;
*) echo '{}';;
esac"#,
        );
        let (manager, cache) = manager_for(&fake, "logs_retention_best_effort");

        let group = manager
            .create_log_group(&LogGroupConfig {
                name: "/apm/jaeger".into(),
                retention_days: Some(30),
                kms_key_id: None,
            })
            .unwrap();
        // Creation succeeded; the retention setting did not stick
        assert_eq!(group.retention_days, None);
        assert!(cache.get_log_group("/apm/jaeger").is_some());
        cache.close();
    }

    #[test]
    fn event_batch_ships_in_one_call() {
        let fake = FakeCli::new(
            r#"echo "$2" >> "$(dirname "$0")/log"
echo '{}'"#,
        );
        let (manager, cache) = manager_for(&fake, "logs_batch");

        manager
            .put_log_events(
                "/apm/jaeger",
                "ingest",
                &[
                    LogEvent {
                        timestamp_ms: 1_700_000_000_000,
                        message: "span received".into(),
                    },
                    LogEvent {
                        timestamp_ms: 1_700_000_000_001,
                        message: "span indexed".into(),
                    },
                ],
            )
            .unwrap();

        let calls = std::fs::read_to_string(fake.scratch_path("log")).unwrap();
        assert_eq!(calls.matches("put-log-events").count(), 1);
        cache.close();
    }

    #[test]
    fn listing_maps_wire_fields() {
        let fake = FakeCli::new(
            r#"echo '{"logGroups":[{"logGroupName":"/apm/loki","retentionInDays":14}]}'"#,
        );
        let (manager, cache) = manager_for(&fake, "logs_listing");

        let groups = manager.list_log_groups(Some("/apm")).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "/apm/loki");
        assert_eq!(groups[0].retention_days, Some(14));
        cache.close();
    }
}
