//! Logs Insights query submission and polling.

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use slog::{debug, info, o, Logger};
use std::{
    collections::HashMap,
    thread,
    time::{Duration, Instant},
};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The longest a query is polled before giving up.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// Inputs for one Insights query.
#[derive(Clone, Debug)]
pub struct InsightsQueryConfig {
    pub log_groups: Vec<String>,
    pub query: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub limit: Option<i64>,
}

/// One result row, with the `@timestamp` field surfaced when present.
#[derive(Clone, Debug)]
pub struct InsightsRow {
    pub fields: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Scan statistics reported with the results.
#[derive(Clone, Copy, Debug, Default)]
pub struct InsightsStatistics {
    pub records_matched: f64,
    pub records_scanned: f64,
    pub bytes_scanned: f64,
}

/// A completed query.
#[derive(Clone, Debug)]
pub struct InsightsQueryResult {
    pub query_id: String,
    pub status: String,
    pub rows: Vec<InsightsRow>,
    pub statistics: InsightsStatistics,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct StartQueryOutput {
        pub query_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct DescribeQueriesOutput {
        #[serde(default)]
        pub queries: Vec<QueryInfo>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct QueryInfo {
        pub query_id: String,
        pub status: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GetQueryResultsOutput {
        #[serde(default)]
        pub results: Vec<Vec<ResultField>>,
        pub statistics: Option<Statistics>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ResultField {
        pub field: String,
        pub value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Statistics {
        #[serde(default)]
        pub records_matched: f64,
        #[serde(default)]
        pub records_scanned: f64,
        #[serde(default)]
        pub bytes_scanned: f64,
    }
}

/// Insights timestamps arrive as `2026-08-01 12:00:00.000`; RFC 3339 is
/// accepted as a fallback.
fn parse_insights_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.3f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Submits and polls Logs Insights queries.
#[derive(Clone, Debug)]
pub struct InsightsManager {
    invoker: CliInvoker,
    region: String,
    logger: Logger,
}

impl InsightsManager {
    pub fn new(invoker: CliInvoker, region: impl Into<String>, parent_logger: &Logger) -> Self {
        InsightsManager {
            invoker,
            region: region.into(),
            logger: parent_logger.new(o!()),
        }
    }

    /// Submits the query and polls until it completes, fails, or the poll
    /// budget (five minutes at five-second intervals) or the caller's
    /// `deadline` runs out.
    pub fn execute_query(
        &self,
        config: &InsightsQueryConfig,
        deadline: Option<Instant>,
    ) -> Result<InsightsQueryResult, CloudError> {
        self.execute_query_with_interval(config, deadline, POLL_INTERVAL)
    }

    pub(crate) fn execute_query_with_interval(
        &self,
        config: &InsightsQueryConfig,
        deadline: Option<Instant>,
        poll_interval: Duration,
    ) -> Result<InsightsQueryResult, CloudError> {
        if config.log_groups.is_empty() {
            return Err(CloudError::new(
                "aws",
                ErrorKind::InvalidRequest,
                "StartQuery",
                "at least one log group is required",
            ));
        }

        let start_time = config.start_time.timestamp().to_string();
        let end_time = config.end_time.timestamp().to_string();
        let mut args: Vec<String> = vec![
            "logs".into(),
            "start-query".into(),
            "--start-time".into(),
            start_time,
            "--end-time".into(),
            end_time,
            "--query-string".into(),
            config.query.clone(),
            "--region".into(),
            self.region.clone(),
            "--log-group-names".into(),
        ];
        args.extend(config.log_groups.iter().cloned());
        if let Some(limit) = config.limit {
            args.push("--limit".into());
            args.push(limit.to_string());
        }
        args.push("--output".into());
        args.push("json".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let started: wire::StartQueryOutput = self.invoker.run_json("StartQuery", &arg_refs)?;
        let query_id = started.query_id;
        info!(self.logger, "submitted insights query"; event::QUERY_ID => &query_id);

        let poll_deadline = Instant::now() + MAX_WAIT;
        let effective_deadline = match deadline {
            Some(deadline) => deadline.min(poll_deadline),
            None => poll_deadline,
        };

        loop {
            let described: wire::DescribeQueriesOutput = self.invoker.run_json(
                "DescribeQueries",
                &[
                    "logs",
                    "describe-queries",
                    "--region",
                    &self.region,
                    "--output",
                    "json",
                ],
            )?;
            let status = described
                .queries
                .iter()
                .find(|query| query.query_id == query_id)
                .map(|query| query.status.clone())
                .unwrap_or_else(|| "Unknown".to_owned());

            match status.as_str() {
                "Complete" => return self.fetch_results(&query_id, status),
                "Failed" | "Cancelled" => {
                    return Err(CloudError::new(
                        "aws",
                        ErrorKind::InternalError,
                        "DescribeQueries",
                        format!("insights query {query_id} ended as {status}"),
                    ));
                }
                _ => {
                    debug!(
                        self.logger, "query still running";
                        event::QUERY_ID => &query_id,
                        "status" => &status,
                    );
                }
            }

            if Instant::now() + poll_interval > effective_deadline {
                return Err(CloudError::new(
                    "aws",
                    ErrorKind::RequestTimeout,
                    "DescribeQueries",
                    format!("insights query {query_id} did not complete in time"),
                ));
            }
            thread::sleep(poll_interval);
        }
    }

    fn fetch_results(
        &self,
        query_id: &str,
        status: String,
    ) -> Result<InsightsQueryResult, CloudError> {
        let output: wire::GetQueryResultsOutput = self.invoker.run_json(
            "GetQueryResults",
            &[
                "logs",
                "get-query-results",
                "--query-id",
                query_id,
                "--region",
                &self.region,
                "--output",
                "json",
            ],
        )?;

        let rows = output
            .results
            .into_iter()
            .map(|row| {
                let fields: HashMap<String, String> = row
                    .into_iter()
                    .map(|field| (field.field, field.value))
                    .collect();
                let timestamp = fields
                    .get("@timestamp")
                    .and_then(|value| parse_insights_timestamp(value));
                InsightsRow { fields, timestamp }
            })
            .collect();

        let statistics = output
            .statistics
            .map(|statistics| InsightsStatistics {
                records_matched: statistics.records_matched,
                records_scanned: statistics.records_scanned,
                bytes_scanned: statistics.bytes_scanned,
            })
            .unwrap_or_default();

        Ok(InsightsQueryResult {
            query_id: query_id.to_owned(),
            status,
            rows,
            statistics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};
    use assert_matches::assert_matches;

    fn manager_for(fake: &FakeCli, metric_name: &str) -> InsightsManager {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        InsightsManager::new(invoker, "us-east-1", &logger)
    }

    fn query_config() -> InsightsQueryConfig {
        InsightsQueryConfig {
            log_groups: vec!["/apm/loki".to_owned()],
            query: "fields @timestamp, @message | limit 10".to_owned(),
            start_time: Utc::now() - chrono::Duration::hours(1),
            end_time: Utc::now(),
            limit: Some(10),
        }
    }

    /// Fake CLI: query runs for two polls, then completes with one row.
    fn insights_script(terminal_status: &str) -> String {
        format!(
            r#"polls="$(dirname "$0")/polls"
case "$2" in
start-query) echo '{{"queryId":"query-1"}}';;
describe-queries)
    echo poll >> "$polls"
    if [ "$(wc -l < "$polls")" -ge 3 ]; then
        echo '{{"queries":[{{"queryId":"query-1","status":"{terminal_status}"}}]}}'
    else
        echo '{{"queries":[{{"queryId":"query-1","status":"Running"}}]}}'
    fi;;
get-query-results) echo '{{"results":[[{{"field":"@timestamp","value":"2026-08-01 12:00:00.000"}},{{"field":"@message","value":"ERROR timeout"}}]],"statistics":{{"recordsMatched":1.0,"recordsScanned":120.0,"bytesScanned":4096.0}}}}';;
*) exit 1;;
esac"#
        )
    }

    #[test]
    fn query_polls_to_completion_and_parses_rows() {
        let fake = FakeCli::new(&insights_script("Complete"));
        let manager = manager_for(&fake, "insights_completes");

        let result = manager
            .execute_query_with_interval(&query_config(), None, Duration::from_millis(1))
            .unwrap();

        assert_eq!(result.status, "Complete");
        assert_eq!(result.rows.len(), 1);
        let row = &result.rows[0];
        assert_eq!(row.fields["@message"], "ERROR timeout");
        assert!(row.timestamp.is_some());
        assert_eq!(result.statistics.records_scanned, 120.0);
    }

    #[test]
    fn failed_query_is_an_error() {
        let fake = FakeCli::new(&insights_script("Failed"));
        let manager = manager_for(&fake, "insights_failed");

        let err = manager
            .execute_query_with_interval(&query_config(), None, Duration::from_millis(1))
            .unwrap_err();
        assert!(err.message.contains("Failed"));
    }

    #[test]
    fn caller_deadline_bounds_polling() {
        let fake = FakeCli::new(&insights_script("Complete"));
        let manager = manager_for(&fake, "insights_deadline");

        // Deadline expires before the third poll can happen
        let err = manager
            .execute_query_with_interval(
                &query_config(),
                Some(Instant::now() + Duration::from_millis(10)),
                Duration::from_secs(60),
            )
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::RequestTimeout);
    }

    #[test]
    fn empty_log_group_list_is_rejected() {
        let fake = FakeCli::new("exit 1");
        let manager = manager_for(&fake, "insights_no_groups");

        let mut config = query_config();
        config.log_groups.clear();
        let err = manager
            .execute_query_with_interval(&config, None, Duration::from_millis(1))
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);
    }

    #[test]
    fn timestamp_formats() {
        assert!(parse_insights_timestamp("2026-08-01 12:00:00.000").is_some());
        assert!(parse_insights_timestamp("2026-08-01T12:00:00+00:00").is_some());
        assert!(parse_insights_timestamp("yesterday").is_none());
    }
}
