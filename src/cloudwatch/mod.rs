//! CloudWatch observability: dashboards, alarms, logs, Insights queries,
//! events, SNS and per-tool APM presets.

mod alarms;
mod apm;
mod cache;
mod dashboards;
mod events;
mod insights;
mod logs;

pub use alarms::{Alarm, AlarmConfig, AlarmManager, AlarmState};
pub use apm::{ApmIntegrationManager, IntegrationReport};
pub use cache::CloudWatchCache;
pub use dashboards::{Dashboard, DashboardConfig, DashboardManager, DashboardTemplate};
pub use events::{
    EventRule, EventRuleConfig, EventTarget, EventsManager, SnsManager, SnsTopic, SnsTopicConfig,
};
pub use insights::{
    InsightsManager, InsightsQueryConfig, InsightsQueryResult, InsightsRow, InsightsStatistics,
};
pub use logs::{LogEvent, LogGroup, LogGroupConfig, LogsManager};

use crate::{
    cli::CliInvoker, cloudformation::HealthStatus, error::CloudError,
    metrics::ObservabilityMetricsCollector,
};
use chrono::{DateTime, Utc};
use slog::{info, o, Logger};
use std::collections::HashMap;

/// Outcome of probing one CloudWatch surface.
#[derive(Clone, Debug)]
pub struct SurfaceHealth {
    pub name: &'static str,
    pub healthy: bool,
    pub error: Option<String>,
}

/// Aggregate health over the probed surfaces.
#[derive(Clone, Debug)]
pub struct CloudWatchHealthReport {
    pub status: HealthStatus,
    pub surfaces: Vec<SurfaceHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Owns the observability sub-managers, their shared entity cache and the
/// metrics collector.
#[derive(Clone, Debug)]
pub struct CloudWatchManager {
    invoker: CliInvoker,
    region: String,
    dashboards: DashboardManager,
    alarms: AlarmManager,
    logs: LogsManager,
    insights: InsightsManager,
    events: EventsManager,
    sns: SnsManager,
    apm: ApmIntegrationManager,
    cache: CloudWatchCache,
    metrics: ObservabilityMetricsCollector,
    logger: Logger,
}

impl CloudWatchManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        metrics: &ObservabilityMetricsCollector,
        parent_logger: &Logger,
    ) -> Self {
        let region = region.into();
        let logger = parent_logger.new(o!());
        let cache = CloudWatchCache::unbounded(&logger);

        let dashboards =
            DashboardManager::new(invoker.clone(), region.clone(), cache.clone(), &logger);
        let alarms = AlarmManager::new(invoker.clone(), region.clone(), cache.clone(), &logger);
        let logs = LogsManager::new(invoker.clone(), region.clone(), cache.clone(), &logger);
        let insights = InsightsManager::new(invoker.clone(), region.clone(), &logger);
        let events = EventsManager::new(invoker.clone(), region.clone(), cache.clone(), &logger);
        let sns = SnsManager::new(invoker.clone(), region.clone(), cache.clone(), &logger);
        let apm =
            ApmIntegrationManager::new(dashboards.clone(), alarms.clone(), logs.clone(), &logger);

        CloudWatchManager {
            invoker,
            region,
            dashboards,
            alarms,
            logs,
            insights,
            events,
            sns,
            apm,
            cache,
            metrics: metrics.clone(),
            logger,
        }
    }

    pub fn dashboards(&self) -> &DashboardManager {
        &self.dashboards
    }

    pub fn alarms(&self) -> &AlarmManager {
        &self.alarms
    }

    pub fn logs(&self) -> &LogsManager {
        &self.logs
    }

    pub fn insights(&self) -> &InsightsManager {
        &self.insights
    }

    pub fn events(&self) -> &EventsManager {
        &self.events
    }

    pub fn sns(&self) -> &SnsManager {
        &self.sns
    }

    pub fn apm_integrations(&self) -> &ApmIntegrationManager {
        &self.apm
    }

    pub fn cache(&self) -> &CloudWatchCache {
        &self.cache
    }

    /// Publishes one custom metric datapoint.
    pub fn publish_custom_metric(
        &self,
        namespace: &str,
        metric_name: &str,
        value: f64,
        unit: Option<&str>,
        dimensions: &HashMap<String, String>,
    ) -> Result<(), CloudError> {
        let mut datum = serde_json::json!({
            "MetricName": metric_name,
            "Value": value,
        });
        if let Some(unit) = unit {
            datum["Unit"] = serde_json::Value::String(unit.to_owned());
        }
        if !dimensions.is_empty() {
            datum["Dimensions"] = serde_json::Value::Array(
                dimensions
                    .iter()
                    .map(|(name, value)| serde_json::json!({"Name": name, "Value": value}))
                    .collect(),
            );
        }
        let metric_data = serde_json::json!([datum]).to_string();

        self.invoker.run(
            "PutMetricData",
            &[
                "cloudwatch",
                "put-metric-data",
                "--namespace",
                namespace,
                "--metric-data",
                &metric_data,
                "--region",
                &self.region,
            ],
        )?;
        self.metrics.custom_metrics_published.inc();
        Ok(())
    }

    /// Probes the five observability surfaces and grades the success ratio:
    /// everything healthy, a majority healthy (degraded), or worse
    /// (unhealthy).
    pub fn check_health(&self) -> CloudWatchHealthReport {
        let mut surfaces = Vec::with_capacity(5);

        let mut probe = |name: &'static str, outcome: Result<(), CloudError>| {
            let healthy = outcome.is_ok();
            self.metrics
                .health_checks
                .with_label_values(&[if healthy { "ok" } else { "error" }])
                .inc();
            surfaces.push(SurfaceHealth {
                name,
                healthy,
                error: outcome.err().map(|e| e.to_string()),
            });
        };

        probe(
            "api",
            self.invoker
                .run(
                    "ListMetrics",
                    &[
                        "cloudwatch",
                        "list-metrics",
                        "--max-items",
                        "1",
                        "--region",
                        &self.region,
                    ],
                )
                .map(|_| ()),
        );
        probe("dashboards", self.dashboards.list_dashboards().map(|_| ()));
        probe(
            "alarms",
            self.invoker
                .run(
                    "DescribeAlarms",
                    &[
                        "cloudwatch",
                        "describe-alarms",
                        "--max-records",
                        "1",
                        "--region",
                        &self.region,
                    ],
                )
                .map(|_| ()),
        );
        probe("logs", self.logs.list_log_groups(None).map(|_| ()));
        probe(
            "custom-metrics",
            self.publish_custom_metric(
                "APMTool/HealthCheck",
                "HealthProbe",
                1.0,
                Some("Count"),
                &HashMap::new(),
            ),
        );

        let healthy = surfaces.iter().filter(|surface| surface.healthy).count();
        let status = if healthy == surfaces.len() {
            HealthStatus::Healthy
        } else if healthy * 2 > surfaces.len() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        };

        info!(
            self.logger, "observability health checked";
            "status" => status.to_string(),
            "healthy_surfaces" => healthy,
        );
        CloudWatchHealthReport {
            status,
            surfaces,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};

    fn manager_for(fake: &FakeCli, metric_name: &str) -> CloudWatchManager {
        let logger = setup_test_logging();
        let cli_metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let obs_metrics =
            ObservabilityMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &cli_metrics);
        CloudWatchManager::new(invoker, "us-east-1", &obs_metrics, &logger)
    }

    #[test]
    fn healthy_when_every_surface_answers() {
        let fake = FakeCli::new("echo '{}'");
        let manager = manager_for(&fake, "cw_all_healthy");

        let report = manager.check_health();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.surfaces.len(), 5);
        manager.cache().close();
    }

    #[test]
    fn degraded_when_one_surface_fails() {
        let fake = FakeCli::new(
            r#"case "$2" in
list-dashboards) echo 'An error occurred (ServiceUnavailable)' 1>&2; exit 1;;
*) echo '{}';;
esac"#,
        );
        let manager = manager_for(&fake, "cw_degraded");

        let report = manager.check_health();
        assert_eq!(report.status, HealthStatus::Degraded);
        let failed: Vec<&SurfaceHealth> =
            report.surfaces.iter().filter(|s| !s.healthy).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "dashboards");
        manager.cache().close();
    }

    #[test]
    fn unhealthy_when_most_surfaces_fail() {
        let fake = FakeCli::new("echo 'An error occurred (ServiceUnavailable)' 1>&2; exit 1");
        let manager = manager_for(&fake, "cw_unhealthy");

        let report = manager.check_health();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        manager.cache().close();
    }

    #[test]
    fn custom_metric_publication_is_counted() {
        let fake = FakeCli::new("echo '{}'");
        let manager = manager_for(&fake, "cw_custom_metric");

        let before = manager.metrics.custom_metrics_published.get();
        manager
            .publish_custom_metric("APM/Test", "Deployments", 1.0, None, &HashMap::new())
            .unwrap();
        assert_eq!(manager.metrics.custom_metrics_published.get(), before + 1);
        manager.cache().close();
    }
}
