//! Per-tool observability presets.

use super::{
    alarms::{AlarmConfig, AlarmManager},
    dashboards::{template_for_tool, DashboardConfig, DashboardManager},
    logs::{LogGroupConfig, LogsManager},
};
use crate::{error::CloudError, logging::event, s3::ApmTool};
use slog::{info, o, Logger};

/// What a preset installed for one tool.
#[derive(Clone, Debug)]
pub struct IntegrationReport {
    pub tool: ApmTool,
    pub dashboard: String,
    pub alarms: Vec<String>,
    pub log_group: Option<String>,
}

/// Installs the observability preset for each supported APM tool: a
/// namespaced dashboard from the matching template, default alarms for
/// Prometheus, and a log group for the log-centric tools.
#[derive(Clone, Debug)]
pub struct ApmIntegrationManager {
    dashboards: DashboardManager,
    alarms: AlarmManager,
    logs: LogsManager,
    logger: Logger,
}

impl ApmIntegrationManager {
    pub fn new(
        dashboards: DashboardManager,
        alarms: AlarmManager,
        logs: LogsManager,
        parent_logger: &Logger,
    ) -> Self {
        ApmIntegrationManager {
            dashboards,
            alarms,
            logs,
            logger: parent_logger.new(o!()),
        }
    }

    pub fn setup_integration(&self, tool: ApmTool) -> Result<IntegrationReport, CloudError> {
        let namespace = format!("APM/{}", capitalized(tool.as_str()));
        let dashboard_name = format!("apm-{tool}");

        self.dashboards.create_dashboard(&DashboardConfig {
            name: dashboard_name.clone(),
            template: template_for_tool(tool),
            namespace: namespace.clone(),
        })?;

        let mut alarms = Vec::new();
        if tool == ApmTool::Prometheus {
            // Default alert pair: error rate above 5%, response time above
            // 1000 ms
            let error_rate = AlarmConfig::threshold_alarm(
                format!("apm-{tool}-error-rate"),
                namespace.clone(),
                "ErrorRate",
                5.0,
            );
            self.alarms.create_alarm(&error_rate)?;
            alarms.push(error_rate.name);

            let response_time = AlarmConfig::threshold_alarm(
                format!("apm-{tool}-response-time"),
                namespace.clone(),
                "ResponseTime",
                1000.0,
            );
            self.alarms.create_alarm(&response_time)?;
            alarms.push(response_time.name);
        }

        let log_group = if matches!(tool, ApmTool::Jaeger | ApmTool::Loki) {
            let name = format!("/apm/{tool}");
            self.logs.create_log_group(&LogGroupConfig {
                name: name.clone(),
                retention_days: Some(30),
                kms_key_id: None,
            })?;
            Some(name)
        } else {
            None
        };

        info!(
            self.logger, "installed integration preset";
            event::APM_TOOL => tool.as_str(),
            "alarms" => alarms.len(),
        );
        Ok(IntegrationReport {
            tool,
            dashboard: dashboard_name,
            alarms,
            log_group,
        })
    }
}

fn capitalized(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cli::CliInvoker, cloudwatch::cache::CloudWatchCache, logging::setup_test_logging,
        metrics::CliMetricsCollector, test_utils::FakeCli,
    };

    fn manager_for(fake: &FakeCli, metric_name: &str) -> (ApmIntegrationManager, CloudWatchCache) {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        let cache = CloudWatchCache::unbounded(&logger);
        let dashboards =
            DashboardManager::new(invoker.clone(), "us-east-1", cache.clone(), &logger);
        let alarms = AlarmManager::new(invoker.clone(), "us-east-1", cache.clone(), &logger);
        let logs = LogsManager::new(invoker, "us-east-1", cache.clone(), &logger);
        (
            ApmIntegrationManager::new(dashboards, alarms, logs, &logger),
            cache,
        )
    }

    #[test]
    fn prometheus_preset_installs_dashboard_and_two_alarms() {
        let fake = FakeCli::new("echo '{}'");
        let (manager, cache) = manager_for(&fake, "apm_preset_prometheus");

        let report = manager.setup_integration(ApmTool::Prometheus).unwrap();
        assert_eq!(report.dashboard, "apm-prometheus");
        assert_eq!(
            report.alarms,
            vec!["apm-prometheus-error-rate", "apm-prometheus-response-time"]
        );
        assert!(report.log_group.is_none());

        let error_rate = cache.get_alarm("apm-prometheus-error-rate").unwrap();
        assert_eq!(error_rate.threshold, 5.0);
        let response_time = cache.get_alarm("apm-prometheus-response-time").unwrap();
        assert_eq!(response_time.threshold, 1000.0);
        cache.close();
    }

    #[test]
    fn log_centric_tools_get_a_log_group() {
        let fake = FakeCli::new("echo '{}'");
        let (manager, cache) = manager_for(&fake, "apm_preset_loki");

        let report = manager.setup_integration(ApmTool::Loki).unwrap();
        assert_eq!(report.log_group.as_deref(), Some("/apm/loki"));
        assert!(report.alarms.is_empty());
        assert!(cache.get_log_group("/apm/loki").is_some());

        let report = manager.setup_integration(ApmTool::Grafana).unwrap();
        assert!(report.log_group.is_none());
        assert_eq!(report.dashboard, "apm-grafana");
        cache.close();
    }
}
