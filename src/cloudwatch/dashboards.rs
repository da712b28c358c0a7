//! Templated CloudWatch dashboards.

use super::cache::CloudWatchCache;
use crate::{cli::CliInvoker, error::CloudError, logging::event};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use slog::{info, o, Logger};
use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

/// The named dashboard templates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DashboardTemplate {
    Infrastructure,
    Application,
    ServiceMesh,
    Logs,
    Tracing,
    Cost,
}

impl DashboardTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            DashboardTemplate::Infrastructure => "infrastructure",
            DashboardTemplate::Application => "application",
            DashboardTemplate::ServiceMesh => "service-mesh",
            DashboardTemplate::Logs => "logs",
            DashboardTemplate::Tracing => "tracing",
            DashboardTemplate::Cost => "cost",
        }
    }

    pub fn all() -> &'static [DashboardTemplate] {
        &[
            DashboardTemplate::Infrastructure,
            DashboardTemplate::Application,
            DashboardTemplate::ServiceMesh,
            DashboardTemplate::Logs,
            DashboardTemplate::Tracing,
            DashboardTemplate::Cost,
        ]
    }
}

impl Display for DashboardTemplate {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DashboardTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "infrastructure" => Ok(DashboardTemplate::Infrastructure),
            "application" => Ok(DashboardTemplate::Application),
            "service-mesh" => Ok(DashboardTemplate::ServiceMesh),
            "logs" => Ok(DashboardTemplate::Logs),
            "tracing" => Ok(DashboardTemplate::Tracing),
            "cost" => Ok(DashboardTemplate::Cost),
            other => Err(format!("unknown dashboard template {other:?}")),
        }
    }
}

/// Inputs for dashboard creation.
#[derive(Clone, Debug)]
pub struct DashboardConfig {
    pub name: String,
    pub template: DashboardTemplate,
    /// The metric namespace the widgets point at.
    pub namespace: String,
}

/// A cached dashboard descriptor.
#[derive(Clone, Debug)]
pub struct Dashboard {
    pub name: String,
    pub region: String,
    pub template: Option<DashboardTemplate>,
    pub widget_count: usize,
    pub last_updated: DateTime<Utc>,
}

/// Renders the widget array for a template. Positions are a two-column grid.
pub(crate) fn template_widgets(
    template: DashboardTemplate,
    namespace: &str,
    region: &str,
) -> Vec<serde_json::Value> {
    let metric_widget = |x: u64, y: u64, title: &str, metrics: serde_json::Value| {
        json!({
            "type": "metric",
            "x": x, "y": y, "width": 12, "height": 6,
            "properties": {
                "title": title,
                "region": region,
                "metrics": metrics,
                "period": 300,
                "stat": "Average",
                "view": "timeSeries",
            }
        })
    };
    let query_widget = |x: u64, y: u64, title: &str, query: String| {
        json!({
            "type": "log",
            "x": x, "y": y, "width": 24, "height": 6,
            "properties": {
                "title": title,
                "region": region,
                "query": query,
                "view": "table",
            }
        })
    };

    match template {
        DashboardTemplate::Infrastructure => vec![
            metric_widget(
                0,
                0,
                "CPU utilization",
                json!([["AWS/EC2", "CPUUtilization"]]),
            ),
            metric_widget(
                12,
                0,
                "Network throughput",
                json!([["AWS/EC2", "NetworkIn"], ["AWS/EC2", "NetworkOut"]]),
            ),
            metric_widget(
                0,
                6,
                "Disk I/O",
                json!([["AWS/EC2", "DiskReadBytes"], ["AWS/EC2", "DiskWriteBytes"]]),
            ),
            metric_widget(
                12,
                6,
                "Status checks",
                json!([["AWS/EC2", "StatusCheckFailed"]]),
            ),
        ],
        DashboardTemplate::Application => vec![
            metric_widget(0, 0, "Request rate", json!([[namespace, "RequestCount"]])),
            metric_widget(12, 0, "Error rate", json!([[namespace, "ErrorRate"]])),
            metric_widget(
                0,
                6,
                "Response time",
                json!([[namespace, "ResponseTime"]]),
            ),
            metric_widget(12, 6, "Saturation", json!([[namespace, "QueueDepth"]])),
        ],
        DashboardTemplate::ServiceMesh => vec![
            metric_widget(
                0,
                0,
                "Service request volume",
                json!([[namespace, "MeshRequestCount"]]),
            ),
            metric_widget(
                12,
                0,
                "Upstream failures",
                json!([[namespace, "UpstreamFailures"]]),
            ),
            metric_widget(
                0,
                6,
                "Retry volume",
                json!([[namespace, "RetryCount"]]),
            ),
        ],
        DashboardTemplate::Logs => vec![
            query_widget(
                0,
                0,
                "Recent errors",
                "fields @timestamp, @message | filter @message like /ERROR/ | sort @timestamp desc | limit 50"
                    .to_owned(),
            ),
            query_widget(
                0,
                6,
                "Log volume by source",
                "stats count(*) by @logStream | sort count(*) desc".to_owned(),
            ),
        ],
        DashboardTemplate::Tracing => vec![
            metric_widget(0, 0, "Span volume", json!([[namespace, "SpansReceived"]])),
            metric_widget(12, 0, "Trace latency p99", json!([[namespace, "TraceLatencyP99"]])),
            query_widget(
                0,
                6,
                "Slowest operations",
                "fields operation, duration | sort duration desc | limit 25".to_owned(),
            ),
        ],
        DashboardTemplate::Cost => vec![
            metric_widget(
                0,
                0,
                "Estimated charges",
                json!([["AWS/Billing", "EstimatedCharges"]]),
            ),
            metric_widget(
                12,
                0,
                "Data transfer",
                json!([["AWS/EC2", "NetworkOut"]]),
            ),
        ],
    }
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListDashboardsOutput {
        #[serde(default)]
        pub dashboard_entries: Vec<DashboardEntry>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DashboardEntry {
        pub dashboard_name: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetDashboardOutput {
        pub dashboard_body: String,
    }
}

/// Creates and inspects dashboards.
#[derive(Clone, Debug)]
pub struct DashboardManager {
    invoker: CliInvoker,
    region: String,
    cache: CloudWatchCache,
    logger: Logger,
}

impl DashboardManager {
    pub fn new(
        invoker: CliInvoker,
        region: impl Into<String>,
        cache: CloudWatchCache,
        parent_logger: &Logger,
    ) -> Self {
        DashboardManager {
            invoker,
            region: region.into(),
            cache,
            logger: parent_logger.new(o!()),
        }
    }

    /// Renders the template and writes the dashboard. The underlying API is
    /// an upsert, so this serves for update as well.
    pub fn create_dashboard(&self, config: &DashboardConfig) -> Result<Dashboard, CloudError> {
        let widgets = template_widgets(config.template, &config.namespace, &self.region);
        let body = json!({ "widgets": widgets }).to_string();

        self.invoker.run(
            "PutDashboard",
            &[
                "cloudwatch",
                "put-dashboard",
                "--dashboard-name",
                &config.name,
                "--dashboard-body",
                &body,
                "--region",
                &self.region,
            ],
        )?;

        let dashboard = Dashboard {
            name: config.name.clone(),
            region: self.region.clone(),
            template: Some(config.template),
            widget_count: widgets.len(),
            last_updated: Utc::now(),
        };
        self.cache.put_dashboard(dashboard.clone());
        info!(
            self.logger, "wrote dashboard";
            event::DASHBOARD => &config.name,
            "template" => config.template.as_str(),
        );
        Ok(dashboard)
    }

    /// Alias for [`create_dashboard`](Self::create_dashboard); the write API
    /// upserts.
    pub fn update_dashboard(&self, config: &DashboardConfig) -> Result<Dashboard, CloudError> {
        self.create_dashboard(config)
    }

    pub fn get_dashboard(&self, name: &str) -> Result<Dashboard, CloudError> {
        if let Some(cached) = self.cache.get_dashboard(name) {
            return Ok(cached);
        }
        let output: wire::GetDashboardOutput = self.invoker.run_json(
            "GetDashboard",
            &[
                "cloudwatch",
                "get-dashboard",
                "--dashboard-name",
                name,
                "--region",
                &self.region,
                "--output",
                "json",
            ],
        )?;
        let widget_count = serde_json::from_str::<serde_json::Value>(&output.dashboard_body)
            .ok()
            .and_then(|body| body["widgets"].as_array().map(|widgets| widgets.len()))
            .unwrap_or(0);
        let dashboard = Dashboard {
            name: name.to_owned(),
            region: self.region.clone(),
            template: None,
            widget_count,
            last_updated: Utc::now(),
        };
        self.cache.put_dashboard(dashboard.clone());
        Ok(dashboard)
    }

    pub fn list_dashboards(&self) -> Result<Vec<String>, CloudError> {
        let output: wire::ListDashboardsOutput = self.invoker.run_json(
            "ListDashboards",
            &[
                "cloudwatch",
                "list-dashboards",
                "--region",
                &self.region,
                "--output",
                "json",
            ],
        )?;
        Ok(output
            .dashboard_entries
            .into_iter()
            .map(|entry| entry.dashboard_name)
            .collect())
    }

    pub fn delete_dashboard(&self, name: &str) -> Result<(), CloudError> {
        self.invoker.run(
            "DeleteDashboards",
            &[
                "cloudwatch",
                "delete-dashboards",
                "--dashboard-names",
                name,
                "--region",
                &self.region,
            ],
        )?;
        self.cache.remove_dashboard(name);
        Ok(())
    }
}

/// The template that backs each APM tool's preset dashboard.
pub(crate) fn template_for_tool(tool: crate::s3::ApmTool) -> DashboardTemplate {
    match tool {
        crate::s3::ApmTool::Prometheus => DashboardTemplate::Infrastructure,
        crate::s3::ApmTool::Grafana => DashboardTemplate::Application,
        crate::s3::ApmTool::Jaeger => DashboardTemplate::Tracing,
        crate::s3::ApmTool::Loki => DashboardTemplate::Logs,
        crate::s3::ApmTool::Alertmanager => DashboardTemplate::Application,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};

    #[test]
    fn every_template_renders_widgets() {
        for template in DashboardTemplate::all() {
            let widgets = template_widgets(*template, "APM/Monitoring", "us-east-1");
            assert!(!widgets.is_empty(), "template {template} rendered nothing");
            for widget in &widgets {
                assert!(widget["type"].is_string());
                assert!(widget["width"].as_u64().unwrap() > 0);
                assert!(widget["properties"]["region"].is_string());
            }
        }
    }

    #[test]
    fn application_template_points_at_namespace() {
        let widgets = template_widgets(DashboardTemplate::Application, "APM/Svc", "us-east-1");
        let rendered = serde_json::Value::Array(widgets.clone()).to_string();
        assert!(rendered.contains("APM/Svc"));
    }

    #[test]
    fn template_names_round_trip() {
        for template in DashboardTemplate::all() {
            assert_eq!(
                DashboardTemplate::from_str(template.as_str()).unwrap(),
                *template
            );
        }
        DashboardTemplate::from_str("unknown").unwrap_err();
    }

    #[test]
    fn create_writes_and_caches() {
        let fake = FakeCli::new("echo '{}'");
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name("dashboards_create").unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        let cache = CloudWatchCache::unbounded(&logger);
        let manager = DashboardManager::new(invoker, "us-east-1", cache.clone(), &logger);

        let dashboard = manager
            .create_dashboard(&DashboardConfig {
                name: "apm-prometheus".into(),
                template: DashboardTemplate::Infrastructure,
                namespace: "APM/Prometheus".into(),
            })
            .unwrap();
        assert_eq!(dashboard.widget_count, 4);
        assert!(cache.get_dashboard("apm-prometheus").is_some());

        // The cached entry answers subsequent gets
        let fetched = manager.get_dashboard("apm-prometheus").unwrap();
        assert_eq!(fetched.widget_count, 4);
        cache.close();
    }
}
