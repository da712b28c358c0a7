//! Stack drift detection with bounded polling.

use super::StackManager;
use crate::{
    error::{CloudError, ErrorKind},
    logging::event,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use slog::{debug, info};
use std::{
    thread,
    time::{Duration, Instant},
};

const DRIFT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_DRIFT_ATTEMPTS: u32 = 30;

/// One property-level difference on a drifted resource.
#[derive(Clone, Debug)]
pub struct PropertyDifference {
    pub property_path: String,
    pub expected_value: String,
    pub actual_value: String,
    pub difference_type: String,
}

/// Drift findings for one stack resource.
#[derive(Clone, Debug)]
pub struct ResourceDrift {
    pub logical_id: String,
    pub resource_type: String,
    pub status: String,
    pub differences: Vec<PropertyDifference>,
}

/// Outcome of a completed drift detection.
#[derive(Clone, Debug)]
pub struct DriftResult {
    pub stack_name: String,
    pub region: String,
    /// The stack-level verdict, e.g. `IN_SYNC` or `DRIFTED`.
    pub drift_status: String,
    pub total_resources: usize,
    pub drifted_count: usize,
    pub resource_drifts: Vec<ResourceDrift>,
    pub recommendations: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DetectStackDriftOutput {
        pub stack_drift_detection_id: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DetectionStatusOutput {
        pub detection_status: String,
        pub stack_drift_status: Option<String>,
        pub detection_status_reason: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct StackResourceDriftsOutput {
        pub stack_resource_drifts: Vec<ResourceDrift>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ResourceDrift {
        pub logical_resource_id: String,
        pub resource_type: String,
        pub stack_resource_drift_status: String,
        #[serde(default)]
        pub property_differences: Vec<PropertyDifference>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct PropertyDifference {
        pub property_path: String,
        pub expected_value: serde_json::Value,
        pub actual_value: serde_json::Value,
        pub difference_type: String,
    }
}

impl StackManager {
    /// Initiates drift detection on `stack_name` and polls until the
    /// detection completes, fails, or the poll budget (30 attempts at 5s) or
    /// the caller's `deadline` runs out.
    pub fn detect_drift(
        &self,
        stack_name: &str,
        region: &str,
        deadline: Option<Instant>,
    ) -> Result<DriftResult, CloudError> {
        self.detect_drift_with_interval(stack_name, region, deadline, DRIFT_POLL_INTERVAL)
    }

    pub(crate) fn detect_drift_with_interval(
        &self,
        stack_name: &str,
        region: &str,
        deadline: Option<Instant>,
        poll_interval: Duration,
    ) -> Result<DriftResult, CloudError> {
        info!(
            self.logger(), "initiating drift detection";
            event::STACK => stack_name,
            event::REGION => region,
        );
        let initiated: wire::DetectStackDriftOutput = self.invoker().run_json(
            "DetectStackDrift",
            &[
                "cloudformation",
                "detect-stack-drift",
                "--stack-name",
                stack_name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        let detection_id = initiated.stack_drift_detection_id;

        let mut drift_status = String::new();
        let mut completed = false;
        for attempt in 1..=MAX_DRIFT_ATTEMPTS {
            let status: wire::DetectionStatusOutput = self.invoker().run_json(
                "DescribeStackDriftDetectionStatus",
                &[
                    "cloudformation",
                    "describe-stack-drift-detection-status",
                    "--stack-drift-detection-id",
                    &detection_id,
                    "--region",
                    region,
                    "--output",
                    "json",
                ],
            )?;

            match status.detection_status.as_str() {
                "DETECTION_COMPLETE" => {
                    drift_status = status
                        .stack_drift_status
                        .unwrap_or_else(|| "UNKNOWN".to_owned());
                    completed = true;
                    break;
                }
                "DETECTION_FAILED" => {
                    return Err(CloudError::new(
                        "aws",
                        ErrorKind::InternalError,
                        "DetectStackDrift",
                        status
                            .detection_status_reason
                            .unwrap_or_else(|| "drift detection failed".to_owned()),
                    ));
                }
                _ => {
                    debug!(
                        self.logger(), "drift detection still running";
                        event::STACK => stack_name,
                        "attempt" => attempt,
                    );
                }
            }

            if attempt == MAX_DRIFT_ATTEMPTS {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() + poll_interval > deadline {
                    return Err(CloudError::new(
                        "aws",
                        ErrorKind::RequestTimeout,
                        "DetectStackDrift",
                        "drift detection timed out",
                    ));
                }
            }
            thread::sleep(poll_interval);
        }

        if !completed {
            return Err(CloudError::new(
                "aws",
                ErrorKind::RequestTimeout,
                "DetectStackDrift",
                "drift detection timed out",
            ));
        }

        let drifts: wire::StackResourceDriftsOutput = self.invoker().run_json(
            "DescribeStackResourceDrifts",
            &[
                "cloudformation",
                "describe-stack-resource-drifts",
                "--stack-name",
                stack_name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;

        let resource_drifts: Vec<ResourceDrift> = drifts
            .stack_resource_drifts
            .into_iter()
            .map(|drift| ResourceDrift {
                logical_id: drift.logical_resource_id,
                resource_type: drift.resource_type,
                status: drift.stack_resource_drift_status,
                differences: drift
                    .property_differences
                    .into_iter()
                    .map(|diff| PropertyDifference {
                        property_path: diff.property_path,
                        expected_value: render_value(&diff.expected_value),
                        actual_value: render_value(&diff.actual_value),
                        difference_type: diff.difference_type,
                    })
                    .collect(),
            })
            .collect();

        let total_resources = self.list_resources(stack_name, region).len();
        let drifted: Vec<&ResourceDrift> = resource_drifts
            .iter()
            .filter(|r| r.status != "IN_SYNC")
            .collect();
        let recommendations = drift_recommendations(&drifted);

        Ok(DriftResult {
            stack_name: stack_name.to_owned(),
            region: region.to_owned(),
            drift_status,
            total_resources,
            drifted_count: drifted.len(),
            resource_drifts,
            recommendations,
            detected_at: Utc::now(),
        })
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resource-type-aware remediation hints for drifted resources.
fn drift_recommendations(drifted: &[&ResourceDrift]) -> Vec<String> {
    if drifted.is_empty() {
        return vec!["no drift detected; no action required".to_owned()];
    }

    let mut recommendations = vec![
        "update the stack with the current template to reconcile drifted properties".to_owned(),
    ];
    let mut add_hint = |matches: bool, hint: &str| {
        if matches && !recommendations.iter().any(|r| r == hint) {
            recommendations.push(hint.to_owned());
        }
    };

    for drift in drifted {
        add_hint(
            drift.resource_type.starts_with("AWS::ElasticLoadBalancingV2"),
            "review listener, security group and target group changes on the drifted load balancer",
        );
        add_hint(
            drift.resource_type.starts_with("AWS::ECS"),
            "redeploy the ECS service so its task definition matches the template",
        );
        add_hint(
            drift.resource_type.starts_with("AWS::RDS"),
            "check parameter and option group changes on the drifted database instance",
        );
        add_hint(
            drift.resource_type.starts_with("AWS::Lambda"),
            "redeploy the Lambda configuration from the template",
        );
        add_hint(
            drift.resource_type.starts_with("AWS::S3"),
            "reconcile bucket policy and lifecycle changes through the template",
        );
    }
    recommendations.push("re-run drift detection after remediation".to_owned());
    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cli::CliInvoker, logging::setup_test_logging, metrics::CliMetricsCollector,
        test_utils::FakeCli,
    };
    use assert_matches::assert_matches;

    fn manager_for(fake: &FakeCli, metric_name: &str) -> StackManager {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        StackManager::new(invoker, &logger)
    }

    /// Fake CLI whose detection status flips to complete after two polls.
    /// The two-resource stack has one drifted load balancer.
    fn drift_script(always_in_progress: bool) -> String {
        let status_logic = if always_in_progress {
            r#"echo '{"DetectionStatus":"DETECTION_IN_PROGRESS"}'"#.to_owned()
        } else {
            r#"polls="$(dirname "$0")/polls"
echo poll >> "$polls"
if [ "$(wc -l < "$polls")" -ge 3 ]; then
    echo '{"DetectionStatus":"DETECTION_COMPLETE","StackDriftStatus":"DRIFTED"}'
else
    echo '{"DetectionStatus":"DETECTION_IN_PROGRESS"}'
fi"#
            .to_owned()
        };
        format!(
            r#"case "$2" in
detect-stack-drift) echo '{{"StackDriftDetectionId":"detection-1"}}';;
describe-stack-drift-detection-status) {status_logic};;
describe-stack-resource-drifts) echo '{{"StackResourceDrifts":[{{"LogicalResourceId":"Alb","ResourceType":"AWS::ElasticLoadBalancingV2::LoadBalancer","StackResourceDriftStatus":"MODIFIED","PropertyDifferences":[{{"PropertyPath":"/IdleTimeout","ExpectedValue":"60","ActualValue":"120","DifferenceType":"NOT_EQUAL"}}]}},{{"LogicalResourceId":"Service","ResourceType":"AWS::ECS::Service","StackResourceDriftStatus":"IN_SYNC"}}]}}';;
list-stack-resources) echo '{{"StackResourceSummaries":[{{"LogicalResourceId":"Alb","PhysicalResourceId":"arn:lb","ResourceType":"AWS::ElasticLoadBalancingV2::LoadBalancer","ResourceStatus":"CREATE_COMPLETE"}},{{"LogicalResourceId":"Service","PhysicalResourceId":"arn:svc","ResourceType":"AWS::ECS::Service","ResourceStatus":"CREATE_COMPLETE"}}]}}';;
*) exit 1;;
esac"#
        )
    }

    #[test]
    fn drift_detection_polls_to_completion() {
        let fake = FakeCli::new(&drift_script(false));
        let manager = manager_for(&fake, "drift_completes");

        let result = manager
            .detect_drift_with_interval("apm-core", "us-east-1", None, Duration::from_millis(1))
            .unwrap();

        assert_eq!(result.drift_status, "DRIFTED");
        assert_eq!(result.total_resources, 2);
        assert_eq!(result.drifted_count, 1);
        let drifted = &result.resource_drifts[0];
        assert_eq!(drifted.differences.len(), 1);
        assert_eq!(drifted.differences[0].expected_value, "60");
        assert_eq!(drifted.differences[0].actual_value, "120");
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("load balancer")));
    }

    #[test]
    fn drift_detection_exhausts_poll_budget() {
        let fake = FakeCli::new(&drift_script(true));
        let manager = manager_for(&fake, "drift_exhausts");

        let err = manager
            .detect_drift_with_interval("apm-core", "us-east-1", None, Duration::from_millis(1))
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::RequestTimeout);
        assert_eq!(err.message, "drift detection timed out");
    }

    #[test]
    fn drift_detection_honors_caller_deadline() {
        let fake = FakeCli::new(&drift_script(true));
        let manager = manager_for(&fake, "drift_deadline");

        let deadline = Instant::now() + Duration::from_millis(20);
        let started = Instant::now();
        let err = manager
            .detect_drift_with_interval(
                "apm-core",
                "us-east-1",
                Some(deadline),
                Duration::from_secs(60),
            )
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::RequestTimeout);
        // Must bail out without sleeping through the full poll interval
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[test]
    fn failed_detection_surfaces_reason() {
        let fake = FakeCli::new(
            r#"case "$2" in
detect-stack-drift) echo '{"StackDriftDetectionId":"detection-1"}';;
describe-stack-drift-detection-status) echo '{"DetectionStatus":"DETECTION_FAILED","DetectionStatusReason":"rate exceeded while inspecting resources"}';;
*) exit 1;;
esac"#,
        );
        let manager = manager_for(&fake, "drift_failed");

        let err = manager
            .detect_drift_with_interval("apm-core", "us-east-1", None, Duration::from_millis(1))
            .unwrap_err();
        assert!(err.message.contains("rate exceeded"));
    }

    #[test]
    fn clean_stacks_recommend_nothing() {
        let recommendations = drift_recommendations(&[]);
        assert_eq!(recommendations.len(), 1);
        assert!(recommendations[0].contains("no drift"));
    }
}
