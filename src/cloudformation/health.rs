//! Resource-level health checks aggregated per stack.

use super::{Stack, StackManager, StackResource};
use crate::logging::event;
use chrono::{DateTime, Utc};
use slog::info;
use std::fmt::{self, Display, Formatter};

/// Aggregate verdict over a stack's checkable resources.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// The verdict for a single resource.
#[derive(Clone, Debug)]
pub struct ResourceHealth {
    pub logical_id: String,
    pub resource_type: String,
    pub healthy: bool,
    pub detail: String,
}

/// Health findings for one stack.
#[derive(Clone, Debug)]
pub struct StackHealthResult {
    pub stack_name: String,
    pub region: String,
    pub overall: HealthStatus,
    pub resources: Vec<ResourceHealth>,
    pub healthy_count: usize,
    pub unhealthy_count: usize,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// All healthy means healthy; fewer unhealthy than healthy means degraded;
/// otherwise unhealthy.
fn aggregate(healthy: usize, unhealthy: usize) -> HealthStatus {
    if unhealthy == 0 {
        HealthStatus::Healthy
    } else if unhealthy < healthy {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

impl StackManager {
    /// Runs type-specific health checks over every checkable resource in
    /// `stack` and aggregates a verdict with triage recommendations.
    pub fn check_stack_health(&self, stack: &Stack) -> StackHealthResult {
        let mut resources = Vec::new();
        for resource in &stack.resources {
            if let Some(health) = self.check_resource(resource, &stack.region) {
                resources.push(health);
            }
        }

        let healthy_count = resources.iter().filter(|r| r.healthy).count();
        let unhealthy_count = resources.len() - healthy_count;
        let overall = aggregate(healthy_count, unhealthy_count);
        let recommendations = health_recommendations(&resources, overall);

        info!(
            self.logger(), "stack health checked";
            event::STACK => &stack.name,
            "overall" => overall.to_string(),
            "healthy" => healthy_count,
            "unhealthy" => unhealthy_count,
        );

        StackHealthResult {
            stack_name: stack.name.clone(),
            region: stack.region.clone(),
            overall,
            resources,
            healthy_count,
            unhealthy_count,
            recommendations,
            checked_at: Utc::now(),
        }
    }

    /// Checks one resource by type; resources without a type-specific check
    /// are skipped. A failing describe marks the resource unhealthy with the
    /// error as detail.
    fn check_resource(&self, resource: &StackResource, region: &str) -> Option<ResourceHealth> {
        let physical_id = resource.physical_id.as_deref()?;
        let (healthy, detail) = match resource.resource_type.as_str() {
            "AWS::ElasticLoadBalancingV2::LoadBalancer" => {
                match self.describe_load_balancer(physical_id, region) {
                    Ok(lb) => (lb.state == "active", format!("state {}", lb.state)),
                    Err(e) => (false, e.to_string()),
                }
            }
            "AWS::ECS::Service" => match self.describe_ecs_service(physical_id, region) {
                Ok(svc) => (
                    svc.running_count == svc.desired_count,
                    format!("{}/{} tasks running", svc.running_count, svc.desired_count),
                ),
                Err(e) => (false, e.to_string()),
            },
            "AWS::RDS::DBInstance" => match self.describe_rds_instance(physical_id, region) {
                Ok(db) => (db.status == "available", format!("status {}", db.status)),
                Err(e) => (false, e.to_string()),
            },
            "AWS::Lambda::Function" => {
                match self.describe_lambda_function(physical_id, region) {
                    Ok(function) => {
                        let state = function.state.as_deref().unwrap_or("unknown");
                        let update = function.last_update_status.as_deref().unwrap_or("unknown");
                        (
                            state == "Active" && update == "Successful",
                            format!("state {state}, last update {update}"),
                        )
                    }
                    Err(e) => (false, e.to_string()),
                }
            }
            _ => return None,
        };

        Some(ResourceHealth {
            logical_id: resource.logical_id.clone(),
            resource_type: resource.resource_type.clone(),
            healthy,
            detail,
        })
    }
}

/// Generic triage steps plus per-type hints keyed by unhealthy counts.
fn health_recommendations(resources: &[ResourceHealth], overall: HealthStatus) -> Vec<String> {
    let mut recommendations = Vec::new();
    if overall == HealthStatus::Healthy {
        recommendations.push("all checked resources are healthy".to_owned());
        return recommendations;
    }

    recommendations.push("inspect recent stack events for failed updates".to_owned());
    recommendations.push("check CloudWatch alarms associated with the stack".to_owned());

    let unhealthy_of = |type_prefix: &str| {
        resources
            .iter()
            .filter(|r| !r.healthy && r.resource_type.starts_with(type_prefix))
            .count()
    };

    let lb = unhealthy_of("AWS::ElasticLoadBalancingV2");
    if lb > 0 {
        recommendations.push(format!(
            "{lb} load balancer(s) are not active; verify target group health and security groups"
        ));
    }
    let ecs = unhealthy_of("AWS::ECS");
    if ecs > 0 {
        recommendations.push(format!(
            "{ecs} ECS service(s) are below desired count; review service events and task placement"
        ));
    }
    let rds = unhealthy_of("AWS::RDS");
    if rds > 0 {
        recommendations.push(format!(
            "{rds} database instance(s) are not available; check maintenance and storage state"
        ));
    }
    let lambda = unhealthy_of("AWS::Lambda");
    if lambda > 0 {
        recommendations.push(format!(
            "{lambda} Lambda function(s) failed their last update; redeploy or roll back the code"
        ));
    }
    recommendations
}
