//! CloudFormation stack discovery, APM classification and resource expansion.

mod drift;
mod health;

pub use drift::{DriftResult, PropertyDifference, ResourceDrift};
pub use health::{HealthStatus, ResourceHealth, StackHealthResult};

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
    work_queue::WorkQueue,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use slog::{debug, o, warn, Logger};
use std::{collections::HashMap, collections::HashSet, thread};

/// Terms that mark a stack as belonging to the APM estate when they appear in
/// a tag key or value.
pub(crate) const APM_TERMS: &[&str] = &[
    "apm",
    "monitoring",
    "observability",
    "prometheus",
    "grafana",
    "jaeger",
    "loki",
    "alertmanager",
    "application-performance-monitoring",
];

/// Resource types that count toward the APM classification threshold.
pub(crate) const APM_RESOURCE_TYPES: &[&str] = &[
    "AWS::ElasticLoadBalancingV2::LoadBalancer",
    "AWS::ElasticLoadBalancingV2::TargetGroup",
    "AWS::ECS::Service",
    "AWS::ECS::Cluster",
    "AWS::RDS::DBInstance",
    "AWS::Lambda::Function",
    "AWS::ElastiCache::CacheCluster",
    "AWS::S3::Bucket",
    "AWS::EC2::VPC",
    "AWS::CloudWatch::Alarm",
    "AWS::CloudWatch::Dashboard",
];

/// A discovered stack with its classification.
#[derive(Clone, Debug)]
pub struct Stack {
    pub name: String,
    pub stack_id: String,
    pub region: String,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
    pub outputs: HashMap<String, String>,
    pub resources: Vec<StackResource>,
    pub is_apm_stack: bool,
    pub apm_resources: Option<ApmResources>,
}

/// One resource inside a stack.
#[derive(Clone, Debug)]
pub struct StackResource {
    pub logical_id: String,
    pub physical_id: Option<String>,
    pub resource_type: String,
    pub status: String,
}

/// Filters applied to stack discovery.
#[derive(Clone, Debug, Default)]
pub struct StackFilters {
    pub regions: Vec<String>,
    pub statuses: Vec<String>,
    pub name_prefix: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Exact-match tag filters.
    pub tags: HashMap<String, String>,
    pub apm_only: bool,
}

/// Expanded descriptions of the APM-relevant resources in a stack.
#[derive(Clone, Debug, Default)]
pub struct ApmResources {
    pub load_balancers: Vec<LoadBalancerInfo>,
    pub ecs_services: Vec<EcsServiceInfo>,
    pub rds_instances: Vec<RdsInstanceInfo>,
    pub lambda_functions: Vec<LambdaFunctionInfo>,
    pub cache_clusters: Vec<CacheClusterInfo>,
    pub buckets: Vec<BucketInfo>,
    pub vpcs: Vec<VpcInfo>,
}

#[derive(Clone, Debug)]
pub struct LoadBalancerInfo {
    pub name: String,
    pub arn: String,
    pub dns_name: Option<String>,
    pub state: String,
    pub kind: Option<String>,
}

#[derive(Clone, Debug)]
pub struct EcsServiceInfo {
    pub name: String,
    pub cluster: String,
    pub status: String,
    pub running_count: i64,
    pub desired_count: i64,
}

#[derive(Clone, Debug)]
pub struct RdsInstanceInfo {
    pub identifier: String,
    pub status: String,
    pub engine: Option<String>,
    pub instance_class: Option<String>,
}

#[derive(Clone, Debug)]
pub struct LambdaFunctionInfo {
    pub name: String,
    pub state: Option<String>,
    pub last_update_status: Option<String>,
    pub runtime: Option<String>,
}

#[derive(Clone, Debug)]
pub struct CacheClusterInfo {
    pub id: String,
    pub status: String,
    pub engine: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BucketInfo {
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct VpcInfo {
    pub id: String,
    pub state: String,
    pub cidr_block: Option<String>,
}

mod wire {
    use super::{DateTime, Deserialize, Utc};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeStacksOutput {
        pub stacks: Vec<Stack>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Stack {
        pub stack_name: String,
        pub stack_id: String,
        pub stack_status: String,
        pub creation_time: Option<DateTime<Utc>>,
        #[serde(default)]
        pub tags: Vec<Tag>,
        #[serde(default)]
        pub parameters: Vec<Parameter>,
        #[serde(default)]
        pub outputs: Vec<Output>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Tag {
        pub key: String,
        pub value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Parameter {
        pub parameter_key: String,
        pub parameter_value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Output {
        pub output_key: String,
        pub output_value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListStackResourcesOutput {
        pub stack_resource_summaries: Vec<StackResourceSummary>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct StackResourceSummary {
        pub logical_resource_id: String,
        pub physical_resource_id: Option<String>,
        pub resource_type: String,
        pub resource_status: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeLoadBalancersOutput {
        pub load_balancers: Vec<LoadBalancer>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct LoadBalancer {
        pub load_balancer_arn: String,
        pub load_balancer_name: String,
        #[serde(rename = "DNSName")]
        pub dns_name: Option<String>,
        pub state: Option<LoadBalancerState>,
        #[serde(rename = "Type")]
        pub kind: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct LoadBalancerState {
        pub code: String,
    }

    // The ECS API (unlike most of AWS) speaks lowerCamelCase.
    #[derive(Debug, Deserialize)]
    pub(super) struct DescribeServicesOutput {
        pub services: Vec<EcsService>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct EcsService {
        pub service_name: String,
        pub status: String,
        pub running_count: i64,
        pub desired_count: i64,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct DescribeDbInstancesOutput {
        #[serde(rename = "DBInstances")]
        pub db_instances: Vec<DbInstance>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct DbInstance {
        #[serde(rename = "DBInstanceIdentifier")]
        pub identifier: String,
        #[serde(rename = "DBInstanceStatus")]
        pub status: String,
        #[serde(rename = "Engine")]
        pub engine: Option<String>,
        #[serde(rename = "DBInstanceClass")]
        pub instance_class: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct FunctionConfiguration {
        pub function_name: String,
        pub state: Option<String>,
        pub last_update_status: Option<String>,
        pub runtime: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeCacheClustersOutput {
        pub cache_clusters: Vec<CacheCluster>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct CacheCluster {
        pub cache_cluster_id: String,
        pub cache_cluster_status: String,
        pub engine: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeVpcsOutput {
        pub vpcs: Vec<Vpc>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Vpc {
        pub vpc_id: String,
        pub state: String,
        pub cidr_block: Option<String>,
    }
}

/// Whether a stack belongs to the APM estate: any tag key or value contains
/// an APM term, or at least two distinct APM resource types are present.
pub(crate) fn is_apm_stack(
    tags: &HashMap<String, String>,
    resources: &[StackResource],
) -> bool {
    let tag_match = tags.iter().any(|(key, value)| {
        let key = key.to_ascii_lowercase();
        let value = value.to_ascii_lowercase();
        APM_TERMS
            .iter()
            .any(|term| key.contains(term) || value.contains(term))
    });
    if tag_match {
        return true;
    }

    let distinct_apm_types: HashSet<&str> = resources
        .iter()
        .map(|r| r.resource_type.as_str())
        .filter(|t| APM_RESOURCE_TYPES.contains(t))
        .collect();
    distinct_apm_types.len() >= 2
}

/// Whether `stack` passes every requested filter.
fn stack_matches(stack: &Stack, filters: &StackFilters) -> bool {
    if !filters.statuses.is_empty() && !filters.statuses.contains(&stack.status) {
        return false;
    }
    if let Some(prefix) = &filters.name_prefix {
        if !stack.name.starts_with(prefix.as_str()) {
            return false;
        }
    }
    if let Some(after) = filters.created_after {
        match stack.created_at {
            Some(created) if created > after => {}
            _ => return false,
        }
    }
    if let Some(before) = filters.created_before {
        match stack.created_at {
            Some(created) if created < before => {}
            _ => return false,
        }
    }
    for (key, value) in &filters.tags {
        if stack.tags.get(key) != Some(value) {
            return false;
        }
    }
    if filters.apm_only && !stack.is_apm_stack {
        return false;
    }
    true
}

/// Extracts `(cluster, service)` from an ECS service physical id. New-style
/// ARNs carry the cluster name in the resource path; old-style ones do not.
fn ecs_cluster_and_service(physical_id: &str) -> (String, String) {
    let resource = physical_id
        .rsplit_once("service/")
        .map(|(_, rest)| rest)
        .unwrap_or(physical_id);
    match resource.split_once('/') {
        Some((cluster, service)) => (cluster.to_owned(), service.to_owned()),
        None => ("default".to_owned(), resource.to_owned()),
    }
}

/// Discovers and inspects CloudFormation stacks.
#[derive(Clone, Debug)]
pub struct StackManager {
    invoker: CliInvoker,
    logger: Logger,
}

impl StackManager {
    pub fn new(invoker: CliInvoker, parent_logger: &Logger) -> Self {
        StackManager {
            invoker,
            logger: parent_logger.new(o!()),
        }
    }

    pub(crate) fn invoker(&self) -> &CliInvoker {
        &self.invoker
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Lists stacks across the requested regions. With more than one region
    /// the listing fans out one worker per region; individual region
    /// failures are logged and suppressed so the rest still report. Only if
    /// every region fails is an aggregated error returned.
    pub fn list_stacks(&self, filters: &StackFilters) -> Result<Vec<Stack>, CloudError> {
        if filters.regions.is_empty() {
            return Err(CloudError::new(
                "aws",
                ErrorKind::InvalidRequest,
                "ListStacks",
                "at least one region is required",
            ));
        }

        if filters.regions.len() == 1 {
            return self.list_stacks_in_region(&filters.regions[0], filters);
        }

        let queue: WorkQueue<String, (String, Result<Vec<Stack>, CloudError>)> =
            WorkQueue::new(filters.regions.clone());
        let mut workers = Vec::with_capacity(filters.regions.len());
        for _ in 0..filters.regions.len() {
            let queue = queue.clone();
            let manager = self.clone();
            let filters = filters.clone();
            workers.push(thread::spawn(move || {
                while let Some(region) = queue.dequeue_job() {
                    let outcome = manager.list_stacks_in_region(&region, &filters);
                    queue.push_result((region, outcome));
                }
            }));
        }
        for worker in workers {
            let _ = worker.join();
        }

        let outcomes = queue.into_results().unwrap_or_default();
        let mut stacks = Vec::new();
        let mut failures = Vec::new();
        for (region, outcome) in outcomes {
            match outcome {
                Ok(mut found) => stacks.append(&mut found),
                Err(e) => {
                    warn!(
                        self.logger, "region listing failed";
                        event::REGION => &region,
                        "error" => e.to_string(),
                    );
                    failures.push(format!("{region}: {e}"));
                }
            }
        }

        if stacks.is_empty() && !failures.is_empty() && failures.len() == filters.regions.len() {
            return Err(CloudError::new(
                "aws",
                ErrorKind::Unknown,
                "ListStacks",
                format!("all regions failed: {}", failures.join("; ")),
            ));
        }
        Ok(stacks)
    }

    fn list_stacks_in_region(
        &self,
        region: &str,
        filters: &StackFilters,
    ) -> Result<Vec<Stack>, CloudError> {
        let output: wire::DescribeStacksOutput = self.invoker.run_json(
            "DescribeStacks",
            &[
                "cloudformation",
                "describe-stacks",
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;

        let mut stacks = Vec::new();
        for described in output.stacks {
            let stack = self.assemble_stack(described, region);
            if stack_matches(&stack, filters) {
                stacks.push(stack);
            }
        }
        Ok(stacks)
    }

    /// Describes a single stack, classifies it, and expands APM resources
    /// when the stack belongs to the APM estate.
    pub fn get_stack(&self, name: &str, region: &str) -> Result<Stack, CloudError> {
        let output: wire::DescribeStacksOutput = self.invoker.run_json(
            "DescribeStacks",
            &[
                "cloudformation",
                "describe-stacks",
                "--stack-name",
                name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        let described = output.stacks.into_iter().next().ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::ObjectNotFound,
                "GetStack",
                format!("stack {name} not found in {region}"),
            )
        })?;

        let mut stack = self.assemble_stack(described, region);
        if stack.is_apm_stack {
            stack.apm_resources = Some(self.expand_apm_resources(&stack.resources, region));
        }
        Ok(stack)
    }

    fn assemble_stack(&self, described: wire::Stack, region: &str) -> Stack {
        let resources = self.list_resources(&described.stack_name, region);
        let tags: HashMap<String, String> = described
            .tags
            .into_iter()
            .map(|t| (t.key, t.value))
            .collect();
        let is_apm = is_apm_stack(&tags, &resources);
        Stack {
            name: described.stack_name,
            stack_id: described.stack_id,
            region: region.to_owned(),
            status: described.stack_status,
            created_at: described.creation_time,
            tags,
            parameters: described
                .parameters
                .into_iter()
                .map(|p| (p.parameter_key, p.parameter_value))
                .collect(),
            outputs: described
                .outputs
                .into_iter()
                .map(|o| (o.output_key, o.output_value))
                .collect(),
            resources,
            is_apm_stack: is_apm,
            apm_resources: None,
        }
    }

    pub(crate) fn list_resources(&self, stack_name: &str, region: &str) -> Vec<StackResource> {
        let output: Result<wire::ListStackResourcesOutput, CloudError> = self.invoker.run_json(
            "ListStackResources",
            &[
                "cloudformation",
                "list-stack-resources",
                "--stack-name",
                stack_name,
                "--region",
                region,
                "--output",
                "json",
            ],
        );
        match output {
            Ok(output) => output
                .stack_resource_summaries
                .into_iter()
                .map(|r| StackResource {
                    logical_id: r.logical_resource_id,
                    physical_id: r.physical_resource_id,
                    resource_type: r.resource_type,
                    status: r.resource_status,
                })
                .collect(),
            Err(e) => {
                warn!(
                    self.logger, "failed to list stack resources";
                    event::STACK => stack_name,
                    "error" => e.to_string(),
                );
                Vec::new()
            }
        }
    }

    /// Expands each APM-relevant resource with its type-specific description.
    /// Individual not-found resources are skipped rather than failing the
    /// expansion.
    fn expand_apm_resources(&self, resources: &[StackResource], region: &str) -> ApmResources {
        let mut expanded = ApmResources::default();
        for resource in resources {
            let physical_id = match &resource.physical_id {
                Some(id) => id,
                None => continue,
            };
            let outcome: Result<(), CloudError> = match resource.resource_type.as_str() {
                "AWS::ElasticLoadBalancingV2::LoadBalancer" => self
                    .describe_load_balancer(physical_id, region)
                    .map(|lb| expanded.load_balancers.push(lb)),
                "AWS::ECS::Service" => self
                    .describe_ecs_service(physical_id, region)
                    .map(|svc| expanded.ecs_services.push(svc)),
                "AWS::RDS::DBInstance" => self
                    .describe_rds_instance(physical_id, region)
                    .map(|db| expanded.rds_instances.push(db)),
                "AWS::Lambda::Function" => self
                    .describe_lambda_function(physical_id, region)
                    .map(|f| expanded.lambda_functions.push(f)),
                "AWS::ElastiCache::CacheCluster" => self
                    .describe_cache_cluster(physical_id, region)
                    .map(|c| expanded.cache_clusters.push(c)),
                "AWS::S3::Bucket" => {
                    expanded.buckets.push(BucketInfo {
                        name: physical_id.clone(),
                    });
                    Ok(())
                }
                "AWS::EC2::VPC" => self
                    .describe_vpc(physical_id, region)
                    .map(|vpc| expanded.vpcs.push(vpc)),
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                debug!(
                    self.logger, "skipping resource expansion";
                    "resource" => &resource.logical_id,
                    "error" => e.to_string(),
                );
            }
        }
        expanded
    }

    pub(crate) fn describe_load_balancer(
        &self,
        arn: &str,
        region: &str,
    ) -> Result<LoadBalancerInfo, CloudError> {
        let output: wire::DescribeLoadBalancersOutput = self.invoker.run_json(
            "DescribeLoadBalancers",
            &[
                "elbv2",
                "describe-load-balancers",
                "--load-balancer-arns",
                arn,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .load_balancers
            .into_iter()
            .next()
            .map(|lb| LoadBalancerInfo {
                name: lb.load_balancer_name,
                arn: lb.load_balancer_arn,
                dns_name: lb.dns_name,
                state: lb.state.map(|s| s.code).unwrap_or_else(|| "unknown".into()),
                kind: lb.kind,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeLoadBalancers",
                    format!("load balancer {arn} not found"),
                )
            })
    }

    pub(crate) fn describe_ecs_service(
        &self,
        physical_id: &str,
        region: &str,
    ) -> Result<EcsServiceInfo, CloudError> {
        let (cluster, service) = ecs_cluster_and_service(physical_id);
        let output: wire::DescribeServicesOutput = self.invoker.run_json(
            "DescribeServices",
            &[
                "ecs",
                "describe-services",
                "--cluster",
                &cluster,
                "--services",
                &service,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .services
            .into_iter()
            .next()
            .map(|svc| EcsServiceInfo {
                name: svc.service_name,
                cluster: cluster.clone(),
                status: svc.status,
                running_count: svc.running_count,
                desired_count: svc.desired_count,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeServices",
                    format!("service {service} not found in cluster {cluster}"),
                )
            })
    }

    pub(crate) fn describe_rds_instance(
        &self,
        identifier: &str,
        region: &str,
    ) -> Result<RdsInstanceInfo, CloudError> {
        let output: wire::DescribeDbInstancesOutput = self.invoker.run_json(
            "DescribeDBInstances",
            &[
                "rds",
                "describe-db-instances",
                "--db-instance-identifier",
                identifier,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .db_instances
            .into_iter()
            .next()
            .map(|db| RdsInstanceInfo {
                identifier: db.identifier,
                status: db.status,
                engine: db.engine,
                instance_class: db.instance_class,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeDBInstances",
                    format!("database instance {identifier} not found"),
                )
            })
    }

    pub(crate) fn describe_lambda_function(
        &self,
        name: &str,
        region: &str,
    ) -> Result<LambdaFunctionInfo, CloudError> {
        let output: wire::FunctionConfiguration = self.invoker.run_json(
            "GetFunctionConfiguration",
            &[
                "lambda",
                "get-function-configuration",
                "--function-name",
                name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        Ok(LambdaFunctionInfo {
            name: output.function_name,
            state: output.state,
            last_update_status: output.last_update_status,
            runtime: output.runtime,
        })
    }

    pub(crate) fn describe_cache_cluster(
        &self,
        id: &str,
        region: &str,
    ) -> Result<CacheClusterInfo, CloudError> {
        let output: wire::DescribeCacheClustersOutput = self.invoker.run_json(
            "DescribeCacheClusters",
            &[
                "elasticache",
                "describe-cache-clusters",
                "--cache-cluster-id",
                id,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .cache_clusters
            .into_iter()
            .next()
            .map(|c| CacheClusterInfo {
                id: c.cache_cluster_id,
                status: c.cache_cluster_status,
                engine: c.engine,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeCacheClusters",
                    format!("cache cluster {id} not found"),
                )
            })
    }

    pub(crate) fn describe_vpc(&self, id: &str, region: &str) -> Result<VpcInfo, CloudError> {
        let output: wire::DescribeVpcsOutput = self.invoker.run_json(
            "DescribeVpcs",
            &[
                "ec2",
                "describe-vpcs",
                "--vpc-ids",
                id,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .vpcs
            .into_iter()
            .next()
            .map(|vpc| VpcInfo {
                id: vpc.vpc_id,
                state: vpc.state,
                cidr_block: vpc.cidr_block,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeVpcs",
                    format!("vpc {id} not found"),
                )
            })
    }
}
