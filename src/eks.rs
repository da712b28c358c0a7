//! EKS cluster discovery and kubeconfig management.
//!
//! Region is always an explicit argument here; concurrent callers never
//! contend on shared provider state.

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
};
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use std::{collections::HashMap, io::Read, path::PathBuf};

/// A described EKS cluster.
#[derive(Clone, Debug)]
pub struct EksCluster {
    pub name: String,
    pub arn: String,
    pub status: String,
    pub version: String,
    pub endpoint: Option<String>,
    pub region: String,
    pub tags: HashMap<String, String>,
}

/// A described managed node group.
#[derive(Clone, Debug)]
pub struct NodeGroup {
    pub name: String,
    pub status: String,
    pub instance_types: Vec<String>,
    pub desired_size: Option<i64>,
    pub min_size: Option<i64>,
    pub max_size: Option<i64>,
}

/// A described Fargate profile.
#[derive(Clone, Debug)]
pub struct FargateProfile {
    pub name: String,
    pub status: String,
    /// Namespaces selected by the profile.
    pub namespaces: Vec<String>,
}

/// A cluster with its node groups and Fargate profiles expanded.
#[derive(Clone, Debug)]
pub struct EksClusterDetails {
    pub cluster: EksCluster,
    pub node_groups: Vec<NodeGroup>,
    pub fargate_profiles: Vec<FargateProfile>,
}

/// Options for writing a kubeconfig.
#[derive(Clone, Debug, Default)]
pub struct KubeconfigOptions {
    /// Refuse to write over an existing file at an explicit path unless set.
    pub overwrite: bool,
    /// Context alias recorded in the kubeconfig.
    pub alias: Option<String>,
    /// Explicit destination. When absent the contents are materialized via a
    /// temporary file and returned inline, unless `use_default_location`.
    pub kubeconfig_path: Option<PathBuf>,
    /// Let the CLI merge into its standard kubeconfig location
    /// (`~/.kube/config` or `$KUBECONFIG`).
    pub use_default_location: bool,
}

/// Where a kubeconfig ended up: a path on disk, or the contents themselves
/// when no destination was requested.
#[derive(Clone, Debug)]
pub struct KubeconfigResult {
    pub path: Option<PathBuf>,
    pub contents: Option<String>,
}

mod wire {
    use super::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    pub(super) struct ListClustersOutput {
        pub clusters: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct DescribeClusterOutput {
        pub cluster: Cluster,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Cluster {
        pub name: String,
        pub arn: String,
        pub status: String,
        pub version: String,
        pub endpoint: Option<String>,
        #[serde(default)]
        pub tags: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct ListNodegroupsOutput {
        pub nodegroups: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct DescribeNodegroupOutput {
        pub nodegroup: Nodegroup,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Nodegroup {
        pub nodegroup_name: String,
        pub status: String,
        #[serde(default)]
        pub instance_types: Vec<String>,
        pub scaling_config: Option<ScalingConfig>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ScalingConfig {
        pub min_size: Option<i64>,
        pub max_size: Option<i64>,
        pub desired_size: Option<i64>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ListFargateProfilesOutput {
        pub fargate_profile_names: Vec<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct DescribeFargateProfileOutput {
        pub fargate_profile: FargateProfile,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct FargateProfile {
        pub fargate_profile_name: String,
        pub status: String,
        #[serde(default)]
        pub selectors: Vec<Selector>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Selector {
        pub namespace: Option<String>,
    }
}

/// Discovers EKS clusters and writes kubeconfigs.
#[derive(Clone, Debug)]
pub struct EksManager {
    invoker: CliInvoker,
    logger: Logger,
}

impl EksManager {
    pub fn new(invoker: CliInvoker, parent_logger: &Logger) -> Self {
        EksManager {
            invoker,
            logger: parent_logger.new(o!()),
        }
    }

    /// Lists and describes every cluster in `region`. Clusters that fail to
    /// describe are logged and skipped so one bad cluster cannot hide the
    /// rest.
    pub fn list_clusters(&self, region: &str) -> Result<Vec<EksCluster>, CloudError> {
        let names: wire::ListClustersOutput = self.invoker.run_json(
            "ListClusters",
            &["eks", "list-clusters", "--region", region, "--output", "json"],
        )?;

        let mut clusters = Vec::with_capacity(names.clusters.len());
        for name in names.clusters {
            match self.describe_cluster(&name, region) {
                Ok(cluster) => clusters.push(cluster),
                Err(e) => warn!(
                    self.logger, "skipping cluster that failed to describe";
                    event::CLUSTER => &name,
                    "error" => e.to_string(),
                ),
            }
        }
        Ok(clusters)
    }

    /// Walks the region catalog sequentially, swallowing per-region failures
    /// to permit partial results.
    pub fn list_clusters_all_regions(&self, regions: &[String]) -> Vec<EksCluster> {
        let mut clusters = Vec::new();
        for region in regions {
            match self.list_clusters(region) {
                Ok(mut found) => clusters.append(&mut found),
                Err(e) => debug!(
                    self.logger, "skipping region with no reachable EKS endpoint";
                    event::REGION => region.as_str(),
                    "error" => e.to_string(),
                ),
            }
        }
        clusters
    }

    fn describe_cluster(&self, name: &str, region: &str) -> Result<EksCluster, CloudError> {
        let output: wire::DescribeClusterOutput = self.invoker.run_json(
            "DescribeCluster",
            &[
                "eks",
                "describe-cluster",
                "--name",
                name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        Ok(EksCluster {
            name: output.cluster.name,
            arn: output.cluster.arn,
            status: output.cluster.status,
            version: output.cluster.version,
            endpoint: output.cluster.endpoint,
            region: region.to_owned(),
            tags: output.cluster.tags,
        })
    }

    /// Describes a cluster along with its node groups and Fargate profiles.
    /// Item-level failures in either listing are tolerated.
    pub fn cluster_details(
        &self,
        name: &str,
        region: &str,
    ) -> Result<EksClusterDetails, CloudError> {
        let cluster = self.describe_cluster(name, region)?;
        let node_groups = self.list_node_groups(name, region);
        let fargate_profiles = self.list_fargate_profiles(name, region);
        Ok(EksClusterDetails {
            cluster,
            node_groups,
            fargate_profiles,
        })
    }

    fn list_node_groups(&self, cluster: &str, region: &str) -> Vec<NodeGroup> {
        let names: wire::ListNodegroupsOutput = match self.invoker.run_json(
            "ListNodegroups",
            &[
                "eks",
                "list-nodegroups",
                "--cluster-name",
                cluster,
                "--region",
                region,
                "--output",
                "json",
            ],
        ) {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    self.logger, "failed to list node groups";
                    event::CLUSTER => cluster,
                    "error" => e.to_string(),
                );
                return Vec::new();
            }
        };

        let mut groups = Vec::with_capacity(names.nodegroups.len());
        for name in names.nodegroups {
            let described: Result<wire::DescribeNodegroupOutput, CloudError> =
                self.invoker.run_json(
                    "DescribeNodegroup",
                    &[
                        "eks",
                        "describe-nodegroup",
                        "--cluster-name",
                        cluster,
                        "--nodegroup-name",
                        &name,
                        "--region",
                        region,
                        "--output",
                        "json",
                    ],
                );
            match described {
                Ok(output) => {
                    let scaling = output.nodegroup.scaling_config;
                    groups.push(NodeGroup {
                        name: output.nodegroup.nodegroup_name,
                        status: output.nodegroup.status,
                        instance_types: output.nodegroup.instance_types,
                        desired_size: scaling.as_ref().and_then(|s| s.desired_size),
                        min_size: scaling.as_ref().and_then(|s| s.min_size),
                        max_size: scaling.as_ref().and_then(|s| s.max_size),
                    });
                }
                Err(e) => warn!(
                    self.logger, "skipping node group that failed to describe";
                    event::CLUSTER => cluster,
                    "error" => e.to_string(),
                ),
            }
        }
        groups
    }

    fn list_fargate_profiles(&self, cluster: &str, region: &str) -> Vec<FargateProfile> {
        let names: wire::ListFargateProfilesOutput = match self.invoker.run_json(
            "ListFargateProfiles",
            &[
                "eks",
                "list-fargate-profiles",
                "--cluster-name",
                cluster,
                "--region",
                region,
                "--output",
                "json",
            ],
        ) {
            Ok(names) => names,
            Err(e) => {
                warn!(
                    self.logger, "failed to list fargate profiles";
                    event::CLUSTER => cluster,
                    "error" => e.to_string(),
                );
                return Vec::new();
            }
        };

        let mut profiles = Vec::with_capacity(names.fargate_profile_names.len());
        for name in names.fargate_profile_names {
            let described: Result<wire::DescribeFargateProfileOutput, CloudError> =
                self.invoker.run_json(
                    "DescribeFargateProfile",
                    &[
                        "eks",
                        "describe-fargate-profile",
                        "--cluster-name",
                        cluster,
                        "--fargate-profile-name",
                        &name,
                        "--region",
                        region,
                        "--output",
                        "json",
                    ],
                );
            match described {
                Ok(output) => profiles.push(FargateProfile {
                    name: output.fargate_profile.fargate_profile_name,
                    status: output.fargate_profile.status,
                    namespaces: output
                        .fargate_profile
                        .selectors
                        .into_iter()
                        .filter_map(|s| s.namespace)
                        .collect(),
                }),
                Err(e) => warn!(
                    self.logger, "skipping fargate profile that failed to describe";
                    event::CLUSTER => cluster,
                    "error" => e.to_string(),
                ),
            }
        }
        profiles
    }

    /// Writes a kubeconfig for `name`. With an explicit path the file is
    /// written there (refusing to clobber unless `overwrite`); otherwise the
    /// CLI writes into a temporary file whose contents are read back and
    /// returned, and the file is removed.
    pub fn setup_kubeconfig(
        &self,
        name: &str,
        region: &str,
        options: &KubeconfigOptions,
    ) -> Result<KubeconfigResult, CloudError> {
        info!(
            self.logger, "writing kubeconfig";
            event::CLUSTER => name,
            event::REGION => region,
        );

        let mut args: Vec<String> = vec![
            "eks".into(),
            "update-kubeconfig".into(),
            "--name".into(),
            name.into(),
            "--region".into(),
            region.into(),
        ];
        if let Some(alias) = &options.alias {
            args.push("--alias".into());
            args.push(alias.clone());
        }

        match &options.kubeconfig_path {
            Some(path) => {
                if path.exists() && !options.overwrite {
                    return Err(CloudError::new(
                        "aws",
                        ErrorKind::InvalidRequest,
                        "SetupKubeconfig",
                        format!("{} exists and overwrite was not requested", path.display()),
                    ));
                }
                args.push("--kubeconfig".into());
                args.push(path.to_string_lossy().into_owned());
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.invoker.run("SetupKubeconfig", &arg_refs)?;
                Ok(KubeconfigResult {
                    path: Some(path.clone()),
                    contents: None,
                })
            }
            None if options.use_default_location => {
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.invoker.run("SetupKubeconfig", &arg_refs)?;
                Ok(KubeconfigResult {
                    path: None,
                    contents: None,
                })
            }
            None => {
                let scratch = tempfile::NamedTempFile::new().map_err(|e| {
                    CloudError::new(
                        "aws",
                        ErrorKind::InternalError,
                        "SetupKubeconfig",
                        "failed to create temporary kubeconfig",
                    )
                    .with_cause(e)
                })?;
                args.push("--kubeconfig".into());
                args.push(scratch.path().to_string_lossy().into_owned());
                let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
                self.invoker.run("SetupKubeconfig", &arg_refs)?;

                let mut contents = String::new();
                scratch
                    .reopen()
                    .and_then(|mut file| file.read_to_string(&mut contents))
                    .map_err(|e| {
                        CloudError::new(
                            "aws",
                            ErrorKind::InternalError,
                            "SetupKubeconfig",
                            "failed to read temporary kubeconfig",
                        )
                        .with_cause(e)
                    })?;
                // The temp file unlinks when `scratch` drops
                Ok(KubeconfigResult {
                    path: None,
                    contents: Some(contents),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{logging::setup_test_logging, metrics::CliMetricsCollector, test_utils::FakeCli};
    use assert_matches::assert_matches;

    const CLUSTER_JSON: &str = r#"{"cluster":{"name":"apm-prod","arn":"arn:aws:eks:us-east-1:111111111111:cluster/apm-prod","status":"ACTIVE","version":"1.27","endpoint":"https://example.eks.amazonaws.com","tags":{"env":"prod"}}}"#;

    fn manager_for(fake: &FakeCli, metric_name: &str) -> EksManager {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &metrics);
        EksManager::new(invoker, &logger)
    }

    /// A fake `aws eks` that answers list/describe for clusters, node groups
    /// and Fargate profiles.
    fn eks_script() -> String {
        format!(
            r#"case "$2" in
list-clusters) echo '{{"clusters":["apm-prod","broken"]}}';;
describe-cluster)
    case "$*" in
    *broken*) echo 'An error occurred (ResourceNotFoundException)' 1>&2; exit 1;;
    *) echo '{cluster}';;
    esac;;
list-nodegroups) echo '{{"nodegroups":["workers"]}}';;
describe-nodegroup) echo '{{"nodegroup":{{"nodegroupName":"workers","status":"ACTIVE","instanceTypes":["m5.large"],"scalingConfig":{{"minSize":1,"maxSize":5,"desiredSize":3}}}}}}';;
list-fargate-profiles) echo '{{"fargateProfileNames":["monitoring"]}}';;
describe-fargate-profile) echo '{{"fargateProfile":{{"fargateProfileName":"monitoring","status":"ACTIVE","selectors":[{{"namespace":"observability"}}]}}}}';;
update-kubeconfig)
    while [ $# -gt 0 ]; do
        if [ "$1" = "--kubeconfig" ]; then printf 'apiVersion: v1\nkind: Config\n' > "$2"; fi
        shift
    done;;
*) exit 1;;
esac"#,
            cluster = CLUSTER_JSON
        )
    }

    #[test]
    fn list_tolerates_undescribable_clusters() {
        let fake = FakeCli::new(&eks_script());
        let manager = manager_for(&fake, "eks_list_tolerates");

        let clusters = manager.list_clusters("us-east-1").unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "apm-prod");
        assert_eq!(clusters[0].region, "us-east-1");
        assert_eq!(clusters[0].tags["env"], "prod");
    }

    #[test]
    fn all_regions_swallows_region_failures() {
        // Whole-region listing fails for every region; result is empty, not
        // an error.
        let fake = FakeCli::new("echo 'ServiceUnavailable' 1>&2; exit 1");
        let manager = manager_for(&fake, "eks_all_regions");
        let clusters =
            manager.list_clusters_all_regions(&["us-east-1".to_owned(), "us-west-2".to_owned()]);
        assert!(clusters.is_empty());
    }

    #[test]
    fn details_expand_node_groups_and_fargate() {
        let fake = FakeCli::new(&eks_script());
        let manager = manager_for(&fake, "eks_details");

        let details = manager.cluster_details("apm-prod", "us-east-1").unwrap();
        assert_eq!(details.node_groups.len(), 1);
        assert_eq!(details.node_groups[0].desired_size, Some(3));
        assert_eq!(details.fargate_profiles.len(), 1);
        assert_eq!(details.fargate_profiles[0].namespaces, vec!["observability"]);
    }

    #[test]
    fn kubeconfig_to_temp_file_returns_contents() {
        let fake = FakeCli::new(&eks_script());
        let manager = manager_for(&fake, "eks_kubeconfig_temp");

        let result = manager
            .setup_kubeconfig("apm-prod", "us-east-1", &KubeconfigOptions::default())
            .unwrap();
        assert!(result.path.is_none());
        assert!(result.contents.unwrap().contains("kind: Config"));
    }

    #[test]
    fn kubeconfig_default_location_delegates_to_cli() {
        let fake = FakeCli::new(&eks_script());
        let manager = manager_for(&fake, "eks_kubeconfig_default");

        let options = KubeconfigOptions {
            use_default_location: true,
            ..Default::default()
        };
        let result = manager
            .setup_kubeconfig("apm-prod", "us-east-1", &options)
            .unwrap();
        assert!(result.path.is_none());
        assert!(result.contents.is_none());
    }

    #[test]
    fn kubeconfig_respects_overwrite_flag() {
        let fake = FakeCli::new(&eks_script());
        let manager = manager_for(&fake, "eks_kubeconfig_overwrite");

        let existing = tempfile::NamedTempFile::new().unwrap();
        let options = KubeconfigOptions {
            kubeconfig_path: Some(existing.path().to_owned()),
            ..Default::default()
        };
        let err = manager
            .setup_kubeconfig("apm-prod", "us-east-1", &options)
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);

        let options = KubeconfigOptions {
            overwrite: true,
            ..options
        };
        let result = manager
            .setup_kubeconfig("apm-prod", "us-east-1", &options)
            .unwrap();
        assert_eq!(result.path.as_deref(), Some(existing.path()));
    }
}
