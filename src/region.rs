//! Region catalog and current-region resolution.

use crate::{cli::CliInvoker, config::ProviderConfig, error::CloudError, logging::event};
use serde::Deserialize;
use slog::{debug, o, warn, Logger};
use std::time::Duration;

pub const DEFAULT_REGION: &str = "us-east-1";

const IMDS_BASE_URL: &str = "http://169.254.169.254";
const IMDS_REGION_PATH: &str = "/latest/meta-data/placement/region";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);

/// The commercial-partition regions known at build time, used when the
/// account cannot call `DescribeRegions`.
const BUILTIN_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "af-south-1",
    "ap-east-1",
    "ap-south-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-northeast-3",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-southeast-3",
    "ca-central-1",
    "eu-central-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-north-1",
    "eu-south-1",
    "me-south-1",
    "sa-east-1",
];

mod wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct DescribeRegionsOutput {
        pub regions: Vec<Region>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Region {
        pub region_name: String,
    }
}

/// Resolves the region catalog and the effective current region.
#[derive(Clone, Debug)]
pub struct RegionResolver {
    invoker: CliInvoker,
    imds_base_url: String,
    logger: Logger,
}

impl RegionResolver {
    pub fn new(invoker: CliInvoker, parent_logger: &Logger) -> Self {
        RegionResolver {
            invoker,
            imds_base_url: IMDS_BASE_URL.to_owned(),
            logger: parent_logger.new(o!()),
        }
    }

    /// Points the instance-metadata probe somewhere other than the link-local
    /// endpoint. Tests use this to substitute a mock HTTP server.
    pub fn with_imds_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.imds_base_url = base_url.into();
        self
    }

    /// The region catalog. Asks EC2 for the authoritative list and falls back
    /// to the builtin table when the account cannot call `DescribeRegions`.
    pub fn list_regions(&self) -> Result<Vec<String>, CloudError> {
        let result: Result<wire::DescribeRegionsOutput, CloudError> = self.invoker.run_json(
            "DescribeRegions",
            &["ec2", "describe-regions", "--output", "json"],
        );
        match result {
            Ok(output) => Ok(output.regions.into_iter().map(|r| r.region_name).collect()),
            Err(e) => {
                warn!(
                    self.logger, "falling back to builtin region catalog";
                    "error" => e.to_string(),
                );
                Ok(BUILTIN_REGIONS.iter().map(|r| (*r).to_owned()).collect())
            }
        }
    }

    /// Resolves the effective region: provider config, then the `AWS_REGION`
    /// environment family, then the CLI's own configuration, then an
    /// instance-metadata probe, then the default.
    pub fn current_region(&self, config: &ProviderConfig) -> String {
        let from_cli = || {
            let mut args = vec!["configure", "get", "region"];
            if let Some(profile) = &config.profile {
                args.push("--profile");
                args.push(profile);
            }
            self.invoker
                .run("GetConfiguredRegion", &args)
                .ok()
                .map(|out| String::from_utf8_lossy(&out).trim().to_owned())
                .filter(|region| !region.is_empty())
        };

        let region = resolve_region(
            config.region.as_deref(),
            std::env::var("AWS_REGION").ok().as_deref(),
            std::env::var("AWS_DEFAULT_REGION").ok().as_deref(),
            from_cli,
            || self.imds_region(),
        );
        debug!(self.logger, "resolved region"; event::REGION => &region);
        region
    }

    /// Probes the instance metadata service for the placement region. The
    /// probe is bounded at 2 seconds so off-cloud hosts fail fast.
    pub(crate) fn imds_region(&self) -> Option<String> {
        let agent = ureq::AgentBuilder::new().timeout(IMDS_TIMEOUT).build();
        let url = format!("{}{}", self.imds_base_url, IMDS_REGION_PATH);
        match agent.get(&url).call() {
            Ok(response) => response
                .into_string()
                .ok()
                .map(|body| body.trim().to_owned())
                .filter(|region| !region.is_empty()),
            Err(e) => {
                debug!(
                    self.logger, "instance metadata probe failed";
                    "error" => e.to_string(),
                );
                None
            }
        }
    }
}

/// The resolution chain, separated from ambient environment access so it can
/// be tested deterministically.
fn resolve_region(
    configured: Option<&str>,
    env_region: Option<&str>,
    env_default_region: Option<&str>,
    cli_lookup: impl FnOnce() -> Option<String>,
    imds_lookup: impl FnOnce() -> Option<String>,
) -> String {
    if let Some(region) = configured.filter(|r| !r.is_empty()) {
        return region.to_owned();
    }
    if let Some(region) = env_region.filter(|r| !r.is_empty()) {
        return region.to_owned();
    }
    if let Some(region) = env_default_region.filter(|r| !r.is_empty()) {
        return region.to_owned();
    }
    if let Some(region) = cli_lookup() {
        return region;
    }
    if let Some(region) = imds_lookup() {
        return region;
    }
    DEFAULT_REGION.to_owned()
}
