//! The cross-provider capability set and the factory that vends providers.

use crate::{
    cli::CliInvoker,
    cloudwatch::CloudWatchManager,
    config::{ProviderConfig, ProviderKind},
    credentials::{AuthMethod, Credentials, CredentialStore},
    ecr::EcrManager,
    eks::{EksManager, KubeconfigOptions},
    error::{CloudError, ErrorKind},
    logging::event,
    metrics::MetricsBundle,
    region::RegionResolver,
    s3::{S3Cache, S3CacheConfig, S3Manager},
    session::CrossAccountRoleManager,
    cloudformation::StackManager,
};
use dyn_clone::DynClone;
use serde::Deserialize;
use slog::{info, o, Logger};
use std::{collections::HashMap, fmt::Debug};

/// What a CLI-installer probe reports about a vendor tool.
#[derive(Clone, Debug)]
pub struct CliStatus {
    pub installed: bool,
    pub version: Option<String>,
}

/// A provider-neutral container registry descriptor.
#[derive(Clone, Debug)]
pub struct Registry {
    pub name: String,
    pub uri: String,
    pub region: Option<String>,
}

/// A provider-neutral managed-Kubernetes cluster descriptor.
#[derive(Clone, Debug)]
pub struct Cluster {
    pub name: String,
    pub status: Option<String>,
    pub region: Option<String>,
}

/// The capability set every provider satisfies. Deeper, provider-specific
/// surfaces hang off the concrete types (see [`AwsProvider`]).
pub trait CloudProvider: Debug + DynClone + Send {
    fn name(&self) -> &'static str;
    fn detect_cli(&self) -> CliStatus;
    fn validate_cli(&self) -> Result<(), CloudError>;
    fn cli_version(&self) -> Result<String, CloudError>;
    fn validate_auth(&self) -> Result<(), CloudError>;
    fn get_credentials(&self) -> Result<Credentials, CloudError>;
    fn list_registries(&self) -> Result<Vec<Registry>, CloudError>;
    fn get_registry(&self, name: &str) -> Result<Registry, CloudError>;
    fn authenticate_registry(&self, name: &str) -> Result<(), CloudError>;
    fn list_clusters(&self) -> Result<Vec<Cluster>, CloudError>;
    fn get_cluster(&self, name: &str) -> Result<Cluster, CloudError>;
    fn get_kubeconfig(&self, name: &str) -> Result<String, CloudError>;
    fn list_regions(&self) -> Result<Vec<String>, CloudError>;
    fn current_region(&self) -> String;
    fn set_region(&mut self, region: &str);
}

dyn_clone::clone_trait_object!(CloudProvider);

/// The AWS provider: the base capability set plus the resource, stack,
/// storage and observability sub-managers.
#[derive(Clone, Debug)]
pub struct AwsProvider {
    config: ProviderConfig,
    region: String,
    invoker: CliInvoker,
    credentials: CredentialStore,
    sessions: CrossAccountRoleManager,
    ecr: EcrManager,
    eks: EksManager,
    regions: RegionResolver,
    stacks: StackManager,
    s3: S3Manager,
    cloudwatch: CloudWatchManager,
    metrics: MetricsBundle,
    logger: Logger,
}

impl AwsProvider {
    pub fn new(config: ProviderConfig, parent_logger: &Logger, metrics: &MetricsBundle) -> Self {
        let logger = parent_logger.new(o!(event::PROVIDER => "aws"));
        let invoker = CliInvoker::aws(&logger, &metrics.cli)
            .with_timeout(config.cli_timeout())
            .with_retry_policy(config.retry.to_policy());
        let docker = CliInvoker::docker(&logger, &metrics.cli);

        let regions = RegionResolver::new(invoker.clone(), &logger);
        let region = regions.current_region(&config);

        let credentials =
            CredentialStore::new(config.clone(), invoker.clone(), regions.clone(), &logger)
                .with_cache_file(crate::credentials::default_cache_path());
        let sessions = CrossAccountRoleManager::new(invoker.clone(), &logger, &metrics.session);
        let ecr = EcrManager::new(invoker.clone(), docker, &logger);
        let eks = EksManager::new(invoker.clone(), &logger);
        let stacks = StackManager::new(invoker.clone(), &logger);
        let s3_cache = S3Cache::new(S3CacheConfig::default(), &logger);
        let s3 = S3Manager::new(invoker.clone(), s3_cache, &metrics.transfer, &logger);
        let cloudwatch = CloudWatchManager::new(
            invoker.clone(),
            region.clone(),
            &metrics.observability,
            &logger,
        );

        info!(logger, "constructed provider"; event::REGION => &region);
        AwsProvider {
            config,
            region,
            invoker,
            credentials,
            sessions,
            ecr,
            eks,
            regions,
            stacks,
            s3,
            cloudwatch,
            metrics: metrics.clone(),
            logger,
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn credentials_store(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn sessions(&self) -> &CrossAccountRoleManager {
        &self.sessions
    }

    pub fn ecr(&self) -> &EcrManager {
        &self.ecr
    }

    pub fn eks(&self) -> &EksManager {
        &self.eks
    }

    pub fn stacks(&self) -> &StackManager {
        &self.stacks
    }

    pub fn s3(&self) -> &S3Manager {
        &self.s3
    }

    pub fn cloudwatch(&self) -> &CloudWatchManager {
        &self.cloudwatch
    }

    pub fn region_resolver(&self) -> &RegionResolver {
        &self.regions
    }
}

impl CloudProvider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn detect_cli(&self) -> CliStatus {
        match self.cli_version() {
            Ok(version) => CliStatus {
                installed: true,
                version: Some(version),
            },
            Err(_) => CliStatus {
                installed: false,
                version: None,
            },
        }
    }

    fn validate_cli(&self) -> Result<(), CloudError> {
        self.cli_version().map(|_| ())
    }

    fn cli_version(&self) -> Result<String, CloudError> {
        let stdout = self.invoker.run("Version", &["--version"])?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_owned())
    }

    fn validate_auth(&self) -> Result<(), CloudError> {
        self.credentials.caller_identity().map(|_| ())
    }

    fn get_credentials(&self) -> Result<Credentials, CloudError> {
        self.credentials.get_credentials()
    }

    fn list_registries(&self) -> Result<Vec<Registry>, CloudError> {
        Ok(self
            .ecr
            .list_repositories(&self.region)?
            .into_iter()
            .map(|repository| Registry {
                name: repository.name,
                uri: repository.uri,
                region: Some(self.region.clone()),
            })
            .collect())
    }

    fn get_registry(&self, name: &str) -> Result<Registry, CloudError> {
        let repository = self.ecr.get_repository(name, &self.region)?;
        Ok(Registry {
            name: repository.name,
            uri: repository.uri,
            region: Some(self.region.clone()),
        })
    }

    fn authenticate_registry(&self, name: &str) -> Result<(), CloudError> {
        self.ecr.authenticate_registry(name, &self.region)
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>, CloudError> {
        Ok(self
            .eks
            .list_clusters(&self.region)?
            .into_iter()
            .map(|cluster| Cluster {
                name: cluster.name,
                status: Some(cluster.status),
                region: Some(cluster.region),
            })
            .collect())
    }

    fn get_cluster(&self, name: &str) -> Result<Cluster, CloudError> {
        let details = self.eks.cluster_details(name, &self.region)?;
        Ok(Cluster {
            name: details.cluster.name,
            status: Some(details.cluster.status),
            region: Some(details.cluster.region),
        })
    }

    fn get_kubeconfig(&self, name: &str) -> Result<String, CloudError> {
        let result =
            self.eks
                .setup_kubeconfig(name, &self.region, &KubeconfigOptions::default())?;
        result.contents.ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "GetKubeconfig",
                "kubeconfig contents were not materialized",
            )
        })
    }

    fn list_regions(&self) -> Result<Vec<String>, CloudError> {
        self.regions.list_regions()
    }

    fn current_region(&self) -> String {
        self.region.clone()
    }

    fn set_region(&mut self, region: &str) {
        self.region = region.to_owned();
        // The observability stack is region-scoped; rebuild it in place
        self.cloudwatch = CloudWatchManager::new(
            self.invoker.clone(),
            region,
            &self.metrics.observability,
            &self.logger,
        );
    }
}

mod azure_wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    pub(super) struct Version {
        #[serde(rename = "azure-cli")]
        pub azure_cli: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Account {
        pub id: String,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Acr {
        pub name: String,
        #[serde(rename = "loginServer")]
        pub login_server: Option<String>,
        pub location: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Aks {
        pub name: String,
        pub location: Option<String>,
        #[serde(rename = "provisioningState")]
        pub provisioning_state: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Location {
        pub name: String,
    }
}

/// The Azure provider satisfies the base capability set only; the deeper
/// subsystem surfaces are AWS-specific.
#[derive(Clone, Debug)]
pub struct AzureProvider {
    invoker: CliInvoker,
    region: String,
}

impl AzureProvider {
    pub fn new(config: ProviderConfig, parent_logger: &Logger, metrics: &MetricsBundle) -> Self {
        let logger = parent_logger.new(o!(event::PROVIDER => "azure"));
        let invoker =
            CliInvoker::azure(&logger, &metrics.cli).with_timeout(config.cli_timeout());
        AzureProvider {
            invoker,
            region: config.region.unwrap_or_else(|| "eastus".to_owned()),
        }
    }
}

impl CloudProvider for AzureProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn detect_cli(&self) -> CliStatus {
        match self.cli_version() {
            Ok(version) => CliStatus {
                installed: true,
                version: Some(version),
            },
            Err(_) => CliStatus {
                installed: false,
                version: None,
            },
        }
    }

    fn validate_cli(&self) -> Result<(), CloudError> {
        self.cli_version().map(|_| ())
    }

    fn cli_version(&self) -> Result<String, CloudError> {
        let version: azure_wire::Version = self
            .invoker
            .run_json("Version", &["version", "--output", "json"])?;
        version.azure_cli.ok_or_else(|| {
            CloudError::new(
                "azure",
                ErrorKind::Unknown,
                "Version",
                "version output did not name the CLI",
            )
        })
    }

    fn validate_auth(&self) -> Result<(), CloudError> {
        self.invoker
            .run("AccountShow", &["account", "show", "--output", "json"])
            .map(|_| ())
    }

    fn get_credentials(&self) -> Result<Credentials, CloudError> {
        let account: azure_wire::Account = self
            .invoker
            .run_json("AccountShow", &["account", "show", "--output", "json"])?;
        // Managed-identity environments announce themselves through the
        // MSI/identity endpoint variables
        let auth_method = if std::env::var("MSI_ENDPOINT").is_ok()
            || std::env::var("IDENTITY_ENDPOINT").is_ok()
        {
            AuthMethod::InstanceMetadata
        } else if std::env::var("AZURE_CLIENT_ID").is_ok()
            && std::env::var("AZURE_CLIENT_SECRET").is_ok()
        {
            AuthMethod::Environment
        } else {
            AuthMethod::Profile
        };

        let mut properties = HashMap::new();
        if let Ok(tenant_id) = std::env::var("AZURE_TENANT_ID") {
            properties.insert("tenant_id".to_owned(), tenant_id);
        }
        if let Ok(subscription_id) = std::env::var("AZURE_SUBSCRIPTION_ID") {
            properties.insert("subscription_id".to_owned(), subscription_id);
        }

        Ok(Credentials {
            provider: ProviderKind::Azure,
            auth_method,
            profile: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            expiry: None,
            account_id: Some(account.id),
            region: Some(self.region.clone()),
            properties,
        })
    }

    fn list_registries(&self) -> Result<Vec<Registry>, CloudError> {
        let registries: Vec<azure_wire::Acr> = self
            .invoker
            .run_json("AcrList", &["acr", "list", "--output", "json"])?;
        Ok(registries
            .into_iter()
            .map(|registry| Registry {
                uri: registry
                    .login_server
                    .unwrap_or_else(|| format!("{}.azurecr.io", registry.name)),
                region: registry.location,
                name: registry.name,
            })
            .collect())
    }

    fn get_registry(&self, name: &str) -> Result<Registry, CloudError> {
        let registry: azure_wire::Acr = self.invoker.run_json(
            "AcrShow",
            &["acr", "show", "--name", name, "--output", "json"],
        )?;
        Ok(Registry {
            uri: registry
                .login_server
                .unwrap_or_else(|| format!("{}.azurecr.io", registry.name)),
            region: registry.location,
            name: registry.name,
        })
    }

    fn authenticate_registry(&self, name: &str) -> Result<(), CloudError> {
        self.invoker
            .run("AcrLogin", &["acr", "login", "--name", name])
            .map(|_| ())
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>, CloudError> {
        let clusters: Vec<azure_wire::Aks> = self
            .invoker
            .run_json("AksList", &["aks", "list", "--output", "json"])?;
        Ok(clusters
            .into_iter()
            .map(|cluster| Cluster {
                name: cluster.name,
                status: cluster.provisioning_state,
                region: cluster.location,
            })
            .collect())
    }

    fn get_cluster(&self, name: &str) -> Result<Cluster, CloudError> {
        self.list_clusters()?
            .into_iter()
            .find(|cluster| cluster.name == name)
            .ok_or_else(|| {
                CloudError::new(
                    "azure",
                    ErrorKind::ObjectNotFound,
                    "AksShow",
                    format!("cluster {name} not found"),
                )
            })
    }

    fn get_kubeconfig(&self, name: &str) -> Result<String, CloudError> {
        let stdout = self.invoker.run(
            "AksGetCredentials",
            &["aks", "get-credentials", "--name", name, "--file", "-"],
        )?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    fn list_regions(&self) -> Result<Vec<String>, CloudError> {
        let locations: Vec<azure_wire::Location> = self.invoker.run_json(
            "ListLocations",
            &["account", "list-locations", "--output", "json"],
        )?;
        Ok(locations.into_iter().map(|location| location.name).collect())
    }

    fn current_region(&self) -> String {
        self.region.clone()
    }

    fn set_region(&mut self, region: &str) {
        self.region = region.to_owned();
    }
}

mod gcp_wire {
    use super::Deserialize;

    #[derive(Debug, Deserialize)]
    pub(super) struct Version {
        #[serde(rename = "Google Cloud SDK")]
        pub sdk: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct AuthAccount {
        pub account: String,
        pub status: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct ArtifactRepository {
        pub name: String,
        pub format: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct GkeCluster {
        pub name: String,
        pub status: Option<String>,
        pub location: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    pub(super) struct Region {
        pub name: String,
    }
}

/// The GCP provider satisfies the base capability set only.
#[derive(Clone, Debug)]
pub struct GcpProvider {
    invoker: CliInvoker,
    region: String,
}

impl GcpProvider {
    pub fn new(config: ProviderConfig, parent_logger: &Logger, metrics: &MetricsBundle) -> Self {
        let logger = parent_logger.new(o!(event::PROVIDER => "gcp"));
        let invoker = CliInvoker::gcp(&logger, &metrics.cli).with_timeout(config.cli_timeout());
        GcpProvider {
            invoker,
            region: config.region.unwrap_or_else(|| "us-central1".to_owned()),
        }
    }
}

impl CloudProvider for GcpProvider {
    fn name(&self) -> &'static str {
        "gcp"
    }

    fn detect_cli(&self) -> CliStatus {
        match self.cli_version() {
            Ok(version) => CliStatus {
                installed: true,
                version: Some(version),
            },
            Err(_) => CliStatus {
                installed: false,
                version: None,
            },
        }
    }

    fn validate_cli(&self) -> Result<(), CloudError> {
        self.cli_version().map(|_| ())
    }

    fn cli_version(&self) -> Result<String, CloudError> {
        let version: gcp_wire::Version = self
            .invoker
            .run_json("Version", &["version", "--format", "json"])?;
        version.sdk.ok_or_else(|| {
            CloudError::new(
                "gcp",
                ErrorKind::Unknown,
                "Version",
                "version output did not name the SDK",
            )
        })
    }

    fn validate_auth(&self) -> Result<(), CloudError> {
        let accounts: Vec<gcp_wire::AuthAccount> = self
            .invoker
            .run_json("AuthList", &["auth", "list", "--format", "json"])?;
        if accounts
            .iter()
            .any(|account| account.status.as_deref() == Some("ACTIVE"))
        {
            Ok(())
        } else {
            Err(CloudError::new(
                "gcp",
                ErrorKind::AccessDenied,
                "AuthList",
                "no active gcloud account",
            ))
        }
    }

    fn get_credentials(&self) -> Result<Credentials, CloudError> {
        let accounts: Vec<gcp_wire::AuthAccount> = self
            .invoker
            .run_json("AuthList", &["auth", "list", "--format", "json"])?;
        let active = accounts
            .into_iter()
            .find(|account| account.status.as_deref() == Some("ACTIVE"));

        let mut properties = HashMap::new();
        let auth_method = match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            Ok(key_file) => {
                properties.insert("credentials_file".to_owned(), key_file);
                AuthMethod::Static
            }
            Err(_) => AuthMethod::Profile,
        };
        if let Ok(project) = std::env::var("GCLOUD_PROJECT") {
            properties.insert("project".to_owned(), project);
        }
        if let Some(account) = &active {
            properties.insert("account".to_owned(), account.account.clone());
        }

        Ok(Credentials {
            provider: ProviderKind::Gcp,
            auth_method,
            profile: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            expiry: None,
            account_id: None,
            region: Some(self.region.clone()),
            properties,
        })
    }

    fn list_registries(&self) -> Result<Vec<Registry>, CloudError> {
        let repositories: Vec<gcp_wire::ArtifactRepository> = self.invoker.run_json(
            "ArtifactsRepositoriesList",
            &["artifacts", "repositories", "list", "--format", "json"],
        )?;
        Ok(repositories
            .into_iter()
            .filter(|repository| {
                repository
                    .format
                    .as_deref()
                    .map(|format| format.eq_ignore_ascii_case("docker"))
                    .unwrap_or(true)
            })
            .map(|repository| Registry {
                uri: repository.name.clone(),
                name: repository
                    .name
                    .rsplit('/')
                    .next()
                    .unwrap_or(&repository.name)
                    .to_owned(),
                region: Some(self.region.clone()),
            })
            .collect())
    }

    fn get_registry(&self, name: &str) -> Result<Registry, CloudError> {
        self.list_registries()?
            .into_iter()
            .find(|registry| registry.name == name)
            .ok_or_else(|| {
                CloudError::new(
                    "gcp",
                    ErrorKind::ObjectNotFound,
                    "ArtifactsRepositoriesList",
                    format!("repository {name} not found"),
                )
            })
    }

    fn authenticate_registry(&self, name: &str) -> Result<(), CloudError> {
        self.invoker
            .run(
                "AuthConfigureDocker",
                &["auth", "configure-docker", name, "--quiet"],
            )
            .map(|_| ())
    }

    fn list_clusters(&self) -> Result<Vec<Cluster>, CloudError> {
        let clusters: Vec<gcp_wire::GkeCluster> = self.invoker.run_json(
            "ContainerClustersList",
            &["container", "clusters", "list", "--format", "json"],
        )?;
        Ok(clusters
            .into_iter()
            .map(|cluster| Cluster {
                name: cluster.name,
                status: cluster.status,
                region: cluster.location,
            })
            .collect())
    }

    fn get_cluster(&self, name: &str) -> Result<Cluster, CloudError> {
        self.list_clusters()?
            .into_iter()
            .find(|cluster| cluster.name == name)
            .ok_or_else(|| {
                CloudError::new(
                    "gcp",
                    ErrorKind::ObjectNotFound,
                    "ContainerClustersList",
                    format!("cluster {name} not found"),
                )
            })
    }

    fn get_kubeconfig(&self, name: &str) -> Result<String, CloudError> {
        // get-credentials writes to whatever KUBECONFIG points at, so point
        // it at a scratch file and read that back
        let scratch = tempfile::NamedTempFile::new().map_err(|e| {
            CloudError::new(
                "gcp",
                ErrorKind::InternalError,
                "GetKubeconfig",
                "failed to create temporary kubeconfig",
            )
            .with_cause(e)
        })?;
        let path = scratch.path().to_string_lossy().into_owned();
        self.invoker.run_with_env(
            "ContainerClustersGetCredentials",
            &[
                "container",
                "clusters",
                "get-credentials",
                name,
                "--region",
                &self.region,
            ],
            &[("KUBECONFIG", &path)],
        )?;
        std::fs::read_to_string(scratch.path()).map_err(|e| {
            CloudError::new(
                "gcp",
                ErrorKind::InternalError,
                "GetKubeconfig",
                "failed to read temporary kubeconfig",
            )
            .with_cause(e)
        })
    }

    fn list_regions(&self) -> Result<Vec<String>, CloudError> {
        let regions: Vec<gcp_wire::Region> = self.invoker.run_json(
            "ComputeRegionsList",
            &["compute", "regions", "list", "--format", "json"],
        )?;
        Ok(regions.into_iter().map(|region| region.name).collect())
    }

    fn current_region(&self) -> String {
        self.region.clone()
    }

    fn set_region(&mut self, region: &str) {
        self.region = region.to_owned();
    }
}

/// Builds one provider per cloud from configuration.
#[derive(Clone, Debug)]
pub struct ProviderFactory {
    metrics: MetricsBundle,
    logger: Logger,
}

impl ProviderFactory {
    pub fn new(parent_logger: &Logger, metrics: &MetricsBundle) -> Self {
        ProviderFactory {
            metrics: metrics.clone(),
            logger: parent_logger.new(o!()),
        }
    }

    pub fn create(&self, config: ProviderConfig) -> Box<dyn CloudProvider> {
        match config.kind {
            ProviderKind::Aws => Box::new(AwsProvider::new(config, &self.logger, &self.metrics)),
            ProviderKind::Azure => {
                Box::new(AzureProvider::new(config, &self.logger, &self.metrics))
            }
            ProviderKind::Gcp => Box::new(GcpProvider::new(config, &self.logger, &self.metrics)),
        }
    }

    /// The AWS provider with its full sub-manager surface, for callers that
    /// need more than the capability set.
    pub fn create_aws(&self, config: ProviderConfig) -> AwsProvider {
        AwsProvider::new(config, &self.logger, &self.metrics)
    }
}

/// Caches one provider per cloud, vending shared clones.
#[derive(Debug)]
pub struct ProviderManager {
    factory: ProviderFactory,
    providers: std::sync::Mutex<HashMap<ProviderKind, Box<dyn CloudProvider>>>,
}

impl ProviderManager {
    pub fn new(factory: ProviderFactory) -> Self {
        ProviderManager {
            factory,
            providers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Returns the provider for `config.kind`, constructing it on first use.
    /// Clones share the underlying manager state.
    pub fn provider(&self, config: &ProviderConfig) -> Box<dyn CloudProvider> {
        let mut providers = self.providers.lock().unwrap();
        providers
            .entry(config.kind)
            .or_insert_with(|| self.factory.create(config.clone()))
            .clone()
    }
}
