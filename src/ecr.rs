//! ECR registry discovery, token caching and Docker authentication.

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
    work_queue::WorkQueue,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use derivative::Derivative;
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread,
    time::{Duration as StdDuration, Instant},
};

/// Authorization tokens are valid for 12 hours from issuance.
const TOKEN_LIFETIME_HOURS: i64 = 12;

/// Cached tokens are treated as stale this long before they expire.
const TOKEN_STALE_MARGIN_MINUTES: i64 = 5;

const DEFAULT_PER_REGION_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// A cached registry authorization token.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct EcrToken {
    #[derivative(Debug = "ignore")]
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub registry: String,
    pub region: String,
}

impl EcrToken {
    /// Whether the token is within the safety margin of its expiry.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at - Duration::minutes(TOKEN_STALE_MARGIN_MINUTES)
    }

    /// The docker login password encoded in the token, which decodes from
    /// base64 as `AWS:{password}`.
    fn password(&self) -> Result<String, CloudError> {
        let decoded = BASE64.decode(&self.token).map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::Unknown,
                "GetEcrToken",
                "authorization token is not valid base64",
            )
            .with_cause(e)
        })?;
        let text = String::from_utf8_lossy(&decoded);
        match text.split_once(':') {
            Some((_, password)) => Ok(password.to_owned()),
            None => Err(CloudError::new(
                "aws",
                ErrorKind::Unknown,
                "GetEcrToken",
                "authorization token is not in user:password form",
            )),
        }
    }
}

/// An ECR repository descriptor.
#[derive(Clone, Debug)]
pub struct Repository {
    pub name: String,
    pub uri: String,
    pub arn: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Options for the multi-region login fan-out.
#[derive(Clone, Debug)]
pub struct EcrLoginOptions {
    pub account_id: String,
    pub regions: Vec<String>,
    /// When true, regions authenticate on concurrent workers; otherwise the
    /// list is walked sequentially.
    pub parallel: bool,
    pub per_region_timeout: StdDuration,
}

impl EcrLoginOptions {
    pub fn new(account_id: impl Into<String>, regions: Vec<String>) -> Self {
        EcrLoginOptions {
            account_id: account_id.into(),
            regions,
            parallel: true,
            per_region_timeout: DEFAULT_PER_REGION_TIMEOUT,
        }
    }
}

/// Aggregate outcome of a multi-region login.
#[derive(Clone, Debug)]
pub struct EcrLoginReport {
    pub started_at: DateTime<Utc>,
    pub duration: StdDuration,
    pub success: bool,
    /// Regions that authenticated successfully.
    pub regions: Vec<String>,
    /// One `{region}: {error}` entry per failed region.
    pub errors: Vec<String>,
}

/// Options for the staged build-and-push pipeline.
#[derive(Clone, Debug)]
pub struct BuildPushOptions {
    pub dockerfile: PathBuf,
    pub context_dir: PathBuf,
    pub account_id: String,
    pub region: String,
    pub repository: String,
    pub tag: String,
}

impl BuildPushOptions {
    fn registry(&self) -> String {
        registry_host(&self.account_id, &self.region)
    }

    fn local_image(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    fn remote_image(&self) -> String {
        format!("{}/{}:{}", self.registry(), self.repository, self.tag)
    }
}

/// One stage of the build-and-push pipeline.
#[derive(Clone, Debug)]
pub struct BuildPushStage {
    pub name: &'static str,
    pub duration: StdDuration,
    pub error: Option<String>,
}

/// Outcome of the build-and-push pipeline. The first stage failure aborts
/// the remaining stages, so `stages` may be shorter than the full pipeline.
#[derive(Clone, Debug)]
pub struct BuildPushReport {
    pub image_uri: String,
    pub success: bool,
    pub stages: Vec<BuildPushStage>,
    pub total_duration: StdDuration,
}

/// The registry host for an account and region.
pub fn registry_host(account_id: &str, region: &str) -> String {
    format!("{account_id}.dkr.ecr.{region}.amazonaws.com")
}

mod wire {
    use super::{DateTime, Deserialize, Utc};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GetAuthorizationTokenOutput {
        pub authorization_data: Vec<AuthorizationData>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct AuthorizationData {
        pub authorization_token: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct DescribeRepositoriesOutput {
        pub repositories: Vec<Repository>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Repository {
        pub repository_name: String,
        pub repository_uri: String,
        pub repository_arn: String,
        pub created_at: Option<DateTime<Utc>>,
    }
}

/// Manages ECR authentication and repository discovery. Cheap to clone; all
/// clones share one token cache.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct EcrManager {
    aws: CliInvoker,
    docker: CliInvoker,
    #[derivative(Debug = "ignore")]
    tokens: Arc<Mutex<HashMap<String, EcrToken>>>,
    #[derivative(Debug = "ignore")]
    logger: Logger,
}

impl EcrManager {
    pub fn new(aws: CliInvoker, docker: CliInvoker, parent_logger: &Logger) -> Self {
        EcrManager {
            aws,
            docker,
            tokens: Arc::new(Mutex::new(HashMap::new())),
            logger: parent_logger.new(o!()),
        }
    }

    /// Returns a copy of this manager whose CLI calls are bounded by
    /// `timeout`, sharing the same token cache.
    fn with_timeout(&self, timeout: StdDuration) -> Self {
        EcrManager {
            aws: self.aws.with_timeout(timeout),
            docker: self.docker.with_timeout(timeout),
            tokens: Arc::clone(&self.tokens),
            logger: self.logger.clone(),
        }
    }

    /// Returns the cached token for `registry` if it is not within the
    /// staleness margin; otherwise obtains a fresh one valid for 12 hours.
    pub fn get_token(&self, registry: &str, region: &str) -> Result<EcrToken, CloudError> {
        let key = token_key(registry, region);
        {
            let tokens = self.tokens.lock().unwrap();
            if let Some(token) = tokens.get(&key) {
                if !token.is_stale(Utc::now()) {
                    debug!(
                        self.logger, "using cached registry token";
                        event::REGISTRY => registry,
                    );
                    return Ok(token.clone());
                }
            }
        }

        info!(
            self.logger, "obtaining registry token";
            event::REGISTRY => registry,
            event::REGION => region,
        );
        let output: wire::GetAuthorizationTokenOutput = self.aws.run_json(
            "GetEcrToken",
            &[
                "ecr",
                "get-authorization-token",
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        let authorization = output.authorization_data.into_iter().next().ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::Unknown,
                "GetEcrToken",
                "no authorization data in response",
            )
        })?;

        let token = EcrToken {
            token: authorization.authorization_token,
            expires_at: Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS),
            registry: registry.to_owned(),
            region: region.to_owned(),
        };
        self.tokens.lock().unwrap().insert(key, token.clone());
        Ok(token)
    }

    /// Logs the local Docker daemon into `registry`, piping the token
    /// password over stdin. Daemon I/O errors are surfaced as-is.
    pub fn authenticate_registry(&self, registry: &str, region: &str) -> Result<(), CloudError> {
        let token = self.get_token(registry, region)?;
        let password = token.password()?;

        self.docker.run_with_stdin(
            "DockerLogin",
            &[
                "login",
                "--username",
                "AWS",
                "--password-stdin",
                registry,
            ],
            password.as_bytes(),
        )?;
        info!(self.logger, "authenticated registry"; event::REGISTRY => registry);
        Ok(())
    }

    /// Lists repositories in `region`.
    pub fn list_repositories(&self, region: &str) -> Result<Vec<Repository>, CloudError> {
        let output: wire::DescribeRepositoriesOutput = self.aws.run_json(
            "DescribeRepositories",
            &[
                "ecr",
                "describe-repositories",
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        Ok(output
            .repositories
            .into_iter()
            .map(|r| Repository {
                name: r.repository_name,
                uri: r.repository_uri,
                arn: r.repository_arn,
                created_at: r.created_at,
            })
            .collect())
    }

    /// Describes a single repository by name.
    pub fn get_repository(&self, name: &str, region: &str) -> Result<Repository, CloudError> {
        let output: wire::DescribeRepositoriesOutput = self.aws.run_json(
            "DescribeRepositories",
            &[
                "ecr",
                "describe-repositories",
                "--repository-names",
                name,
                "--region",
                region,
                "--output",
                "json",
            ],
        )?;
        output
            .repositories
            .into_iter()
            .next()
            .map(|r| Repository {
                name: r.repository_name,
                uri: r.repository_uri,
                arn: r.repository_arn,
                created_at: r.created_at,
            })
            .ok_or_else(|| {
                CloudError::new(
                    "aws",
                    ErrorKind::ObjectNotFound,
                    "DescribeRepositories",
                    format!("repository {name} not found"),
                )
            })
    }

    /// Authenticates the account's registry in every requested region,
    /// fanning out one worker per region when `parallel` is set. Failures in
    /// individual regions are collected rather than aborting the rest.
    pub fn login_with_optimization(&self, options: &EcrLoginOptions) -> EcrLoginReport {
        let started_at = Utc::now();
        let started = Instant::now();

        let outcomes: Vec<(String, Result<(), CloudError>)> = if options.parallel {
            let queue: WorkQueue<String, (String, Result<(), CloudError>)> =
                WorkQueue::new(options.regions.clone());
            let mut workers = Vec::with_capacity(options.regions.len());
            for _ in 0..options.regions.len() {
                let queue = queue.clone();
                let manager = self.with_timeout(options.per_region_timeout);
                let account_id = options.account_id.clone();
                workers.push(thread::spawn(move || {
                    while let Some(region) = queue.dequeue_job() {
                        let registry = registry_host(&account_id, &region);
                        let outcome = manager.authenticate_registry(&registry, &region);
                        queue.push_result((region, outcome));
                    }
                }));
            }
            for worker in workers {
                let _ = worker.join();
            }
            queue.into_results().unwrap_or_default()
        } else {
            let manager = self.with_timeout(options.per_region_timeout);
            options
                .regions
                .iter()
                .map(|region| {
                    let registry = registry_host(&options.account_id, region);
                    (
                        region.clone(),
                        manager.authenticate_registry(&registry, region),
                    )
                })
                .collect()
        };

        let mut regions = Vec::new();
        let mut errors = Vec::new();
        for (region, outcome) in outcomes {
            match outcome {
                Ok(()) => regions.push(region),
                Err(e) => errors.push(format!("{region}: {e}")),
            }
        }

        let report = EcrLoginReport {
            started_at,
            duration: started.elapsed(),
            success: errors.is_empty(),
            regions,
            errors,
        };
        info!(
            self.logger, "registry login fan-out finished";
            "success" => report.success,
            "regions_ok" => report.regions.len(),
            "regions_failed" => report.errors.len(),
        );
        report
    }

    /// Runs the staged build pipeline: prepare, ecr-auth, build, tag, push.
    /// Each stage records its own duration; the first failure aborts the
    /// remaining stages and the partial stage list is returned.
    pub fn build_and_push_image(&self, options: &BuildPushOptions) -> BuildPushReport {
        let total = Instant::now();
        let mut stages: Vec<BuildPushStage> = Vec::with_capacity(5);
        let image_uri = options.remote_image();

        let run_stage = |stages: &mut Vec<BuildPushStage>,
                         name: &'static str,
                         action: &dyn Fn() -> Result<(), CloudError>|
         -> bool {
            let started = Instant::now();
            let result = action();
            let failed = result.is_err();
            if let Err(ref e) = result {
                warn!(self.logger, "build stage failed"; "stage" => name, "error" => e.to_string());
            }
            stages.push(BuildPushStage {
                name,
                duration: started.elapsed(),
                error: result.err().map(|e| e.to_string()),
            });
            !failed
        };

        let registry = options.registry();
        let local_image = options.local_image();
        let dockerfile = options.dockerfile.to_string_lossy().into_owned();
        let context_dir = options.context_dir.to_string_lossy().into_owned();

        let ok = run_stage(&mut stages, "prepare", &|| {
            if !options.dockerfile.is_file() {
                return Err(CloudError::new(
                    "docker",
                    ErrorKind::InvalidRequest,
                    "BuildAndPushImage",
                    format!("Dockerfile {} does not exist", options.dockerfile.display()),
                ));
            }
            if !options.context_dir.is_dir() {
                return Err(CloudError::new(
                    "docker",
                    ErrorKind::InvalidRequest,
                    "BuildAndPushImage",
                    format!(
                        "build context {} does not exist",
                        options.context_dir.display()
                    ),
                ));
            }
            Ok(())
        }) && run_stage(&mut stages, "ecr-auth", &|| {
            self.authenticate_registry(&registry, &options.region)
        }) && run_stage(&mut stages, "build", &|| {
            self.docker
                .run(
                    "DockerBuild",
                    &["build", "-f", &dockerfile, "-t", &local_image, &context_dir],
                )
                .map(|_| ())
        }) && run_stage(&mut stages, "tag", &|| {
            self.docker
                .run("DockerTag", &["tag", &local_image, &image_uri])
                .map(|_| ())
        }) && run_stage(&mut stages, "push", &|| {
            self.docker
                .run("DockerPush", &["push", &image_uri])
                .map(|_| ())
        });

        BuildPushReport {
            image_uri,
            success: ok,
            stages,
            total_duration: total.elapsed(),
        }
    }
}

fn token_key(registry: &str, region: &str) -> String {
    format!("{registry}:{region}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        logging::setup_test_logging,
        metrics::CliMetricsCollector,
        test_utils::{line_count, FakeCli},
    };

    // base64("AWS:fake-password")
    const FAKE_TOKEN: &str = "QVdTOmZha2UtcGFzc3dvcmQ=";

    fn token_script() -> String {
        format!(
            "echo call >> \"$(dirname \"$0\")/calls\"\necho '{{\"authorizationData\":[{{\"authorizationToken\":\"{FAKE_TOKEN}\"}}]}}'"
        )
    }

    fn manager_for(aws: &FakeCli, docker: &FakeCli, metric_name: &str) -> EcrManager {
        let logger = setup_test_logging();
        let metrics = CliMetricsCollector::new_with_metric_name(metric_name).unwrap();
        let aws = CliInvoker::new("aws", aws.program(), &logger, &metrics);
        let docker = CliInvoker::new("docker", docker.program(), &logger, &metrics);
        EcrManager::new(aws, docker, &logger)
    }

    #[test]
    fn token_staleness_margin() {
        let now = Utc::now();
        let mut token = EcrToken {
            token: FAKE_TOKEN.into(),
            expires_at: now + Duration::hours(12),
            registry: "r".into(),
            region: "us-east-1".into(),
        };
        assert!(!token.is_stale(now));

        // Four minutes from expiry is inside the five-minute margin
        token.expires_at = now + Duration::minutes(4);
        assert!(token.is_stale(now));
        token.expires_at = now + Duration::minutes(6);
        assert!(!token.is_stale(now));
    }

    #[test]
    fn token_password_decodes() {
        let token = EcrToken {
            token: FAKE_TOKEN.into(),
            expires_at: Utc::now(),
            registry: "r".into(),
            region: "us-east-1".into(),
        };
        assert_eq!(token.password().unwrap(), "fake-password");
    }

    #[test]
    fn token_is_cached_per_registry_and_region() {
        let aws = FakeCli::new(&token_script());
        let docker = FakeCli::new("exit 0");
        let manager = manager_for(&aws, &docker, "ecr_token_cached");

        let registry = registry_host("111111111111", "us-east-1");
        let first = manager.get_token(&registry, "us-east-1").unwrap();
        let second = manager.get_token(&registry, "us-east-1").unwrap();
        assert_eq!(first.token, second.token);
        assert_eq!(line_count(&aws.scratch_path("calls")), 1);

        // A different region is a different cache entry
        manager.get_token(&registry, "us-west-2").unwrap();
        assert_eq!(line_count(&aws.scratch_path("calls")), 2);
    }

    #[test]
    fn token_lifetime_is_twelve_hours() {
        let aws = FakeCli::new(&token_script());
        let docker = FakeCli::new("exit 0");
        let manager = manager_for(&aws, &docker, "ecr_token_lifetime");

        let before = Utc::now();
        let token = manager.get_token("registry", "us-east-1").unwrap();
        let lifetime = token.expires_at - before;
        assert!(lifetime <= Duration::hours(12));
        assert!(lifetime > Duration::hours(12) - Duration::minutes(1));
    }

    #[test]
    fn parallel_login_aggregates_partial_failure() {
        // eu-west-1 is denied; the other regions succeed
        let aws = FakeCli::new(&format!(
            "case \"$*\" in *eu-west-1*) echo 'An error occurred (AccessDenied)' 1>&2; exit 1;; esac\n{}",
            token_script()
        ));
        let docker = FakeCli::new("cat > /dev/null; exit 0");
        let manager = manager_for(&aws, &docker, "ecr_parallel_login");

        let options = EcrLoginOptions::new(
            "111111111111",
            vec![
                "us-east-1".to_owned(),
                "us-west-2".to_owned(),
                "eu-west-1".to_owned(),
            ],
        );
        let report = manager.login_with_optimization(&options);

        assert!(!report.success);
        assert_eq!(report.regions.len(), 2);
        assert!(report.regions.contains(&"us-east-1".to_owned()));
        assert!(report.regions.contains(&"us-west-2".to_owned()));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("eu-west-1:"));
    }

    #[test]
    fn sequential_login_covers_all_regions() {
        let aws = FakeCli::new(&token_script());
        let docker = FakeCli::new("cat > /dev/null; exit 0");
        let manager = manager_for(&aws, &docker, "ecr_sequential_login");

        let mut options = EcrLoginOptions::new(
            "111111111111",
            vec!["us-east-1".to_owned(), "us-west-2".to_owned()],
        );
        options.parallel = false;
        let report = manager.login_with_optimization(&options);
        assert!(report.success);
        assert_eq!(report.regions.len(), 2);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn build_pipeline_aborts_on_first_failure() {
        let context = tempfile::TempDir::new().unwrap();
        let dockerfile = context.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();

        let aws = FakeCli::new(&token_script());
        // Login succeeds, build fails
        let docker = FakeCli::new(
            "case \"$1\" in login) cat > /dev/null; exit 0;; build) echo 'build failed' 1>&2; exit 1;; *) exit 0;; esac",
        );
        let manager = manager_for(&aws, &docker, "ecr_build_abort");

        let report = manager.build_and_push_image(&BuildPushOptions {
            dockerfile,
            context_dir: context.path().to_owned(),
            account_id: "111111111111".into(),
            region: "us-east-1".into(),
            repository: "apm/collector".into(),
            tag: "v1".into(),
        });

        assert!(!report.success);
        let names: Vec<&str> = report.stages.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["prepare", "ecr-auth", "build"]);
        assert!(report.stages[2].error.is_some());
        assert_eq!(
            report.image_uri,
            "111111111111.dkr.ecr.us-east-1.amazonaws.com/apm/collector:v1"
        );
    }

    #[test]
    fn build_pipeline_missing_dockerfile_fails_prepare() {
        let aws = FakeCli::new(&token_script());
        let docker = FakeCli::new("exit 0");
        let manager = manager_for(&aws, &docker, "ecr_build_missing_dockerfile");

        let report = manager.build_and_push_image(&BuildPushOptions {
            dockerfile: PathBuf::from("/nonexistent/Dockerfile"),
            context_dir: PathBuf::from("/nonexistent"),
            account_id: "111111111111".into(),
            region: "us-east-1".into(),
            repository: "apm/collector".into(),
            tag: "v1".into(),
        });

        assert!(!report.success);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].name, "prepare");
    }

    #[test]
    fn full_build_pipeline_runs_every_stage() {
        let context = tempfile::TempDir::new().unwrap();
        let dockerfile = context.path().join("Dockerfile");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();

        let aws = FakeCli::new(&token_script());
        let docker = FakeCli::new("case \"$1\" in login) cat > /dev/null;; esac; exit 0");
        let manager = manager_for(&aws, &docker, "ecr_build_full");

        let report = manager.build_and_push_image(&BuildPushOptions {
            dockerfile,
            context_dir: context.path().to_owned(),
            account_id: "111111111111".into(),
            region: "us-east-1".into(),
            repository: "apm/collector".into(),
            tag: "v1".into(),
        });

        assert!(report.success);
        let names: Vec<&str> = report.stages.iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["prepare", "ecr-auth", "build", "tag", "push"]);
        assert!(report.stages.iter().all(|s| s.error.is_none()));
    }
}
