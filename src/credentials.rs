//! Credential resolution, role assumption and role chaining.
//!
//! Credentials are resolved through a fixed source chain (explicit
//! configuration, process environment, CLI profile, instance metadata) and
//! memoized per provider. Role assumption wraps `sts assume-role` with the
//! full option surface (external id, MFA, session policy, tags, source
//! identity); chains execute strictly sequentially with each step running
//! under the previous step's temporary credentials.

use crate::{
    cli::CliInvoker,
    config::{ProviderConfig, ProviderKind},
    error::{CloudError, ErrorKind},
    logging::event,
    region::RegionResolver,
};
use chrono::{DateTime, Duration, Utc};
use derivative::Derivative;
use serde::Deserialize;
use serde_json::Value;
use slog::{debug, info, o, warn, Logger};
use std::{
    collections::HashMap,
    env,
    sync::{Arc, RwLock},
};

/// How soon before expiry a credential is considered stale and re-resolved.
const REFRESH_THRESHOLD_SECONDS: i64 = 300;

/// Environment variables making up the AWS credential family. The role-chain
/// guard snapshots exactly this set.
const CREDENTIAL_ENV_VARS: &[&str] = &[
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// How a set of credentials was obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AuthMethod {
    Static,
    Environment,
    Profile,
    InstanceMetadata,
    AssumedRole,
}

/// A capability bundle for one provider identity.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct Credentials {
    pub provider: ProviderKind,
    pub auth_method: AuthMethod,
    pub profile: Option<String>,
    pub access_key_id: Option<String>,
    #[derivative(Debug = "ignore")]
    pub secret_access_key: Option<String>,
    #[derivative(Debug = "ignore")]
    pub session_token: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub properties: HashMap<String, String>,
}

impl Credentials {
    fn empty(provider: ProviderKind, auth_method: AuthMethod) -> Self {
        Credentials {
            provider,
            auth_method,
            profile: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            expiry: None,
            account_id: None,
            region: None,
            properties: HashMap::new(),
        }
    }

    /// Whether these credentials are usable for at least `refresh_threshold`
    /// longer. Credentials with no expiry are always fresh.
    pub fn is_fresh(&self, refresh_threshold: Duration) -> bool {
        match self.expiry {
            Some(expiry) => Utc::now() + refresh_threshold < expiry,
            None => true,
        }
    }
}

/// The identity of the current caller, per `sts get-caller-identity`.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// Options controlling a single role assumption.
#[derive(Clone, Debug, Default)]
pub struct AssumeRoleOptions {
    pub session_name: Option<String>,
    pub external_id: Option<String>,
    pub mfa_serial: Option<String>,
    pub mfa_token: Option<String>,
    /// Defaults to 3600 seconds.
    pub duration_seconds: Option<i64>,
    /// An inline session policy document.
    pub session_policy: Option<String>,
    pub policy_arns: Vec<String>,
    pub tags: HashMap<String, String>,
    pub transitive_tag_keys: Vec<String>,
    pub source_identity: Option<String>,
    /// Whether the cross-account session manager should keep the resulting
    /// session alive with background re-assumption.
    pub enable_auto_refresh: bool,
    /// How long before expiry the background worker re-assumes. Defaults to
    /// the crate-wide refresh threshold.
    pub refresh_threshold_seconds: Option<i64>,
}

impl AssumeRoleOptions {
    pub fn refresh_threshold(&self) -> Duration {
        Duration::seconds(
            self.refresh_threshold_seconds
                .unwrap_or(REFRESH_THRESHOLD_SECONDS),
        )
    }
}

/// One step of a role-assumption chain.
#[derive(Clone, Debug)]
pub struct ChainStep {
    pub role_arn: String,
    pub options: AssumeRoleOptions,
}

/// Result of inspecting whether (and how) a role can be assumed.
#[derive(Clone, Debug)]
pub struct RoleAssumptionReport {
    pub role_arn: String,
    pub requires_external_id: bool,
    pub requires_mfa: bool,
    pub max_session_duration: i64,
    pub caller_can_assume: bool,
}

mod wire {
    use super::{DateTime, Deserialize, Utc};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct AssumeRoleOutput {
        pub credentials: StsCredentials,
        pub assumed_role_user: AssumedRoleUser,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct StsCredentials {
        pub access_key_id: String,
        pub secret_access_key: String,
        pub session_token: String,
        pub expiration: DateTime<Utc>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct AssumedRoleUser {
        pub arn: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetRoleOutput {
        pub role: Role,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Role {
        pub assume_role_policy_document: serde_json::Value,
        #[serde(default = "super::default_max_session_duration")]
        pub max_session_duration: i64,
    }
}

fn default_max_session_duration() -> i64 {
    3600
}

/// Extracts the account id from an IAM ARN like
/// `arn:aws:iam::222222222222:role/APMReader`.
pub(crate) fn account_id_from_arn(arn: &str) -> Option<String> {
    arn.split(':').nth(4).filter(|s| !s.is_empty()).map(String::from)
}

fn role_name_from_arn(arn: &str) -> Option<&str> {
    arn.rsplit_once("role/").map(|(_, name)| name)
}

/// Assumes `role_arn` with the given options using whatever identity the
/// `aws` CLI currently resolves (ambient credentials or the chain-step
/// environment installed by [`assume_role_chain`]).
pub(crate) fn assume_role(
    invoker: &CliInvoker,
    logger: &Logger,
    role_arn: &str,
    options: &AssumeRoleOptions,
) -> Result<Credentials, CloudError> {
    let session_name = options
        .session_name
        .clone()
        .unwrap_or_else(|| format!("apm-session-{}", Utc::now().timestamp()));
    let duration = options.duration_seconds.unwrap_or(3600).to_string();

    let logger = logger.new(o!(
        event::ROLE_ARN => role_arn.to_owned(),
        event::SESSION_NAME => session_name.clone(),
    ));
    info!(logger, "assuming role");

    let mut args: Vec<String> = vec![
        "sts".into(),
        "assume-role".into(),
        "--role-arn".into(),
        role_arn.into(),
        "--role-session-name".into(),
        session_name.clone(),
        "--duration-seconds".into(),
        duration,
    ];
    if let Some(external_id) = &options.external_id {
        args.push("--external-id".into());
        args.push(external_id.clone());
    }
    if let (Some(serial), Some(token)) = (&options.mfa_serial, &options.mfa_token) {
        args.push("--serial-number".into());
        args.push(serial.clone());
        args.push("--token-code".into());
        args.push(token.clone());
    }
    if let Some(policy) = &options.session_policy {
        args.push("--policy".into());
        args.push(policy.clone());
    }
    if !options.policy_arns.is_empty() {
        args.push("--policy-arns".into());
        for arn in &options.policy_arns {
            args.push(format!("arn={arn}"));
        }
    }
    if !options.tags.is_empty() {
        args.push("--tags".into());
        for (key, value) in &options.tags {
            args.push(format!("Key={key},Value={value}"));
        }
    }
    if !options.transitive_tag_keys.is_empty() {
        args.push("--transitive-tag-keys".into());
        args.extend(options.transitive_tag_keys.iter().cloned());
    }
    if let Some(source_identity) = &options.source_identity {
        args.push("--source-identity".into());
        args.push(source_identity.clone());
    }
    args.push("--output".into());
    args.push("json".into());

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let stdout = invoker.run("AssumeRole", &arg_refs)?;
    parse_assume_role_output(&stdout, role_arn, &session_name)
}

/// Maps the CLI's assume-role output into domain credentials.
fn parse_assume_role_output(
    stdout: &[u8],
    role_arn: &str,
    session_name: &str,
) -> Result<Credentials, CloudError> {
    let output: wire::AssumeRoleOutput = serde_json::from_slice(stdout).map_err(|e| {
        CloudError::new(
            "aws",
            ErrorKind::Unknown,
            "AssumeRole",
            "failed to decode assume-role output",
        )
        .with_cause(e)
    })?;

    let mut credentials = Credentials::empty(ProviderKind::Aws, AuthMethod::AssumedRole);
    credentials.access_key_id = Some(output.credentials.access_key_id);
    credentials.secret_access_key = Some(output.credentials.secret_access_key);
    credentials.session_token = Some(output.credentials.session_token);
    credentials.expiry = Some(output.credentials.expiration);
    credentials.account_id = account_id_from_arn(role_arn);
    credentials
        .properties
        .insert("role_arn".to_owned(), role_arn.to_owned());
    credentials
        .properties
        .insert("session_name".to_owned(), session_name.to_owned());
    credentials.properties.insert(
        "assumed_role_arn".to_owned(),
        output.assumed_role_user.arn,
    );
    Ok(credentials)
}

/// Snapshot of the credential environment variables, restored on drop.
///
/// The role-chain path must mutate the process environment so each chain step
/// executes under the previous step's credentials; the snapshot is taken once
/// at chain entry and restored once on every exit path. Because the
/// environment is process-wide, chains must not run concurrently within one
/// process.
pub struct EnvCredentialGuard {
    saved: Vec<(&'static str, Option<String>)>,
}

impl EnvCredentialGuard {
    pub fn capture() -> Self {
        EnvCredentialGuard {
            saved: CREDENTIAL_ENV_VARS
                .iter()
                .map(|&key| (key, env::var(key).ok()))
                .collect(),
        }
    }

    /// Installs `credentials` into the environment for subsequent CLI calls.
    fn install(credentials: &Credentials) {
        match &credentials.access_key_id {
            Some(value) => env::set_var("AWS_ACCESS_KEY_ID", value),
            None => env::remove_var("AWS_ACCESS_KEY_ID"),
        }
        match &credentials.secret_access_key {
            Some(value) => env::set_var("AWS_SECRET_ACCESS_KEY", value),
            None => env::remove_var("AWS_SECRET_ACCESS_KEY"),
        }
        match &credentials.session_token {
            Some(value) => env::set_var("AWS_SESSION_TOKEN", value),
            None => env::remove_var("AWS_SESSION_TOKEN"),
        }
    }
}

impl Drop for EnvCredentialGuard {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}

/// Assumes each step of `chain` in order, executing step N under step N−1's
/// credentials. Returns the credentials of every step; the last entry is the
/// operative identity. The process environment is restored on all exit paths.
///
/// Not safe to call concurrently with another chain in the same process.
pub fn assume_role_chain(
    invoker: &CliInvoker,
    logger: &Logger,
    chain: &[ChainStep],
) -> Result<Vec<Credentials>, CloudError> {
    if chain.is_empty() {
        return Err(CloudError::new(
            "aws",
            ErrorKind::InvalidRequest,
            "AssumeRoleChain",
            "role chain must contain at least one step",
        ));
    }

    let _guard = EnvCredentialGuard::capture();
    let mut results = Vec::with_capacity(chain.len());

    for (index, step) in chain.iter().enumerate() {
        debug!(
            logger, "assuming chain step";
            "step" => index,
            event::ROLE_ARN => &step.role_arn,
        );
        let credentials = assume_role(invoker, logger, &step.role_arn, &step.options)
            .map_err(|e| e.in_operation(format!("AssumeRoleChain[{index}]")))?;
        // The next step's CLI call must run under this step's tokens
        EnvCredentialGuard::install(&credentials);
        results.push(credentials);
    }

    Ok(results)
}

/// Inspects `role_arn`'s trust policy and reports what the assumption would
/// require of the caller.
pub fn validate_role_assumption(
    invoker: &CliInvoker,
    logger: &Logger,
    caller: Option<&CallerIdentity>,
    role_arn: &str,
) -> Result<RoleAssumptionReport, CloudError> {
    let role_name = role_name_from_arn(role_arn).ok_or_else(|| {
        CloudError::new(
            "aws",
            ErrorKind::InvalidRequest,
            "ValidateRoleAssumption",
            format!("{role_arn} is not a role ARN"),
        )
    })?;

    debug!(logger, "inspecting trust policy"; event::ROLE_ARN => role_arn);
    let output: wire::GetRoleOutput = invoker.run_json(
        "GetRole",
        &["iam", "get-role", "--role-name", role_name, "--output", "json"],
    )?;

    let policy = decode_policy_document(&output.role.assume_role_policy_document);
    let (requires_external_id, requires_mfa, caller_can_assume) =
        analyze_trust_policy(&policy, caller.map(|c| c.account.as_str()));

    Ok(RoleAssumptionReport {
        role_arn: role_arn.to_owned(),
        requires_external_id,
        requires_mfa,
        max_session_duration: output.role.max_session_duration,
        caller_can_assume,
    })
}

/// The CLI usually returns the trust policy URL-decoded into a JSON object,
/// but older versions hand back the raw URL-encoded string.
fn decode_policy_document(document: &Value) -> Value {
    match document {
        Value::String(encoded) => {
            let decoded = percent_decode(encoded);
            serde_json::from_str(&decoded).unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Walks the trust policy statements and reports `(requires_external_id,
/// requires_mfa, caller_can_assume)`.
fn analyze_trust_policy(policy: &Value, caller_account: Option<&str>) -> (bool, bool, bool) {
    let statements: Vec<&Value> = match &policy["Statement"] {
        Value::Array(list) => list.iter().collect(),
        Value::Object(_) => vec![&policy["Statement"]],
        _ => Vec::new(),
    };

    let mut requires_external_id = false;
    let mut requires_mfa = false;
    let mut caller_can_assume = false;

    for statement in statements {
        if statement["Effect"].as_str() != Some("Allow") {
            continue;
        }
        let actions: Vec<&str> = match &statement["Action"] {
            Value::String(action) => vec![action.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !actions.iter().any(|a| *a == "sts:AssumeRole" || *a == "sts:*") {
            continue;
        }

        let condition = &statement["Condition"];
        if condition["StringEquals"].get("sts:ExternalId").is_some() {
            requires_external_id = true;
        }
        if condition["Bool"]["aws:MultiFactorAuthPresent"].as_str() == Some("true") {
            requires_mfa = true;
        }

        let principals: Vec<&str> = match &statement["Principal"]["AWS"] {
            Value::String(principal) => vec![principal.as_str()],
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            _ => {
                if statement["Principal"].as_str() == Some("*") {
                    vec!["*"]
                } else {
                    Vec::new()
                }
            }
        };
        if let Some(account) = caller_account {
            if principals.iter().any(|p| *p == "*" || p.contains(account)) {
                caller_can_assume = true;
            }
        }
    }

    (requires_external_id, requires_mfa, caller_can_assume)
}

struct MemoizedCredentials {
    credentials: Credentials,
    fetched_at: DateTime<Utc>,
}

/// The on-disk shape of memoized credentials, mirroring the vendor CLI's own
/// session cache file.
#[derive(Debug, Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedCredentials {
    auth_method: String,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    expiry: Option<DateTime<Utc>>,
    account_id: Option<String>,
    region: Option<String>,
    fetched_at: DateTime<Utc>,
}

/// The default location of the file-backed credential cache.
pub fn default_cache_path() -> std::path::PathBuf {
    std::env::temp_dir().join("multicloud").join("credentials.json")
}

fn auth_method_name(method: AuthMethod) -> &'static str {
    match method {
        AuthMethod::Static => "static",
        AuthMethod::Environment => "environment",
        AuthMethod::Profile => "profile",
        AuthMethod::InstanceMetadata => "instance-metadata",
        AuthMethod::AssumedRole => "assumed-role",
    }
}

fn auth_method_from_name(name: &str) -> Option<AuthMethod> {
    match name {
        "static" => Some(AuthMethod::Static),
        "environment" => Some(AuthMethod::Environment),
        "profile" => Some(AuthMethod::Profile),
        "instance-metadata" => Some(AuthMethod::InstanceMetadata),
        "assumed-role" => Some(AuthMethod::AssumedRole),
        _ => None,
    }
}

/// Resolves and memoizes the provider's base credentials.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct CredentialStore {
    config: ProviderConfig,
    invoker: CliInvoker,
    #[derivative(Debug = "ignore")]
    regions: RegionResolver,
    #[derivative(Debug = "ignore")]
    memo: Arc<RwLock<Option<MemoizedCredentials>>>,
    /// Optional file backing the memo across process restarts.
    cache_file: Option<std::path::PathBuf>,
    #[derivative(Debug = "ignore")]
    logger: Logger,
}

impl CredentialStore {
    pub fn new(
        config: ProviderConfig,
        invoker: CliInvoker,
        regions: RegionResolver,
        parent_logger: &Logger,
    ) -> Self {
        CredentialStore {
            config,
            invoker,
            regions,
            memo: Arc::new(RwLock::new(None)),
            cache_file: None,
            logger: parent_logger.new(o!()),
        }
    }

    /// Backs the memo with a file so resolved credentials survive process
    /// restarts for their TTL.
    pub fn with_cache_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.cache_file = Some(path.into());
        self
    }

    /// Resolves the provider's current credentials, consulting the memoized
    /// result when it is within TTL and still fresh.
    pub fn get_credentials(&self) -> Result<Credentials, CloudError> {
        let ttl = self.config.credential_cache_ttl();
        {
            let memo = self.memo.read().unwrap();
            if let Some(cached) = memo.as_ref() {
                if Utc::now() < cached.fetched_at + ttl
                    && cached
                        .credentials
                        .is_fresh(Duration::seconds(REFRESH_THRESHOLD_SECONDS))
                {
                    debug!(self.logger, "using memoized credentials");
                    return Ok(cached.credentials.clone());
                }
            }
        }

        let mut memo = self.memo.write().unwrap();
        // Another caller may have resolved while we waited for the lock
        if let Some(cached) = memo.as_ref() {
            if Utc::now() < cached.fetched_at + ttl
                && cached
                    .credentials
                    .is_fresh(Duration::seconds(REFRESH_THRESHOLD_SECONDS))
            {
                return Ok(cached.credentials.clone());
            }
        }

        if let Some(persisted) = self.load_persisted(ttl) {
            debug!(self.logger, "loaded credentials from file cache");
            *memo = Some(MemoizedCredentials {
                credentials: persisted.clone(),
                fetched_at: Utc::now(),
            });
            return Ok(persisted);
        }

        let credentials = self.resolve()?;
        self.persist(&credentials);
        *memo = Some(MemoizedCredentials {
            credentials: credentials.clone(),
            fetched_at: Utc::now(),
        });
        Ok(credentials)
    }

    /// Reads the file cache, returning credentials only when both the cache
    /// TTL and the credentials' own freshness window still hold.
    fn load_persisted(&self, ttl: Duration) -> Option<Credentials> {
        let path = self.cache_file.as_ref()?;
        let file = std::fs::File::open(path).ok()?;
        let persisted: PersistedCredentials = serde_json::from_reader(file).ok()?;
        if Utc::now() >= persisted.fetched_at + ttl {
            return None;
        }

        let mut credentials = Credentials::empty(
            self.config.kind,
            auth_method_from_name(&persisted.auth_method)?,
        );
        credentials.access_key_id = persisted.access_key_id;
        credentials.secret_access_key = persisted.secret_access_key;
        credentials.session_token = persisted.session_token;
        credentials.expiry = persisted.expiry;
        credentials.account_id = persisted.account_id;
        credentials.region = persisted.region;
        if !credentials.is_fresh(Duration::seconds(REFRESH_THRESHOLD_SECONDS)) {
            return None;
        }
        Some(credentials)
    }

    /// Best-effort write of the resolved credentials to the file cache.
    fn persist(&self, credentials: &Credentials) {
        let path = match &self.cache_file {
            Some(path) => path,
            None => return,
        };
        let persisted = PersistedCredentials {
            auth_method: auth_method_name(credentials.auth_method).to_owned(),
            access_key_id: credentials.access_key_id.clone(),
            secret_access_key: credentials.secret_access_key.clone(),
            session_token: credentials.session_token.clone(),
            expiry: credentials.expiry,
            account_id: credentials.account_id.clone(),
            region: credentials.region.clone(),
            fetched_at: Utc::now(),
        };
        let outcome = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let file = options.open(path)?;
            serde_json::to_writer(file, &persisted)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        })();
        if let Err(e) = outcome {
            warn!(
                self.logger, "failed to persist credential cache";
                "error" => e.to_string(),
            );
        }
    }

    /// Drops the memoized credentials so the next call re-resolves.
    pub fn invalidate(&self) {
        *self.memo.write().unwrap() = None;
    }

    /// Asks STS who the ambient identity is.
    pub fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        self.invoker.run_json(
            "GetCallerIdentity",
            &["sts", "get-caller-identity", "--output", "json"],
        )
    }

    /// Assumes a role using the current ambient identity.
    pub fn assume_role_with_options(
        &self,
        role_arn: &str,
        options: &AssumeRoleOptions,
    ) -> Result<Credentials, CloudError> {
        assume_role(&self.invoker, &self.logger, role_arn, options)
    }

    /// Inspects whether the current caller could assume `role_arn`.
    pub fn validate_role_assumption(
        &self,
        role_arn: &str,
    ) -> Result<RoleAssumptionReport, CloudError> {
        let caller = self.caller_identity().ok();
        validate_role_assumption(&self.invoker, &self.logger, caller.as_ref(), role_arn)
    }

    fn resolve(&self) -> Result<Credentials, CloudError> {
        let profile = self
            .config
            .profile
            .clone()
            .or_else(|| env::var("AWS_PROFILE").ok());

        let profile_lookup = || self.profile_credentials(profile.as_deref());
        let imds_lookup = || self.regions.imds_region();

        let credentials = resolve_from_sources(
            self.config.kind,
            self.config.static_credentials.as_ref(),
            &EnvSnapshot::capture(),
            self.config.region.as_deref(),
            profile_lookup,
            imds_lookup,
        );
        info!(
            self.logger, "resolved credentials";
            "auth_method" => format!("{:?}", credentials.auth_method),
        );
        Ok(credentials)
    }

    fn profile_credentials(&self, profile: Option<&str>) -> Option<(String, String)> {
        let get = |key: &str| {
            let mut args = vec!["configure", "get", key];
            if let Some(profile) = profile {
                args.push("--profile");
                args.push(profile);
            }
            self.invoker
                .run("GetProfileCredential", &args)
                .ok()
                .map(|out| String::from_utf8_lossy(&out).trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        let access_key_id = get("aws_access_key_id")?;
        let secret_access_key = get("aws_secret_access_key")?;
        Some((access_key_id, secret_access_key))
    }
}

/// Snapshot of the credential-related environment, captured once per
/// resolution so the chain is tested deterministically.
struct EnvSnapshot {
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    session_token: Option<String>,
    region: Option<String>,
}

impl EnvSnapshot {
    fn capture() -> Self {
        EnvSnapshot {
            access_key_id: env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty()),
            secret_access_key: env::var("AWS_SECRET_ACCESS_KEY")
                .ok()
                .filter(|v| !v.is_empty()),
            session_token: env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty()),
            region: env::var("AWS_REGION")
                .ok()
                .or_else(|| env::var("AWS_DEFAULT_REGION").ok())
                .filter(|v| !v.is_empty()),
        }
    }
}

/// The source chain: explicit configuration, environment, CLI profile,
/// instance metadata.
fn resolve_from_sources(
    provider: ProviderKind,
    static_credentials: Option<&crate::config::StaticCredentials>,
    env: &EnvSnapshot,
    configured_region: Option<&str>,
    profile_lookup: impl FnOnce() -> Option<(String, String)>,
    imds_lookup: impl FnOnce() -> Option<String>,
) -> Credentials {
    if let Some(static_creds) = static_credentials {
        let mut credentials = Credentials::empty(provider, AuthMethod::Static);
        credentials.access_key_id = Some(static_creds.access_key_id.clone());
        credentials.secret_access_key = Some(static_creds.secret_access_key.clone());
        credentials.session_token = static_creds.session_token.clone();
        credentials.region = configured_region.map(String::from);
        return credentials;
    }

    if let (Some(access_key_id), Some(secret_access_key)) =
        (&env.access_key_id, &env.secret_access_key)
    {
        let mut credentials = Credentials::empty(provider, AuthMethod::Environment);
        credentials.access_key_id = Some(access_key_id.clone());
        credentials.secret_access_key = Some(secret_access_key.clone());
        credentials.session_token = env.session_token.clone();
        credentials.region = env
            .region
            .clone()
            .or_else(|| configured_region.map(String::from));
        return credentials;
    }

    if let Some((access_key_id, secret_access_key)) = profile_lookup() {
        let mut credentials = Credentials::empty(provider, AuthMethod::Profile);
        credentials.access_key_id = Some(access_key_id);
        credentials.secret_access_key = Some(secret_access_key);
        credentials.region = configured_region.map(String::from);
        return credentials;
    }

    // No key material anywhere; the instance role (if any) will authenticate
    // CLI calls implicitly, so all we can usefully resolve is the region.
    let mut credentials = Credentials::empty(provider, AuthMethod::InstanceMetadata);
    credentials.region = imds_lookup().or_else(|| configured_region.map(String::from));
    credentials
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StaticCredentials;
    use assert_matches::assert_matches;

    const ASSUME_ROLE_OUTPUT: &str = r#"{
        "Credentials": {
            "AccessKeyId": "ASIAFAKEFAKEFAKE",
            "SecretAccessKey": "fake-secret",
            "SessionToken": "fake-session-token",
            "Expiration": "2026-08-01T13:00:00+00:00"
        },
        "AssumedRoleUser": {
            "AssumedRoleId": "AROAFAKE:apm-session",
            "Arn": "arn:aws:sts::222222222222:assumed-role/APMReader/apm-session"
        }
    }"#;

    #[test]
    fn freshness_boundaries() {
        let mut credentials = Credentials::empty(ProviderKind::Aws, AuthMethod::AssumedRole);
        assert!(credentials.is_fresh(Duration::seconds(300)));

        credentials.expiry = Some(Utc::now() + Duration::seconds(600));
        assert!(credentials.is_fresh(Duration::seconds(300)));
        assert!(!credentials.is_fresh(Duration::seconds(900)));

        credentials.expiry = Some(Utc::now() - Duration::seconds(1));
        assert!(!credentials.is_fresh(Duration::seconds(0)));
    }

    #[test]
    fn assume_role_output_maps_to_domain() {
        let credentials = parse_assume_role_output(
            ASSUME_ROLE_OUTPUT.as_bytes(),
            "arn:aws:iam::222222222222:role/APMReader",
            "apm-session",
        )
        .unwrap();

        assert_matches!(credentials.auth_method, AuthMethod::AssumedRole);
        assert_eq!(credentials.account_id.as_deref(), Some("222222222222"));
        assert_eq!(
            credentials.properties["role_arn"],
            "arn:aws:iam::222222222222:role/APMReader"
        );
        assert_eq!(credentials.properties["session_name"], "apm-session");
        assert_eq!(
            credentials.properties["assumed_role_arn"],
            "arn:aws:sts::222222222222:assumed-role/APMReader/apm-session"
        );
        assert!(credentials.expiry.is_some());
        assert_eq!(
            credentials.access_key_id.as_deref(),
            Some("ASIAFAKEFAKEFAKE")
        );
    }

    #[test]
    fn assume_role_output_garbage_is_an_error() {
        let err =
            parse_assume_role_output(b"not-json", "arn:aws:iam::1:role/x", "s").unwrap_err();
        assert_matches!(err.kind, ErrorKind::Unknown);
    }

    #[test]
    fn account_extraction() {
        assert_eq!(
            account_id_from_arn("arn:aws:iam::222222222222:role/APMReader").as_deref(),
            Some("222222222222")
        );
        assert_eq!(account_id_from_arn("not-an-arn"), None);
        assert_eq!(
            role_name_from_arn("arn:aws:iam::222222222222:role/path/APMReader"),
            Some("path/APMReader")
        );
    }

    #[test]
    fn env_guard_restores_on_drop() {
        // This test owns the credential environment; nothing else in the
        // suite touches these variables.
        env::set_var("AWS_ACCESS_KEY_ID", "original-key");
        env::remove_var("AWS_SESSION_TOKEN");

        {
            let _guard = EnvCredentialGuard::capture();
            env::set_var("AWS_ACCESS_KEY_ID", "chain-step-key");
            env::set_var("AWS_SESSION_TOKEN", "chain-step-token");
        }

        assert_eq!(env::var("AWS_ACCESS_KEY_ID").unwrap(), "original-key");
        assert!(env::var("AWS_SESSION_TOKEN").is_err());
        env::remove_var("AWS_ACCESS_KEY_ID");
    }

    #[test]
    fn trust_policy_external_id_and_mfa() {
        let policy: Value = serde_json::from_str(
            r#"{
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": {"AWS": "arn:aws:iam::111111111111:root"},
                    "Action": "sts:AssumeRole",
                    "Condition": {
                        "StringEquals": {"sts:ExternalId": "abc-123"},
                        "Bool": {"aws:MultiFactorAuthPresent": "true"}
                    }
                }]
            }"#,
        )
        .unwrap();

        let (external_id, mfa, can_assume) = analyze_trust_policy(&policy, Some("111111111111"));
        assert!(external_id);
        assert!(mfa);
        assert!(can_assume);

        let (_, _, can_assume) = analyze_trust_policy(&policy, Some("999999999999"));
        assert!(!can_assume);
    }

    #[test]
    fn trust_policy_single_statement_object() {
        let policy: Value = serde_json::from_str(
            r#"{
                "Statement": {
                    "Effect": "Allow",
                    "Principal": {"AWS": ["arn:aws:iam::111111111111:root"]},
                    "Action": ["sts:AssumeRole"]
                }
            }"#,
        )
        .unwrap();

        let (external_id, mfa, can_assume) = analyze_trust_policy(&policy, Some("111111111111"));
        assert!(!external_id);
        assert!(!mfa);
        assert!(can_assume);
    }

    #[test]
    fn url_encoded_policy_documents_decode() {
        let encoded = Value::String(
            "%7B%22Statement%22%3A%5B%7B%22Effect%22%3A%22Allow%22%2C%22Action%22%3A%22sts%3AAssumeRole%22%7D%5D%7D"
                .to_owned(),
        );
        let decoded = decode_policy_document(&encoded);
        assert_eq!(decoded["Statement"][0]["Effect"], "Allow");
    }

    #[test]
    fn source_chain_prefers_static_configuration() {
        let static_creds = StaticCredentials {
            access_key_id: "AKIASTATIC".into(),
            secret_access_key: "static-secret".into(),
            session_token: None,
        };
        let env = EnvSnapshot {
            access_key_id: Some("AKIAENV".into()),
            secret_access_key: Some("env-secret".into()),
            session_token: None,
            region: None,
        };

        let credentials = resolve_from_sources(
            ProviderKind::Aws,
            Some(&static_creds),
            &env,
            Some("us-east-1"),
            || panic!("profile lookup should not run"),
            || panic!("imds lookup should not run"),
        );
        assert_matches!(credentials.auth_method, AuthMethod::Static);
        assert_eq!(credentials.access_key_id.as_deref(), Some("AKIASTATIC"));
    }

    #[test]
    fn source_chain_environment_then_profile_then_imds() {
        let env_with_keys = EnvSnapshot {
            access_key_id: Some("AKIAENV".into()),
            secret_access_key: Some("env-secret".into()),
            session_token: Some("env-token".into()),
            region: Some("eu-west-1".into()),
        };
        let credentials = resolve_from_sources(
            ProviderKind::Aws,
            None,
            &env_with_keys,
            None,
            || panic!("profile lookup should not run"),
            || panic!("imds lookup should not run"),
        );
        assert_matches!(credentials.auth_method, AuthMethod::Environment);
        assert_eq!(credentials.region.as_deref(), Some("eu-west-1"));

        let empty_env = EnvSnapshot {
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
            region: None,
        };
        let credentials = resolve_from_sources(
            ProviderKind::Aws,
            None,
            &empty_env,
            None,
            || Some(("AKIAPROFILE".into(), "profile-secret".into())),
            || panic!("imds lookup should not run"),
        );
        assert_matches!(credentials.auth_method, AuthMethod::Profile);

        let credentials = resolve_from_sources(
            ProviderKind::Aws,
            None,
            &empty_env,
            None,
            || None,
            || Some("ap-southeast-2".into()),
        );
        assert_matches!(credentials.auth_method, AuthMethod::InstanceMetadata);
        assert_eq!(credentials.region.as_deref(), Some("ap-southeast-2"));
    }

    #[test]
    fn file_cache_round_trips_and_honors_ttl() {
        use crate::{
            logging::setup_test_logging, metrics::CliMetricsCollector, region::RegionResolver,
        };

        let logger = setup_test_logging();
        let metrics =
            CliMetricsCollector::new_with_metric_name("credentials_file_cache").unwrap();
        // `false` exits non-zero: no profile lookup can succeed
        let invoker = CliInvoker::new("aws", "false", &logger, &metrics);
        // A closed port keeps the metadata probe from leaving the host
        let regions = RegionResolver::new(invoker.clone(), &logger)
            .with_imds_base_url("http://127.0.0.1:9");
        let scratch = tempfile::TempDir::new().unwrap();
        let cache_path = scratch.path().join("credentials.json");

        let config = ProviderConfig {
            static_credentials: Some(StaticCredentials {
                access_key_id: "AKIAPERSISTED".into(),
                secret_access_key: "persisted-secret".into(),
                session_token: None,
            }),
            ..Default::default()
        };
        let store = CredentialStore::new(config, invoker.clone(), regions.clone(), &logger)
            .with_cache_file(&cache_path);
        let resolved = store.get_credentials().unwrap();
        assert_matches!(resolved.auth_method, AuthMethod::Static);
        assert!(cache_path.is_file());

        // A fresh store with no static configuration answers from the file
        let bare = CredentialStore::new(
            ProviderConfig::default(),
            invoker.clone(),
            regions.clone(),
            &logger,
        )
        .with_cache_file(&cache_path);
        let from_disk = bare.get_credentials().unwrap();
        assert_matches!(from_disk.auth_method, AuthMethod::Static);
        assert_eq!(from_disk.access_key_id.as_deref(), Some("AKIAPERSISTED"));

        // An expired cache entry is ignored and the chain re-runs
        let stale = PersistedCredentials {
            auth_method: "static".into(),
            access_key_id: Some("AKIASTALE".into()),
            secret_access_key: Some("stale".into()),
            session_token: None,
            expiry: None,
            account_id: None,
            region: None,
            fetched_at: Utc::now() - Duration::hours(2),
        };
        std::fs::write(&cache_path, serde_json::to_vec(&stale).unwrap()).unwrap();
        let bare = CredentialStore::new(ProviderConfig::default(), invoker, regions, &logger)
            .with_cache_file(&cache_path);
        let resolved = bare.get_credentials().unwrap();
        assert_ne!(resolved.access_key_id.as_deref(), Some("AKIASTALE"));
    }

    #[test]
    fn secrets_are_hidden_from_debug() {
        let mut credentials = Credentials::empty(ProviderKind::Aws, AuthMethod::Static);
        credentials.secret_access_key = Some("super-secret".into());
        credentials.session_token = Some("session-secret".into());
        let debug = format!("{credentials:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("session-secret"));
    }
}
