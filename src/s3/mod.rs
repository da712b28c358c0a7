//! S3 configuration store: buckets with secure defaults, object transfer
//! (single and multipart), metadata caching, batch processing and the APM
//! config layout.

mod apm_config;
mod batch;
mod cache;
mod multipart;

pub use apm_config::{apm_lifecycle_rules, ApmConfigStore, ApmTool};
pub use batch::{BatchOperation, BatchOptions, BatchOutcome, S3BatchProcessor, S3ConnectionPool};
pub use cache::{S3Cache, S3CacheConfig};

use crate::{
    cli::CliInvoker,
    error::{CloudError, ErrorKind},
    logging::event,
    metrics::TransferMetricsCollector,
    region::DEFAULT_REGION,
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use slog::{debug, info, o, warn, Logger};
use std::{collections::HashMap, io::Read, path::Path};

/// Batched object deletion is limited to this many keys per call.
const DELETE_BATCH_SIZE: usize = 1000;

static BUCKET_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9.-]*[a-z0-9]$").unwrap());

/// A bucket as returned by the listing.
#[derive(Clone, Debug)]
pub struct BucketSummary {
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Assembled bucket configuration.
#[derive(Clone, Debug)]
pub struct BucketDetails {
    pub name: String,
    pub region: Option<String>,
    pub versioning_enabled: bool,
    pub encryption_algorithm: Option<String>,
    pub public_access_blocked: bool,
    pub lifecycle_rule_count: usize,
    pub policy: Option<String>,
    pub tags: HashMap<String, String>,
    pub logging_target: Option<String>,
}

/// An object descriptor.
#[derive(Clone, Debug)]
pub struct FileInfo {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub storage_class: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
    pub parts_count: Option<usize>,
}

/// Server-side encryption settings.
#[derive(Clone, Debug)]
pub struct EncryptionConfig {
    pub sse_algorithm: String,
    pub kms_key_id: Option<String>,
    pub bucket_key_enabled: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        EncryptionConfig {
            sse_algorithm: "AES256".to_owned(),
            kms_key_id: None,
            bucket_key_enabled: true,
        }
    }
}

/// Public access block settings; the default blocks everything.
#[derive(Clone, Debug)]
pub struct PublicAccessBlockConfig {
    pub block_public_acls: bool,
    pub ignore_public_acls: bool,
    pub block_public_policy: bool,
    pub restrict_public_buckets: bool,
}

impl Default for PublicAccessBlockConfig {
    fn default() -> Self {
        PublicAccessBlockConfig {
            block_public_acls: true,
            ignore_public_acls: true,
            block_public_policy: true,
            restrict_public_buckets: true,
        }
    }
}

/// One storage-class transition inside a lifecycle rule.
#[derive(Clone, Debug)]
pub struct LifecycleTransition {
    pub days: i64,
    pub storage_class: String,
}

/// A lifecycle rule, serialized into the bucket lifecycle configuration.
#[derive(Clone, Debug)]
pub struct LifecycleRule {
    pub id: String,
    pub prefix: Option<String>,
    pub transitions: Vec<LifecycleTransition>,
    pub expiration_days: Option<i64>,
    pub abort_incomplete_multipart_days: Option<i64>,
}

/// Access-log shipping settings.
#[derive(Clone, Debug)]
pub struct BucketLoggingConfig {
    pub target_bucket: String,
    pub target_prefix: String,
}

/// Options for bucket creation. Absent sub-configurations fall back to the
/// secure defaults: versioning on, SSE-S3 with bucket keys, public access
/// fully blocked, and a `CreatedBy=APM-Tool` tag.
#[derive(Clone, Debug, Default)]
pub struct BucketOptions {
    pub versioning: Option<bool>,
    pub encryption: Option<EncryptionConfig>,
    pub public_access_block: Option<PublicAccessBlockConfig>,
    pub lifecycle_rules: Option<Vec<LifecycleRule>>,
    pub policy: Option<String>,
    pub replication: Option<serde_json::Value>,
    pub logging: Option<BucketLoggingConfig>,
    pub tags: HashMap<String, String>,
}

/// Options for a single object upload.
#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    /// Force the multipart path even under the size threshold (the 5 MiB
    /// service minimum still applies).
    pub multipart: bool,
    pub part_size: Option<u64>,
    pub concurrency: Option<usize>,
    pub storage_class: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Metadata/tagging directives applied during a copy.
#[derive(Clone, Debug, Default)]
pub struct CopyDirectives {
    pub metadata: Option<HashMap<String, String>>,
    pub tagging: Option<String>,
}

/// A downloaded object streamed from a temporary file that is removed when
/// the reader is dropped.
#[derive(Debug)]
pub struct DownloadStream {
    inner: tempfile::NamedTempFile,
}

impl DownloadStream {
    /// The on-disk location backing the stream, valid until drop.
    pub fn path(&self) -> &Path {
        self.inner.path()
    }
}

impl Read for DownloadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

mod wire {
    use super::{DateTime, Deserialize, Utc};
    use std::collections::HashMap;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListBucketsOutput {
        #[serde(default)]
        pub buckets: Vec<Bucket>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Bucket {
        pub name: String,
        pub creation_date: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketVersioningOutput {
        pub status: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketLocationOutput {
        pub location_constraint: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketEncryptionOutput {
        pub server_side_encryption_configuration: Option<EncryptionConfiguration>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct EncryptionConfiguration {
        #[serde(default)]
        pub rules: Vec<EncryptionRule>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct EncryptionRule {
        pub apply_server_side_encryption_by_default: Option<EncryptionDefault>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct EncryptionDefault {
        #[serde(rename = "SSEAlgorithm")]
        pub sse_algorithm: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetPublicAccessBlockOutput {
        pub public_access_block_configuration: Option<PublicAccessBlockConfiguration>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct PublicAccessBlockConfiguration {
        #[serde(default)]
        pub block_public_acls: bool,
        #[serde(default)]
        pub ignore_public_acls: bool,
        #[serde(default)]
        pub block_public_policy: bool,
        #[serde(default)]
        pub restrict_public_buckets: bool,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketLifecycleOutput {
        #[serde(default)]
        pub rules: Vec<serde_json::Value>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketTaggingOutput {
        #[serde(default)]
        pub tag_set: Vec<Tag>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct Tag {
        pub key: String,
        pub value: String,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketPolicyOutput {
        pub policy: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct GetBucketLoggingOutput {
        pub logging_enabled: Option<LoggingEnabled>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct LoggingEnabled {
        pub target_bucket: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct PutObjectOutput {
        pub e_tag: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct HeadObjectOutput {
        pub content_length: Option<u64>,
        pub e_tag: Option<String>,
        pub storage_class: Option<String>,
        pub last_modified: Option<DateTime<Utc>>,
        #[serde(default)]
        pub metadata: HashMap<String, String>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListObjectsOutput {
        #[serde(default)]
        pub contents: Vec<ObjectSummary>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ObjectSummary {
        pub key: String,
        pub size: u64,
        pub e_tag: Option<String>,
        pub storage_class: Option<String>,
        pub last_modified: Option<DateTime<Utc>>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ListObjectVersionsOutput {
        #[serde(default)]
        pub versions: Vec<ObjectVersion>,
        #[serde(default)]
        pub delete_markers: Vec<ObjectVersion>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(super) struct ObjectVersion {
        pub key: String,
        pub version_id: Option<String>,
    }
}

/// Validates a bucket name against the S3 naming rules.
pub fn validate_bucket_name(name: &str) -> Result<(), CloudError> {
    let invalid = |reason: &str| {
        CloudError::new(
            "aws",
            ErrorKind::InvalidBucketName,
            "ValidateBucketName",
            format!("{name:?}: {reason}"),
        )
    };
    if name.len() < 3 || name.len() > 63 {
        return Err(invalid("length must be between 3 and 63 characters"));
    }
    if !BUCKET_NAME_RE.is_match(name) {
        return Err(invalid(
            "only lowercase letters, digits, dots and hyphens, starting and ending alphanumeric",
        ));
    }
    if name.contains("..") || name.contains(".-") || name.contains("-.") {
        return Err(invalid("dots and hyphens must not be adjacent"));
    }
    Ok(())
}

/// Multipart when above the threshold, or when forced and the payload meets
/// the service minimum.
fn should_use_multipart(size: u64, force: bool) -> bool {
    if size > multipart::MULTIPART_THRESHOLD_BYTES {
        return true;
    }
    force && size >= multipart::MIN_PART_SIZE_BYTES
}

/// The S3 manager. Cheap to clone; clones share one metadata cache.
#[derive(Clone, Debug)]
pub struct S3Manager {
    invoker: CliInvoker,
    cache: S3Cache,
    metrics: TransferMetricsCollector,
    logger: Logger,
}

impl S3Manager {
    pub fn new(
        invoker: CliInvoker,
        cache: S3Cache,
        metrics: &TransferMetricsCollector,
        parent_logger: &Logger,
    ) -> Self {
        S3Manager {
            invoker,
            cache,
            metrics: metrics.clone(),
            logger: parent_logger.new(o!()),
        }
    }

    pub fn cache(&self) -> &S3Cache {
        &self.cache
    }

    fn count_op(&self, operation: &str, outcome: &Result<impl Sized, CloudError>) {
        let status = if outcome.is_ok() { "ok" } else { "error" };
        self.metrics
            .transfer_operations
            .with_label_values(&[operation, status])
            .inc();
    }

    /// Creates a bucket and applies its sub-configurations in a fixed order:
    /// versioning, encryption, public-access-block, lifecycle, policy,
    /// replication, logging, tags. The first failing sub-call aborts with a
    /// wrapped error naming the stage.
    pub fn create_bucket(
        &self,
        name: &str,
        region: &str,
        options: &BucketOptions,
    ) -> Result<(), CloudError> {
        validate_bucket_name(name)?;
        let logger = self.logger.new(o!(event::BUCKET => name.to_owned()));
        info!(logger, "creating bucket"; event::REGION => region);

        let mut args: Vec<String> = vec![
            "s3api".into(),
            "create-bucket".into(),
            "--bucket".into(),
            name.into(),
            "--region".into(),
            region.into(),
        ];
        if region != DEFAULT_REGION {
            args.push("--create-bucket-configuration".into());
            args.push(format!("LocationConstraint={region}"));
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.invoker.run("CreateBucket", &arg_refs)?;

        self.apply_bucket_configuration(name, region, options)
            .map_err(|e| {
                let stage = e.operation.clone();
                e.in_operation(format!("CreateBucket/{stage}"))
            })?;
        self.cache.invalidate_bucket(name);
        Ok(())
    }

    /// Creates the bucket, or returns the existing bucket's details without
    /// re-applying any configuration when it already exists.
    pub fn create_or_get_bucket(
        &self,
        name: &str,
        region: &str,
        options: &BucketOptions,
    ) -> Result<BucketDetails, CloudError> {
        match self.create_bucket(name, region, options) {
            Ok(()) => {}
            Err(e) if e.kind == ErrorKind::BucketAlreadyExists => {
                debug!(self.logger, "bucket already exists"; event::BUCKET => name);
            }
            Err(e) => return Err(e),
        }
        self.get_bucket_details(name)
    }

    fn apply_bucket_configuration(
        &self,
        name: &str,
        _region: &str,
        options: &BucketOptions,
    ) -> Result<(), CloudError> {
        if options.versioning.unwrap_or(true) {
            self.invoker.run(
                "PutBucketVersioning",
                &[
                    "s3api",
                    "put-bucket-versioning",
                    "--bucket",
                    name,
                    "--versioning-configuration",
                    "Status=Enabled",
                ],
            )?;
        }

        let encryption = options.encryption.clone().unwrap_or_default();
        let mut rule = serde_json::json!({
            "ApplyServerSideEncryptionByDefault": {"SSEAlgorithm": encryption.sse_algorithm},
            "BucketKeyEnabled": encryption.bucket_key_enabled,
        });
        if let Some(kms_key_id) = &encryption.kms_key_id {
            rule["ApplyServerSideEncryptionByDefault"]["KMSMasterKeyID"] =
                serde_json::Value::String(kms_key_id.clone());
        }
        let encryption_config = serde_json::json!({ "Rules": [rule] }).to_string();
        self.invoker.run(
            "PutBucketEncryption",
            &[
                "s3api",
                "put-bucket-encryption",
                "--bucket",
                name,
                "--server-side-encryption-configuration",
                &encryption_config,
            ],
        )?;

        let block = options.public_access_block.clone().unwrap_or_default();
        let block_config = format!(
            "BlockPublicAcls={},IgnorePublicAcls={},BlockPublicPolicy={},RestrictPublicBuckets={}",
            block.block_public_acls,
            block.ignore_public_acls,
            block.block_public_policy,
            block.restrict_public_buckets,
        );
        self.invoker.run(
            "PutPublicAccessBlock",
            &[
                "s3api",
                "put-public-access-block",
                "--bucket",
                name,
                "--public-access-block-configuration",
                &block_config,
            ],
        )?;

        if let Some(rules) = &options.lifecycle_rules {
            let lifecycle = lifecycle_configuration_json(rules).to_string();
            self.invoker.run(
                "PutBucketLifecycleConfiguration",
                &[
                    "s3api",
                    "put-bucket-lifecycle-configuration",
                    "--bucket",
                    name,
                    "--lifecycle-configuration",
                    &lifecycle,
                ],
            )?;
        }

        if let Some(policy) = &options.policy {
            self.invoker.run(
                "PutBucketPolicy",
                &["s3api", "put-bucket-policy", "--bucket", name, "--policy", policy],
            )?;
        }

        if let Some(replication) = &options.replication {
            let replication = replication.to_string();
            self.invoker.run(
                "PutBucketReplication",
                &[
                    "s3api",
                    "put-bucket-replication",
                    "--bucket",
                    name,
                    "--replication-configuration",
                    &replication,
                ],
            )?;
        }

        if let Some(logging) = &options.logging {
            let status = serde_json::json!({
                "LoggingEnabled": {
                    "TargetBucket": logging.target_bucket,
                    "TargetPrefix": logging.target_prefix,
                }
            })
            .to_string();
            self.invoker.run(
                "PutBucketLogging",
                &[
                    "s3api",
                    "put-bucket-logging",
                    "--bucket",
                    name,
                    "--bucket-logging-status",
                    &status,
                ],
            )?;
        }

        let mut tags = options.tags.clone();
        tags.entry("CreatedBy".to_owned())
            .or_insert_with(|| "APM-Tool".to_owned());
        let tag_set: Vec<serde_json::Value> = tags
            .iter()
            .map(|(key, value)| serde_json::json!({"Key": key, "Value": value}))
            .collect();
        let tagging = serde_json::json!({ "TagSet": tag_set }).to_string();
        self.invoker.run(
            "PutBucketTagging",
            &["s3api", "put-bucket-tagging", "--bucket", name, "--tagging", &tagging],
        )?;

        Ok(())
    }

    /// Lists buckets, consulting and refreshing the metadata cache.
    pub fn list_buckets(&self) -> Result<Vec<BucketSummary>, CloudError> {
        if let Some(cached) = self.cache.get_bucket_list() {
            debug!(self.logger, "returning cached bucket listing");
            return Ok(cached);
        }
        let output: wire::ListBucketsOutput = self
            .invoker
            .run_json_retrying("ListBuckets", &["s3api", "list-buckets", "--output", "json"])?;
        let buckets: Vec<BucketSummary> = output
            .buckets
            .into_iter()
            .map(|b| BucketSummary {
                name: b.name,
                created_at: b.creation_date,
            })
            .collect();
        self.cache.put_bucket_list(buckets.clone());
        Ok(buckets)
    }

    /// Assembles the bucket's configuration sub-records, tolerating the
    /// not-set errors S3 reports for absent configurations.
    pub fn get_bucket_details(&self, name: &str) -> Result<BucketDetails, CloudError> {
        if let Some(cached) = self.cache.get_bucket(name) {
            return Ok(cached);
        }

        // head-bucket distinguishes missing buckets from missing sub-config
        self.invoker
            .run("HeadBucket", &["s3api", "head-bucket", "--bucket", name])?;

        let versioning: Option<wire::GetBucketVersioningOutput> = self
            .invoker
            .run_json(
                "GetBucketVersioning",
                &["s3api", "get-bucket-versioning", "--bucket", name, "--output", "json"],
            )
            .ok();
        let location: Option<wire::GetBucketLocationOutput> = self
            .invoker
            .run_json(
                "GetBucketLocation",
                &["s3api", "get-bucket-location", "--bucket", name, "--output", "json"],
            )
            .ok();
        let encryption: Option<wire::GetBucketEncryptionOutput> = self
            .invoker
            .run_json(
                "GetBucketEncryption",
                &["s3api", "get-bucket-encryption", "--bucket", name, "--output", "json"],
            )
            .ok();
        let public_access: Option<wire::GetPublicAccessBlockOutput> = self
            .invoker
            .run_json(
                "GetPublicAccessBlock",
                &["s3api", "get-public-access-block", "--bucket", name, "--output", "json"],
            )
            .ok();
        let lifecycle: Option<wire::GetBucketLifecycleOutput> = self
            .invoker
            .run_json(
                "GetBucketLifecycleConfiguration",
                &[
                    "s3api",
                    "get-bucket-lifecycle-configuration",
                    "--bucket",
                    name,
                    "--output",
                    "json",
                ],
            )
            .ok();
        let tagging: Option<wire::GetBucketTaggingOutput> = self
            .invoker
            .run_json(
                "GetBucketTagging",
                &["s3api", "get-bucket-tagging", "--bucket", name, "--output", "json"],
            )
            .ok();
        let policy: Option<wire::GetBucketPolicyOutput> = self
            .invoker
            .run_json(
                "GetBucketPolicy",
                &["s3api", "get-bucket-policy", "--bucket", name, "--output", "json"],
            )
            .ok();
        let logging: Option<wire::GetBucketLoggingOutput> = self
            .invoker
            .run_json(
                "GetBucketLogging",
                &["s3api", "get-bucket-logging", "--bucket", name, "--output", "json"],
            )
            .ok();

        let details = BucketDetails {
            name: name.to_owned(),
            region: location.and_then(|l| l.location_constraint).or_else(|| {
                // An absent constraint means the original region
                Some(DEFAULT_REGION.to_owned())
            }),
            versioning_enabled: versioning
                .and_then(|v| v.status)
                .map(|status| status == "Enabled")
                .unwrap_or(false),
            encryption_algorithm: encryption
                .and_then(|e| e.server_side_encryption_configuration)
                .and_then(|c| c.rules.into_iter().next())
                .and_then(|r| r.apply_server_side_encryption_by_default)
                .map(|d| d.sse_algorithm),
            public_access_blocked: public_access
                .and_then(|p| p.public_access_block_configuration)
                .map(|c| {
                    c.block_public_acls
                        && c.ignore_public_acls
                        && c.block_public_policy
                        && c.restrict_public_buckets
                })
                .unwrap_or(false),
            lifecycle_rule_count: lifecycle.map(|l| l.rules.len()).unwrap_or(0),
            policy: policy.and_then(|p| p.policy),
            tags: tagging
                .map(|t| t.tag_set.into_iter().map(|tag| (tag.key, tag.value)).collect())
                .unwrap_or_default(),
            logging_target: logging
                .and_then(|l| l.logging_enabled)
                .and_then(|l| l.target_bucket),
        };
        self.cache.put_bucket(name, details.clone());
        Ok(details)
    }

    /// Uploads a local file, choosing single-part or multipart by size (and
    /// the caller's request). Returns the resulting object descriptor.
    pub fn upload_file(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<FileInfo, CloudError> {
        let size = std::fs::metadata(local_path)
            .map_err(|e| {
                CloudError::new(
                    "aws",
                    ErrorKind::InvalidRequest,
                    "UploadFile",
                    format!("cannot stat {}", local_path.display()),
                )
                .with_cause(e)
            })?
            .len();

        let result = if should_use_multipart(size, options.multipart) {
            let part_size = options
                .part_size
                .unwrap_or(multipart::DEFAULT_PART_SIZE_BYTES)
                .max(multipart::MIN_PART_SIZE_BYTES);
            let concurrency = options
                .concurrency
                .unwrap_or(multipart::DEFAULT_CONCURRENCY)
                .max(1);
            multipart::upload(
                &self.invoker,
                &self.logger,
                &self.metrics,
                local_path,
                bucket,
                key,
                part_size,
                concurrency,
            )
        } else {
            self.put_object(local_path, bucket, key, size, options)
        };
        self.count_op("upload", &result);
        if result.is_ok() {
            self.cache.invalidate_file(bucket, key);
        }
        result
    }

    fn put_object(
        &self,
        local_path: &Path,
        bucket: &str,
        key: &str,
        size: u64,
        options: &UploadOptions,
    ) -> Result<FileInfo, CloudError> {
        let body = local_path.to_string_lossy().into_owned();
        let mut args: Vec<String> = vec![
            "s3api".into(),
            "put-object".into(),
            "--bucket".into(),
            bucket.into(),
            "--key".into(),
            key.into(),
            "--body".into(),
            body,
        ];
        if let Some(storage_class) = &options.storage_class {
            args.push("--storage-class".into());
            args.push(storage_class.clone());
        }
        if !options.metadata.is_empty() {
            let metadata = options
                .metadata
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            args.push("--metadata".into());
            args.push(metadata);
        }
        args.push("--output".into());
        args.push("json".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output: wire::PutObjectOutput = self.invoker.run_json("PutObject", &arg_refs)?;

        Ok(FileInfo {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            size,
            etag: output.e_tag.map(|etag| etag.trim_matches('"').to_owned()),
            storage_class: options.storage_class.clone(),
            last_modified: None,
            metadata: options.metadata.clone(),
            parts_count: None,
        })
    }

    /// Streams an object into a temporary file; the returned reader removes
    /// the file when dropped.
    pub fn download_file(&self, bucket: &str, key: &str) -> Result<DownloadStream, CloudError> {
        let scratch = tempfile::NamedTempFile::new().map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "DownloadFile",
                "failed to create download scratch file",
            )
            .with_cause(e)
        })?;
        let result = self.download_to(bucket, key, scratch.path());
        self.count_op("download", &result);
        result?;
        Ok(DownloadStream { inner: scratch })
    }

    /// Downloads an object to an explicit local path.
    pub fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<(), CloudError> {
        let dest = dest.to_string_lossy().into_owned();
        self.invoker
            .run_retrying(
                "GetObject",
                &["s3api", "get-object", "--bucket", bucket, "--key", key, &dest],
            )
            .map(|_| ())
    }

    /// Single-call server-side copy with optional directives.
    pub fn copy_file(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
        directives: Option<&CopyDirectives>,
    ) -> Result<(), CloudError> {
        let copy_source = format!("{src_bucket}/{src_key}");
        let mut args: Vec<String> = vec![
            "s3api".into(),
            "copy-object".into(),
            "--copy-source".into(),
            copy_source,
            "--bucket".into(),
            dst_bucket.into(),
            "--key".into(),
            dst_key.into(),
        ];
        if let Some(directives) = directives {
            if let Some(metadata) = &directives.metadata {
                let rendered = metadata
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(",");
                args.push("--metadata".into());
                args.push(rendered);
                args.push("--metadata-directive".into());
                args.push("REPLACE".into());
            }
            if let Some(tagging) = &directives.tagging {
                args.push("--tagging".into());
                args.push(tagging.clone());
                args.push("--tagging-directive".into());
                args.push("REPLACE".into());
            }
        }
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self.invoker.run("CopyObject", &arg_refs).map(|_| ());
        self.count_op("copy", &result);
        if result.is_ok() {
            self.cache.invalidate_file(dst_bucket, dst_key);
        }
        result
    }

    /// Copy then delete. When the delete fails the copy still counts as a
    /// success and the source object remains.
    pub fn move_file(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), CloudError> {
        self.copy_file(src_bucket, src_key, dst_bucket, dst_key, None)?;
        if let Err(e) = self.delete_file(src_bucket, src_key) {
            warn!(
                self.logger, "move left source object behind";
                event::BUCKET => src_bucket,
                event::STORAGE_KEY => src_key,
                "error" => e.to_string(),
            );
        }
        Ok(())
    }

    pub fn delete_file(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        let result = self
            .invoker
            .run(
                "DeleteObject",
                &["s3api", "delete-object", "--bucket", bucket, "--key", key],
            )
            .map(|_| ());
        self.count_op("delete", &result);
        self.cache.invalidate_file(bucket, key);
        result
    }

    /// Describes one object via head-object, consulting the cache.
    pub fn file_info(&self, bucket: &str, key: &str) -> Result<FileInfo, CloudError> {
        if let Some(cached) = self.cache.get_file(bucket, key) {
            return Ok(cached);
        }
        let output: wire::HeadObjectOutput = self.invoker.run_json_retrying(
            "HeadObject",
            &[
                "s3api",
                "head-object",
                "--bucket",
                bucket,
                "--key",
                key,
                "--output",
                "json",
            ],
        )?;
        let info = FileInfo {
            bucket: bucket.to_owned(),
            key: key.to_owned(),
            size: output.content_length.unwrap_or(0),
            etag: output.e_tag.map(|etag| etag.trim_matches('"').to_owned()),
            storage_class: output.storage_class,
            last_modified: output.last_modified,
            metadata: output.metadata,
            parts_count: None,
        };
        self.cache.put_file(bucket, key, info.clone());
        Ok(info)
    }

    /// Lists objects under a prefix.
    pub fn list_files(&self, bucket: &str, prefix: &str) -> Result<Vec<FileInfo>, CloudError> {
        let mut args = vec![
            "s3api",
            "list-objects-v2",
            "--bucket",
            bucket,
            "--output",
            "json",
        ];
        if !prefix.is_empty() {
            args.push("--prefix");
            args.push(prefix);
        }
        let output: wire::ListObjectsOutput =
            self.invoker.run_json_retrying("ListObjectsV2", &args)?;
        Ok(output
            .contents
            .into_iter()
            .map(|object| FileInfo {
                bucket: bucket.to_owned(),
                key: object.key,
                size: object.size,
                etag: object.e_tag.map(|etag| etag.trim_matches('"').to_owned()),
                storage_class: object.storage_class,
                last_modified: object.last_modified,
                metadata: HashMap::new(),
                parts_count: None,
            })
            .collect())
    }

    /// Deletes a bucket. A non-empty bucket fails unless `force`, in which
    /// case versioning is suspended, every object version is batch-deleted
    /// (1000 keys per call), and the bucket is then removed.
    pub fn delete_bucket(&self, name: &str, force: bool) -> Result<(), CloudError> {
        let remaining = self.list_files(name, "")?;
        if !remaining.is_empty() && !force {
            return Err(CloudError::new(
                "aws",
                ErrorKind::BucketNotEmpty,
                "DeleteBucket",
                format!("bucket {name} holds {} object(s)", remaining.len()),
            ));
        }

        if force {
            // Suspend versioning so the batch delete is not racing new
            // versions of the same keys
            self.invoker.run(
                "PutBucketVersioning",
                &[
                    "s3api",
                    "put-bucket-versioning",
                    "--bucket",
                    name,
                    "--versioning-configuration",
                    "Status=Suspended",
                ],
            )?;
            self.purge_objects(name)?;
        }

        self.invoker
            .run("DeleteBucket", &["s3api", "delete-bucket", "--bucket", name])?;
        self.cache.invalidate_bucket(name);
        info!(self.logger, "deleted bucket"; event::BUCKET => name);
        Ok(())
    }

    fn purge_objects(&self, bucket: &str) -> Result<(), CloudError> {
        let versions: Result<wire::ListObjectVersionsOutput, CloudError> = self.invoker.run_json(
            "ListObjectVersions",
            &[
                "s3api",
                "list-object-versions",
                "--bucket",
                bucket,
                "--output",
                "json",
            ],
        );

        let mut targets: Vec<(String, Option<String>)> = Vec::new();
        match versions {
            Ok(output) => {
                for version in output.versions.into_iter().chain(output.delete_markers) {
                    targets.push((version.key, version.version_id));
                }
            }
            // Unversioned buckets answer the plain listing instead
            Err(_) => {
                for object in self.list_files(bucket, "")? {
                    targets.push((object.key, None));
                }
            }
        }

        for chunk in targets.chunks(DELETE_BATCH_SIZE) {
            let objects: Vec<serde_json::Value> = chunk
                .iter()
                .map(|(key, version_id)| match version_id {
                    Some(version_id) => {
                        serde_json::json!({"Key": key, "VersionId": version_id})
                    }
                    None => serde_json::json!({"Key": key}),
                })
                .collect();
            let delete_doc = serde_json::json!({"Objects": objects, "Quiet": true}).to_string();
            self.invoker.run(
                "DeleteObjects",
                &[
                    "s3api",
                    "delete-objects",
                    "--bucket",
                    bucket,
                    "--delete",
                    &delete_doc,
                ],
            )?;
        }
        Ok(())
    }
}

/// Renders lifecycle rules into the configuration document shape.
fn lifecycle_configuration_json(rules: &[LifecycleRule]) -> serde_json::Value {
    let rules: Vec<serde_json::Value> = rules
        .iter()
        .map(|rule| {
            let mut rendered = serde_json::json!({
                "ID": rule.id,
                "Status": "Enabled",
                "Filter": {"Prefix": rule.prefix.clone().unwrap_or_default()},
            });
            if !rule.transitions.is_empty() {
                rendered["Transitions"] = serde_json::Value::Array(
                    rule.transitions
                        .iter()
                        .map(|t| {
                            serde_json::json!({"Days": t.days, "StorageClass": t.storage_class})
                        })
                        .collect(),
                );
            }
            if let Some(days) = rule.expiration_days {
                rendered["Expiration"] = serde_json::json!({"Days": days});
            }
            if let Some(days) = rule.abort_incomplete_multipart_days {
                rendered["AbortIncompleteMultipartUpload"] =
                    serde_json::json!({"DaysAfterInitiation": days});
            }
            rendered
        })
        .collect();
    serde_json::json!({ "Rules": rules })
}
