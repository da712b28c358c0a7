//! APM tool configuration storage in S3.
//!
//! Key layout:
//! - current:  `configs/{env}/{tool}/{tool}-{ts}.json`
//! - backups:  `backups/{env}/{tool}/{tool}-backup-{ts}.json`
//! - restores: `configs/{env}/{tool}/{tool}-restored-{ts}.json`
//! - deploys:  `configs/{targetEnv}/{tool}/{tool}-deployed-{ts}.json`

use super::{
    FileInfo, LifecycleRule, LifecycleTransition, S3Manager, UploadOptions,
};
use crate::{
    error::{CloudError, ErrorKind},
    logging::event,
};
use chrono::Utc;
use slog::{info, o, Logger};
use std::{
    fmt::{self, Display, Formatter},
    io::{Read, Write},
    str::FromStr,
};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// The APM tools whose configuration this store understands.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ApmTool {
    Prometheus,
    Grafana,
    Jaeger,
    Loki,
    Alertmanager,
}

impl ApmTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApmTool::Prometheus => "prometheus",
            ApmTool::Grafana => "grafana",
            ApmTool::Jaeger => "jaeger",
            ApmTool::Loki => "loki",
            ApmTool::Alertmanager => "alertmanager",
        }
    }

    pub fn all() -> &'static [ApmTool] {
        &[
            ApmTool::Prometheus,
            ApmTool::Grafana,
            ApmTool::Jaeger,
            ApmTool::Loki,
            ApmTool::Alertmanager,
        ]
    }
}

impl Display for ApmTool {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApmTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "prometheus" => Ok(ApmTool::Prometheus),
            "grafana" => Ok(ApmTool::Grafana),
            "jaeger" => Ok(ApmTool::Jaeger),
            "loki" => Ok(ApmTool::Loki),
            "alertmanager" => Ok(ApmTool::Alertmanager),
            other => Err(format!("unknown APM tool {other:?}")),
        }
    }
}

fn config_prefix(env: &str, tool: ApmTool) -> String {
    format!("configs/{env}/{tool}/")
}

fn backup_prefix(env: &str, tool: ApmTool) -> String {
    format!("backups/{env}/{tool}/")
}

fn config_key(env: &str, tool: ApmTool, timestamp: &str) -> String {
    format!("configs/{env}/{tool}/{tool}-{timestamp}.json")
}

fn backup_key(env: &str, tool: ApmTool, timestamp: &str) -> String {
    format!("backups/{env}/{tool}/{tool}-backup-{timestamp}.json")
}

fn restored_key(env: &str, tool: ApmTool, timestamp: &str) -> String {
    format!("configs/{env}/{tool}/{tool}-restored-{timestamp}.json")
}

fn deployed_key(target_env: &str, tool: ApmTool, timestamp: &str) -> String {
    format!("configs/{target_env}/{tool}/{tool}-deployed-{timestamp}.json")
}

/// Validates a configuration document against the per-tool minimum-field
/// rules before it is allowed into the store.
pub(crate) fn validate_config(tool: ApmTool, config: &serde_json::Value) -> Result<(), CloudError> {
    let invalid = |reason: String| {
        CloudError::new(
            "aws",
            ErrorKind::InvalidRequest,
            "ValidateApmConfig",
            format!("{tool} configuration invalid: {reason}"),
        )
    };

    if !config.is_object() {
        return Err(invalid("document must be a JSON object".to_owned()));
    }

    match tool {
        ApmTool::Prometheus => {
            if config.get("global").is_none() {
                return Err(invalid("missing required field `global`".to_owned()));
            }
            if config.get("scrape_configs").is_none() {
                return Err(invalid("missing required field `scrape_configs`".to_owned()));
            }
        }
        ApmTool::Grafana => {
            let password = config
                .get("security")
                .and_then(|security| security.get("admin_password"))
                .and_then(|password| password.as_str())
                .ok_or_else(|| invalid("missing `security.admin_password`".to_owned()))?;
            if password == "admin" || password == "password" {
                return Err(invalid("admin password must not be a well-known default".to_owned()));
            }
        }
        ApmTool::Jaeger => {
            if config
                .get("service_name")
                .and_then(|name| name.as_str())
                .map(str::is_empty)
                .unwrap_or(true)
            {
                return Err(invalid("missing `service_name`".to_owned()));
            }
        }
        ApmTool::Loki => {
            if config.get("auth_enabled").is_none() {
                return Err(invalid("missing `auth_enabled`".to_owned()));
            }
            if config.get("server").is_none() {
                return Err(invalid("missing `server`".to_owned()));
            }
        }
        ApmTool::Alertmanager => {
            if config.get("route").is_none() {
                return Err(invalid("missing `route`".to_owned()));
            }
            if config.get("receivers").is_none() {
                return Err(invalid("missing `receivers`".to_owned()));
            }
        }
    }
    Ok(())
}

/// The lifecycle defaults applied to APM config buckets: tiered transitions
/// for configs, seven-year backup retention, temp cleanup, and abandoned
/// multipart reaping.
pub fn apm_lifecycle_rules() -> Vec<LifecycleRule> {
    vec![
        LifecycleRule {
            id: "config-tiering".to_owned(),
            prefix: Some("configs/".to_owned()),
            transitions: vec![
                LifecycleTransition {
                    days: 30,
                    storage_class: "STANDARD_IA".to_owned(),
                },
                LifecycleTransition {
                    days: 90,
                    storage_class: "GLACIER".to_owned(),
                },
                LifecycleTransition {
                    days: 365,
                    storage_class: "DEEP_ARCHIVE".to_owned(),
                },
            ],
            expiration_days: None,
            abort_incomplete_multipart_days: None,
        },
        LifecycleRule {
            id: "backup-retention".to_owned(),
            prefix: Some("backups/".to_owned()),
            transitions: Vec::new(),
            // Seven years
            expiration_days: Some(2555),
            abort_incomplete_multipart_days: None,
        },
        LifecycleRule {
            id: "temp-cleanup".to_owned(),
            prefix: Some("temp/".to_owned()),
            transitions: Vec::new(),
            expiration_days: Some(7),
            abort_incomplete_multipart_days: None,
        },
        LifecycleRule {
            id: "abort-incomplete-uploads".to_owned(),
            prefix: None,
            transitions: Vec::new(),
            expiration_days: None,
            abort_incomplete_multipart_days: Some(1),
        },
    ]
}

/// Stores, backs up and deploys APM tool configuration in one bucket.
#[derive(Clone, Debug)]
pub struct ApmConfigStore {
    manager: S3Manager,
    bucket: String,
    logger: Logger,
}

impl ApmConfigStore {
    pub fn new(manager: S3Manager, bucket: impl Into<String>, parent_logger: &Logger) -> Self {
        let bucket = bucket.into();
        let logger = parent_logger.new(o!(event::BUCKET => bucket.clone()));
        ApmConfigStore {
            manager,
            bucket,
            logger,
        }
    }

    /// Validates and uploads a configuration document as the new current
    /// version. Returns the object key.
    pub fn upload_config(
        &self,
        tool: ApmTool,
        env: &str,
        config: &serde_json::Value,
    ) -> Result<String, CloudError> {
        validate_config(tool, config)?;
        let key = config_key(env, tool, &Utc::now().format(TIMESTAMP_FORMAT).to_string());
        self.put_json(&key, config)?;
        info!(
            self.logger, "uploaded config";
            event::APM_TOOL => tool.as_str(),
            event::STORAGE_KEY => &key,
        );
        Ok(key)
    }

    /// Downloads the newest configuration for `tool` in `env`, parsed as
    /// JSON.
    pub fn download_config(
        &self,
        tool: ApmTool,
        env: &str,
    ) -> Result<serde_json::Value, CloudError> {
        let latest = self.latest_under(&config_prefix(env, tool), tool)?;
        self.get_json(&latest.key)
    }

    /// Copies the newest current configuration into the backups area.
    /// Returns the backup key.
    pub fn backup_config(&self, tool: ApmTool, env: &str) -> Result<String, CloudError> {
        let latest = self.latest_under(&config_prefix(env, tool), tool)?;
        let key = backup_key(env, tool, &Utc::now().format(TIMESTAMP_FORMAT).to_string());
        self.manager
            .copy_file(&self.bucket, &latest.key, &self.bucket, &key, None)?;
        info!(
            self.logger, "backed up config";
            event::APM_TOOL => tool.as_str(),
            event::STORAGE_KEY => &key,
        );
        Ok(key)
    }

    /// Restores the newest backup as a new current version. Returns the
    /// restored key.
    pub fn restore_config(&self, tool: ApmTool, env: &str) -> Result<String, CloudError> {
        let latest_backup = self.latest_under(&backup_prefix(env, tool), tool)?;
        let key = restored_key(env, tool, &Utc::now().format(TIMESTAMP_FORMAT).to_string());
        self.manager
            .copy_file(&self.bucket, &latest_backup.key, &self.bucket, &key, None)?;
        info!(
            self.logger, "restored config";
            event::APM_TOOL => tool.as_str(),
            event::STORAGE_KEY => &key,
        );
        Ok(key)
    }

    /// Deploys the newest configuration from `source_env` into `target_env`.
    /// The document is validated on the way through. Returns the deployed
    /// key.
    pub fn deploy_config(
        &self,
        tool: ApmTool,
        source_env: &str,
        target_env: &str,
    ) -> Result<String, CloudError> {
        let config = self.download_config(tool, source_env)?;
        validate_config(tool, &config)?;
        let key = deployed_key(
            target_env,
            tool,
            &Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        );
        self.put_json(&key, &config)?;
        info!(
            self.logger, "deployed config across environments";
            event::APM_TOOL => tool.as_str(),
            "source_env" => source_env,
            "target_env" => target_env,
            event::STORAGE_KEY => &key,
        );
        Ok(key)
    }

    /// The newest object under `prefix` by last-modified.
    fn latest_under(&self, prefix: &str, tool: ApmTool) -> Result<FileInfo, CloudError> {
        let mut objects = self.manager.list_files(&self.bucket, prefix)?;
        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
        objects.into_iter().next().ok_or_else(|| {
            CloudError::new(
                "aws",
                ErrorKind::ObjectNotFound,
                "DownloadApmConfig",
                format!("no {tool} configuration under {prefix}"),
            )
        })
    }

    fn put_json(&self, key: &str, config: &serde_json::Value) -> Result<(), CloudError> {
        let mut scratch = tempfile::NamedTempFile::new().map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "UploadApmConfig",
                "failed to stage config document",
            )
            .with_cause(e)
        })?;
        let rendered = serde_json::to_vec_pretty(config).map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "UploadApmConfig",
                "failed to render config document",
            )
            .with_cause(e)
        })?;
        scratch.write_all(&rendered).and_then(|_| scratch.flush()).map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "UploadApmConfig",
                "failed to write config document",
            )
            .with_cause(e)
        })?;

        self.manager
            .upload_file(scratch.path(), &self.bucket, key, &UploadOptions::default())
            .map(|_| ())
    }

    fn get_json(&self, key: &str) -> Result<serde_json::Value, CloudError> {
        let mut stream = self.manager.download_file(&self.bucket, key)?;
        let mut body = Vec::new();
        stream.read_to_end(&mut body).map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InternalError,
                "DownloadApmConfig",
                "failed to read downloaded config",
            )
            .with_cause(e)
        })?;
        serde_json::from_slice(&body).map_err(|e| {
            CloudError::new(
                "aws",
                ErrorKind::InvalidRequest,
                "DownloadApmConfig",
                format!("object {key} is not valid JSON"),
            )
            .with_cause(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cli::CliInvoker,
        logging::setup_test_logging,
        metrics::{CliMetricsCollector, TransferMetricsCollector},
        s3::{S3Cache, S3CacheConfig},
        test_utils::FakeCli,
    };
    use assert_matches::assert_matches;

    #[test]
    fn key_layout() {
        assert_eq!(
            config_key("prod", ApmTool::Prometheus, "20260801120000"),
            "configs/prod/prometheus/prometheus-20260801120000.json"
        );
        assert_eq!(
            backup_key("prod", ApmTool::Grafana, "20260801120000"),
            "backups/prod/grafana/grafana-backup-20260801120000.json"
        );
        assert_eq!(
            restored_key("prod", ApmTool::Loki, "20260801120000"),
            "configs/prod/loki/loki-restored-20260801120000.json"
        );
        assert_eq!(
            deployed_key("staging", ApmTool::Jaeger, "20260801120000"),
            "configs/staging/jaeger/jaeger-deployed-20260801120000.json"
        );
    }

    #[test]
    fn prometheus_validation_requires_core_sections() {
        let valid = serde_json::json!({"global": {}, "scrape_configs": []});
        validate_config(ApmTool::Prometheus, &valid).unwrap();

        let missing = serde_json::json!({"global": {}});
        let err = validate_config(ApmTool::Prometheus, &missing).unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);
        assert!(err.message.contains("scrape_configs"));
    }

    #[test]
    fn grafana_validation_rejects_default_passwords() {
        let valid = serde_json::json!({"security": {"admin_password": "s3curely-generated"}});
        validate_config(ApmTool::Grafana, &valid).unwrap();

        for bad in ["admin", "password"] {
            let config = serde_json::json!({"security": {"admin_password": bad}});
            validate_config(ApmTool::Grafana, &config).unwrap_err();
        }
        let missing = serde_json::json!({"security": {}});
        validate_config(ApmTool::Grafana, &missing).unwrap_err();
    }

    #[test]
    fn remaining_tool_validators() {
        validate_config(
            ApmTool::Jaeger,
            &serde_json::json!({"service_name": "apm-jaeger"}),
        )
        .unwrap();
        validate_config(ApmTool::Jaeger, &serde_json::json!({})).unwrap_err();

        validate_config(
            ApmTool::Loki,
            &serde_json::json!({"auth_enabled": false, "server": {}}),
        )
        .unwrap();
        validate_config(ApmTool::Loki, &serde_json::json!({"server": {}})).unwrap_err();

        validate_config(
            ApmTool::Alertmanager,
            &serde_json::json!({"route": {}, "receivers": []}),
        )
        .unwrap();
        validate_config(ApmTool::Alertmanager, &serde_json::json!({"route": {}})).unwrap_err();

        validate_config(ApmTool::Prometheus, &serde_json::json!([1, 2])).unwrap_err();
    }

    #[test]
    fn lifecycle_defaults_cover_tiering_and_retention() {
        let rules = apm_lifecycle_rules();
        let tiering = rules.iter().find(|r| r.id == "config-tiering").unwrap();
        let classes: Vec<&str> = tiering
            .transitions
            .iter()
            .map(|t| t.storage_class.as_str())
            .collect();
        assert_eq!(classes, vec!["STANDARD_IA", "GLACIER", "DEEP_ARCHIVE"]);

        let backups = rules.iter().find(|r| r.id == "backup-retention").unwrap();
        assert_eq!(backups.expiration_days, Some(2555));

        let temp = rules.iter().find(|r| r.id == "temp-cleanup").unwrap();
        assert_eq!(temp.expiration_days, Some(7));

        let abort = rules
            .iter()
            .find(|r| r.id == "abort-incomplete-uploads")
            .unwrap();
        assert_eq!(abort.abort_incomplete_multipart_days, Some(1));
    }

    /// A fake `aws s3api` backed by a directory: put-object copies the body
    /// into storage, get-object copies it back out, list-objects-v2 lists
    /// keys under the prefix (newest last-modified by file order).
    fn storage_script() -> &'static str {
        r#"store="$(dirname "$0")/store"
mkdir -p "$store"
cmd="$2"
bucket=""; key=""; body=""; prefix=""; dest=""; prev=""
for arg in "$@"; do
    case "$prev" in
    --bucket) bucket="$arg";;
    --key) key="$arg";;
    --body) body="$arg";;
    --prefix) prefix="$arg";;
    esac
    prev="$arg"
    dest="$arg"
done
flat() { echo "$1" | tr '/' '_'; }
case "$cmd" in
put-object) cp "$body" "$store/$(flat "$key")"; date +%s%N > "$store/$(flat "$key").ts"; echo '{"ETag":"\"x\""}';;
get-object) cp "$store/$(flat "$key")" "$dest"; echo '{}';;
copy-object)
    src_key="${3#*/}"
    # --copy-source is "bucket/key"; find it among the args
    prev=""
    for arg in "$@"; do
        if [ "$prev" = "--copy-source" ]; then src_key="${arg#*/}"; fi
        prev="$arg"
    done
    cp "$store/$(flat "$src_key")" "$store/$(flat "$key")"
    date +%s%N > "$store/$(flat "$key").ts"
    echo '{}';;
list-objects-v2)
    printf '{"Contents":['
    first=1
    n=0
    for f in "$store"/*.ts; do
        [ -e "$f" ] || continue
        stored="${f%.ts}"
        k="$(basename "$stored" | tr '_' '/')"
        case "$k" in
        "$prefix"*)
            n=$((n+1))
            ts="$(cat "$f")"
            secs=$((1700000000 + n))
            if [ $first -eq 0 ]; then printf ','; fi
            first=0
            printf '{"Key":"%s","Size":1,"LastModified":"2026-08-01T00:00:%02d+00:00"}' "$k" "$n"
            ;;
        esac
    done
    printf ']}'
    ;;
*) echo '{}';;
esac"#
    }

    #[test]
    fn upload_then_download_round_trips() {
        let fake = FakeCli::new(storage_script());
        let logger = setup_test_logging();
        let cli_metrics = CliMetricsCollector::new_with_metric_name("apm_round_trip").unwrap();
        let transfer_metrics =
            TransferMetricsCollector::new_with_metric_name("apm_round_trip").unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &cli_metrics);
        let cache = S3Cache::new(S3CacheConfig::default(), &logger);
        let manager = S3Manager::new(invoker, cache, &transfer_metrics, &logger);
        let store = ApmConfigStore::new(manager.clone(), "apm-config", &logger);

        let config = serde_json::json!({"global": {}, "scrape_configs": []});
        let key = store
            .upload_config(ApmTool::Prometheus, "prod", &config)
            .unwrap();
        assert!(key.starts_with("configs/prod/prometheus/prometheus-"));
        assert!(key.ends_with(".json"));

        let downloaded = store.download_config(ApmTool::Prometheus, "prod").unwrap();
        assert_eq!(downloaded, config);
        manager.cache().close();
    }

    #[test]
    fn invalid_config_never_reaches_storage() {
        let fake = FakeCli::new(storage_script());
        let logger = setup_test_logging();
        let cli_metrics = CliMetricsCollector::new_with_metric_name("apm_invalid").unwrap();
        let transfer_metrics =
            TransferMetricsCollector::new_with_metric_name("apm_invalid").unwrap();
        let invoker = CliInvoker::new("aws", fake.program(), &logger, &cli_metrics);
        let cache = S3Cache::new(S3CacheConfig::default(), &logger);
        let manager = S3Manager::new(invoker, cache, &transfer_metrics, &logger);
        let store = ApmConfigStore::new(manager.clone(), "apm-config", &logger);

        let err = store
            .upload_config(ApmTool::Grafana, "prod", &serde_json::json!({"security": {}}))
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::InvalidRequest);

        let err = store
            .download_config(ApmTool::Grafana, "prod")
            .unwrap_err();
        assert_matches!(err.kind, ErrorKind::ObjectNotFound);
        manager.cache().close();
    }
}
