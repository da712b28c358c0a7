use crate::retries::RetryPolicy;
use chrono::Duration;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
    time::Duration as StdDuration,
};

/// The clouds this toolkit can be pointed at.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Aws,
    Azure,
    Gcp,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
        }
    }
}

impl Display for ProviderKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(ProviderKind::Aws),
            "azure" | "az" => Ok(ProviderKind::Azure),
            "gcp" | "gcloud" | "google" => Ok(ProviderKind::Gcp),
            other => Err(format!("unknown provider {other:?}")),
        }
    }
}

/// Static credentials supplied directly in configuration. These take priority
/// over every other source in the resolution chain.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Retry tuning carried in provider configuration.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub initial_interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        RetrySettings {
            initial_interval_ms: 1_000,
            max_attempts: 3,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: StdDuration::from_millis(self.initial_interval_ms),
            // The backoff interval is always capped at 30s
            max_interval: StdDuration::from_secs(30),
            max_attempts: self.max_attempts,
        }
    }
}

/// Per-provider configuration handed to the factory.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub region: Option<String>,
    pub profile: Option<String>,
    pub static_credentials: Option<StaticCredentials>,
    /// TTL for the memoized credential resolution, in seconds.
    pub credential_cache_ttl_seconds: i64,
    pub retry: RetrySettings,
    /// Deadline for a single CLI invocation, in seconds.
    pub cli_timeout_seconds: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            kind: ProviderKind::Aws,
            region: None,
            profile: None,
            static_credentials: None,
            credential_cache_ttl_seconds: 300,
            retry: RetrySettings::default(),
            cli_timeout_seconds: 60,
        }
    }
}

impl ProviderConfig {
    pub fn credential_cache_ttl(&self) -> Duration {
        Duration::seconds(self.credential_cache_ttl_seconds)
    }

    pub fn cli_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.cli_timeout_seconds)
    }
}

/// A bucket-and-key location, `s3://{bucket}/{optional key}`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct S3Uri {
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum S3UriParseError {
    #[error("not an S3 URI")]
    NoUri,
    #[error("S3 URI must be in the format `s3://{{bucket name}}/{{optional key}}`")]
    InvalidFormat,
}

impl Display for S3Uri {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

impl FromStr for S3Uri {
    type Err = S3UriParseError;

    fn from_str(s: &str) -> Result<Self, S3UriParseError> {
        let bucket_and_key = s.strip_prefix("s3://").ok_or(S3UriParseError::NoUri)?;

        let mut components = bucket_and_key.splitn(2, '/').take_while(|s| !s.is_empty());
        let bucket = components
            .next()
            .ok_or(S3UriParseError::InvalidFormat)?
            .to_owned();
        let key = components.next().map(|s| s.to_owned()).unwrap_or_default();

        Ok(S3Uri { bucket, key })
    }
}

impl<'de> Deserialize<'de> for S3Uri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for S3Uri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// Where a configuration document lives: a local file or an object in S3.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigLocation {
    Local(PathBuf),
    S3(S3Uri),
}

impl FromStr for ConfigLocation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<ConfigLocation> {
        match S3Uri::from_str(s) {
            Err(S3UriParseError::NoUri) => {}
            uri => {
                return Ok(ConfigLocation::S3(
                    uri.map_err(|e| anyhow::anyhow!("parsing an S3 URI: {e}"))?,
                ))
            }
        }
        Ok(ConfigLocation::Local(s.into()))
    }
}

impl<'de> Deserialize<'de> for ConfigLocation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A duration given as whole hours, minutes and seconds, used for user input
/// in flags or config files (session durations, refresh windows). Convert to
/// [`chrono::Duration`] with [`to_duration`](HmsDuration::to_duration) for
/// arithmetic.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HmsDuration {
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl HmsDuration {
    pub fn from_hms(hours: u32, minutes: u32, seconds: u32) -> HmsDuration {
        HmsDuration {
            hours,
            minutes,
            seconds,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        // Components aren't allowed to overflow unless they're the first
        // non-0 component
        if self.hours != 0 && self.minutes >= 60 {
            return Err("minutes > 59 are not allowed if hours is specified".into());
        }
        if (self.hours != 0 || self.minutes != 0) && self.seconds >= 60 {
            return Err("seconds > 59 are not allowed if hours or minutes are specified".into());
        }
        Ok(())
    }

    pub fn to_duration(&self) -> Duration {
        Duration::hours(self.hours.into())
            + Duration::minutes(self.minutes.into())
            + Duration::seconds(self.seconds.into())
    }
}

impl From<HmsDuration> for Duration {
    fn from(d: HmsDuration) -> Duration {
        d.to_duration()
    }
}

impl Display for HmsDuration {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        if self.hours != 0 {
            write!(f, "{}h", self.hours)?;
        }
        if self.minutes != 0 {
            write!(f, "{}m", self.minutes)?;
        }
        if self.seconds != 0 || (self.hours == 0 && self.minutes == 0) {
            write!(f, "{}s", self.seconds)?;
        }
        Ok(())
    }
}

impl FromStr for HmsDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<HmsDuration, String> {
        use once_cell::sync::Lazy;
        use regex::Regex;

        static RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

        let groups = RE
            .captures(s)
            .ok_or("not in expected format (e.g. 1h30m20s)")?;

        let parse_component = |group_idx, label| -> Result<u32, String> {
            groups
                .get(group_idx)
                .map_or(Ok(0), |x| u32::from_str(x.as_str()))
                .map_err(|e| format!("failed to parse {}: {}", label, e))
        };

        let d = HmsDuration {
            hours: parse_component(1, "hours")?,
            minutes: parse_component(2, "minutes")?,
            seconds: parse_component(3, "seconds")?,
        };
        d.validate()?;
        Ok(d)
    }
}

impl Serialize for HmsDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for HmsDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<HmsDuration, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

fn default_session_duration() -> i64 {
    3600
}

/// A role that may be assumed in a managed account.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleConfig {
    pub role_name: String,
    pub role_arn: String,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub mfa_required: bool,
    #[serde(default = "default_session_duration")]
    pub session_duration: i64,
}

/// One account in the multi-account configuration document.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub account_id: String,
    pub account_name: String,
    pub environment: String,
    pub default_region: String,
    #[serde(default)]
    pub roles: Vec<RoleConfig>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub mfa_required: bool,
    #[serde(default = "default_session_duration")]
    pub session_duration: i64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// The multi-account configuration document, loaded from a local file or an
/// `s3://` location.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiAccountConfig {
    pub organization: String,
    pub master_account: String,
    pub accounts: Vec<AccountConfig>,
}

impl MultiAccountConfig {
    pub fn from_reader(reader: impl std::io::Read) -> anyhow::Result<Self> {
        serde_json::from_reader(reader)
            .map_err(|e| anyhow::anyhow!("failed to parse multi-account configuration: {e}"))
    }

    pub fn load_local(path: &std::path::Path) -> anyhow::Result<Self> {
        let file = std::fs::File::open(path)
            .map_err(|e| anyhow::anyhow!("failed to open {}: {e}", path.display()))?;
        Self::from_reader(file)
    }

    /// Loads the document from wherever it lives: a local file or an object
    /// in S3.
    pub fn load(location: &ConfigLocation, s3: &crate::s3::S3Manager) -> anyhow::Result<Self> {
        match location {
            ConfigLocation::Local(path) => Self::load_local(path),
            ConfigLocation::S3(uri) => {
                let stream = s3.download_file(&uri.bucket, &uri.key).map_err(|e| {
                    anyhow::anyhow!("failed to download multi-account configuration: {e}")
                })?;
                Self::from_reader(stream)
            }
        }
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }

    /// All accounts tagged with the given environment name.
    pub fn accounts_in_environment(&self, environment: &str) -> Vec<&AccountConfig> {
        self.accounts
            .iter()
            .filter(|a| a.environment == environment)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_test::{assert_de_tokens, assert_tokens, Token};

    #[test]
    fn parse_s3uri() {
        let uri = S3Uri::from_str("s3://my-bucket/path/to/object").unwrap();
        assert_eq!(uri.bucket, "my-bucket");
        assert_eq!(uri.key, "path/to/object");
    }

    #[test]
    fn parse_s3uri_no_key() {
        let u1 = S3Uri::from_str("s3://my-bucket").unwrap();
        let u2 = S3Uri::from_str("s3://my-bucket/").unwrap();
        assert_eq!(u1.key, "");
        assert_eq!(u1, u2);
    }

    #[test]
    fn parse_invalid_s3uris() {
        let e = S3Uri::from_str("s3://").unwrap_err();
        assert_matches!(e, S3UriParseError::InvalidFormat);
        let e = S3Uri::from_str("http://localhost").unwrap_err();
        assert_matches!(e, S3UriParseError::NoUri);
    }

    #[test]
    fn deserialize_config_location() {
        assert_de_tokens(
            &ConfigLocation::S3("s3://my-bucket/accounts.json".parse().unwrap()),
            &[Token::Str("s3://my-bucket/accounts.json")],
        );
        assert_de_tokens(
            &ConfigLocation::Local("relative/path/accounts.json".into()),
            &[Token::Str("relative/path/accounts.json")],
        );
        assert_de_tokens(
            &ConfigLocation::Local("/absolute/path.json".into()),
            &[Token::Str("/absolute/path.json")],
        );
    }

    #[test]
    fn provider_kind_round_trip() {
        for (input, expected) in [
            ("aws", ProviderKind::Aws),
            ("AZURE", ProviderKind::Azure),
            ("gcloud", ProviderKind::Gcp),
        ] {
            assert_eq!(ProviderKind::from_str(input).unwrap(), expected);
        }
        ProviderKind::from_str("digitalocean").unwrap_err();
    }

    #[test]
    fn hmsduration_serialization() {
        let testcases = [
            (HmsDuration::from_hms(0, 0, 0), "0s"),
            (HmsDuration::from_hms(11, 0, 0), "11h"),
            (HmsDuration::from_hms(0, 22, 0), "22m"),
            (HmsDuration::from_hms(0, 0, 33), "33s"),
            (HmsDuration::from_hms(11, 22, 0), "11h22m"),
            (HmsDuration::from_hms(11, 0, 33), "11h33s"),
            (HmsDuration::from_hms(0, 22, 33), "22m33s"),
            (HmsDuration::from_hms(11, 22, 33), "11h22m33s"),
            // Allowed overflows
            (HmsDuration::from_hms(0, 0, 90), "90s"),
            (HmsDuration::from_hms(0, 90, 33), "90m33s"),
            (HmsDuration::from_hms(90, 22, 33), "90h22m33s"),
        ];

        for (duration, serialized) in &testcases {
            assert_tokens(duration, &[Token::Str(serialized)]);
        }
    }

    #[test]
    fn hmsduration_parse_errors() {
        let testcases = [
            ("123", "not in expected format"),
            ("h", "not in expected format"),
            ("33s22m", "not in expected format"),
            ("1m90s", "seconds > 59"),
            ("1h90m", "minutes > 59"),
            ("9999999999s", "failed to parse seconds"),
        ];

        for (serialized, expected_error) in &testcases {
            match HmsDuration::from_str(serialized) {
                Ok(val) => panic!(
                    "Expected {:?} to fail to deserialize, but it succeeded: {:?}",
                    serialized, val
                ),
                Err(err) if !err.contains(expected_error) => panic!(
                    "Expected {:?} to fail with {:?}, but failed with: {:?}",
                    serialized, expected_error, err
                ),
                _ => {}
            }
        }
    }

    #[test]
    fn multi_account_document() {
        let document = r#"{
            "organization": "apm-corp",
            "masterAccount": "111111111111",
            "accounts": [
                {
                    "accountId": "222222222222",
                    "accountName": "apm-prod",
                    "environment": "prod",
                    "defaultRegion": "us-east-1",
                    "roles": [
                        {
                            "roleName": "APMReader",
                            "roleArn": "arn:aws:iam::222222222222:role/APMReader",
                            "externalId": "abc-123",
                            "mfaRequired": false
                        }
                    ],
                    "tags": {"team": "observability"}
                },
                {
                    "accountId": "333333333333",
                    "accountName": "apm-staging",
                    "environment": "staging",
                    "defaultRegion": "us-west-2"
                }
            ]
        }"#;

        let config = MultiAccountConfig::from_reader(document.as_bytes()).unwrap();
        assert_eq!(config.organization, "apm-corp");
        assert_eq!(config.accounts.len(), 2);

        let prod = config.account("222222222222").unwrap();
        assert_eq!(prod.roles[0].role_name, "APMReader");
        assert_eq!(prod.roles[0].session_duration, 3600);
        assert_eq!(prod.roles[0].external_id.as_deref(), Some("abc-123"));
        assert_eq!(prod.tags["team"], "observability");

        assert_eq!(config.accounts_in_environment("staging").len(), 1);
        assert!(config.account("999999999999").is_none());
    }

    #[test]
    fn retry_settings_to_policy() {
        let policy = RetrySettings {
            initial_interval_ms: 250,
            max_attempts: 5,
        }
        .to_policy();
        assert_eq!(policy.initial_interval, StdDuration::from_millis(250));
        assert_eq!(policy.max_interval, StdDuration::from_secs(30));
        assert_eq!(policy.max_attempts, 5);
    }
}
