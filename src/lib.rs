#![allow(clippy::too_many_arguments)]

//! Multi-cloud orchestration toolkit for an APM platform.
//!
//! The crate wraps the vendor command line tools (`aws`, `az`, `gcloud`,
//! `docker`), normalizes their JSON output into a stable domain model, and
//! layers credential lifecycle, caching, bounded concurrency and retry
//! semantics on top. The [`provider::CloudProvider`] capability set is the
//! cross-cloud surface; the AWS provider additionally exposes the ECR, EKS,
//! CloudFormation, S3 and CloudWatch sub-managers.

use anyhow::Result;

pub mod cli;
pub mod cloudformation;
pub mod cloudwatch;
pub mod config;
pub mod credentials;
pub mod ecr;
pub mod eks;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod region;
mod retries;
pub mod s3;
pub mod session;
pub mod test_utils;
mod work_queue;

pub use error::{CloudError, ErrorKind};

/// This trait captures whether a given failure is permanent (bad input,
/// missing resource, denied access) or transient (service hiccups, throttling,
/// timeouts), in which case the operation may be retried.
pub trait ErrorClassification {
    fn is_retryable(&self) -> bool;
}

/// Top-level error for the `cloudctl` binary and other embedders.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error("command line parsing error: {0}")]
    Clap(#[from] clap::Error),
    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),
    #[error("error parsing time: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("failed to deserialize JSON document: {0}")]
    BadDocument(serde_json::Error),
}

impl ErrorClassification for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Catch-all error type -- retries OK.
            Error::AnyhowError(_) => true,
            // Dispatch to the typed cloud error.
            Error::Cloud(e) => e.is_retryable(),
            // These indicate a problem with how the process was invoked or
            // with data from an outside source; re-running cannot help.
            Error::Clap(_)
            | Error::MissingArguments(_)
            | Error::TimeParse(_)
            | Error::BadDocument(_) => false,
        }
    }
}

/// Parses a JSON document from a reader into a [`serde_json::Value`],
/// wrapping failures in the crate error.
pub fn parse_json_document(reader: impl std::io::Read) -> Result<serde_json::Value, Error> {
    serde_json::from_reader(reader).map_err(Error::BadDocument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CloudError, ErrorKind};

    #[test]
    fn error_classification_dispatches_to_cloud_error() {
        let retryable: Error =
            CloudError::new("aws", ErrorKind::Throttled, "ListStacks", "slow down").into();
        assert!(retryable.is_retryable());

        let fatal: Error =
            CloudError::new("aws", ErrorKind::AccessDenied, "ListStacks", "denied").into();
        assert!(!fatal.is_retryable());

        let missing = Error::MissingArguments("role-arn");
        assert!(!missing.is_retryable());
    }
}
