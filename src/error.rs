//! The typed error surface shared by every provider operation.
//!
//! All outbound cloud calls, whether they succeed through a vendor CLI or die
//! in a subprocess, report failure as a [`CloudError`]. The error carries the
//! originating operation name, a machine-readable [`ErrorKind`], and a
//! retryable flag so callers (and the retry layer) never have to parse
//! message text.

use crate::ErrorClassification;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt::{self, Display, Formatter};

/// Machine-readable classification of a failed cloud operation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    BucketNotFound,
    ObjectNotFound,
    AccessDenied,
    BucketAlreadyExists,
    BucketNotEmpty,
    InvalidBucketName,
    InvalidRequest,
    InternalError,
    ServiceUnavailable,
    RequestTimeout,
    Throttled,
    Unknown,
}

impl ErrorKind {
    /// The stable wire code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::BucketNotFound => "BUCKET_NOT_FOUND",
            ErrorKind::ObjectNotFound => "OBJECT_NOT_FOUND",
            ErrorKind::AccessDenied => "ACCESS_DENIED",
            ErrorKind::BucketAlreadyExists => "BUCKET_ALREADY_EXISTS",
            ErrorKind::BucketNotEmpty => "S3_BUCKET_NOT_EMPTY",
            ErrorKind::InvalidBucketName => "INVALID_BUCKET_NAME",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::InternalError => "INTERNAL_ERROR",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorKind::Throttled => "THROTTLED",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether an operation failing with this kind may be re-attempted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::InternalError
                | ErrorKind::ServiceUnavailable
                | ErrorKind::RequestTimeout
                | ErrorKind::Throttled
                | ErrorKind::Unknown
        )
    }

    /// The HTTP status code conventionally associated with this kind, used to
    /// fill the wire shape when the CLI did not report one.
    pub fn default_status_code(&self) -> Option<u16> {
        match self {
            ErrorKind::BucketNotFound | ErrorKind::ObjectNotFound => Some(404),
            ErrorKind::AccessDenied => Some(403),
            ErrorKind::BucketAlreadyExists | ErrorKind::BucketNotEmpty => Some(409),
            ErrorKind::InvalidBucketName | ErrorKind::InvalidRequest => Some(400),
            ErrorKind::InternalError => Some(500),
            ErrorKind::ServiceUnavailable => Some(503),
            ErrorKind::RequestTimeout => Some(408),
            ErrorKind::Throttled => Some(429),
            ErrorKind::Unknown => None,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Classify the stderr of a failed vendor CLI invocation.
///
/// Vendor CLIs report service errors as free-form text containing the service
/// error code. The match order matters: specific service codes are matched
/// before the transport-level fallbacks.
pub fn classify_stderr(stderr: &str) -> ErrorKind {
    const TABLE: &[(&[&str], ErrorKind)] = &[
        (
            &["NoSuchBucket", "The specified bucket does not exist"],
            ErrorKind::BucketNotFound,
        ),
        (
            &[
                "NoSuchKey",
                "NotFoundException",
                "ResourceNotFoundException",
                "404",
            ],
            ErrorKind::ObjectNotFound,
        ),
        (
            &[
                "AccessDenied",
                "AccessDeniedException",
                "UnauthorizedOperation",
                "not authorized",
            ],
            ErrorKind::AccessDenied,
        ),
        (
            &["BucketAlreadyExists", "BucketAlreadyOwnedByYou"],
            ErrorKind::BucketAlreadyExists,
        ),
        (&["BucketNotEmpty"], ErrorKind::BucketNotEmpty),
        (
            &[
                "Throttling",
                "ThrottlingException",
                "SlowDown",
                "TooManyRequestsException",
                "Rate exceeded",
            ],
            ErrorKind::Throttled,
        ),
        (
            &["RequestTimeout", "RequestTimeTooSkewed", "timed out"],
            ErrorKind::RequestTimeout,
        ),
        (
            &["ServiceUnavailable", "Service Unavailable", "503"],
            ErrorKind::ServiceUnavailable,
        ),
        (
            &["InternalError", "InternalFailure", "InternalServiceError"],
            ErrorKind::InternalError,
        ),
        (
            &[
                "ValidationError",
                "ValidationException",
                "InvalidParameter",
                "InvalidRequest",
                "MalformedPolicyDocument",
                "InvalidArgument",
            ],
            ErrorKind::InvalidRequest,
        ),
    ];

    for (needles, kind) in TABLE {
        if needles.iter().any(|needle| stderr.contains(needle)) {
            return *kind;
        }
    }
    ErrorKind::Unknown
}

/// The error value returned by every provider operation.
#[derive(Debug, thiserror::Error)]
#[error("[{provider}] {operation}: {kind}: {message}")]
pub struct CloudError {
    /// The provider (or local tool) the failed call was addressed to.
    pub provider: &'static str,
    pub kind: ErrorKind,
    pub message: String,
    /// Name of the operation that failed, e.g. `CreateBucket`.
    pub operation: String,
    pub retryable: bool,
    pub status_code: Option<u16>,
    pub timestamp: DateTime<Utc>,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CloudError {
    pub fn new(
        provider: &'static str,
        kind: ErrorKind,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CloudError {
            provider,
            kind,
            message: message.into(),
            operation: operation.into(),
            retryable: kind.is_retryable(),
            status_code: kind.default_status_code(),
            timestamp: Utc::now(),
            cause: None,
        }
    }

    pub fn with_cause(
        mut self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    /// Re-labels the operation, used when a lower-level failure is surfaced
    /// from a composite operation.
    pub fn in_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }
}

impl ErrorClassification for CloudError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
}

// The serialized form is the cross-process wire shape; the cause chain is
// flattened into a string because callers on the other side cannot downcast.
impl Serialize for CloudError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CloudError", 8)?;
        state.serialize_field("provider", self.provider)?;
        state.serialize_field("code", self.kind.code())?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("operation", &self.operation)?;
        state.serialize_field("retryable", &self.retryable)?;
        state.serialize_field("statusCode", &self.status_code)?;
        state.serialize_field("timestamp", &self.timestamp.to_rfc3339())?;
        state.serialize_field("cause", &self.cause.as_ref().map(|c| c.to_string()))?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let retryable = [
            ErrorKind::InternalError,
            ErrorKind::ServiceUnavailable,
            ErrorKind::RequestTimeout,
            ErrorKind::Throttled,
            ErrorKind::Unknown,
        ];
        let fatal = [
            ErrorKind::BucketNotFound,
            ErrorKind::ObjectNotFound,
            ErrorKind::AccessDenied,
            ErrorKind::BucketAlreadyExists,
            ErrorKind::BucketNotEmpty,
            ErrorKind::InvalidBucketName,
            ErrorKind::InvalidRequest,
        ];
        for kind in retryable {
            assert!(kind.is_retryable(), "{} should be retryable", kind);
        }
        for kind in fatal {
            assert!(!kind.is_retryable(), "{} should not be retryable", kind);
        }
    }

    #[test]
    fn classify_service_codes() {
        let cases = [
            (
                "An error occurred (NoSuchBucket) when calling the HeadBucket operation",
                ErrorKind::BucketNotFound,
            ),
            (
                "An error occurred (NoSuchKey) when calling the GetObject operation",
                ErrorKind::ObjectNotFound,
            ),
            (
                "An error occurred (AccessDenied) when calling the PutObject operation",
                ErrorKind::AccessDenied,
            ),
            (
                "An error occurred (BucketAlreadyOwnedByYou) when calling CreateBucket",
                ErrorKind::BucketAlreadyExists,
            ),
            (
                "An error occurred (BucketNotEmpty) when calling DeleteBucket",
                ErrorKind::BucketNotEmpty,
            ),
            (
                "An error occurred (Throttling) when calling DescribeStacks: Rate exceeded",
                ErrorKind::Throttled,
            ),
            ("Read timed out", ErrorKind::RequestTimeout),
            (
                "An error occurred (ServiceUnavailable): Please reduce your request rate",
                ErrorKind::ServiceUnavailable,
            ),
            (
                "An error occurred (InternalError): We encountered an internal error",
                ErrorKind::InternalError,
            ),
            (
                "An error occurred (ValidationError): Template format error",
                ErrorKind::InvalidRequest,
            ),
            ("something nobody has seen before", ErrorKind::Unknown),
        ];
        for (stderr, expected) in cases {
            assert_eq!(classify_stderr(stderr), expected, "stderr: {}", stderr);
        }
    }

    #[test]
    fn wire_shape() {
        let err = CloudError::new("aws", ErrorKind::AccessDenied, "PutObject", "denied")
            .with_cause(std::io::Error::new(std::io::ErrorKind::Other, "underlying"));
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["provider"], "aws");
        assert_eq!(value["code"], "ACCESS_DENIED");
        assert_eq!(value["operation"], "PutObject");
        assert_eq!(value["retryable"], false);
        assert_eq!(value["statusCode"], 403);
        assert_eq!(value["cause"], "underlying");
        assert!(value["timestamp"].as_str().is_some());
    }
}
