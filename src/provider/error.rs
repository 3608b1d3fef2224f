//! Provider error classification.
//!
//! Failures are classified once, where they leave the provider boundary, so
//! the poller and the drivers only ever look at [`ProviderErrorKind`].

use std::fmt;

/// Result alias for provider facade calls
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// How a provider failure should be treated by callers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Throttled, retryable, or "not visible yet"; try again
    Transient,
    /// The resource does not exist (maps to `DELETED/NOT-EXIST`)
    NotFound,
    /// The resource already exists
    AlreadyExists,
    /// The per-call deadline expired
    Timeout,
    /// Anything else
    Other,
}

/// A failed provider call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderError {
    /// Service name, e.g. `cloudformation`
    pub service: String,
    /// Operation name, e.g. `DescribeStacks`
    pub operation: String,
    /// Provider error code when one was reported
    pub code: Option<String>,
    /// Human-readable message
    pub message: String,
    /// Classification
    pub kind: ProviderErrorKind,
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.operation)?;
        if let Some(code) = &self.code {
            write!(f, " ({code})")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for ProviderError {}

impl ProviderError {
    /// Build an error with an explicit classification
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        kind: ProviderErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            code: None,
            message: message.into(),
            kind,
        }
    }

    /// Attach the provider error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Build an error from a provider code and message, classifying it
    pub fn from_code(
        service: impl Into<String>,
        operation: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let message = message.into();
        let kind = classify(&code, &message);
        Self {
            service: service.into(),
            operation: operation.into(),
            code: Some(code),
            message,
            kind,
        }
    }

    /// True for throttling and other retryable failures
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Transient | ProviderErrorKind::Timeout
        )
    }

    /// True when the resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    /// True when the resource already exists
    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }
}

const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "RequestThrottled",
    "SlowDown",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "InternalFailure",
    "InternalError",
    "InternalServerError",
    "ServerException",
    "RequestTimeout",
    "RequestTimeoutException",
    "PriorRequestNotComplete",
    "OperationAborted",
    "ConcurrentModification",
    "ConcurrentModificationException",
    "IDPCommunicationError",
];

const NOT_FOUND_CODES: &[&str] = &[
    "ResourceNotFoundException",
    "NoSuchEntity",
    "NoSuchBucket",
    "NoSuchKey",
    "NotFoundException",
    "NotFound",
    "LoadBalancerNotFound",
    "ListenerNotFound",
    "RuleNotFound",
    "TargetGroupNotFound",
    "InvalidKeyPair.NotFound",
    "InvalidInstanceID.NotFound",
];

const ALREADY_EXISTS_CODES: &[&str] = &[
    "AlreadyExistsException",
    "EntityAlreadyExists",
    "BucketAlreadyOwnedByYou",
    "InvalidKeyPair.Duplicate",
    "ResourceInUseException",
];

/// Map a provider error code (and message) to a [`ProviderErrorKind`].
pub fn classify(code: &str, message: &str) -> ProviderErrorKind {
    if TRANSIENT_CODES.contains(&code) {
        return ProviderErrorKind::Transient;
    }
    if NOT_FOUND_CODES.contains(&code) {
        return ProviderErrorKind::NotFound;
    }
    if ALREADY_EXISTS_CODES.contains(&code) {
        return ProviderErrorKind::AlreadyExists;
    }
    // CloudFormation reports a missing stack as a ValidationError
    if code == "ValidationError" && message.contains("does not exist") {
        return ProviderErrorKind::NotFound;
    }
    // IAM role/instance-profile propagation lag surfaces as InvalidParameter
    if message.contains("does not yet exist") || message.contains("not authorized to perform: iam:PassRole") {
        return ProviderErrorKind::Transient;
    }
    ProviderErrorKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_transient() {
        let e = ProviderError::from_code("cloudformation", "DescribeStacks", "Throttling", "Rate exceeded");
        assert!(e.is_transient());
        assert!(!e.is_not_found());
    }

    #[test]
    fn missing_cluster_is_not_found() {
        let e = ProviderError::from_code(
            "eks",
            "DescribeCluster",
            "ResourceNotFoundException",
            "No cluster found for name: test-001.",
        );
        assert!(e.is_not_found());
    }

    #[test]
    fn missing_stack_validation_error_is_not_found() {
        let e = ProviderError::from_code(
            "cloudformation",
            "DescribeStacks",
            "ValidationError",
            "Stack with id test-001-vpc does not exist",
        );
        assert!(e.is_not_found());

        let e = ProviderError::from_code(
            "cloudformation",
            "CreateStack",
            "ValidationError",
            "Template format error",
        );
        assert_eq!(e.kind, ProviderErrorKind::Other);
    }

    #[test]
    fn role_propagation_lag_is_transient() {
        assert_eq!(
            classify(
                "InvalidParameterException",
                "Role with arn: arn:aws:iam::123:role/x, does not yet exist"
            ),
            ProviderErrorKind::Transient
        );
    }

    #[test]
    fn display_includes_service_operation_and_code() {
        let e = ProviderError::from_code("elbv2", "DeleteLoadBalancer", "LoadBalancerNotFound", "gone");
        assert_eq!(e.to_string(), "elbv2:DeleteLoadBalancer (LoadBalancerNotFound): gone");
        assert!(e.is_not_found());
    }
}
