//! Error types for the ALB ingress controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Each error variant includes contextual information like the Ingress
//! key, the failing AWS operation, and underlying causes. The controller
//! loop is the only place retry decisions are made; everything below it
//! propagates errors unchanged.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Classification of an AWS API failure, derived from the error code
/// returned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwsErrorKind {
    /// Request was throttled; retry with backoff, unbounded
    Throttled,
    /// Server-side or network failure; retry with backoff, unbounded
    Server,
    /// Resource conflict (`ResourceInUse`, duplicate names, priority
    /// collisions); retried a bounded number of times
    Conflict,
    /// Credentials or permissions problem; not retryable, surfaced via
    /// the health endpoint
    Access,
    /// Anything else the service returned
    Other,
}

/// Main error type for controller operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// AWS API error
    #[error("aws error [{operation}]: {message}")]
    Aws {
        /// The AWS operation that failed (e.g. "CreateLoadBalancer")
        operation: String,
        /// Description of what failed
        message: String,
        /// Classification driving the retry decision
        kind: AwsErrorKind,
    },

    /// Validation error for an Ingress spec or its annotations
    #[error("validation error for {ingress}: {message}")]
    Validation {
        /// `{namespace}/{name}` of the Ingress with invalid configuration
        ingress: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field or annotation (e.g. "alb.ingress.kubernetes.io/subnets")
        field: Option<String>,
    },

    /// Several leaf siblings failed during one reconciliation pass
    #[error("{}", format_composite(.errors))]
    Composite {
        /// The accumulated errors, in reconciliation order
        errors: Vec<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "assembler", "store")
        context: String,
    },
}

fn format_composite(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors: {}", errors.len(), parts.join("; "))
}

impl Error {
    /// Create an AWS error with the given operation and classification
    pub fn aws(
        operation: impl Into<String>,
        kind: AwsErrorKind,
        msg: impl Into<String>,
    ) -> Self {
        Self::Aws {
            operation: operation.into(),
            message: msg.into(),
            kind,
        }
    }

    /// Create a validation error without Ingress context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            ingress: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with Ingress context
    pub fn validation_for(ingress: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            ingress: ingress.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with Ingress context and the offending field
    pub fn validation_for_field(
        ingress: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            ingress: ingress.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Fold a batch of accumulated errors into one.
    ///
    /// Returns `Ok(())` for an empty batch and unwraps a singleton so
    /// callers never see a one-element composite.
    pub fn composite(mut errors: Vec<Error>) -> std::result::Result<(), Error> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Composite { errors }),
        }
    }

    /// Check if this error is retryable.
    ///
    /// Validation errors are not retryable (the Ingress spec must change).
    /// AWS access errors are not retryable (credentials must change).
    /// Kubernetes 4xx responses are not retryable; everything else is.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Aws { kind, .. } => !matches!(kind, AwsErrorKind::Access),
            Error::Validation { .. } => false,
            Error::Composite { errors } => errors.iter().any(Error::is_retryable),
            Error::Internal { .. } => true,
        }
    }

    /// Check if this error is (or contains) an AWS resource conflict.
    ///
    /// Conflicts get a bounded number of fixed-interval retries before the
    /// controller gives up and treats the Ingress as failed.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Aws { kind, .. } => *kind == AwsErrorKind::Conflict,
            Error::Composite { errors } => errors.iter().any(Error::is_conflict),
            _ => false,
        }
    }

    /// Check if this error indicates broken AWS credentials or permissions.
    ///
    /// These flip the health endpoint to failing.
    pub fn is_access(&self) -> bool {
        match self {
            Error::Aws { kind, .. } => *kind == AwsErrorKind::Access,
            Error::Composite { errors } => errors.iter().any(Error::is_access),
            _ => false,
        }
    }

    /// Get the Ingress key if this error is associated with a specific Ingress
    pub fn ingress(&self) -> Option<&str> {
        match self {
            Error::Validation { ingress, .. } => Some(ingress),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = Error::validation("fewer than 2 subnets supplied");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("subnets"));
    }

    #[test]
    fn validation_error_carries_ingress_and_field() {
        let err = Error::validation_for_field(
            "default/web",
            "alb.ingress.kubernetes.io/certificate-arn",
            "required for HTTPS listeners",
        );
        assert_eq!(err.ingress(), Some("default/web"));
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(
                    field.as_deref(),
                    Some("alb.ingress.kubernetes.io/certificate-arn")
                );
            }
            _ => panic!("expected Validation variant"),
        }
    }

    #[test]
    fn aws_error_retryability_follows_kind() {
        assert!(Error::aws("CreateRule", AwsErrorKind::Throttled, "slow down").is_retryable());
        assert!(Error::aws("CreateRule", AwsErrorKind::Server, "500").is_retryable());
        assert!(Error::aws("DeleteTargetGroup", AwsErrorKind::Conflict, "in use").is_retryable());
        assert!(!Error::aws("DescribeTags", AwsErrorKind::Access, "denied").is_retryable());
    }

    #[test]
    fn conflict_detection_sees_through_composites() {
        let composite = Error::composite(vec![
            Error::aws("CreateRule", AwsErrorKind::Server, "500"),
            Error::aws("CreateTargetGroup", AwsErrorKind::Conflict, "duplicate name"),
        ])
        .expect_err("two errors should fold into a composite");

        assert!(composite.is_conflict());
        assert!(composite.is_retryable());
        assert!(!composite.is_access());
    }

    #[test]
    fn composite_folds_empty_and_singleton_batches() {
        assert!(Error::composite(vec![]).is_ok());

        let single = Error::composite(vec![Error::validation("bad")])
            .expect_err("singleton should produce an error");
        assert!(matches!(single, Error::Validation { .. }));
    }

    #[test]
    fn composite_message_joins_parts() {
        let err = Error::composite(vec![
            Error::validation("first"),
            Error::internal("second"),
        ])
        .expect_err("two errors should fold into a composite");
        let msg = err.to_string();
        assert!(msg.starts_with("2 errors:"));
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
    }

    #[test]
    fn access_errors_are_fatal_not_retried() {
        let err = Error::aws("DescribeLoadBalancers", AwsErrorKind::Access, "expired token");
        assert!(err.is_access());
        assert!(!err.is_retryable());
    }

    #[test]
    fn internal_error_has_context() {
        let err = Error::internal_with_context("store", "tree missing after merge");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("[store]"));
    }
}
