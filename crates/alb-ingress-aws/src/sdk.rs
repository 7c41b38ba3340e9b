//! SDK error classification shared by the ELBv2 and EC2 clients.

use alb_ingress_common::{AwsErrorKind, Error};
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;

/// Convert an SDK failure into our structured error, classifying it by
/// the service error code so the controller can pick a retry policy.
pub(crate) fn sdk_err<E, R>(operation: &'static str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata,
{
    let code = err.meta().code().map(str::to_string);
    let message = err
        .meta()
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{operation} failed"));

    let kind = classify(code.as_deref(), &err);
    let message = match &code {
        Some(c) => format!("{c}: {message}"),
        None => message,
    };
    Error::aws(operation, kind, message)
}

fn classify<E, R>(code: Option<&str>, err: &SdkError<E, R>) -> AwsErrorKind {
    // Connection-level failures never reached the service; treat them
    // like a 5xx and retry.
    if matches!(
        err,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_)
    ) {
        return AwsErrorKind::Server;
    }

    match code {
        Some(
            "Throttling"
            | "ThrottlingException"
            | "RequestLimitExceeded"
            | "TooManyRequestsException",
        ) => AwsErrorKind::Throttled,
        Some(
            "ResourceInUse"
            | "DuplicateTargetGroupName"
            | "DuplicateLoadBalancerName"
            | "DuplicateListener"
            | "PriorityInUse"
            | "DependencyViolation"
            | "InvalidGroup.Duplicate",
        ) => AwsErrorKind::Conflict,
        Some(
            "AccessDenied"
            | "AccessDeniedException"
            | "UnauthorizedOperation"
            | "InvalidClientTokenId"
            | "ExpiredToken"
            | "ExpiredTokenException"
            | "AuthFailure",
        ) => AwsErrorKind::Access,
        Some("InternalFailure" | "InternalError" | "ServiceUnavailable" | "RequestTimeout") => {
            AwsErrorKind::Server
        }
        _ => AwsErrorKind::Other,
    }
}
