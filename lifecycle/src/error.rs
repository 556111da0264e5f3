use aws_sdk_ec2::types::SdkError;
use snafu::Snafu;
use std::fmt;
use std::path::PathBuf;
use tokio::time::error::Elapsed;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Failed to {} ({}): {}", what, kind, message))]
    Api {
        what: String,
        kind: ApiErrorKind,
        message: String,
    },

    #[snafu(display("Error running '{}', exit code {}\nstderr:\n{}", hint, code, stderr))]
    Command {
        hint: String,
        code: i32,
        stderr: String,
    },

    #[snafu(display("{} became '{}'", what, state))]
    FailedState { what: String, state: String },

    #[snafu(display("'{}' is not a valid issuer url: {}", url, source))]
    IssuerUrl {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("Unable to deserialize manifest '{}': {}", path.display(), source))]
    ManifestDeserialize {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[snafu(display("Manifest is invalid: {}", reason))]
    ManifestInvalid { reason: String },

    #[snafu(display("Unable to read manifest '{}': {}", path.display(), source))]
    ManifestRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Unable to serialize manifest: {}", source))]
    ManifestSerialize { source: serde_json::Error },

    #[snafu(display(
        "Manifest schema version {} is not supported (expected {})",
        found,
        expected
    ))]
    ManifestVersion { found: u32, expected: u32 },

    #[snafu(display("Unable to write manifest '{}': {}", path.display(), source))]
    ManifestWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("{} was missing from {}", what, from))]
    Missing { what: String, from: String },

    #[snafu(display("Failed to create '{}' process: {}", what, source))]
    Process {
        what: String,
        source: std::io::Error,
    },

    #[snafu(display("Failed to remove file at '{}': {}", path.display(), source))]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Gave up waiting for {} after {} attempts", what, attempts))]
    WaitAttempts { what: String, attempts: u32 },

    #[snafu(display("Timed out waiting for {}", what))]
    WaitTimeout { what: String, source: Elapsed },

    #[snafu(display("Failed to write file at '{}': {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The classification of an AWS service error, used to decide whether a failure is ignorable
/// (a deletion target that is already gone, a policy that already exists), retryable, or fatal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApiErrorKind {
    NotFound,
    AlreadyExists,
    AccessDenied,
    Conflict,
    Throttled,
    Other,
}

impl fmt::Display for ApiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ApiErrorKind::NotFound => "not found",
            ApiErrorKind::AlreadyExists => "already exists",
            ApiErrorKind::AccessDenied => "access denied",
            ApiErrorKind::Conflict => "dependency conflict",
            ApiErrorKind::Throttled => "throttled",
            ApiErrorKind::Other => "error",
        };
        write!(f, "{}", name)
    }
}

/// Map a service error code to its classification. Covers the code families of the services we
/// call: EC2 (`InvalidVpcID.NotFound`, `Gateway.NotAttached`, `DependencyViolation`), EKS
/// (`ResourceNotFoundException`, `ResourceInUseException`), IAM (`NoSuchEntity`,
/// `EntityAlreadyExists`, `DeleteConflict`) and STS (`AccessDenied`). A detach call rerun after
/// a prior teardown already detached the resource reports `.NotAttached`; for convergence that
/// is the same as the resource being gone.
pub fn classify_code(code: Option<&str>) -> ApiErrorKind {
    let code = match code {
        Some(code) => code,
        None => return ApiErrorKind::Other,
    };
    if code.contains("NotFound")
        || code.ends_with(".NotAttached")
        || code == "NoSuchEntity"
        || code == "NoSuchEntityException"
    {
        ApiErrorKind::NotFound
    } else if code.contains("AlreadyExists") || code.contains("Duplicate") {
        ApiErrorKind::AlreadyExists
    } else if code.starts_with("AccessDenied") || code == "UnauthorizedOperation" {
        ApiErrorKind::AccessDenied
    } else if code == "DependencyViolation"
        || code == "DeleteConflict"
        || code == "DeleteConflictException"
        || code == "ResourceInUseException"
    {
        ApiErrorKind::Conflict
    } else if code.contains("Throttl") || code == "RequestLimitExceeded" {
        ApiErrorKind::Throttled
    } else {
        ApiErrorKind::Other
    }
}

/// Access to the modeled error code of a generated SDK error type.
pub trait ErrorCode {
    fn error_code(&self) -> Option<&str>;
}

macro_rules! impl_error_code {
    ($($error:ty),* $(,)?) => {
        $(impl ErrorCode for $error {
            fn error_code(&self) -> Option<&str> {
                self.code()
            }
        })*
    };
}

impl_error_code!(
    aws_sdk_ec2::error::AssociateRouteTableError,
    aws_sdk_ec2::error::AttachInternetGatewayError,
    aws_sdk_ec2::error::AuthorizeSecurityGroupIngressError,
    aws_sdk_ec2::error::CreateInternetGatewayError,
    aws_sdk_ec2::error::CreateRouteError,
    aws_sdk_ec2::error::CreateRouteTableError,
    aws_sdk_ec2::error::CreateSecurityGroupError,
    aws_sdk_ec2::error::CreateSubnetError,
    aws_sdk_ec2::error::CreateVpcError,
    aws_sdk_ec2::error::DeleteInternetGatewayError,
    aws_sdk_ec2::error::DeleteRouteError,
    aws_sdk_ec2::error::DeleteRouteTableError,
    aws_sdk_ec2::error::DeleteSecurityGroupError,
    aws_sdk_ec2::error::DeleteSubnetError,
    aws_sdk_ec2::error::DeleteVpcError,
    aws_sdk_ec2::error::DescribeAvailabilityZonesError,
    aws_sdk_ec2::error::DescribeNetworkInterfacesError,
    aws_sdk_ec2::error::DescribeRouteTablesError,
    aws_sdk_ec2::error::DetachInternetGatewayError,
    aws_sdk_ec2::error::DisassociateRouteTableError,
    aws_sdk_ec2::error::ModifySubnetAttributeError,
    aws_sdk_ec2::error::ModifyVpcAttributeError,
    aws_sdk_eks::error::CreateClusterError,
    aws_sdk_eks::error::CreateNodegroupError,
    aws_sdk_eks::error::DeleteClusterError,
    aws_sdk_eks::error::DeleteNodegroupError,
    aws_sdk_eks::error::DescribeClusterError,
    aws_sdk_eks::error::DescribeNodegroupError,
    aws_sdk_elasticloadbalancingv2::error::DescribeLoadBalancersError,
    aws_sdk_elasticloadbalancingv2::error::DescribeTagsError,
    aws_sdk_iam::error::AttachRolePolicyError,
    aws_sdk_iam::error::CreateOpenIDConnectProviderError,
    aws_sdk_iam::error::CreatePolicyError,
    aws_sdk_iam::error::CreateRoleError,
    aws_sdk_iam::error::DeleteOpenIDConnectProviderError,
    aws_sdk_iam::error::DeletePolicyError,
    aws_sdk_iam::error::DeleteRoleError,
    aws_sdk_iam::error::DetachRolePolicyError,
    aws_sdk_iam::error::ListAttachedRolePoliciesError,
    aws_sdk_sts::error::AssumeRoleError,
    aws_sdk_sts::error::GetCallerIdentityError,
);

/// Classify an SDK result's error. Anything that is not a service error (timeouts, connector
/// failures) is `Other`; the SDK's own retry configuration has already dealt with transient
/// dispatch problems by the time we see them.
pub fn classify<E>(error: &SdkError<E>) -> ApiErrorKind
where
    E: ErrorCode,
{
    match error {
        SdkError::ServiceError(context) => classify_code(context.err().error_code()),
        _ => ApiErrorKind::Other,
    }
}

fn describe<E>(error: &SdkError<E>) -> String
where
    E: std::error::Error,
{
    match error {
        SdkError::ServiceError(context) => context.err().to_string(),
        other => format!("{:?}", other),
    }
}

/// Conversion from SDK results to classified `Error::Api` values, with the tolerance policies the
/// workflows need: `allow_missing` for re-runnable deletion steps and `allow_existing` for the
/// add-on policy creations that may race a previous run.
pub trait SdkResultExt<T> {
    fn api_context<S: Into<String>>(self, what: S) -> Result<T>;

    /// `Ok(None)` when the service reports the resource does not exist.
    fn allow_missing<S: Into<String>>(self, what: S) -> Result<Option<T>>;

    /// `Ok(None)` when the service reports the resource already exists.
    fn allow_existing<S: Into<String>>(self, what: S) -> Result<Option<T>>;
}

impl<T, E> SdkResultExt<T> for std::result::Result<T, SdkError<E>>
where
    E: ErrorCode + std::error::Error + Send + Sync + 'static,
{
    fn api_context<S: Into<String>>(self, what: S) -> Result<T> {
        self.map_err(|error| Error::Api {
            what: what.into(),
            kind: classify(&error),
            message: describe(&error),
        })
    }

    fn allow_missing<S: Into<String>>(self, what: S) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(error) if classify(&error) == ApiErrorKind::NotFound => Ok(None),
            Err(error) => Err(Error::Api {
                what: what.into(),
                kind: classify(&error),
                message: describe(&error),
            }),
        }
    }

    fn allow_existing<S: Into<String>>(self, what: S) -> Result<Option<T>> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(error) if classify(&error) == ApiErrorKind::AlreadyExists => Ok(None),
            Err(error) => Err(Error::Api {
                what: what.into(),
                kind: classify(&error),
                message: describe(&error),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_code, ApiErrorKind};

    #[test]
    fn not_found_codes() {
        assert_eq!(
            classify_code(Some("InvalidVpcID.NotFound")),
            ApiErrorKind::NotFound
        );
        assert_eq!(
            classify_code(Some("ResourceNotFoundException")),
            ApiErrorKind::NotFound
        );
        assert_eq!(classify_code(Some("NoSuchEntity")), ApiErrorKind::NotFound);
    }

    // A rerun may detach an internet gateway that a prior partial run already detached; the
    // second detach must count as already clean.
    #[test]
    fn an_already_detached_gateway_counts_as_not_found() {
        assert_eq!(
            classify_code(Some("Gateway.NotAttached")),
            ApiErrorKind::NotFound
        );
    }

    #[test]
    fn already_exists_codes() {
        assert_eq!(
            classify_code(Some("EntityAlreadyExists")),
            ApiErrorKind::AlreadyExists
        );
        assert_eq!(
            classify_code(Some("InvalidPermission.Duplicate")),
            ApiErrorKind::AlreadyExists
        );
    }

    #[test]
    fn access_denied_codes() {
        assert_eq!(
            classify_code(Some("AccessDenied")),
            ApiErrorKind::AccessDenied
        );
        assert_eq!(
            classify_code(Some("AccessDeniedException")),
            ApiErrorKind::AccessDenied
        );
        assert_eq!(
            classify_code(Some("UnauthorizedOperation")),
            ApiErrorKind::AccessDenied
        );
    }

    #[test]
    fn conflict_codes() {
        assert_eq!(
            classify_code(Some("DependencyViolation")),
            ApiErrorKind::Conflict
        );
        assert_eq!(
            classify_code(Some("ResourceInUseException")),
            ApiErrorKind::Conflict
        );
        assert_eq!(classify_code(Some("DeleteConflict")), ApiErrorKind::Conflict);
    }

    #[test]
    fn throttling_and_unknown_codes() {
        assert_eq!(
            classify_code(Some("RequestLimitExceeded")),
            ApiErrorKind::Throttled
        );
        assert_eq!(
            classify_code(Some("ThrottlingException")),
            ApiErrorKind::Throttled
        );
        assert_eq!(classify_code(Some("InternalError")), ApiErrorKind::Other);
        assert_eq!(classify_code(None), ApiErrorKind::Other);
    }
}
