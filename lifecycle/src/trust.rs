//! Cross-account access: creating a role another account may assume, gated on a shared external
//! id and a recent MFA session, and verifying end to end that assuming it works.

use crate::aws::{sdk_config, sdk_config_from_credentials};
use crate::constants::{
    DEFAULT_ASSUME_ROLE_SESSION_DURATION, MAX_MFA_SESSION_AGE, READ_ONLY_ACCESS_POLICY_ARN,
};
use crate::error::{self, Result, SdkResultExt};
use crate::policy;
use log::info;
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use std::fs;
use std::path::Path;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct TrustSetupRequest {
    /// Name of the role to create in the current account.
    pub role_name: String,
    /// Account id whose principals may assume the role.
    pub trusted_account_id: String,
    pub region: Option<String>,
}

/// What the trusted account's administrator needs: the role arn, the external id their
/// principals must present, and a ready-made policy granting exactly that assumption.
#[derive(Clone, Debug)]
pub struct TrustSetupOutcome {
    pub role_arn: String,
    pub external_id: String,
    pub assumer_policy: String,
}

/// A fresh external id. Random and long enough that the trusted account cannot be tricked into
/// presenting it on someone else's behalf (the confused deputy).
pub fn new_external_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Create the cross-account role with read-only access and write the assumer policy document to
/// `policy_path` for the trusted account's administrator.
pub async fn setup(request: &TrustSetupRequest, policy_path: &Path) -> Result<TrustSetupOutcome> {
    let config = sdk_config(&request.region, &None).await;
    let iam = aws_sdk_iam::Client::new(&config);

    let external_id = new_external_id();
    info!("Creating cross-account role '{}'", request.role_name);
    let role_arn = iam
        .create_role()
        .role_name(&request.role_name)
        .assume_role_policy_document(policy::cross_account_trust_policy(
            &request.trusted_account_id,
            &external_id,
            MAX_MFA_SESSION_AGE,
        ))
        .send()
        .await
        .api_context(format!("create role '{}'", request.role_name))?
        .role
        .and_then(|role| role.arn)
        .context(error::MissingSnafu {
            what: "role arn",
            from: "CreateRole response",
        })?;
    iam.attach_role_policy()
        .role_name(&request.role_name)
        .policy_arn(READ_ONLY_ACCESS_POLICY_ARN)
        .send()
        .await
        .api_context(format!("attach read-only access to '{}'", request.role_name))?;

    let assumer_policy = policy::assumer_policy(&role_arn, &external_id);
    fs::write(policy_path, &assumer_policy).context(error::WriteFileSnafu {
        path: policy_path,
    })?;
    info!("Wrote assumer policy to '{}'", policy_path.display());

    Ok(TrustSetupOutcome {
        role_arn,
        external_id,
        assumer_policy,
    })
}

#[derive(Clone, Debug)]
pub struct TrustTestRequest {
    pub role_arn: String,
    pub external_id: String,
    /// Arn of the MFA device to authenticate with, with `mfa_token`. The role's trust policy
    /// requires an MFA session, so assumption fails without these unless the caller's session
    /// already carries MFA.
    pub mfa_serial: Option<String>,
    pub mfa_token: Option<String>,
    pub region: Option<String>,
}

/// Who the assumed session turned out to be, per the target account's STS.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssumedIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

impl std::fmt::Display for AssumedIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!("Serialization failed: {}", e));
        std::fmt::Display::fmt(&s, f)
    }
}

/// Assume the role with the external id (and MFA, if provided), then ask STS who we are using
/// only the temporary credentials. Proves the whole chain: trust policy, external id, MFA
/// condition, and the issued credentials themselves.
pub async fn verify(request: &TrustTestRequest) -> Result<AssumedIdentity> {
    let config = sdk_config(&request.region, &None).await;
    let sts = aws_sdk_sts::Client::new(&config);

    info!("Assuming '{}'", request.role_arn);
    let mut assume_role = sts
        .assume_role()
        .role_arn(&request.role_arn)
        .role_session_name("trust-verification")
        .external_id(&request.external_id)
        .duration_seconds(DEFAULT_ASSUME_ROLE_SESSION_DURATION);
    if let (Some(serial), Some(token)) = (&request.mfa_serial, &request.mfa_token) {
        assume_role = assume_role.serial_number(serial).token_code(token);
    }
    let credentials = assume_role
        .send()
        .await
        .api_context(format!("assume role '{}'", request.role_arn))?
        .credentials
        .context(error::MissingSnafu {
            what: "credentials",
            from: "AssumeRole response",
        })?;

    let access_key_id = credentials.access_key_id.context(error::MissingSnafu {
        what: "access key id",
        from: "AssumeRole credentials",
    })?;
    let secret_access_key = credentials
        .secret_access_key
        .context(error::MissingSnafu {
            what: "secret access key",
            from: "AssumeRole credentials",
        })?;

    let assumed_config = sdk_config_from_credentials(
        &access_key_id,
        &secret_access_key,
        credentials.session_token,
        &request.region,
    )
    .await;
    let assumed_sts = aws_sdk_sts::Client::new(&assumed_config);
    let identity = assumed_sts
        .get_caller_identity()
        .send()
        .await
        .api_context("get caller identity with assumed credentials")?;

    let identity = AssumedIdentity {
        account: identity.account.context(error::MissingSnafu {
            what: "account id",
            from: "GetCallerIdentity response",
        })?,
        arn: identity.arn.context(error::MissingSnafu {
            what: "caller arn",
            from: "GetCallerIdentity response",
        })?,
        user_id: identity.user_id.context(error::MissingSnafu {
            what: "user id",
            from: "GetCallerIdentity response",
        })?,
    };
    info!("Assumed identity: {}", identity);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::new_external_id;

    #[test]
    fn external_ids_are_long_and_unique() {
        let first = new_external_id();
        let second = new_external_id();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
