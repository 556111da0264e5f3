use anyhow::{Context, Result};
use clap::Parser;
use lifecycle::trust::{self, TrustSetupRequest};
use log::warn;
use std::fs;
use std::path::PathBuf;

/// The trust-setup subcommand creates a read-only role in the current account that the trusted
/// account may assume, gated on a generated external id and a recent MFA session. A ready-made
/// policy for the trusted account's principals is printed along with the values to share; the
/// policy file itself is removed once printed.
#[derive(Debug, Parser)]
pub(crate) struct TrustSetup {
    /// Name for the cross-account role.
    #[clap(long = "role-name")]
    role_name: String,

    /// Account id whose principals may assume the role.
    #[clap(long = "trusted-account")]
    trusted_account: String,

    /// Region for the STS endpoint. Defaults to us-west-2; IAM itself is global.
    #[clap(long = "region")]
    region: Option<String>,

    /// Where to write the policy document for the trusted account.
    #[clap(long = "policy-file", default_value = "assume-role-policy.json")]
    policy_file: PathBuf,
}

impl TrustSetup {
    pub(crate) async fn run(self) -> Result<()> {
        let request = TrustSetupRequest {
            role_name: self.role_name,
            trusted_account_id: self.trusted_account,
            region: self.region,
        };
        let outcome = trust::setup(&request, &self.policy_file)
            .await
            .context("Unable to set up the cross-account role")?;
        println!("Role arn:    {}", outcome.role_arn);
        println!("External id: {}", outcome.external_id);
        println!(
            "Attach the policy in '{}' to the assuming principals in account {}:",
            self.policy_file.display(),
            request.trusted_account_id
        );
        println!("{}", outcome.assumer_policy);

        // The external id is a shared secret; do not leave a copy sitting on disk once it has
        // been printed.
        fs::remove_file(&self.policy_file).context(format!(
            "Unable to remove the policy file at '{}'",
            self.policy_file.display()
        ))?;
        warn!(
            "Removed '{}'; the policy above must be shared with account {} out of band",
            self.policy_file.display(),
            request.trusted_account_id
        );
        Ok(())
    }
}
