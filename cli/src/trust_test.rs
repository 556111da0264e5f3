use anyhow::{Context, Result};
use clap::Parser;
use lifecycle::trust::{self, TrustTestRequest};

/// The trust-test subcommand assumes the cross-account role with the shared external id (and an
/// MFA code, if the device is given) and then asks STS who the temporary credentials belong to.
#[derive(Debug, Parser)]
pub(crate) struct TrustTest {
    /// Arn of the role to assume.
    #[clap(long = "role-arn")]
    role_arn: String,

    /// External id shared during trust setup.
    #[clap(long = "external-id")]
    external_id: String,

    /// Arn of the MFA device to authenticate with.
    #[clap(long = "mfa-serial", requires = "mfa-token")]
    mfa_serial: Option<String>,

    /// Current code from the MFA device.
    #[clap(long = "mfa-token", requires = "mfa-serial")]
    mfa_token: Option<String>,

    /// Region for the STS endpoints. Defaults to us-west-2.
    #[clap(long = "region")]
    region: Option<String>,
}

impl TrustTest {
    pub(crate) async fn run(self) -> Result<()> {
        let request = TrustTestRequest {
            role_arn: self.role_arn,
            external_id: self.external_id,
            mfa_serial: self.mfa_serial,
            mfa_token: self.mfa_token,
            region: self.region,
        };
        let identity = trust::verify(&request)
            .await
            .context("Unable to assume the cross-account role")?;
        println!("{}", identity);
        Ok(())
    }
}
