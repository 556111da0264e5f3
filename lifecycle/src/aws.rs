use crate::constants::{DEFAULT_ASSUME_ROLE_SESSION_DURATION, DEFAULT_REGION};
use aws_config::default_provider::credentials::default_provider;
use aws_config::sts::AssumeRoleProvider;
use aws_config::retry::RetryConfig;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_sts::Region;
use aws_smithy_types::retry::RetryMode;
use aws_types::SdkConfig;
use log::info;
use std::time::Duration;

/// Set up the config for aws calls, layering `sts::assume_role` over the ambient credential chain
/// when a role arn is provided. The adaptive retry config absorbs throttling from the bursts of
/// calls the provisioning and teardown workflows make.
pub async fn sdk_config(region: &Option<String>, assume_role: &Option<String>) -> SdkConfig {
    let region = region
        .as_ref()
        .unwrap_or(&DEFAULT_REGION.to_string())
        .to_string();
    info!("Using region '{}' for the aws config", region);

    let mut config_loader = aws_config::from_env().retry_config(
        RetryConfig::standard()
            .with_retry_mode(RetryMode::Adaptive)
            .with_max_attempts(15),
    );
    let base_provider = SharedCredentialsProvider::new(default_provider().await);

    config_loader = match assume_role {
        Some(role_arn) => {
            info!("Assuming role '{}' for all aws calls", role_arn);
            config_loader.credentials_provider(SharedCredentialsProvider::new(
                AssumeRoleProvider::builder(role_arn)
                    .region(Region::new(region.clone()))
                    .session_name("ekstack")
                    .session_length(Duration::from_secs(
                        DEFAULT_ASSUME_ROLE_SESSION_DURATION as u64,
                    ))
                    .build(base_provider),
            ))
        }
        None => config_loader.credentials_provider(base_provider),
    };

    config_loader.region(Region::new(region)).load().await
}

/// Build a config from an explicit temporary credential set, e.g. the triple returned by
/// `sts assume-role`.
pub async fn sdk_config_from_credentials(
    access_key_id: &str,
    secret_access_key: &str,
    session_token: Option<String>,
    region: &Option<String>,
) -> SdkConfig {
    let region = region
        .as_ref()
        .unwrap_or(&DEFAULT_REGION.to_string())
        .to_string();
    aws_config::from_env()
        .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
            access_key_id,
            secret_access_key,
            session_token,
            None,
            "assumed-role",
        )))
        .region(Region::new(region))
        .load()
        .await
}
