use anyhow::{Context, Result};
use clap::Parser;
use lifecycle::constants::{DEFAULT_KUBECONFIG_PATH, DEFAULT_MANIFEST_PATH};
use lifecycle::teardown;
use std::path::PathBuf;

/// The teardown subcommand deletes everything listed in the manifest, in reverse dependency
/// order, and finally removes the manifest and kubeconfig. Running it again after a partial
/// failure picks up where it left off; running it with no manifest does nothing.
#[derive(Debug, Parser)]
pub(crate) struct Teardown {
    /// Path to the manifest written by the provision subcommand.
    #[clap(long = "manifest", default_value = DEFAULT_MANIFEST_PATH)]
    manifest: PathBuf,

    /// Path to the kubeconfig written by the provision subcommand.
    #[clap(long = "kubeconfig", default_value = DEFAULT_KUBECONFIG_PATH)]
    kubeconfig: PathBuf,
}

impl Teardown {
    pub(crate) async fn run(self) -> Result<()> {
        teardown::teardown(&self.manifest, &self.kubeconfig)
            .await
            .context("Unable to tear down the cluster. (Rerun to retry the remaining steps)")?;
        println!("Teardown complete.");
        Ok(())
    }
}
