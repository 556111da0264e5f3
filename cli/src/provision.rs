use anyhow::{Context, Result};
use clap::Parser;
use lifecycle::constants::{DEFAULT_KUBECONFIG_PATH, DEFAULT_MANIFEST_PATH};
use lifecycle::provision::{self, ProvisionRequest};
use std::path::PathBuf;

/// The provision subcommand builds the whole environment: VPC networking, the cluster and its
/// node group, the OIDC provider, the add-on roles, the in-cluster add-ons and the demo
/// workload. On success it writes the manifest the teardown subcommand consumes.
#[derive(Debug, Parser)]
pub(crate) struct Provision {
    /// Name of the cluster; derived resource names are prefixed with it.
    #[clap(long = "cluster-name")]
    cluster_name: String,

    /// Region to provision in. Defaults to us-west-2.
    #[clap(long = "region")]
    region: Option<String>,

    /// Route 53 domain the demo workload is published under.
    #[clap(long = "domain")]
    domain: String,

    /// Subdomain for the demo workload, served at `<subdomain>.<domain>`.
    #[clap(long = "subdomain", default_value = "demo")]
    subdomain: String,

    /// Where to write the manifest of created resources.
    #[clap(long = "manifest", default_value = DEFAULT_MANIFEST_PATH)]
    manifest: PathBuf,

    /// Where to write the kubeconfig for the new cluster.
    #[clap(long = "kubeconfig", default_value = DEFAULT_KUBECONFIG_PATH)]
    kubeconfig: PathBuf,
}

impl Provision {
    pub(crate) async fn run(self) -> Result<()> {
        let request = ProvisionRequest {
            cluster_name: self.cluster_name,
            region: self.region,
            domain: self.domain,
            subdomain: self.subdomain,
        };
        let manifest = provision::provision(&request, &self.manifest, &self.kubeconfig)
            .await
            .context(
                "Unable to provision the cluster. (No manifest was written, so the resources \
                 created so far are left in place and must be removed manually)",
            )?;
        println!("{}", manifest);
        Ok(())
    }
}
