use crate::error::{self, Result};
use log::info;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::Path;

/// Bump when the manifest layout changes; `load` rejects anything else.
pub const SCHEMA_VERSION: u32 = 1;

/// The on-disk record of every identifier provisioning created. It is written once at the end of
/// a successful provisioning run and is the only input teardown needs: all identifiers that
/// deletion steps depend on, including the OIDC provider arn that can no longer be derived once
/// the cluster is gone, are snapshotted here at creation time.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterManifest {
    pub schema_version: u32,

    pub cluster_name: String,
    pub region: String,
    pub nodegroup_name: String,

    pub vpc_id: String,
    /// One subnet per availability zone, exactly two.
    pub subnet_ids: Vec<String>,
    pub security_group_id: String,
    pub internet_gateway_id: String,
    pub route_table_id: String,

    pub account_id: String,
    pub domain: String,
    pub subdomain: String,

    /// The cluster's OIDC issuer url, captured while the cluster still existed.
    pub oidc_issuer: String,
    pub oidc_provider_arn: String,

    pub cluster_role_name: String,
    pub node_role_name: String,
    pub load_balancer_role_name: String,
    pub external_dns_role_name: String,
    pub load_balancer_policy_arn: String,
    pub external_dns_policy_arn: String,
}

impl std::fmt::Display for ClusterManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string_pretty(self)
            .unwrap_or_else(|e| format!("Serialization failed: {}", e));
        std::fmt::Display::fmt(&s, f)
    }
}

impl ClusterManifest {
    /// Serialize to `path`. Called once, after every resource exists.
    pub fn save(&self, path: &Path) -> Result<()> {
        let serialized =
            serde_json::to_string_pretty(self).context(error::ManifestSerializeSnafu)?;
        fs::write(path, serialized).context(error::ManifestWriteSnafu { path })?;
        info!("Wrote manifest to '{}'", path.display());
        Ok(())
    }

    /// Read and validate the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).context(error::ManifestReadSnafu { path })?;
        let manifest: Self =
            serde_json::from_str(&contents).context(error::ManifestDeserializeSnafu { path })?;
        ensure!(
            manifest.schema_version == SCHEMA_VERSION,
            error::ManifestVersionSnafu {
                found: manifest.schema_version,
                expected: SCHEMA_VERSION,
            }
        );
        manifest.validate()?;
        Ok(manifest)
    }

    /// Delete the manifest file. A missing file is fine; teardown may be rerun after a partial
    /// failure.
    pub fn remove(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(error::RemoveFileSnafu { path }),
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.subnet_ids.len() == 2,
            error::ManifestInvalidSnafu {
                reason: format!("expected exactly 2 subnet ids, found {}", self.subnet_ids.len()),
            }
        );
        ensure!(
            !self.cluster_name.is_empty(),
            error::ManifestInvalidSnafu {
                reason: "cluster name is empty",
            }
        );
        ensure!(
            !self.region.is_empty(),
            error::ManifestInvalidSnafu {
                reason: "region is empty",
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ClusterManifest, SCHEMA_VERSION};
    use crate::error::Error;

    fn sample() -> ClusterManifest {
        ClusterManifest {
            schema_version: SCHEMA_VERSION,
            cluster_name: "demo".to_string(),
            region: "us-west-2".to_string(),
            nodegroup_name: "demo-nodes".to_string(),
            vpc_id: "vpc-0123".to_string(),
            subnet_ids: vec!["subnet-aaa".to_string(), "subnet-bbb".to_string()],
            security_group_id: "sg-0123".to_string(),
            internet_gateway_id: "igw-0123".to_string(),
            route_table_id: "rtb-0123".to_string(),
            account_id: "111122223333".to_string(),
            domain: "example.com".to_string(),
            subdomain: "demo".to_string(),
            oidc_issuer: "https://oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE".to_string(),
            oidc_provider_arn:
                "arn:aws:iam::111122223333:oidc-provider/oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE"
                    .to_string(),
            cluster_role_name: "demo-cluster-role".to_string(),
            node_role_name: "demo-node-role".to_string(),
            load_balancer_role_name: "demo-load-balancer-controller".to_string(),
            external_dns_role_name: "demo-external-dns".to_string(),
            load_balancer_policy_arn: "arn:aws:iam::111122223333:policy/demo-alb".to_string(),
            external_dns_policy_arn: "arn:aws:iam::111122223333:policy/demo-dns".to_string(),
        }
    }

    #[test]
    fn round_trip_is_structurally_identical() {
        let manifest = sample();
        let serialized = serde_json::to_string(&manifest).unwrap();
        let deserialized: ClusterManifest = serde_json::from_str(&serialized).unwrap();
        assert_eq!(manifest, deserialized);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = sample();
        manifest.save(&path).unwrap();
        let loaded = ClusterManifest::load(&path).unwrap();
        assert_eq!(manifest, loaded);
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = sample();
        manifest.schema_version = SCHEMA_VERSION + 1;
        manifest.save(&path).unwrap();
        match ClusterManifest::load(&path) {
            Err(Error::ManifestVersion { found, expected }) => {
                assert_eq!(found, SCHEMA_VERSION + 1);
                assert_eq!(expected, SCHEMA_VERSION);
            }
            other => panic!("expected ManifestVersion error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_subnet_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = sample();
        manifest.subnet_ids.push("subnet-ccc".to_string());
        manifest.save(&path).unwrap();
        assert!(matches!(
            ClusterManifest::load(&path),
            Err(Error::ManifestInvalid { .. })
        ));
    }

    #[test]
    fn removing_a_missing_manifest_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never-written.json");
        assert!(ClusterManifest::remove(&path).is_ok());
    }
}
