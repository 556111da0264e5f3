//! Teardown of everything provisioning created, in reverse dependency order. The plan is
//! computed up front from the manifest alone, so no step ever has to query a half-deleted
//! environment to figure out what to delete next. Deletion steps tolerate exactly one error
//! class, `NotFound`, which makes a rerun after a partial failure converge instead of failing
//! on the work already done.

use crate::addons;
use crate::aws::sdk_config;
use crate::error::{self, Result, SdkResultExt};
use crate::manifest::ClusterManifest;
use crate::wait::{self, Backoff};
use aws_sdk_ec2::model::Filter;
use aws_sdk_eks::model::NodegroupStatus;
use log::{info, warn};
use snafu::{OptionExt, ResultExt};
use std::fmt;
use std::path::Path;
use std::time::Duration;

const DELETE_TIMEOUT: Duration = Duration::from_secs(1800);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// One deletion step, fully resolved from the manifest. Steps carry their own identifiers so
/// executing them never requires describing resources that may already be half-gone.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    RemoveWorkload,
    AwaitLoadBalancerDrain { cluster_name: String },
    RemoveExternalDns,
    RemoveLoadBalancerController,
    DeleteNodegroup { cluster_name: String, nodegroup_name: String },
    DeleteCluster { cluster_name: String },
    DeleteOidcProvider { provider_arn: String },
    DeleteRole { role_name: String },
    DeletePolicy { policy_arn: String },
    AwaitInterfaceDrain { subnet_id: String },
    DeleteRouteTable { route_table_id: String },
    DeleteSubnet { subnet_id: String },
    DeleteSecurityGroup { security_group_id: String },
    DeleteInternetGateway { internet_gateway_id: String, vpc_id: String },
    DeleteVpc { vpc_id: String },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::RemoveWorkload => write!(f, "remove the demo workload"),
            Step::AwaitLoadBalancerDrain { cluster_name } => {
                write!(f, "wait for '{}' load balancers to drain", cluster_name)
            }
            Step::RemoveExternalDns => write!(f, "remove external-dns"),
            Step::RemoveLoadBalancerController => write!(f, "remove the load balancer controller"),
            Step::DeleteNodegroup { nodegroup_name, .. } => {
                write!(f, "delete node group '{}'", nodegroup_name)
            }
            Step::DeleteCluster { cluster_name } => write!(f, "delete cluster '{}'", cluster_name),
            Step::DeleteOidcProvider { provider_arn } => {
                write!(f, "delete OIDC provider '{}'", provider_arn)
            }
            Step::DeleteRole { role_name } => write!(f, "delete role '{}'", role_name),
            Step::DeletePolicy { policy_arn } => write!(f, "delete policy '{}'", policy_arn),
            Step::AwaitInterfaceDrain { subnet_id } => {
                write!(f, "wait for interfaces in '{}' to drain", subnet_id)
            }
            Step::DeleteRouteTable { route_table_id } => {
                write!(f, "delete route table '{}'", route_table_id)
            }
            Step::DeleteSubnet { subnet_id } => write!(f, "delete subnet '{}'", subnet_id),
            Step::DeleteSecurityGroup { security_group_id } => {
                write!(f, "delete security group '{}'", security_group_id)
            }
            Step::DeleteInternetGateway { internet_gateway_id, .. } => {
                write!(f, "delete internet gateway '{}'", internet_gateway_id)
            }
            Step::DeleteVpc { vpc_id } => write!(f, "delete VPC '{}'", vpc_id),
        }
    }
}

/// Resolve the full deletion plan from the manifest. Every identifier comes from the manifest
/// snapshot taken at provisioning time, including the OIDC provider arn.
pub fn plan(manifest: &ClusterManifest) -> Vec<Step> {
    let mut steps = vec![
        Step::RemoveWorkload,
        Step::AwaitLoadBalancerDrain {
            cluster_name: manifest.cluster_name.clone(),
        },
        Step::RemoveExternalDns,
        Step::RemoveLoadBalancerController,
        Step::DeleteNodegroup {
            cluster_name: manifest.cluster_name.clone(),
            nodegroup_name: manifest.nodegroup_name.clone(),
        },
        Step::DeleteCluster {
            cluster_name: manifest.cluster_name.clone(),
        },
        Step::DeleteOidcProvider {
            provider_arn: manifest.oidc_provider_arn.clone(),
        },
        Step::DeleteRole {
            role_name: manifest.external_dns_role_name.clone(),
        },
        Step::DeleteRole {
            role_name: manifest.load_balancer_role_name.clone(),
        },
        Step::DeletePolicy {
            policy_arn: manifest.external_dns_policy_arn.clone(),
        },
        Step::DeletePolicy {
            policy_arn: manifest.load_balancer_policy_arn.clone(),
        },
        Step::DeleteRole {
            role_name: manifest.node_role_name.clone(),
        },
        Step::DeleteRole {
            role_name: manifest.cluster_role_name.clone(),
        },
    ];
    for subnet_id in &manifest.subnet_ids {
        steps.push(Step::AwaitInterfaceDrain {
            subnet_id: subnet_id.clone(),
        });
    }
    steps.push(Step::DeleteRouteTable {
        route_table_id: manifest.route_table_id.clone(),
    });
    for subnet_id in &manifest.subnet_ids {
        steps.push(Step::DeleteSubnet {
            subnet_id: subnet_id.clone(),
        });
    }
    steps.push(Step::DeleteSecurityGroup {
        security_group_id: manifest.security_group_id.clone(),
    });
    steps.push(Step::DeleteInternetGateway {
        internet_gateway_id: manifest.internet_gateway_id.clone(),
        vpc_id: manifest.vpc_id.clone(),
    });
    steps.push(Step::DeleteVpc {
        vpc_id: manifest.vpc_id.clone(),
    });
    steps
}

struct AwsClients {
    ec2: aws_sdk_ec2::Client,
    eks: aws_sdk_eks::Client,
    elbv2: aws_sdk_elasticloadbalancingv2::Client,
    iam: aws_sdk_iam::Client,
}

/// Tear down the environment the manifest describes, then delete the manifest and kubeconfig.
/// A missing manifest is a no-op; there is nothing to delete.
pub async fn teardown(manifest_path: &Path, kubeconfig_path: &Path) -> Result<()> {
    if !manifest_path.exists() {
        info!(
            "No manifest at '{}', nothing to tear down",
            manifest_path.display()
        );
        return Ok(());
    }
    let manifest = ClusterManifest::load(manifest_path)?;
    let config = sdk_config(&Some(manifest.region.clone()), &None).await;
    let clients = AwsClients {
        ec2: aws_sdk_ec2::Client::new(&config),
        eks: aws_sdk_eks::Client::new(&config),
        elbv2: aws_sdk_elasticloadbalancingv2::Client::new(&config),
        iam: aws_sdk_iam::Client::new(&config),
    };

    for step in plan(&manifest) {
        info!("Teardown step: {}", step);
        execute(&clients, &manifest, kubeconfig_path, &step).await?;
    }

    ClusterManifest::remove(manifest_path)?;
    remove_file(kubeconfig_path)?;
    info!("Done, cluster '{}' is gone", manifest.cluster_name);
    Ok(())
}

fn remove_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context(error::RemoveFileSnafu { path }),
    }
}

/// In-cluster cleanup cannot block the rest of teardown: if the cluster is unreachable or the
/// release is already gone, the resources die with the cluster anyway.
fn best_effort(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Could not {}, continuing: {}", what, e);
    }
}

async fn execute(
    clients: &AwsClients,
    manifest: &ClusterManifest,
    kubeconfig_path: &Path,
    step: &Step,
) -> Result<()> {
    match step {
        Step::RemoveWorkload => {
            best_effort(
                "remove the demo workload",
                addons::delete_manifest(
                    kubeconfig_path,
                    &addons::demo_workload_manifest(&manifest.domain, &manifest.subdomain),
                ),
            );
            Ok(())
        }
        Step::AwaitLoadBalancerDrain { cluster_name } => {
            await_load_balancer_drain(&clients.elbv2, cluster_name).await;
            Ok(())
        }
        Step::RemoveExternalDns => {
            best_effort(
                "remove external-dns",
                addons::delete_manifest(
                    kubeconfig_path,
                    &addons::external_dns_manifest(
                        "unused",
                        &manifest.domain,
                        &manifest.cluster_name,
                    ),
                ),
            );
            Ok(())
        }
        Step::RemoveLoadBalancerController => {
            best_effort(
                "uninstall the load balancer controller",
                addons::uninstall_load_balancer_controller(kubeconfig_path),
            );
            Ok(())
        }
        Step::DeleteNodegroup {
            cluster_name,
            nodegroup_name,
        } => delete_nodegroup(&clients.eks, cluster_name, nodegroup_name).await,
        Step::DeleteCluster { cluster_name } => delete_cluster(&clients.eks, cluster_name).await,
        Step::DeleteOidcProvider { provider_arn } => {
            clients
                .iam
                .delete_open_id_connect_provider()
                .open_id_connect_provider_arn(provider_arn)
                .send()
                .await
                .allow_missing("delete OIDC provider")?;
            Ok(())
        }
        Step::DeleteRole { role_name } => delete_role(&clients.iam, role_name).await,
        Step::DeletePolicy { policy_arn } => {
            clients
                .iam
                .delete_policy()
                .policy_arn(policy_arn)
                .send()
                .await
                .allow_missing(format!("delete policy '{}'", policy_arn))?;
            Ok(())
        }
        Step::AwaitInterfaceDrain { subnet_id } => {
            await_interface_drain(&clients.ec2, subnet_id).await
        }
        Step::DeleteRouteTable { route_table_id } => {
            delete_route_table(&clients.ec2, route_table_id).await
        }
        Step::DeleteSubnet { subnet_id } => {
            clients
                .ec2
                .delete_subnet()
                .subnet_id(subnet_id)
                .send()
                .await
                .allow_missing(format!("delete subnet '{}'", subnet_id))?;
            Ok(())
        }
        Step::DeleteSecurityGroup { security_group_id } => {
            clients
                .ec2
                .delete_security_group()
                .group_id(security_group_id)
                .send()
                .await
                .allow_missing(format!("delete security group '{}'", security_group_id))?;
            Ok(())
        }
        Step::DeleteInternetGateway {
            internet_gateway_id,
            vpc_id,
        } => {
            clients
                .ec2
                .detach_internet_gateway()
                .internet_gateway_id(internet_gateway_id)
                .vpc_id(vpc_id)
                .send()
                .await
                .allow_missing("detach internet gateway")?;
            clients
                .ec2
                .delete_internet_gateway()
                .internet_gateway_id(internet_gateway_id)
                .send()
                .await
                .allow_missing("delete internet gateway")?;
            Ok(())
        }
        Step::DeleteVpc { vpc_id } => {
            clients
                .ec2
                .delete_vpc()
                .vpc_id(vpc_id)
                .send()
                .await
                .allow_missing(format!("delete VPC '{}'", vpc_id))?;
            Ok(())
        }
    }
}

/// List every load balancer still tagged as belonging to the cluster. The controller tags the
/// ALBs it provisions with both the legacy cluster tag and its own `elbv2.k8s.aws/cluster` tag.
async fn cluster_load_balancers(
    elbv2: &aws_sdk_elasticloadbalancingv2::Client,
    cluster_name: &str,
) -> Result<Vec<String>> {
    let mut arns = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let mut request = elbv2.describe_load_balancers();
        if let Some(m) = &marker {
            request = request.marker(m);
        }
        let page = request
            .send()
            .await
            .api_context("describe load balancers")?;
        arns.extend(
            page.load_balancers
                .unwrap_or_default()
                .into_iter()
                .filter_map(|lb| lb.load_balancer_arn),
        );
        match page.next_marker {
            Some(m) => marker = Some(m),
            None => break,
        }
    }

    let cluster_tag = format!("kubernetes.io/cluster/{}", cluster_name);
    let mut matching = Vec::new();
    // DescribeTags accepts at most 20 arns per call.
    for chunk in arns.chunks(20) {
        let mut request = elbv2.describe_tags();
        for arn in chunk {
            request = request.resource_arns(arn);
        }
        let descriptions = request
            .send()
            .await
            .api_context("describe load balancer tags")?
            .tag_descriptions
            .unwrap_or_default();
        for description in descriptions {
            let owned = description.tags.as_deref().unwrap_or_default().iter().any(|tag| {
                match (tag.key(), tag.value()) {
                    (Some(key), _) if key == cluster_tag => true,
                    (Some("elbv2.k8s.aws/cluster"), Some(value)) => value == cluster_name,
                    _ => false,
                }
            });
            if owned {
                if let Some(arn) = description.resource_arn {
                    matching.push(arn);
                }
            }
        }
    }
    Ok(matching)
}

/// Wait for the controller to finish deleting the cluster's load balancers after the ingress is
/// gone. Best effort: if they never drain, the interface drain below will surface the problem.
async fn await_load_balancer_drain(
    elbv2: &aws_sdk_elasticloadbalancingv2::Client,
    cluster_name: &str,
) {
    let result = wait::until(
        "load balancers to drain",
        Backoff::new(Duration::from_secs(10), Duration::from_secs(30), 60),
        DRAIN_TIMEOUT,
        || {
            let elbv2 = elbv2.clone();
            let cluster_name = cluster_name.to_string();
            async move {
                Ok(cluster_load_balancers(&elbv2, &cluster_name)
                    .await?
                    .is_empty())
            }
        },
    )
    .await;
    if let Err(e) = result {
        warn!("Load balancers did not drain cleanly, continuing: {}", e);
    }
}

/// ALB and node interfaces linger in the subnets for a while after their parents are deleted;
/// the subnets cannot be deleted until the interfaces are gone.
async fn await_interface_drain(ec2: &aws_sdk_ec2::Client, subnet_id: &str) -> Result<()> {
    wait::until(
        "network interfaces to drain",
        Backoff::new(Duration::from_secs(10), Duration::from_secs(30), 60),
        DRAIN_TIMEOUT,
        || {
            let ec2 = ec2.clone();
            let subnet_id = subnet_id.to_string();
            async move {
                let interfaces = ec2
                    .describe_network_interfaces()
                    .filters(Filter::builder().name("subnet-id").values(subnet_id).build())
                    .send()
                    .await
                    .api_context("describe network interfaces")?
                    .network_interfaces
                    .unwrap_or_default();
                Ok(interfaces.is_empty())
            }
        },
    )
    .await
}

async fn delete_nodegroup(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
    nodegroup_name: &str,
) -> Result<()> {
    let deleted = eks
        .delete_nodegroup()
        .cluster_name(cluster_name)
        .nodegroup_name(nodegroup_name)
        .send()
        .await
        .allow_missing(format!("delete node group '{}'", nodegroup_name))?;
    if deleted.is_none() {
        return Ok(());
    }
    wait::until(
        "node group deletion",
        Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 100),
        DELETE_TIMEOUT,
        || {
            let eks = eks.clone();
            let cluster_name = cluster_name.to_string();
            let nodegroup_name = nodegroup_name.to_string();
            async move {
                let output = eks
                    .describe_nodegroup()
                    .cluster_name(&cluster_name)
                    .nodegroup_name(&nodegroup_name)
                    .send()
                    .await
                    .allow_missing("describe node group")?;
                let nodegroup = match output.and_then(|output| output.nodegroup) {
                    Some(nodegroup) => nodegroup,
                    None => return Ok(true),
                };
                match nodegroup.status {
                    Some(NodegroupStatus::DeleteFailed) => error::FailedStateSnafu {
                        what: format!("node group '{}'", nodegroup_name),
                        state: "DELETE_FAILED",
                    }
                    .fail(),
                    _ => Ok(false),
                }
            }
        },
    )
    .await
}

async fn delete_cluster(eks: &aws_sdk_eks::Client, cluster_name: &str) -> Result<()> {
    let deleted = eks
        .delete_cluster()
        .name(cluster_name)
        .send()
        .await
        .allow_missing(format!("delete cluster '{}'", cluster_name))?;
    if deleted.is_none() {
        return Ok(());
    }
    wait::until(
        "cluster deletion",
        Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 100),
        DELETE_TIMEOUT,
        || {
            let eks = eks.clone();
            let cluster_name = cluster_name.to_string();
            async move {
                let output = eks
                    .describe_cluster()
                    .name(&cluster_name)
                    .send()
                    .await
                    .allow_missing("describe cluster")?;
                Ok(output.and_then(|output| output.cluster).is_none())
            }
        },
    )
    .await
}

/// Managed policies must be detached before the role can be deleted.
async fn delete_role(iam: &aws_sdk_iam::Client, role_name: &str) -> Result<()> {
    let attached = iam
        .list_attached_role_policies()
        .role_name(role_name)
        .send()
        .await
        .allow_missing(format!("list policies attached to '{}'", role_name))?;
    let attached = match attached {
        Some(output) => output.attached_policies.unwrap_or_default(),
        None => return Ok(()),
    };
    for policy in attached {
        let policy_arn = policy.policy_arn.context(error::MissingSnafu {
            what: "policy arn",
            from: "ListAttachedRolePolicies response",
        })?;
        iam.detach_role_policy()
            .role_name(role_name)
            .policy_arn(&policy_arn)
            .send()
            .await
            .allow_missing(format!("detach '{}' from '{}'", policy_arn, role_name))?;
    }
    iam.delete_role()
        .role_name(role_name)
        .send()
        .await
        .allow_missing(format!("delete role '{}'", role_name))?;
    Ok(())
}

/// The route table may still hold its subnet associations and default route; both go first.
async fn delete_route_table(ec2: &aws_sdk_ec2::Client, route_table_id: &str) -> Result<()> {
    let tables = ec2
        .describe_route_tables()
        .route_table_ids(route_table_id)
        .send()
        .await
        .allow_missing(format!("describe route table '{}'", route_table_id))?;
    let tables = match tables {
        Some(output) => output.route_tables.unwrap_or_default(),
        None => return Ok(()),
    };
    for table in tables {
        for association in table.associations.unwrap_or_default() {
            if association.main == Some(true) {
                continue;
            }
            if let Some(association_id) = association.route_table_association_id {
                ec2.disassociate_route_table()
                    .association_id(&association_id)
                    .send()
                    .await
                    .allow_missing(format!("disassociate '{}'", association_id))?;
            }
        }
    }
    ec2.delete_route()
        .route_table_id(route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .send()
        .await
        .allow_missing("delete default route")?;
    ec2.delete_route_table()
        .route_table_id(route_table_id)
        .send()
        .await
        .allow_missing(format!("delete route table '{}'", route_table_id))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{plan, teardown, Step};
    use crate::manifest::{ClusterManifest, SCHEMA_VERSION};

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

    fn position(steps: &[Step], wanted: &Step) -> usize {
        steps
            .iter()
            .position(|step| step == wanted)
            .unwrap_or_else(|| panic!("plan is missing step: {}", wanted))
    }

    #[test]
    fn nodegroup_goes_before_cluster() {
        let manifest = sample();
        let steps = plan(&manifest);
        let nodegroup = position(
            &steps,
            &Step::DeleteNodegroup {
                cluster_name: "demo".to_string(),
                nodegroup_name: "demo-nodes".to_string(),
            },
        );
        let cluster = position(
            &steps,
            &Step::DeleteCluster {
                cluster_name: "demo".to_string(),
            },
        );
        assert!(nodegroup < cluster);
    }

    #[test]
    fn oidc_provider_comes_from_the_manifest() {
        let manifest = sample();
        let steps = plan(&manifest);
        assert!(steps.contains(&Step::DeleteOidcProvider {
            provider_arn: manifest.oidc_provider_arn.clone(),
        }));
        // The provider deletion must not depend on the cluster still existing.
        let provider = position(
            &steps,
            &Step::DeleteOidcProvider {
                provider_arn: manifest.oidc_provider_arn.clone(),
            },
        );
        let cluster = position(
            &steps,
            &Step::DeleteCluster {
                cluster_name: "demo".to_string(),
            },
        );
        assert!(cluster < provider);
    }

    #[test]
    fn exactly_the_manifest_subnets_are_deleted() {
        let manifest = sample();
        let steps = plan(&manifest);
        let deleted: Vec<&str> = steps
            .iter()
            .filter_map(|step| match step {
                Step::DeleteSubnet { subnet_id } => Some(subnet_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["subnet-aaa", "subnet-bbb"]);
    }

    #[test]
    fn vpc_is_deleted_last() {
        let manifest = sample();
        let steps = plan(&manifest);
        assert_eq!(
            steps.last(),
            Some(&Step::DeleteVpc {
                vpc_id: manifest.vpc_id,
            })
        );
    }

    #[test]
    fn ingress_is_removed_before_the_controller() {
        let steps = plan(&sample());
        let workload = position(&steps, &Step::RemoveWorkload);
        let drain = position(
            &steps,
            &Step::AwaitLoadBalancerDrain {
                cluster_name: "demo".to_string(),
            },
        );
        let controller = position(&steps, &Step::RemoveLoadBalancerController);
        assert!(workload < drain);
        assert!(drain < controller);
    }

    #[test]
    fn interfaces_drain_before_subnets_are_deleted() {
        let steps = plan(&sample());
        let drain = position(
            &steps,
            &Step::AwaitInterfaceDrain {
                subnet_id: "subnet-aaa".to_string(),
            },
        );
        let subnet = position(
            &steps,
            &Step::DeleteSubnet {
                subnet_id: "subnet-aaa".to_string(),
            },
        );
        assert!(drain < subnet);
    }

    #[tokio::test]
    async fn missing_manifest_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("missing.json");
        let kubeconfig = dir.path().join("missing.yaml");
        assert!(teardown(&manifest, &kubeconfig).await.is_ok());
    }
}
