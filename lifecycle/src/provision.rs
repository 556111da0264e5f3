//! Ordered, fail-fast provisioning of the cluster environment. Steps run strictly in dependency
//! order and any hard failure aborts the run, leaving the resources created so far in place for
//! inspection; nothing is rolled back automatically. The only tolerated creation conflicts are
//! the two add-on policies, which may survive from a previous environment with the same name.

use crate::addons;
use crate::aws::sdk_config;
use crate::constants::{
    ADDON_NAMESPACE, DEFAULT_REGION, ECR_READ_ONLY_POLICY_ARN, EKS_CLUSTER_POLICY_ARN,
    EKS_CNI_POLICY_ARN, EKS_WORKER_NODE_POLICY_ARN, EXTERNAL_DNS_SERVICE_ACCOUNT, INGRESS_PORTS,
    LOAD_BALANCER_CONTROLLER_SERVICE_ACCOUNT, NODEGROUP_DESIRED_SIZE, NODEGROUP_MAX_SIZE,
    NODEGROUP_MIN_SIZE, OIDC_AUDIENCE, OIDC_THUMBPRINT, SUBNET_CIDRS, VPC_CIDR,
};
use crate::error::{self, Result, SdkResultExt};
use crate::manifest::{ClusterManifest, SCHEMA_VERSION};
use crate::policy;
use crate::wait::{self, Backoff};
use aws_sdk_ec2::model::{
    AttributeBooleanValue, Filter, IpPermission, IpRange, ResourceType, Tag, TagSpecification,
};
use aws_sdk_eks::model::{
    ClusterStatus, NodegroupScalingConfig, NodegroupStatus, VpcConfigRequest,
};
use aws_sdk_eks::types::SdkError;
use aws_types::SdkConfig;
use log::{debug, info, warn};
use snafu::OptionExt;
use std::path::Path;
use std::time::Duration;

const CLUSTER_CREATE_TIMEOUT: Duration = Duration::from_secs(1800);
const NODEGROUP_CREATE_TIMEOUT: Duration = Duration::from_secs(1800);
/// Creation calls rejected while a new IAM role propagates are retried on a fixed cadence.
const ROLE_PROPAGATION_ATTEMPTS: u32 = 30;
const ROLE_PROPAGATION_DELAY: Duration = Duration::from_secs(10);

/// What to build: the cluster name seeds every derived resource name, and the domain pair is
/// handed to external-dns and the demo workload.
#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub cluster_name: String,
    pub region: Option<String>,
    pub domain: String,
    pub subdomain: String,
}

struct AwsClients {
    ec2: aws_sdk_ec2::Client,
    eks: aws_sdk_eks::Client,
    iam: aws_sdk_iam::Client,
    sts: aws_sdk_sts::Client,
}

impl AwsClients {
    fn new(shared_config: &SdkConfig) -> Self {
        Self {
            ec2: aws_sdk_ec2::Client::new(shared_config),
            eks: aws_sdk_eks::Client::new(shared_config),
            iam: aws_sdk_iam::Client::new(shared_config),
            sts: aws_sdk_sts::Client::new(shared_config),
        }
    }
}

struct Network {
    vpc_id: String,
    subnet_ids: Vec<String>,
    internet_gateway_id: String,
    route_table_id: String,
    security_group_id: String,
}

/// Run the full provisioning workflow and write the manifest that teardown consumes. The
/// manifest is only written once every resource exists; a failed run leaves no manifest.
pub async fn provision(
    request: &ProvisionRequest,
    manifest_path: &Path,
    kubeconfig_path: &Path,
) -> Result<ClusterManifest> {
    let region = request
        .region
        .clone()
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    let config = sdk_config(&Some(region.clone()), &None).await;
    let clients = AwsClients::new(&config);

    info!("Resolving account id");
    let account_id = clients
        .sts
        .get_caller_identity()
        .send()
        .await
        .api_context("get caller identity")?
        .account
        .context(error::MissingSnafu {
            what: "account id",
            from: "GetCallerIdentity response",
        })?;
    debug!("Provisioning in account {}", account_id);

    let network = create_network(&clients.ec2, &request.cluster_name).await?;

    let cluster_role_name = format!("{}-cluster-role", request.cluster_name);
    let cluster_role_arn = create_role(
        &clients.iam,
        &cluster_role_name,
        &policy::service_trust_policy("eks.amazonaws.com"),
        &[EKS_CLUSTER_POLICY_ARN],
    )
    .await?;

    let node_role_name = format!("{}-node-role", request.cluster_name);
    let node_role_arn = create_role(
        &clients.iam,
        &node_role_name,
        &policy::service_trust_policy("ec2.amazonaws.com"),
        &[
            EKS_WORKER_NODE_POLICY_ARN,
            EKS_CNI_POLICY_ARN,
            ECR_READ_ONLY_POLICY_ARN,
        ],
    )
    .await?;

    create_cluster(&clients.eks, &request.cluster_name, &cluster_role_arn, &network).await?;
    let oidc_issuer = wait_for_cluster_active(&clients.eks, &request.cluster_name).await?;

    let nodegroup_name = format!("{}-nodes", request.cluster_name);
    create_nodegroup(
        &clients.eks,
        &request.cluster_name,
        &nodegroup_name,
        &node_role_arn,
        &network.subnet_ids,
    )
    .await?;
    wait_for_nodegroup_active(&clients.eks, &request.cluster_name, &nodegroup_name).await?;

    info!("Creating OIDC identity provider for '{}'", oidc_issuer);
    let oidc_provider_arn = clients
        .iam
        .create_open_id_connect_provider()
        .url(&oidc_issuer)
        .client_id_list(OIDC_AUDIENCE)
        .thumbprint_list(OIDC_THUMBPRINT)
        .send()
        .await
        .api_context("create OIDC identity provider")?
        .open_id_connect_provider_arn
        .context(error::MissingSnafu {
            what: "provider arn",
            from: "CreateOpenIDConnectProvider response",
        })?;
    let issuer_id = policy::issuer_id(&oidc_issuer)?;

    let load_balancer_role_name = format!("{}-load-balancer-controller", request.cluster_name);
    let (load_balancer_role_arn, load_balancer_policy_arn) = create_addon_role(
        &clients.iam,
        &account_id,
        &load_balancer_role_name,
        &policy::load_balancer_controller_policy(),
        &oidc_provider_arn,
        &issuer_id,
        LOAD_BALANCER_CONTROLLER_SERVICE_ACCOUNT,
    )
    .await?;

    let external_dns_role_name = format!("{}-external-dns", request.cluster_name);
    let (external_dns_role_arn, external_dns_policy_arn) = create_addon_role(
        &clients.iam,
        &account_id,
        &external_dns_role_name,
        &policy::external_dns_policy(),
        &oidc_provider_arn,
        &issuer_id,
        EXTERNAL_DNS_SERVICE_ACCOUNT,
    )
    .await?;

    addons::write_kubeconfig(&request.cluster_name, &region, kubeconfig_path)?;
    addons::install_load_balancer_controller(
        kubeconfig_path,
        &request.cluster_name,
        &region,
        &network.vpc_id,
        &load_balancer_role_arn,
    )?;
    info!("Installing external-dns for '{}'", request.domain);
    addons::apply_manifest(
        kubeconfig_path,
        &addons::external_dns_manifest(
            &external_dns_role_arn,
            &request.domain,
            &request.cluster_name,
        ),
    )?;
    info!(
        "Deploying the demo workload at '{}.{}'",
        request.subdomain, request.domain
    );
    addons::apply_manifest(
        kubeconfig_path,
        &addons::demo_workload_manifest(&request.domain, &request.subdomain),
    )?;

    let manifest = ClusterManifest {
        schema_version: SCHEMA_VERSION,
        cluster_name: request.cluster_name.clone(),
        region,
        nodegroup_name,
        vpc_id: network.vpc_id,
        subnet_ids: network.subnet_ids,
        security_group_id: network.security_group_id,
        internet_gateway_id: network.internet_gateway_id,
        route_table_id: network.route_table_id,
        account_id,
        domain: request.domain.clone(),
        subdomain: request.subdomain.clone(),
        oidc_issuer,
        oidc_provider_arn,
        cluster_role_name,
        node_role_name,
        load_balancer_role_name,
        external_dns_role_name,
        load_balancer_policy_arn,
        external_dns_policy_arn,
    };
    manifest.save(manifest_path)?;
    info!("Done, cluster '{}' is ready", request.cluster_name);
    Ok(manifest)
}

fn tag_specification(resource_type: ResourceType, tags: &[(&str, &str)]) -> TagSpecification {
    let mut builder = TagSpecification::builder().resource_type(resource_type);
    for (key, value) in tags {
        builder = builder.tags(Tag::builder().key(*key).value(*value).build());
    }
    builder.build()
}

async fn create_network(ec2: &aws_sdk_ec2::Client, cluster_name: &str) -> Result<Network> {
    info!("Creating VPC");
    let vpc_id = ec2
        .create_vpc()
        .cidr_block(VPC_CIDR)
        .tag_specifications(tag_specification(
            ResourceType::Vpc,
            &[("Name", &format!("{}-vpc", cluster_name))],
        ))
        .send()
        .await
        .api_context("create VPC")?
        .vpc
        .and_then(|vpc| vpc.vpc_id)
        .context(error::MissingSnafu {
            what: "vpc id",
            from: "CreateVpc response",
        })?;
    debug!("Created VPC {}", vpc_id);

    // The cluster endpoint and node bootstrapping need both DNS attributes.
    ec2.modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_support(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .api_context("enable VPC DNS support")?;
    ec2.modify_vpc_attribute()
        .vpc_id(&vpc_id)
        .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
        .send()
        .await
        .api_context("enable VPC DNS hostnames")?;

    info!("Finding availability zones");
    let zones: Vec<String> = ec2
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .api_context("describe availability zones")?
        .availability_zones
        .context(error::MissingSnafu {
            what: "availability zones",
            from: "DescribeAvailabilityZones response",
        })?
        .into_iter()
        .filter_map(|zone| zone.zone_name)
        .take(SUBNET_CIDRS.len())
        .collect();
    if zones.len() < SUBNET_CIDRS.len() {
        return error::MissingSnafu {
            what: format!("{} availability zones", SUBNET_CIDRS.len()),
            from: "DescribeAvailabilityZones response",
        }
        .fail();
    }

    let cluster_tag = format!("kubernetes.io/cluster/{}", cluster_name);
    let mut subnet_ids = Vec::new();
    for (zone, cidr) in zones.iter().zip(SUBNET_CIDRS) {
        info!("Creating subnet {} in {}", cidr, zone);
        let subnet_id = ec2
            .create_subnet()
            .vpc_id(&vpc_id)
            .cidr_block(cidr)
            .availability_zone(zone)
            .tag_specifications(tag_specification(
                ResourceType::Subnet,
                &[
                    ("Name", &format!("{}-{}", cluster_name, zone)),
                    (&cluster_tag, "shared"),
                    // Marks the subnet as a target for internet-facing load balancers.
                    ("kubernetes.io/role/elb", "1"),
                ],
            ))
            .send()
            .await
            .api_context(format!("create subnet in '{}'", zone))?
            .subnet
            .and_then(|subnet| subnet.subnet_id)
            .context(error::MissingSnafu {
                what: "subnet id",
                from: "CreateSubnet response",
            })?;
        ec2.modify_subnet_attribute()
            .subnet_id(&subnet_id)
            .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .api_context(format!("enable public IPs on subnet '{}'", subnet_id))?;
        subnet_ids.push(subnet_id);
    }

    info!("Creating internet gateway");
    let internet_gateway_id = ec2
        .create_internet_gateway()
        .tag_specifications(tag_specification(
            ResourceType::InternetGateway,
            &[("Name", &format!("{}-igw", cluster_name))],
        ))
        .send()
        .await
        .api_context("create internet gateway")?
        .internet_gateway
        .and_then(|gateway| gateway.internet_gateway_id)
        .context(error::MissingSnafu {
            what: "internet gateway id",
            from: "CreateInternetGateway response",
        })?;
    ec2.attach_internet_gateway()
        .internet_gateway_id(&internet_gateway_id)
        .vpc_id(&vpc_id)
        .send()
        .await
        .api_context("attach internet gateway")?;

    info!("Creating route table");
    let route_table_id = ec2
        .create_route_table()
        .vpc_id(&vpc_id)
        .tag_specifications(tag_specification(
            ResourceType::RouteTable,
            &[("Name", &format!("{}-public", cluster_name))],
        ))
        .send()
        .await
        .api_context("create route table")?
        .route_table
        .and_then(|table| table.route_table_id)
        .context(error::MissingSnafu {
            what: "route table id",
            from: "CreateRouteTable response",
        })?;
    ec2.create_route()
        .route_table_id(&route_table_id)
        .destination_cidr_block("0.0.0.0/0")
        .gateway_id(&internet_gateway_id)
        .send()
        .await
        .api_context("create default route")?;
    for subnet_id in &subnet_ids {
        ec2.associate_route_table()
            .route_table_id(&route_table_id)
            .subnet_id(subnet_id)
            .send()
            .await
            .api_context(format!("associate route table with '{}'", subnet_id))?;
    }

    info!("Creating security group");
    let security_group_id = ec2
        .create_security_group()
        .group_name(format!("{}-web", cluster_name))
        .description(format!("Ingress for the {} cluster", cluster_name))
        .vpc_id(&vpc_id)
        .send()
        .await
        .api_context("create security group")?
        .group_id
        .context(error::MissingSnafu {
            what: "security group id",
            from: "CreateSecurityGroup response",
        })?;
    for port in INGRESS_PORTS {
        ec2.authorize_security_group_ingress()
            .group_id(&security_group_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(port)
                    .to_port(port)
                    .ip_ranges(IpRange::builder().cidr_ip("0.0.0.0/0").build())
                    .build(),
            )
            .send()
            .await
            .api_context(format!("authorize ingress on port {}", port))?;
    }

    Ok(Network {
        vpc_id,
        subnet_ids,
        internet_gateway_id,
        route_table_id,
        security_group_id,
    })
}

async fn create_role(
    iam: &aws_sdk_iam::Client,
    role_name: &str,
    trust_policy: &str,
    managed_policy_arns: &[&str],
) -> Result<String> {
    info!("Creating role '{}'", role_name);
    let role_arn = iam
        .create_role()
        .role_name(role_name)
        .assume_role_policy_document(trust_policy)
        .send()
        .await
        .api_context(format!("create role '{}'", role_name))?
        .role
        .and_then(|role| role.arn)
        .context(error::MissingSnafu {
            what: "role arn",
            from: "CreateRole response",
        })?;
    for policy_arn in managed_policy_arns {
        iam.attach_role_policy()
            .role_name(role_name)
            .policy_arn(*policy_arn)
            .send()
            .await
            .api_context(format!("attach '{}' to '{}'", policy_arn, role_name))?;
    }
    Ok(role_arn)
}

/// The role for an add-on's service account: a dedicated permission policy plus a trust policy
/// federated through the cluster's OIDC provider. Unlike every other creation step, the policy
/// may already exist from a previous environment with the same name; in that case it is reused.
async fn create_addon_role(
    iam: &aws_sdk_iam::Client,
    account_id: &str,
    role_name: &str,
    policy_document: &str,
    provider_arn: &str,
    issuer_id: &str,
    service_account: &str,
) -> Result<(String, String)> {
    let policy_name = format!("{}-policy", role_name);
    let policy_arn = match iam
        .create_policy()
        .policy_name(&policy_name)
        .policy_document(policy_document)
        .send()
        .await
        .allow_existing(format!("create policy '{}'", policy_name))?
    {
        Some(output) => output
            .policy
            .and_then(|policy| policy.arn)
            .context(error::MissingSnafu {
                what: "policy arn",
                from: "CreatePolicy response",
            })?,
        None => {
            warn!("Policy '{}' already exists, reusing it", policy_name);
            format!("arn:aws:iam::{}:policy/{}", account_id, policy_name)
        }
    };
    let role_arn = create_role(
        iam,
        role_name,
        &policy::federated_trust_policy(provider_arn, issuer_id, ADDON_NAMESPACE, service_account),
        &[&policy_arn],
    )
    .await?;
    Ok((role_arn, policy_arn))
}

/// Newly created IAM roles take a few seconds to become visible to EKS, which rejects them with
/// `InvalidParameterException` until then. A genuinely invalid request reports the same code, so
/// retries are attempt-bounded and the last rejection is surfaced verbatim.
fn role_still_propagating<E: crate::error::ErrorCode>(error: &SdkError<E>) -> bool {
    if let SdkError::ServiceError(context) = error {
        return context.err().error_code() == Some("InvalidParameterException");
    }
    false
}

async fn create_cluster(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
    cluster_role_arn: &str,
    network: &Network,
) -> Result<()> {
    info!("Creating EKS cluster '{}'", cluster_name);
    wait::retry(
        "create cluster",
        ROLE_PROPAGATION_ATTEMPTS,
        ROLE_PROPAGATION_DELAY,
        role_still_propagating,
        || {
            let mut vpc_config =
                VpcConfigRequest::builder().security_group_ids(&network.security_group_id);
            for subnet_id in &network.subnet_ids {
                vpc_config = vpc_config.subnet_ids(subnet_id);
            }
            eks.create_cluster()
                .name(cluster_name)
                .role_arn(cluster_role_arn)
                .resources_vpc_config(vpc_config.build())
                .send()
        },
    )
    .await
    .api_context("create cluster")?;
    Ok(())
}

async fn wait_for_cluster_active(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
) -> Result<String> {
    info!("Waiting for cluster '{}' to become active", cluster_name);
    let backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 100);
    wait::until("cluster to become active", backoff, CLUSTER_CREATE_TIMEOUT, || {
        let eks = eks.clone();
        let cluster_name = cluster_name.to_string();
        async move {
            let status = cluster_status(&eks, &cluster_name).await?;
            match status {
                ClusterStatus::Active => Ok(true),
                ClusterStatus::Creating | ClusterStatus::Pending => Ok(false),
                other => error::FailedStateSnafu {
                    what: format!("cluster '{}'", cluster_name),
                    state: other.as_str(),
                }
                .fail(),
            }
        }
    })
    .await?;

    // Snapshot the issuer now; teardown must never have to ask the (deleted) cluster for it.
    let issuer = eks
        .describe_cluster()
        .name(cluster_name)
        .send()
        .await
        .api_context("describe cluster")?
        .cluster
        .and_then(|cluster| cluster.identity)
        .and_then(|identity| identity.oidc)
        .and_then(|oidc| oidc.issuer)
        .context(error::MissingSnafu {
            what: "OIDC issuer",
            from: "DescribeCluster response",
        })?;
    Ok(issuer)
}

async fn cluster_status(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
) -> Result<ClusterStatus> {
    eks.describe_cluster()
        .name(cluster_name)
        .send()
        .await
        .api_context("describe cluster")?
        .cluster
        .and_then(|cluster| cluster.status)
        .context(error::MissingSnafu {
            what: "cluster status",
            from: "DescribeCluster response",
        })
}

async fn create_nodegroup(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
    nodegroup_name: &str,
    node_role_arn: &str,
    subnet_ids: &[String],
) -> Result<()> {
    info!(
        "Creating node group '{}' ({}/{}/{} nodes)",
        nodegroup_name, NODEGROUP_MIN_SIZE, NODEGROUP_DESIRED_SIZE, NODEGROUP_MAX_SIZE
    );
    wait::retry(
        "create node group",
        ROLE_PROPAGATION_ATTEMPTS,
        ROLE_PROPAGATION_DELAY,
        role_still_propagating,
        || {
            let mut request = eks
                .create_nodegroup()
                .cluster_name(cluster_name)
                .nodegroup_name(nodegroup_name)
                .node_role(node_role_arn)
                .scaling_config(
                    NodegroupScalingConfig::builder()
                        .min_size(NODEGROUP_MIN_SIZE)
                        .desired_size(NODEGROUP_DESIRED_SIZE)
                        .max_size(NODEGROUP_MAX_SIZE)
                        .build(),
                );
            for subnet_id in subnet_ids {
                request = request.subnets(subnet_id);
            }
            request.send()
        },
    )
    .await
    .api_context("create node group")?;
    Ok(())
}

async fn wait_for_nodegroup_active(
    eks: &aws_sdk_eks::Client,
    cluster_name: &str,
    nodegroup_name: &str,
) -> Result<()> {
    info!("Waiting for node group '{}' to become active", nodegroup_name);
    let backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(60), 100);
    wait::until(
        "node group to become active",
        backoff,
        NODEGROUP_CREATE_TIMEOUT,
        || {
            let eks = eks.clone();
            let cluster_name = cluster_name.to_string();
            let nodegroup_name = nodegroup_name.to_string();
            async move {
                let status = eks
                    .describe_nodegroup()
                    .cluster_name(&cluster_name)
                    .nodegroup_name(&nodegroup_name)
                    .send()
                    .await
                    .api_context("describe node group")?
                    .nodegroup
                    .and_then(|nodegroup| nodegroup.status)
                    .context(error::MissingSnafu {
                        what: "node group status",
                        from: "DescribeNodegroup response",
                    })?;
                match status {
                    NodegroupStatus::Active => Ok(true),
                    NodegroupStatus::Creating | NodegroupStatus::Updating => Ok(false),
                    other => error::FailedStateSnafu {
                        what: format!("node group '{}'", nodegroup_name),
                        state: other.as_str(),
                    }
                    .fail(),
                }
            }
        },
    )
    .await
}
