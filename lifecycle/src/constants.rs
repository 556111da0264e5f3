pub const DEFAULT_REGION: &str = "us-west-2";
pub const DEFAULT_ASSUME_ROLE_SESSION_DURATION: i32 = 3600;

/// Where provisioning records the identifiers that teardown consumes.
pub const DEFAULT_MANIFEST_PATH: &str = "ekstack-manifest.json";
pub const DEFAULT_KUBECONFIG_PATH: &str = "ekstack-kubeconfig.yaml";

pub const VPC_CIDR: &str = "10.0.0.0/16";
/// One subnet per availability zone; the cluster requires at least two.
pub const SUBNET_CIDRS: [&str; 2] = ["10.0.1.0/24", "10.0.2.0/24"];
pub const INGRESS_PORTS: [i32; 2] = [80, 443];

pub const NODEGROUP_MIN_SIZE: i32 = 1;
pub const NODEGROUP_DESIRED_SIZE: i32 = 2;
pub const NODEGROUP_MAX_SIZE: i32 = 3;

/// Root CA thumbprint for EKS OIDC issuer endpoints.
pub const OIDC_THUMBPRINT: &str = "9e99a48a9960b14926bb7f3b02e22da2b0ab7280";
pub const OIDC_AUDIENCE: &str = "sts.amazonaws.com";

pub const ADDON_NAMESPACE: &str = "kube-system";
pub const LOAD_BALANCER_CONTROLLER_SERVICE_ACCOUNT: &str = "aws-load-balancer-controller";
pub const EXTERNAL_DNS_SERVICE_ACCOUNT: &str = "external-dns";

pub const EKS_CLUSTER_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKSClusterPolicy";
pub const EKS_WORKER_NODE_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKSWorkerNodePolicy";
pub const EKS_CNI_POLICY_ARN: &str = "arn:aws:iam::aws:policy/AmazonEKS_CNI_Policy";
pub const ECR_READ_ONLY_POLICY_ARN: &str =
    "arn:aws:iam::aws:policy/AmazonEC2ContainerRegistryReadOnly";
pub const READ_ONLY_ACCESS_POLICY_ARN: &str = "arn:aws:iam::aws:policy/ReadOnlyAccess";

/// Maximum age, in seconds, of the MFA session a cross-account assumer must present.
pub const MAX_MFA_SESSION_AGE: i32 = 3600;
