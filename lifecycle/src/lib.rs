/*!

`lifecycle` provisions and tears down an EKS demo environment and manages a
cross-account trust relationship.

The provisioning engine creates the networking (VPC, subnets, internet gateway,
route table, security group), IAM roles, the cluster and its node group, an OIDC
identity provider, and the two cluster add-ons (the AWS load balancer controller
and external-dns). Every identifier the teardown engine will later need is
recorded in a versioned on-disk manifest before provisioning finishes, so
teardown never has to resolve an identifier from a resource it has already
deleted. Teardown is re-runnable: a resource that is already gone is treated as
cleaned up, while permission and dependency failures are escalated.

The `trust` module covers the cross-account side: creating an MFA-gated role
assumable with a locally generated external id, and verifying the assumption
end to end.

!*/

pub mod addons;
pub mod aws;
pub mod constants;
pub mod error;
pub mod manifest;
pub mod policy;
pub mod provision;
pub mod teardown;
pub mod trust;
pub mod wait;

pub use error::{Error, Result};
