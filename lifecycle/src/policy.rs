//! IAM policy and trust document builders. Documents are built as JSON values and handed to the
//! IAM APIs as strings.

use crate::error::{self, Result};
use serde_json::json;
use snafu::ResultExt;
use url::Url;

/// Trust policy allowing a service principal (e.g. `eks.amazonaws.com`) to assume the role.
pub fn service_trust_policy(service_principal: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Service": service_principal },
            "Action": "sts:AssumeRole"
        }]
    })
    .to_string()
}

/// The cluster issuer url without its scheme, the form IAM uses in federated trust conditions.
pub fn issuer_id(issuer_url: &str) -> Result<String> {
    let url = Url::parse(issuer_url).context(error::IssuerUrlSnafu { url: issuer_url })?;
    let host = url.host_str().ok_or_else(|| error::Error::Missing {
        what: "host".to_string(),
        from: format!("issuer url '{}'", issuer_url),
    })?;
    Ok(format!("{}{}", host, url.path()))
}

/// Trust policy binding a role to one in-cluster service account through the cluster's OIDC
/// provider.
pub fn federated_trust_policy(
    provider_arn: &str,
    issuer_id: &str,
    namespace: &str,
    service_account: &str,
) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "Federated": provider_arn },
            "Action": "sts:AssumeRoleWithWebIdentity",
            "Condition": {
                "StringEquals": {
                    (format!("{}:sub", issuer_id)):
                        format!("system:serviceaccount:{}:{}", namespace, service_account),
                    (format!("{}:aud", issuer_id)): "sts.amazonaws.com"
                }
            }
        }]
    })
    .to_string()
}

/// Permissions the load balancer controller needs to manage ALBs for cluster ingresses.
pub fn load_balancer_controller_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": [
                    "ec2:DescribeVpcs",
                    "ec2:DescribeSubnets",
                    "ec2:DescribeSecurityGroups",
                    "ec2:DescribeInstances",
                    "ec2:DescribeNetworkInterfaces",
                    "ec2:DescribeAvailabilityZones",
                    "ec2:CreateSecurityGroup",
                    "ec2:CreateTags",
                    "ec2:DeleteTags",
                    "ec2:AuthorizeSecurityGroupIngress",
                    "ec2:RevokeSecurityGroupIngress",
                    "ec2:DeleteSecurityGroup"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": [
                    "elasticloadbalancing:*"
                ],
                "Resource": "*"
            },
            {
                "Effect": "Allow",
                "Action": [
                    "iam:CreateServiceLinkedRole",
                    "cognito-idp:DescribeUserPoolClient",
                    "acm:ListCertificates",
                    "acm:DescribeCertificate",
                    "waf-regional:GetWebACL",
                    "wafv2:GetWebACL",
                    "shield:GetSubscriptionState"
                ],
                "Resource": "*"
            }
        ]
    })
    .to_string()
}

/// Permissions external-dns needs to synchronize ingress hostnames into Route 53.
pub fn external_dns_policy() -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["route53:ChangeResourceRecordSets"],
                "Resource": ["arn:aws:route53:::hostedzone/*"]
            },
            {
                "Effect": "Allow",
                "Action": [
                    "route53:ListHostedZones",
                    "route53:ListResourceRecordSets"
                ],
                "Resource": ["*"]
            }
        ]
    })
    .to_string()
}

/// Trust policy for the cross-account role: the trusted account's principals may assume it only
/// when presenting the exact external id from an MFA session no older than
/// `max_mfa_age_seconds`.
pub fn cross_account_trust_policy(
    trusted_account_id: &str,
    external_id: &str,
    max_mfa_age_seconds: i32,
) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Principal": { "AWS": format!("arn:aws:iam::{}:root", trusted_account_id) },
            "Action": "sts:AssumeRole",
            "Condition": {
                "StringEquals": { "sts:ExternalId": external_id },
                "Bool": { "aws:MultiFactorAuthPresent": "true" },
                "NumericLessThan": {
                    "aws:MultiFactorAuthAge": max_mfa_age_seconds.to_string()
                }
            }
        }]
    })
    .to_string()
}

/// Companion policy for the trusted account: lets its principals assume exactly `role_arn`, and
/// only with the shared external id.
pub fn assumer_policy(role_arn: &str, external_id: &str) -> String {
    json!({
        "Version": "2012-10-17",
        "Statement": [{
            "Effect": "Allow",
            "Action": "sts:AssumeRole",
            "Resource": role_arn,
            "Condition": {
                "StringEquals": { "sts:ExternalId": external_id }
            }
        }]
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(document: String) -> Value {
        serde_json::from_str(&document).unwrap()
    }

    #[test]
    fn service_trust_names_the_principal() {
        let document = parse(service_trust_policy("eks.amazonaws.com"));
        assert_eq!(
            document
                .pointer("/Statement/0/Principal/Service")
                .and_then(Value::as_str),
            Some("eks.amazonaws.com")
        );
        assert_eq!(
            document
                .pointer("/Statement/0/Action")
                .and_then(Value::as_str),
            Some("sts:AssumeRole")
        );
    }

    #[test]
    fn issuer_id_strips_the_scheme() {
        assert_eq!(
            issuer_id("https://oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE").unwrap(),
            "oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE"
        );
    }

    #[test]
    fn issuer_id_rejects_garbage() {
        assert!(issuer_id("not a url").is_err());
    }

    #[test]
    fn federated_trust_binds_the_service_account() {
        let issuer = "oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE";
        let document = parse(federated_trust_policy(
            "arn:aws:iam::111122223333:oidc-provider/oidc.eks.us-west-2.amazonaws.com/id/EXAMPLE",
            issuer,
            "kube-system",
            "external-dns",
        ));
        let conditions = document
            .pointer("/Statement/0/Condition/StringEquals")
            .unwrap();
        assert_eq!(
            conditions
                .get(format!("{}:sub", issuer))
                .and_then(Value::as_str),
            Some("system:serviceaccount:kube-system:external-dns")
        );
        assert_eq!(
            conditions
                .get(format!("{}:aud", issuer))
                .and_then(Value::as_str),
            Some("sts.amazonaws.com")
        );
    }

    #[test]
    fn cross_account_trust_requires_external_id_and_mfa() {
        let document = parse(cross_account_trust_policy(
            "444455556666",
            "f81d4fae7dec11d0a76500a0c91e6bf6",
            3600,
        ));
        let condition = document.pointer("/Statement/0/Condition").unwrap();
        assert_eq!(
            condition
                .pointer("/StringEquals/sts:ExternalId")
                .and_then(Value::as_str),
            Some("f81d4fae7dec11d0a76500a0c91e6bf6")
        );
        assert_eq!(
            condition
                .pointer("/Bool/aws:MultiFactorAuthPresent")
                .and_then(Value::as_str),
            Some("true")
        );
        assert_eq!(
            condition
                .pointer("/NumericLessThan/aws:MultiFactorAuthAge")
                .and_then(Value::as_str),
            Some("3600")
        );
        assert_eq!(
            document
                .pointer("/Statement/0/Principal/AWS")
                .and_then(Value::as_str),
            Some("arn:aws:iam::444455556666:root")
        );
    }

    #[test]
    fn assumer_policy_is_scoped_to_the_role() {
        let role_arn = "arn:aws:iam::111122223333:role/partner-audit";
        let document = parse(assumer_policy(role_arn, "secret"));
        assert_eq!(
            document
                .pointer("/Statement/0/Resource")
                .and_then(Value::as_str),
            Some(role_arn)
        );
        assert_eq!(
            document
                .pointer("/Statement/0/Condition/StringEquals/sts:ExternalId")
                .and_then(Value::as_str),
            Some("secret")
        );
    }
}
