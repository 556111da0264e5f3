//! The cluster boundary: writing the kubeconfig and applying or deleting the add-on and demo
//! workload manifests with `aws`, `kubectl` and `helm`. The software installed here runs inside
//! the cluster and is an external collaborator; we only drive its installation.

use crate::constants::{ADDON_NAMESPACE, LOAD_BALANCER_CONTROLLER_SERVICE_ACCOUNT};
use crate::error::{self, Result};
use log::info;
use snafu::{OptionExt, ResultExt};
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

const EKS_CHARTS_REPO: &str = "https://aws.github.io/eks-charts";
const LOAD_BALANCER_CONTROLLER_CHART: &str = "aws-load-balancer-controller";

/// Run a command, optionally feeding `stdin`, and return its stdout if it exited zero.
fn run(hint: &str, command: &mut Command, stdin: Option<&str>) -> Result<String> {
    let mut child = command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(error::ProcessSnafu { what: hint })?;
    if let Some(input) = stdin {
        child
            .stdin
            .as_mut()
            .context(error::MissingSnafu {
                what: "stdin handle",
                from: format!("'{}' child process", hint),
            })?
            .write_all(input.as_bytes())
            .context(error::ProcessSnafu { what: hint })?;
    }
    let output = child
        .wait_with_output()
        .context(error::ProcessSnafu { what: hint })?;
    check_output(hint, output)
}

/// If the command was successful (exit code zero), returns the command's stdout. Otherwise
/// returns an error carrying the exit code and stderr.
fn check_output(hint: &str, output: Output) -> Result<String> {
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        error::CommandSnafu {
            hint,
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
        .fail()
    }
}

fn kubeconfig_arg(kubeconfig: &Path) -> Result<&str> {
    kubeconfig.to_str().context(error::MissingSnafu {
        what: "a utf-8 path",
        from: format!("kubeconfig location '{}'", kubeconfig.display()),
    })
}

/// Write a kubeconfig for the cluster so kubectl and helm can reach it.
pub fn write_kubeconfig(cluster_name: &str, region: &str, kubeconfig: &Path) -> Result<()> {
    info!("Updating kubeconfig file");
    run(
        "aws eks update-kubeconfig",
        Command::new("aws").args([
            "eks",
            "update-kubeconfig",
            "--region",
            region,
            "--name",
            cluster_name,
            "--kubeconfig",
            kubeconfig_arg(kubeconfig)?,
        ]),
        None,
    )?;
    Ok(())
}

/// Install the load balancer controller chart, annotating its service account with the IAM role
/// created for it.
pub fn install_load_balancer_controller(
    kubeconfig: &Path,
    cluster_name: &str,
    region: &str,
    vpc_id: &str,
    role_arn: &str,
) -> Result<()> {
    info!("Installing the load balancer controller");
    let args = vec![
        "upgrade".to_string(),
        "--install".to_string(),
        LOAD_BALANCER_CONTROLLER_CHART.to_string(),
        LOAD_BALANCER_CONTROLLER_CHART.to_string(),
        "--repo".to_string(),
        EKS_CHARTS_REPO.to_string(),
        "--kubeconfig".to_string(),
        kubeconfig_arg(kubeconfig)?.to_string(),
        "--namespace".to_string(),
        ADDON_NAMESPACE.to_string(),
        "--set".to_string(),
        format!("clusterName={}", cluster_name),
        "--set".to_string(),
        format!("region={}", region),
        "--set".to_string(),
        format!("vpcId={}", vpc_id),
        "--set".to_string(),
        format!(
            "serviceAccount.name={}",
            LOAD_BALANCER_CONTROLLER_SERVICE_ACCOUNT
        ),
        "--set".to_string(),
        format!(
            "serviceAccount.annotations.eks\\.amazonaws\\.com/role-arn={}",
            role_arn
        ),
        "--wait".to_string(),
    ];
    run(
        "helm upgrade --install aws-load-balancer-controller",
        Command::new("helm").args(&args),
        None,
    )?;
    Ok(())
}

pub fn uninstall_load_balancer_controller(kubeconfig: &Path) -> Result<()> {
    info!("Uninstalling the load balancer controller");
    run(
        "helm uninstall aws-load-balancer-controller",
        Command::new("helm").args([
            "uninstall",
            LOAD_BALANCER_CONTROLLER_CHART,
            "--kubeconfig",
            kubeconfig_arg(kubeconfig)?,
            "--namespace",
            ADDON_NAMESPACE,
        ]),
        None,
    )?;
    Ok(())
}

pub fn apply_manifest(kubeconfig: &Path, manifest: &str) -> Result<()> {
    run(
        "kubectl apply",
        Command::new("kubectl").args([
            "--kubeconfig",
            kubeconfig_arg(kubeconfig)?,
            "apply",
            "-f",
            "-",
        ]),
        Some(manifest),
    )?;
    Ok(())
}

pub fn delete_manifest(kubeconfig: &Path, manifest: &str) -> Result<()> {
    run(
        "kubectl delete",
        Command::new("kubectl").args([
            "--kubeconfig",
            kubeconfig_arg(kubeconfig)?,
            "delete",
            "--ignore-not-found=true",
            "-f",
            "-",
        ]),
        Some(manifest),
    )?;
    Ok(())
}

/// Manifest for external-dns: a service account bound to `role_arn`, RBAC, and a deployment that
/// synchronizes ingress hostnames under `domain` into Route 53.
pub fn external_dns_manifest(role_arn: &str, domain: &str, owner_id: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: ServiceAccount
metadata:
  name: external-dns
  namespace: kube-system
  annotations:
    eks.amazonaws.com/role-arn: {role_arn}
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: external-dns
rules:
  - apiGroups: [""]
    resources: ["services", "endpoints", "pods", "nodes"]
    verbs: ["get", "watch", "list"]
  - apiGroups: ["networking.k8s.io"]
    resources: ["ingresses"]
    verbs: ["get", "watch", "list"]
---
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRoleBinding
metadata:
  name: external-dns-viewer
roleRef:
  apiGroup: rbac.authorization.k8s.io
  kind: ClusterRole
  name: external-dns
subjects:
  - kind: ServiceAccount
    name: external-dns
    namespace: kube-system
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: external-dns
  namespace: kube-system
spec:
  strategy:
    type: Recreate
  selector:
    matchLabels:
      app: external-dns
  template:
    metadata:
      labels:
        app: external-dns
    spec:
      serviceAccountName: external-dns
      containers:
        - name: external-dns
          image: registry.k8s.io/external-dns/external-dns:v0.13.4
          args:
            - --source=ingress
            - --provider=aws
            - --aws-zone-type=public
            - --registry=txt
            - --txt-owner-id={owner_id}
            - --domain-filter={domain}
"#
    )
}

/// The demo workload: a web deployment exposed through an ALB ingress at
/// `<subdomain>.<domain>`, which external-dns picks up and registers.
pub fn demo_workload_manifest(domain: &str, subdomain: &str) -> String {
    format!(
        r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: demo-web
  namespace: default
spec:
  replicas: 2
  selector:
    matchLabels:
      app: demo-web
  template:
    metadata:
      labels:
        app: demo-web
    spec:
      containers:
        - name: web
          image: public.ecr.aws/nginx/nginx:stable
          ports:
            - containerPort: 80
---
apiVersion: v1
kind: Service
metadata:
  name: demo-web
  namespace: default
spec:
  type: ClusterIP
  selector:
    app: demo-web
  ports:
    - port: 80
      targetPort: 80
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: demo-web
  namespace: default
  annotations:
    alb.ingress.kubernetes.io/scheme: internet-facing
    alb.ingress.kubernetes.io/target-type: ip
spec:
  ingressClassName: alb
  rules:
    - host: {subdomain}.{domain}
      http:
        paths:
          - path: /
            pathType: Prefix
            backend:
              service:
                name: demo-web
                port:
                  number: 80
"#
    )
}

#[cfg(test)]
mod tests {
    use super::{demo_workload_manifest, external_dns_manifest};

    #[test]
    fn external_dns_manifest_carries_role_and_domain() {
        let manifest = external_dns_manifest(
            "arn:aws:iam::111122223333:role/demo-external-dns",
            "example.com",
            "demo",
        );
        assert!(manifest
            .contains("eks.amazonaws.com/role-arn: arn:aws:iam::111122223333:role/demo-external-dns"));
        assert!(manifest.contains("--domain-filter=example.com"));
        assert!(manifest.contains("--txt-owner-id=demo"));
    }

    #[test]
    fn demo_workload_is_served_at_the_subdomain() {
        let manifest = demo_workload_manifest("example.com", "demo");
        assert!(manifest.contains("host: demo.example.com"));
        assert!(manifest.contains("ingressClassName: alb"));
    }
}
