use assert_cmd::Command;

#[test]
fn help_is_available() {
    Command::cargo_bin("ekstack")
        .unwrap()
        .arg("--help")
        .assert()
        .success();
}

#[test]
fn every_subcommand_documents_itself() {
    for subcommand in ["provision", "teardown", "trust-setup", "trust-test"] {
        Command::cargo_bin("ekstack")
            .unwrap()
            .args([subcommand, "--help"])
            .assert()
            .success();
    }
}

#[test]
fn provision_requires_a_cluster_name() {
    Command::cargo_bin("ekstack")
        .unwrap()
        .args(["provision", "--domain", "example.com"])
        .assert()
        .failure();
}

#[test]
fn mfa_serial_requires_a_token() {
    Command::cargo_bin("ekstack")
        .unwrap()
        .args([
            "trust-test",
            "--role-arn",
            "arn:aws:iam::111122223333:role/partner-audit",
            "--external-id",
            "secret",
            "--mfa-serial",
            "arn:aws:iam::444455556666:mfa/user",
        ])
        .assert()
        .failure();
}

// Teardown with no manifest must not touch AWS at all, so it is safe to run here.
#[test]
fn teardown_without_a_manifest_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("missing.json");
    let kubeconfig = dir.path().join("missing.yaml");
    Command::cargo_bin("ekstack")
        .unwrap()
        .args([
            "teardown",
            "--manifest",
            manifest.to_str().unwrap(),
            "--kubeconfig",
            kubeconfig.to_str().unwrap(),
        ])
        .assert()
        .success();
}
