/*!

This is the command line interface for provisioning and tearing down the EKS demo environment,
and for setting up and verifying cross-account role assumption.

!*/

mod provision;
mod teardown;
mod trust_setup;
mod trust_test;

use anyhow::Result;
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

/// The command line interface for managing the cluster environment and cross-account trust.
#[derive(Debug, Parser)]
#[clap(author, version, about)]
struct Args {
    /// Set logging verbosity [trace|debug|info|warn|error]. If the environment variable `RUST_LOG`
    /// is present, it overrides the default logging behavior. See https://docs.rs/env_logger/latest
    #[clap(long = "log-level", default_value = "info")]
    log_level: LevelFilter,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Parser)]
enum Command {
    /// Provision the cluster, its add-ons and the demo workload.
    Provision(provision::Provision),
    /// Tear down everything a provisioning run created.
    Teardown(teardown::Teardown),
    /// Create a role another account may assume with an external id and MFA.
    TrustSetup(trust_setup::TrustSetup),
    /// Assume a cross-account role and report the resulting identity.
    TrustTest(trust_test::TrustTest),
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logger(args.log_level);
    if let Err(e) = run(args).await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Provision(provision) => provision.run().await,
        Command::Teardown(teardown) => teardown.run().await,
        Command::TrustSetup(trust_setup) => trust_setup.run().await,
        Command::TrustTest(trust_test) => trust_test.run().await,
    }
}

/// Initialize the logger with the value passed by `--log-level` (or its default) when the
/// `RUST_LOG` environment variable is not present. If present, the `RUST_LOG` environment variable
/// overrides `--log-level`/`level`.
fn init_logger(level: LevelFilter) {
    match std::env::var(env_logger::DEFAULT_FILTER_ENV).ok() {
        Some(_) => {
            // RUST_LOG exists; env_logger will use it.
            Builder::from_default_env().init();
        }
        None => {
            // RUST_LOG does not exist; set the level for our crates only.
            Builder::new()
                .filter(Some(env!("CARGO_CRATE_NAME")), level)
                .filter(Some("lifecycle"), level)
                .init();
        }
    }
}
