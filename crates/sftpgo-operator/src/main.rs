//! SFTPGo Operator - runs SFTPGo servers and their users from custom resources

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use sftpgo_common::crd::{SftpGoServer, SftpGoUser};
use sftpgo_common::kube_utils::create_client;
use sftpgo_common::retry::{retry_with_backoff, RetryConfig};
use sftpgo_common::telemetry::{init_telemetry, TelemetryConfig};
use sftpgo_common::FIELD_MANAGER;

mod controller_runner;

/// SFTPGo operator - CRD-driven management of SFTPGo servers and users
#[derive(Parser, Debug)]
#[command(name = "sftpgo-operator", version, about, long_about = None)]
struct Cli {
    /// Print CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the SftpGoServer and SftpGoUser controllers (default mode)
    Controller(ControllerArgs),
}

#[derive(Parser, Debug, Clone)]
struct ControllerArgs {
    /// Path to a kubeconfig; in-cluster or default config when omitted
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Only watch this namespace; all namespaces when omitted
    #[arg(long, env = "SFTPGO_WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Maximum concurrent reconciliations per controller
    #[arg(
        long,
        env = "SFTPGO_CONTROLLER_CONCURRENCY",
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    concurrency: u16,

    /// Timeout for each SFTPGo admin API request, in seconds
    #[arg(long, env = "SFTPGO_ADMIN_TIMEOUT_SECS", default_value_t = 30)]
    admin_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube and reqwest both pull in rustls; pin the process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install aws-lc-rs crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())
        .map_err(|e| anyhow::anyhow!("failed to initialize telemetry: {e}"))?;

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        // No subcommand: controller mode, configured from the environment
        None => ControllerArgs::parse_from(["sftpgo-operator"]),
    };
    run_controller(args).await
}

/// Both CRDs as a multi-document YAML stream
fn crd_manifests() -> anyhow::Result<String> {
    let server = serde_yaml::to_string(&SftpGoServer::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize SftpGoServer CRD: {e}"))?;
    let user = serde_yaml::to_string(&SftpGoUser::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize SftpGoUser CRD: {e}"))?;
    Ok(format!("{server}---\n{user}"))
}

/// Install both CRDs using server-side apply
///
/// The operator installs its own CRDs on startup so their schema always
/// matches the binary. Each apply is retried with backoff while the API
/// server comes up.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in [SftpGoServer::crd(), SftpGoUser::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        let patch = Patch::Apply(&crd);
        tracing::info!(crd = %name, "installing CRD");
        retry_with_backoff(
            &RetryConfig::with_max_attempts(10),
            &format!("install CRD {name}"),
            || crds.patch(&name, &params, &patch),
        )
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {name} CRD: {e}"))?;
    }

    tracing::info!("all SFTPGo CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(
        watch_namespace = args.watch_namespace.as_deref().unwrap_or("*"),
        concurrency = args.concurrency,
        admin_timeout_secs = args.admin_timeout_secs,
        "starting SFTPGo operator"
    );

    let client = create_client(args.kubeconfig.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {e}"))?;

    ensure_crds_installed(&client).await?;

    let settings = controller_runner::RunnerSettings {
        namespace: args.watch_namespace,
        concurrency: args.concurrency,
        admin_timeout: Duration::from_secs(args.admin_timeout_secs),
    };

    let mut controllers = controller_runner::build_server_controllers(client.clone(), &settings);
    controllers.extend(controller_runner::build_user_controllers(client, &settings)?);

    tracing::info!(count = controllers.len(), "controllers started");
    futures::future::join_all(controllers).await;
    tracing::info!("controllers stopped, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_args_default_from_cli() {
        let cli = Cli::try_parse_from(["sftpgo-operator", "controller"]).unwrap();
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.concurrency, 4);
        assert_eq!(args.admin_timeout_secs, 30);
        assert!(args.kubeconfig.is_none());
    }

    #[test]
    fn controller_args_parse_flags() {
        let cli = Cli::try_parse_from([
            "sftpgo-operator",
            "controller",
            "--watch-namespace",
            "files",
            "--concurrency",
            "8",
            "--admin-timeout-secs",
            "5",
        ])
        .unwrap();
        let Some(Commands::Controller(args)) = cli.command else {
            panic!("expected controller subcommand");
        };
        assert_eq!(args.watch_namespace.as_deref(), Some("files"));
        assert_eq!(args.concurrency, 8);
        assert_eq!(args.admin_timeout_secs, 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Cli::try_parse_from(["sftpgo-operator", "controller", "--concurrency", "0"])
            .unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let cli = Cli::try_parse_from(["sftpgo-operator", "controller", "--concurrency", "1"]);
        assert!(cli.is_ok());
    }

    #[test]
    fn crd_manifests_contain_both_kinds() {
        let yaml = crd_manifests().unwrap();
        assert!(yaml.contains("sftpgoservers.sftpgo.sftpgo.io"));
        assert!(yaml.contains("sftpgousers.sftpgo.sftpgo.io"));
        assert_eq!(yaml.matches("\n---\n").count(), 1);
    }
}
