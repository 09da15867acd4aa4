//! icadmin - command-line front end for innodb-cluster-admin.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads the controller configuration from the environment and flags
//! - Runs one administration operation and prints its result as JSON

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

use innodb_cluster_admin::client::{InstanceDef, MySqlConnector, MySqlConnectorConfig};
use innodb_cluster_admin::config::AdminConfig;
use innodb_cluster_admin::controller::{
    AddInstanceOptions, Cluster, ConfigureInstanceOptions, Context, CreateClusterOptions, Dba,
    DissolveOptions, DropMetadataOptions, GetClusterOptions, OperationReport, OptionValue,
    RebootOptions, RejoinInstanceOptions, RemoveInstanceOptions, RescanOptions,
    parse_operation_options,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Parser)]
#[command(name = "icadmin", version, about = "Administer MySQL InnoDB clusters")]
struct Cli {
    /// Instance to work through, as `user[:password]@host[:port]`.
    #[arg(long, env = "ICADMIN_URI")]
    uri: String,

    /// Password for every instance, when not part of the URI.
    #[arg(long, env = "ICADMIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,

    /// Seconds to wait for a member to apply the group's transactions.
    #[arg(long)]
    gtid_wait_timeout: Option<u64>,

    /// Seconds to wait for a joining member to come ONLINE.
    #[arg(long)]
    join_timeout: Option<u64>,

    #[arg(long)]
    connect_timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check whether the instance can be used in a cluster.
    CheckInstance,
    /// Fix the configuration of the instance.
    ConfigureInstance {
        #[arg(long)]
        restart: bool,
    },
    /// Create a cluster on the instance.
    CreateCluster {
        name: String,
        /// Options as a JSON object, e.g. '{"memberWeight": 80}'.
        #[arg(long)]
        options: Option<String>,
    },
    Describe,
    Status,
    Options {
        #[arg(long)]
        all: bool,
    },
    AddInstance {
        instance: String,
        #[arg(long)]
        options: Option<String>,
    },
    RemoveInstance {
        instance: String,
        #[arg(long)]
        options: Option<String>,
    },
    RejoinInstance {
        instance: String,
        #[arg(long)]
        options: Option<String>,
    },
    /// Compare the instance's transactions with the cluster's.
    CheckInstanceState { instance: String },
    /// Restore quorum from the partition the instance belongs to.
    ForceQuorum { instance: String },
    /// Reboot the cluster after a complete outage.
    Reboot {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        options: Option<String>,
    },
    Rescan {
        #[arg(long)]
        options: Option<String>,
    },
    Dissolve {
        #[arg(long)]
        force: bool,
    },
    SetOption {
        option: String,
        value: String,
    },
    SetInstanceOption {
        instance: String,
        option: String,
        value: String,
    },
    SwitchToSinglePrimary {
        #[arg(long)]
        primary: Option<String>,
    },
    SwitchToMultiPrimary,
    SetPrimary { instance: String },
    DropMetadata {
        #[arg(long)]
        force: bool,
        #[arg(long)]
        clear_read_only: bool,
    },
}

type BoxError = Box<dyn std::error::Error>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("innodb_cluster_admin=info".parse()?)
        .add_directive("icadmin=info".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match cli.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Pretty => subscriber.pretty().init(),
    }

    let mut config = AdminConfig::from_env()?;
    if let Some(secs) = cli.gtid_wait_timeout {
        config = config.with_gtid_wait_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = cli.join_timeout {
        config = config.with_join_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = cli.connect_timeout {
        config.connect_timeout = Duration::from_secs(secs);
    }

    let connector = MySqlConnector::new(MySqlConnectorConfig {
        connect_timeout: config.connect_timeout,
    });
    let dba = Dba::new(Context::new(connector, config));
    let target = cli
        .uri
        .parse::<InstanceDef>()?
        .with_password(cli.password.as_deref());

    info!(instance = %target.endpoint(), "Starting icadmin");

    let result = run_to_completion(run(&dba, &target, cli.command), shutdown_signal()).await;
    match result {
        Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
        Err(e) => {
            error!(error = %e, "Operation failed");
            return Err(e);
        }
    }
    Ok(())
}

fn output<T: Serialize>(value: T, report: OperationReport) -> serde_json::Value {
    json!({
        "result": value,
        "warnings": report.warnings,
        "notes": report.notes,
    })
}

fn options<T: serde::de::DeserializeOwned + Default>(
    raw: Option<&str>,
    keys: &[&str],
) -> Result<T, BoxError> {
    match raw {
        Some(raw) => {
            let value: serde_json::Value = serde_json::from_str(raw)?;
            Ok(parse_operation_options(&value, keys)?)
        }
        None => Ok(T::default()),
    }
}

/// Numbers and booleans are passed typed, anything else as a string.
fn option_value(raw: &str) -> OptionValue {
    serde_json::from_str(raw).unwrap_or_else(|_| OptionValue::from(raw))
}

fn instance(raw: &str, target: &InstanceDef) -> Result<InstanceDef, BoxError> {
    Ok(raw.parse::<InstanceDef>()?.with_credentials_from(target))
}

async fn cluster(
    dba: &Dba<MySqlConnector>,
    target: &InstanceDef,
) -> Result<Cluster<MySqlConnector>, BoxError> {
    Ok(dba
        .get_cluster(target, None, GetClusterOptions::default())
        .await?
        .into_inner())
}

async fn run(
    dba: &Dba<MySqlConnector>,
    target: &InstanceDef,
    command: Command,
) -> Result<serde_json::Value, BoxError> {
    let value = match command {
        Command::CheckInstance => {
            let checked = dba.check_instance_configuration(target).await?;
            output(checked.value, checked.report)
        }
        Command::ConfigureInstance { restart } => {
            let options = ConfigureInstanceOptions {
                restart: Some(restart),
                ..Default::default()
            };
            let configured = dba.configure_instance(target, options).await?;
            output(configured.value, configured.report)
        }
        Command::CreateCluster { name, options: raw } => {
            let options: CreateClusterOptions =
                options(raw.as_deref(), CreateClusterOptions::KEYS)?;
            let created = dba.create_cluster(target, &name, options).await?;
            output(created.value.name(), created.report)
        }
        Command::Describe => {
            let described = cluster(dba, target).await?.describe().await?;
            output(described.value, described.report)
        }
        Command::Status => {
            let status = cluster(dba, target).await?.status().await?;
            output(status.value, status.report)
        }
        Command::Options { all } => {
            let listed = cluster(dba, target).await?.options(all).await?;
            output(listed.value, listed.report)
        }
        Command::AddInstance { instance: raw, options: opts } => {
            let options: AddInstanceOptions = options(opts.as_deref(), AddInstanceOptions::KEYS)?;
            let report = cluster(dba, target)
                .await?
                .add_instance(&instance(&raw, target)?, options)
                .await?;
            output((), report)
        }
        Command::RemoveInstance { instance: raw, options: opts } => {
            let options: RemoveInstanceOptions =
                options(opts.as_deref(), RemoveInstanceOptions::KEYS)?;
            let report = cluster(dba, target)
                .await?
                .remove_instance(&instance(&raw, target)?, options)
                .await?;
            output((), report)
        }
        Command::RejoinInstance { instance: raw, options: opts } => {
            let options: RejoinInstanceOptions =
                options(opts.as_deref(), RejoinInstanceOptions::KEYS)?;
            let report = cluster(dba, target)
                .await?
                .rejoin_instance(&instance(&raw, target)?, options)
                .await?;
            output((), report)
        }
        Command::CheckInstanceState { instance: raw } => {
            let checked = cluster(dba, target)
                .await?
                .check_instance_state(&instance(&raw, target)?)
                .await?;
            output(checked.value, checked.report)
        }
        Command::ForceQuorum { instance: raw } => {
            let report = cluster(dba, target)
                .await?
                .force_quorum_using_partition_of(&instance(&raw, target)?, None)
                .await?;
            output((), report)
        }
        Command::Reboot { name, options: raw } => {
            let options: RebootOptions = options(raw.as_deref(), RebootOptions::KEYS)?;
            let rebooted = dba
                .reboot_cluster_from_complete_outage(target, name.as_deref(), options)
                .await?;
            output(rebooted.value.name(), rebooted.report)
        }
        Command::Rescan { options: raw } => {
            let options: RescanOptions = options(raw.as_deref(), RescanOptions::KEYS)?;
            let rescanned = cluster(dba, target).await?.rescan(options).await?;
            output(rescanned.value, rescanned.report)
        }
        Command::Dissolve { force } => {
            let options = DissolveOptions { force: Some(force) };
            let report = cluster(dba, target).await?.dissolve(options).await?;
            output((), report)
        }
        Command::SetOption { option, value } => {
            let report = cluster(dba, target)
                .await?
                .set_option(&option, option_value(&value))
                .await?;
            output((), report)
        }
        Command::SetInstanceOption { instance: raw, option, value } => {
            let report = cluster(dba, target)
                .await?
                .set_instance_option(&instance(&raw, target)?, &option, option_value(&value))
                .await?;
            output((), report)
        }
        Command::SwitchToSinglePrimary { primary } => {
            let primary = primary.map(|raw| instance(&raw, target)).transpose()?;
            let report = cluster(dba, target)
                .await?
                .switch_to_single_primary_mode(primary.as_ref())
                .await?;
            output((), report)
        }
        Command::SwitchToMultiPrimary => {
            let report = cluster(dba, target)
                .await?
                .switch_to_multi_primary_mode()
                .await?;
            output((), report)
        }
        Command::SetPrimary { instance: raw } => {
            let report = cluster(dba, target)
                .await?
                .set_primary_instance(&instance(&raw, target)?)
                .await?;
            output((), report)
        }
        Command::DropMetadata {
            force,
            clear_read_only,
        } => {
            let options = DropMetadataOptions {
                force: Some(force),
                clear_read_only: Some(clear_read_only),
            };
            let report = dba.drop_metadata_schema(target, options).await?;
            output((), report)
        }
    };
    Ok(value)
}

/// Drive `operation` to completion.
///
/// A shutdown signal is logged but never cancels a running operation: a
/// mutating step that has started always runs to completion or failure.
async fn run_to_completion<F, S>(operation: F, shutdown: S) -> F::Output
where
    F: Future,
    S: Future<Output = ()>,
{
    tokio::pin!(operation);
    tokio::select! {
        output = &mut operation => output,
        () = shutdown => {
            warn!("Shutdown requested, waiting for the current operation to finish");
            operation.await
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// A handler that cannot be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_operation() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let operation = async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            flag.store(true, Ordering::SeqCst);
            "removed"
        };

        // The signal fires immediately, long before the operation is done.
        let output = run_to_completion(operation, async {}).await;
        assert_eq!(output, "removed");
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_operation_without_signal() {
        let output = run_to_completion(async { 7 }, std::future::pending()).await;
        assert_eq!(output, 7);
    }
}
