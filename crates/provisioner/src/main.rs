use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use provisioner::commands::{
    register_all, CommandError, DeleteInstanceByNameCommand, GetExpiredInstancesQuery,
    ProvisionInstanceCommand, ProvisionTarget, Services, SetInstanceExpiryCommand,
};
use provisioner::compose::parse_exposed_ports;
use provisioner::config::ProvisionerConfig;
use provisioner::configuration::ConfigurationFile;
use provisioner::db::{DbClient, PoolLimits};
use provisioner::dispatch::Dispatcher;
use provisioner::firewall::{resolve_firewall_ports, ExposedPortRange};
use provisioner::provisioning::{InstanceFile, RegistryAuthentication};
use provisioner::ssh::{OpenSshClientFactory, OpenSshSettings};

#[derive(Debug, Parser)]
#[command(name = "provisioner")]
#[command(about = "Provisions Docker Compose workloads onto remote hosts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates the database and applies migrations.
    Migrate,
    /// Registers an instance and runs the provisioning pipeline against a host.
    Provision(ProvisionArgs),
    /// Prints the firewall ranges a set of compose files needs.
    Ports {
        #[arg(required = true)]
        compose_files: Vec<PathBuf>,
    },
    /// Sets or clears the expiry of an instance.
    Expire {
        #[arg(long)]
        instance: String,
        /// RFC 3339 timestamp. Omit to keep the instance forever.
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Lists instances whose expiry has passed.
    Expired,
    /// Deletes an instance record.
    Delete {
        #[arg(long)]
        instance: String,
    },
}

#[derive(Debug, Args)]
struct ProvisionArgs {
    /// Provision into the shared demo cluster.
    #[arg(long, conflicts_with_all = ["user", "pull_request"])]
    demo: bool,
    #[arg(long)]
    user: Option<String>,
    #[arg(long, requires = "user")]
    cluster: Option<String>,
    #[arg(long)]
    pull_request: Option<String>,
    /// JSON configuration file applied to a pull request instance.
    #[arg(long, requires = "pull_request")]
    configuration: Option<PathBuf>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value = "nano_2_0")]
    plan: String,
    #[arg(long)]
    ip: Option<String>,
    #[arg(long = "compose", required = true)]
    compose_files: Vec<PathBuf>,
    /// Extra file as LOCAL=REMOTE, REMOTE relative to the provisioning directory.
    #[arg(long = "file")]
    files: Vec<String>,
    /// Build argument as KEY=VALUE.
    #[arg(long = "build-arg")]
    build_arguments: Vec<String>,
    #[arg(long)]
    registry: Option<String>,
    #[arg(long, requires = "registry_password")]
    registry_username: Option<String>,
    #[arg(long, env = "PROVISIONER_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ProvisionerConfig::load()?;

    let cancellation = CancellationToken::new();
    let interrupt = cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            interrupt.cancel();
        }
    });

    match cli.command {
        Command::Migrate => {
            let database_path = config.database_path();
            DbClient::initialize_with_limits(&database_path, PoolLimits::from_config(&config))
                .await?;
            info!(database_path = %database_path, "database migrated");
        }
        Command::Ports { compose_files } => {
            let services = Services::from_config(&config, open_ssh(&config))?;
            for range in required_firewall_ports(&services.required_ports, &compose_files)? {
                println!("{range}");
            }
        }
        Command::Provision(arguments) => {
            let dispatcher = dispatcher(&config).await?;
            let request = provision_request(arguments)?;
            match dispatcher.send(request, &cancellation).await {
                Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
                Err(error) => {
                    if let Some(CommandError::ProvisioningFailed { failure, .. }) =
                        error.downcast_ref::<CommandError>()
                    {
                        eprintln!("{}", serde_json::to_string_pretty(failure)?);
                    }
                    return Err(error);
                }
            }
        }
        Command::Expire { instance, at } => {
            let dispatcher = dispatcher(&config).await?;
            dispatcher
                .send(
                    SetInstanceExpiryCommand {
                        instance_name: instance,
                        expires_at: at,
                    },
                    &cancellation,
                )
                .await?;
        }
        Command::Expired => {
            let dispatcher = dispatcher(&config).await?;
            let expired = dispatcher
                .send(GetExpiredInstancesQuery { now: Utc::now() }, &cancellation)
                .await?;
            println!("{}", serde_json::to_string_pretty(&expired)?);
        }
        Command::Delete { instance } => {
            let dispatcher = dispatcher(&config).await?;
            let deleted = dispatcher
                .send(
                    DeleteInstanceByNameCommand {
                        instance_name: instance.clone(),
                    },
                    &cancellation,
                )
                .await?;
            if !deleted {
                bail!("instance {instance} was not found");
            }
        }
    }

    Ok(())
}

fn open_ssh(config: &ProvisionerConfig) -> Arc<OpenSshClientFactory> {
    Arc::new(OpenSshClientFactory::new(OpenSshSettings::from_config(
        config,
    )))
}

async fn dispatcher(config: &ProvisionerConfig) -> Result<Dispatcher> {
    let db = DbClient::initialize_with_limits(
        &config.database_path(),
        PoolLimits::from_config(config),
    )
    .await?;
    let services = Services::from_config(config, open_ssh(config))?;

    let mut dispatcher = Dispatcher::new(db);
    register_all(&mut dispatcher, &services);
    Ok(dispatcher)
}

fn required_firewall_ports(
    required: &[ExposedPortRange],
    compose_files: &[PathBuf],
) -> Result<Vec<ExposedPortRange>> {
    let mut exposed = Vec::new();
    for path in compose_files {
        exposed.extend(parse_exposed_ports(&read_text(path)?)?);
    }

    Ok(resolve_firewall_ports(required, &exposed))
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

fn split_pair<'a>(value: &'a str, what: &str) -> Result<(&'a str, &'a str)> {
    value
        .split_once('=')
        .with_context(|| format!("{what} `{value}` must look like LEFT=RIGHT"))
}

fn provision_request(arguments: ProvisionArgs) -> Result<ProvisionInstanceCommand> {
    let target = match (arguments.demo, arguments.user, arguments.pull_request) {
        (true, None, None) => ProvisionTarget::Demo,
        (false, Some(user_id), None) => ProvisionTarget::User {
            user_id,
            cluster_id: arguments.cluster,
        },
        (false, None, Some(pull_request_id)) => {
            let configuration = match &arguments.configuration {
                Some(path) => serde_json::from_str::<ConfigurationFile>(&read_text(path)?)
                    .with_context(|| format!("invalid configuration in {}", path.display()))?,
                None => ConfigurationFile::default(),
            };
            ProvisionTarget::PullRequest {
                pull_request_id,
                configuration,
            }
        }
        _ => bail!("exactly one of --demo, --user or --pull-request is required"),
    };

    let compose_documents = arguments
        .compose_files
        .iter()
        .map(|path| read_text(path))
        .collect::<Result<Vec<_>>>()?;

    let files = arguments
        .files
        .iter()
        .map(|value| {
            let (local, remote) = split_pair(value, "--file")?;
            let contents = std::fs::read(local).with_context(|| format!("failed to read {local}"))?;
            Ok(InstanceFile {
                path: remote.to_string(),
                contents,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let build_arguments = arguments
        .build_arguments
        .iter()
        .map(|value| {
            let (key, value) = split_pair(value, "--build-arg")?;
            Ok((key.to_string(), value.to_string()))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;

    let authentication = match (arguments.registry_username, arguments.registry_password) {
        (Some(username), Some(password)) => vec![RegistryAuthentication {
            registry: arguments.registry,
            username,
            password,
        }],
        _ => Vec::new(),
    };

    Ok(ProvisionInstanceCommand {
        target,
        instance_name: arguments.name,
        plan_id: arguments.plan,
        ip_address: arguments.ip,
        compose_documents,
        files,
        authentication,
        build_arguments,
    })
}
