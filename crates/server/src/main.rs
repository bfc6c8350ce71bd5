//! Homeshare server
//!
//! Runs the storage backend and administers the identity registry.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use server::config::{default_config_path, Config};
use server::model::{ShareItem, UserConfig};
use server::{Homeshare, RegistryStore, ShareEngine};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Homeshare - sandboxed multi-user storage with shares and previews.
#[derive(Parser, Debug)]
#[command(name = "homeshare")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the server until SIGTERM or SIGINT
    Serve,

    /// Write the effective configuration to the config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Manage identities
    #[command(subcommand)]
    Users(UsersCommands),

    /// Manage shares
    #[command(subcommand)]
    Shares(SharesCommands),

    /// Recreate every share link from the registry
    Repair,
}

/// Subcommands for identity management.
#[derive(Subcommand, Debug, Clone)]
pub enum UsersCommands {
    /// List all identities
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Register a new identity
    Add {
        /// Identity name
        name: String,

        /// Initial password
        #[arg(long)]
        password: Option<String>,

        /// Grant edit and create rights
        #[arg(long)]
        write: bool,

        /// Grant administrator rights
        #[arg(long)]
        admin: bool,

        /// Source address that authenticates as this identity (repeatable)
        #[arg(long = "ip")]
        ips: Vec<IpAddr>,
    },

    /// Delete an identity and every link it owns or receives
    Delete {
        /// Identity name
        name: String,
    },

    /// Change an identity's password
    Passwd {
        /// Identity name
        name: String,

        /// New password
        password: String,
    },
}

/// Subcommands for share management.
#[derive(Subcommand, Debug, Clone)]
pub enum SharesCommands {
    /// List shares owned by, or visible to, an identity
    List {
        /// Identity name
        name: String,
    },

    /// Publish a path of an identity's sandbox
    Add {
        /// Owning identity
        owner: String,

        /// Path inside the owner's sandbox
        path: String,

        /// Visible to every registered identity
        #[arg(long)]
        local: bool,

        /// Visible to anonymous visitors holding the hash
        #[arg(long)]
        external: bool,

        /// Identity allowed to see the share (repeatable)
        #[arg(long = "user")]
        users: Vec<String>,
    },

    /// Withdraw a share
    Remove {
        /// Owning identity
        owner: String,

        /// Shared path
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    let _guard = init_tracing(&config, cli.verbose)?;
    tracing::debug!("Using config file: {:?}", config_path);

    config.validate()?;

    match cli.command {
        Commands::Serve => run_server(config).await?,
        Commands::InitConfig { force } => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            config.save(&config_path)?;
            println!("Configuration written to {}", config_path.display());
        }
        Commands::Users(cmd) => {
            let (registry, engine) = open_registry(&config)?;
            run_users_command(&engine, cmd)?;
            registry.flush()?;
        }
        Commands::Shares(cmd) => {
            let (registry, engine) = open_registry(&config)?;
            run_shares_command(&engine, cmd)?;
            registry.flush()?;
        }
        Commands::Repair => {
            let (registry, engine) = open_registry(&config)?;
            let report = engine.repair()?;
            println!(
                "Links: {} created, {} removed, {} failed",
                report.created, report.removed, report.failed
            );
            registry.flush()?;
        }
    }

    Ok(())
}

/// Installs the global subscriber.
///
/// With `daemon.log_dir` set, output goes to a daily rotated file; the
/// returned guard must live until exit so buffered lines are written.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match &config.daemon.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "homeshare.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            Ok(None)
        }
    }
}

/// Runs the service until a shutdown signal arrives.
async fn run_server(config: Config) -> anyhow::Result<()> {
    let mut service = Homeshare::new(config)?;
    service.start().await?;
    tracing::info!(
        "Serving {} identities",
        service.registry().list_identities()?.len()
    );

    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    service.stop().await
}

/// Waits for SIGTERM or SIGINT.
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Loads the registry for a one-shot administrative command.
fn open_registry(config: &Config) -> anyhow::Result<(Arc<RegistryStore>, ShareEngine)> {
    let registry = Arc::new(RegistryStore::load(&config.storage.registry_path)?);
    let engine = ShareEngine::new(&config.storage.root, Arc::clone(&registry));
    Ok((registry, engine))
}

fn run_users_command(engine: &ShareEngine, cmd: UsersCommands) -> anyhow::Result<()> {
    let registry = engine.registry();
    match cmd {
        UsersCommands::List { json } => {
            let users = registry.list_identities()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&users)?);
                return Ok(());
            }
            let default = registry.default_identity()?;
            for user in users {
                let mut flags = Vec::new();
                if user.admin {
                    flags.push("admin");
                }
                if user.can_create {
                    flags.push("create");
                }
                if user.can_edit {
                    flags.push("edit");
                }
                println!(
                    "  {}{} [{}] shares: {}",
                    user.username,
                    if user.is_named(&default.username) {
                        " (default)"
                    } else {
                        ""
                    },
                    flags.join(","),
                    user.shares.len()
                );
            }
        }
        UsersCommands::Add {
            name,
            password,
            write,
            admin,
            ips,
        } => {
            let mut user = if admin {
                UserConfig::admin(&name)?
            } else {
                UserConfig::new(&name)?
            };
            if write {
                user = user.with_write_access();
            }
            if let Some(password) = password {
                user.set_password(&password);
            }
            user.ips = ips;

            let report = engine.add_identity(user)?;
            println!("Identity {} added ({} links created)", name, report.created);
        }
        UsersCommands::Delete { name } => {
            let report = engine.delete_identity(&name)?;
            println!("Identity {} deleted ({} links removed)", name, report.removed);
        }
        UsersCommands::Passwd { name, password } => {
            registry.set_password(&name, &password)?;
            println!("Password of {} changed", name);
        }
    }
    Ok(())
}

fn run_shares_command(engine: &ShareEngine, cmd: SharesCommands) -> anyhow::Result<()> {
    match cmd {
        SharesCommands::List { name } => {
            let owner = engine
                .registry()
                .lookup_by_name(&name)?
                .with_context(|| format!("Unknown identity: {}", name))?;

            println!("Owned by {}:", owner.username);
            for share in &owner.shares {
                println!("  {}  {}", share.hash, share.path);
            }

            println!("Shared with {}:", owner.username);
            for entry in engine.allowed_shares_for(&name)? {
                println!("  {}  {}:{}", entry.share.hash, entry.owner, entry.share.path);
            }
        }
        SharesCommands::Add {
            owner,
            path,
            local,
            external,
            users,
        } => {
            let share = ShareItem::new(&path)?
                .with_local(local)
                .with_external(external)
                .with_users(users);
            let stored = engine.add_share(&owner, share)?;
            println!("Shared {}:{} as {}", owner, stored.path, stored.hash);
        }
        SharesCommands::Remove { owner, path } => match engine.delete_share(&owner, &path)? {
            Some(share) => println!("Share {}:{} removed", owner, share.path),
            None => println!("{} has no share on {}", owner, path),
        },
    }
    Ok(())
}
