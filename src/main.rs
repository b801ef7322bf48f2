#![forbid(unsafe_code)]

//! `vmlink`: developer tool for booting and reaching a single test system.
//!
//! Prints the QEMU invocation for a configured system, or boots it and waits
//! until its forwarded SSH port answers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use vmlink::backend::qemu::{image_path, qemu_command_with, QemuOptions};
use vmlink::backend::CommandInvocation;
use vmlink::config::LinkConfig;
use vmlink::connect::{wait_port_up_with, Client, SshDialer};
use vmlink::{LinkError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "vmlink", about = "Boot and reach ephemeral test systems", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the QEMU argument vector for a system.
    Argv {
        /// System name from the configuration.
        system: String,
        /// Host port forwarded to the guest's SSH port.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Boot a system and wait until its SSH port answers.
    Boot {
        /// System name from the configuration.
        system: String,
        /// Host port forwarded to the guest's SSH port.
        #[arg(long)]
        port: Option<u16>,
        /// Also open a control-channel session and run `uname -a`.
        #[arg(long)]
        ssh: bool,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| LinkError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = LinkConfig::load_from_path(&args.config)?;
    info!(systems = config.systems.len(), "configuration loaded");

    match args.command {
        Command::Argv { system, port } => {
            let invocation = build(&config, &system, port)?;
            println!("{}", invocation.argv().join(" "));
            Ok(())
        }
        Command::Boot { system, port, ssh } => boot(&config, &system, port, ssh).await,
    }
}

fn build(config: &LinkConfig, name: &str, port: Option<u16>) -> Result<CommandInvocation> {
    let system = config.system(name)?;
    let path = image_path(&system.image)?;
    let options = QemuOptions {
        binary: config.qemu.binary.clone(),
        ..QemuOptions::from_env()
    };
    qemu_command_with(
        system,
        &path,
        config.qemu.memory_mb,
        port.unwrap_or(config.qemu.base_port),
        &options,
    )
}

async fn boot(config: &LinkConfig, name: &str, port: Option<u16>, ssh: bool) -> Result<()> {
    let system = config.system(name)?;
    let port = port.unwrap_or(config.qemu.base_port);
    let address = format!("127.0.0.1:{port}");

    let mut child = build(config, name, Some(port))?
        .command()
        .spawn()
        .map_err(|err| LinkError::Io(format!("failed to start qemu for {system}: {err}")))?;
    info!(system = %system, pid = child.id().unwrap_or(0), "qemu started");

    let ct = CancellationToken::new();
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_ct.cancel();
    });

    wait_port_up_with(
        &ct,
        system,
        &address,
        Some(&mut child),
        config.port_wait.options(),
    )
    .await?;
    info!(system = %system, address, "system is up");

    if ssh {
        let client = Client::connect(
            system.name.clone(),
            address.clone(),
            config.ssh.ssh_config(),
            Arc::new(SshDialer::new()),
        )
        .await?;
        match client.run("uname -a").await {
            Ok(out) => println!("{}", out.trim_end()),
            Err(err) => error!(%err, "remote command failed"),
        }
    }

    ct.cancelled().await;
    info!(system = %system, "shutting down");
    if let Ok(Some(status)) = child.try_wait() {
        info!(system = %system, %status, "qemu already exited");
        return Ok(());
    }
    child
        .kill()
        .await
        .map_err(|err| LinkError::Io(format!("failed to stop qemu for {system}: {err}")))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| LinkError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| LinkError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
