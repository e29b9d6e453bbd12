use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use domaind::cgroup::{CgroupBackend, CgroupV2, Controller};
use domaind::config::Config;
use domaind::domain::DomainRecord;
use domaind::process::Supervisor;
use domaind::reconnect;

#[derive(Parser)]
#[command(name = "domaind", version, about = "External-hypervisor domain supervision daemon")]
struct Cli {
    /// Path to the daemon configuration file.
    #[arg(long, default_value = "/etc/domaind/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconnect persisted domains and supervise them.
    Serve,
    /// Verify host prerequisites (hypervisor binary, cgroups, tun device).
    Check,
    /// Print the persisted domain records.
    Status,
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        info!(path = %path.display(), "no config file, using defaults");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check => check(&config),
        Command::Status => status(&config),
    }
}

async fn serve(config: Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;
    tokio::fs::create_dir_all(&config.run_dir)
        .await
        .with_context(|| format!("creating run dir {}", config.run_dir.display()))?;

    let supervisor = Arc::new(Supervisor::new(config));
    reconnect::reconnect_all(&supervisor).await?;
    info!("domaind ready");

    wait_for_shutdown().await?;
    // Hypervisor processes stay up; the next daemon instance reconnects to
    // them from the persisted records.
    info!("shutting down, running domains are left for reconnection");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

fn check(config: &Config) -> Result<()> {
    let binary = &config.hypervisor.binary;
    if !binary.is_file() {
        bail!("hypervisor binary {} not found", binary.display());
    }
    println!("hypervisor binary: {}", binary.display());

    let cgroup = CgroupV2::new(&config.cgroup);
    if cgroup.available() {
        let cpu = cgroup.has_controller(Controller::Cpu);
        let cpuset = cgroup.has_controller(Controller::Cpuset);
        println!("cgroup v2: available (cpu: {}, cpuset: {})", cpu, cpuset);
    } else {
        warn!("cgroup v2 unavailable, placement limited to cpu affinity");
        println!("cgroup v2: unavailable");
    }

    if Path::new("/dev/net/tun").exists() {
        println!("tun device: present");
    } else {
        warn!("/dev/net/tun missing, network device handoff will fail");
        println!("tun device: missing");
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let records = DomainRecord::load_all(&config.state_dir)?;
    if records.is_empty() {
        println!("no domains");
        return Ok(());
    }
    println!("{:<24} {:<24} {:>8}  {}", "NAME", "STATE", "PID", "UUID");
    for record in records {
        let pid = record
            .pid
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<24} {:>8}  {}",
            record.config.name,
            record.state.to_string(),
            pid,
            record.config.uuid
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::parse_from(["domaind", "serve"]);
        assert!(matches!(cli.command, Command::Serve));
        let cli = Cli::parse_from(["domaind", "--config", "/tmp/d.toml", "status"]);
        assert_eq!(cli.config, PathBuf::from("/tmp/d.toml"));
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn test_check_fails_without_binary() {
        let mut config = Config::default();
        config.hypervisor.binary = PathBuf::from("/nonexistent/hypervisor");
        let err = check(&config).unwrap_err();
        assert!(format!("{}", err).contains("not found"));
    }
}
