use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use tether_host::{EXAMPLE_CONFIG, HostConfig, ScriptHost, init_logging};

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enables debug mode (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a script until it has no open handles left or Ctrl-C is pressed
    Run {
        script: PathBuf,

        /// Arguments passed to the script as the global `arg` table
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Write an example config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// List the native modules scripts can require
    Modules,
}

fn log_level(debug: u8) -> &'static str {
    match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn start_logging(cli: &Cli, config: &HostConfig) -> Result<Option<WorkerGuard>> {
    init_logging("tether", log_level(cli.debug), config.logging.file)
        .context("failed to set up logging")
}

fn load_config(cli: &Cli) -> Result<HostConfig> {
    HostConfig::load(cli.config.as_deref()).context("failed to load config")
}

fn run_script(cli: &Cli, script: &Path, args: &[String]) -> Result<()> {
    let config = load_config(cli)?;
    let _guard = start_logging(cli, &config)?;

    let host = ScriptHost::new(&config).context("failed to start script host")?;
    host.set_args(args)?;

    let queue = host.queue();
    host.context().spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(target: "host", "Interrupted, shutting down");
            queue.shutdown();
        }
    });

    host.exec_file(script)
        .with_context(|| format!("script {} failed", script.display()))?;
    let summary = host.run().context("run loop stopped")?;

    let failures = host.dispatcher().failures();
    if failures > 0 {
        warn!(target: "host", "{} callback(s) raised errors", failures);
    }
    info!(
        target: "host",
        "Done after {} event(s){}",
        summary.tasks,
        if summary.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

fn init_config(cli: &Cli, force: bool) -> Result<()> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => HostConfig::config_path()?,
    };
    if path.exists() && !force {
        bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(&path, EXAMPLE_CONFIG)
        .with_context(|| format!("failed to write {}", path.display()))?;
    eprintln!("Config file created at: {}", path.display());
    Ok(())
}

fn list_modules(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    for (name, _) in tether_modules::MODULES {
        let state = if config.modules.enabled.iter().any(|m| m == name) {
            "enabled"
        } else {
            "disabled"
        };
        println!("{name:<10} {state}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Command::Run { script, args } => run_script(&cli, script, args),
        Command::InitConfig { force } => init_config(&cli, *force),
        Command::Modules => list_modules(&cli),
    }
}
