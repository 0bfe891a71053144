mod actions;
mod bridge;
mod color;
mod commands;
mod config;
mod cpu;
mod discover;
mod engine;
mod entity;
mod error;
mod hue_client;
mod logging;
mod model;
mod pairing;
mod prompt;
mod registry;
mod resolver;
mod shell;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::commands::Context;
use crate::cpu::CpuVisualizer;
use crate::prompt::{Decisions, TerminalDecisions};
use crate::registry::Registry;
use crate::resolver::Scope;
use crate::shell::{Flow, Shell};

#[derive(Parser)]
#[command(name = "huesh", about = "Interactive shell for Philips Hue bridges")]
struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive shell (default)
    Shell,
    /// Run a single shell command and exit
    Exec {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Scan the local network for bridges and pair with them
    Discover,
    /// Write a default config file
    GenConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Check which configured bridges answer
    Bridges,
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted");
            trigger.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_path);
    let command = cli.command.unwrap_or(Commands::Shell);

    if let Commands::GenConfig { force } = command {
        if config_path.exists() && !force {
            bail!("{} already exists, use --force to overwrite", config_path.display());
        }
        config::Config::default().save(&config_path)?;
        println!("Wrote {}", config_path.display());
        return Ok(());
    }

    let cfg = config::Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if let Err(e) = cfg.validate() {
        bail!("Config validation failed: {}", e);
    }
    let logs = logging::init(&cfg.logger.level);
    info!(
        "Loaded config from {}: {} known bridges",
        config_path.display(),
        cfg.bridges.len()
    );

    let decisions: Arc<dyn Decisions> = Arc::new(TerminalDecisions);

    match command {
        Commands::GenConfig { .. } => {}
        Commands::Bridges => {
            let connected = bridge::connect_known(&cfg.bridges, cfg.commands.timeout()).await;
            for b in &connected {
                println!("{:<18} {:<20} {}", b.id(), b.host, b.info.name);
            }
            if connected.len() < cfg.bridges.len() {
                warn!(
                    "{} of {} configured bridges did not answer",
                    cfg.bridges.len() - connected.len(),
                    cfg.bridges.len()
                );
            }
        }
        Commands::Discover => {
            let cancel = interrupt_token();
            let found =
                discover::discover_bridges(&cfg.discovery, decisions.as_ref(), &cancel).await?;
            for f in &found {
                match pairing::provision(
                    f,
                    decisions.as_ref(),
                    Some(&config_path),
                    cfg.commands.timeout(),
                )
                .await
                {
                    Ok(b) => println!("Paired with {} ({}) at {}", b.info.name, b.id(), b.host),
                    Err(e) => error!("Pairing with {} failed: {}", f.host, e),
                }
            }
        }
        Commands::Shell | Commands::Exec { .. } => {
            let registry = Arc::new(Registry::new(&cfg.registry));
            let cancel = interrupt_token();
            pairing::setup(
                &cfg,
                Some(&config_path),
                decisions.as_ref(),
                &registry,
                &cancel,
            )
            .await?;

            let ctx = Context {
                registry,
                cpu: Arc::new(CpuVisualizer::new(cfg.commands.cpu_interval())),
                decisions,
                settings: cfg.commands.clone(),
                scope: Scope::Registry,
            };
            let mut shell = Shell::new(Arc::new(ctx), Some(logs));

            if let Commands::Exec { args } = command {
                if let Flow::Continue(out) = shell.execute(&args.join(" ")).await? {
                    print!("{}", out);
                }
            } else {
                shell.run().await?;
            }
        }
    }

    Ok(())
}
