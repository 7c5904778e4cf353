use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use pixsweep::config::CampaignConfig;
use pixsweep::core::expand::expand;
use pixsweep::core::naming::{RunId, RunLayout};
use pixsweep::orchestration::{Campaign, SystemProcessRunner};
use pixsweep::{plog, plog_error, Result};

/// pixsweep - parameter sweeps of detector simulation and reconstruction
#[derive(Parser, Debug)]
#[command(name = "pixsweep")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    PIXSWEEP_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the campaign described by a config file
    Run {
        /// JSON or TOML config; a template is written if it does not exist
        #[arg(short, long)]
        config: PathBuf,

        /// Enable debug logging (writes to ~/.pixsweep/pixsweep.log)
        #[arg(short = 'd', long)]
        debug: bool,

        /// Mirror log lines to stderr
        #[arg(long)]
        console: bool,

        /// Override the configured worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// List the tasks a config expands to, without running anything
    Plan {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Run {
            config,
            debug,
            console,
            workers,
        } => {
            pixsweep::log::init(debug, console);
            run_campaign(config, workers)
        }
        Command::Plan { config } => {
            pixsweep::log::init(false, false);
            run_plan(config)
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_config_error() => {
            plog_error!("{}", e);
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            plog_error!("Run aborted: {}", e);
            eprintln!("Run aborted: {}", e);
            ExitCode::SUCCESS
        }
    }
}

fn run_campaign(config_path: PathBuf, workers: Option<usize>) -> Result<()> {
    let mut cfg = CampaignConfig::load(&config_path)?;
    if workers.is_some() {
        cfg.workers = workers;
    }
    if pixsweep::log::is_debug() {
        plog!("pixsweep starting with {} (debug mode enabled)", config_path.display());
    } else {
        plog!("pixsweep starting with {}", config_path.display());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let summary = runtime.block_on(Campaign::new(cfg, Arc::new(SystemProcessRunner::new())).run())?;

    println!("{}", summary);
    Ok(())
}

fn run_plan(config_path: PathBuf) -> Result<()> {
    let cfg = CampaignConfig::load(&config_path)?;
    let layout = RunLayout::new(&cfg.output_root, RunId::now());

    for task in expand(&cfg, &layout) {
        match &task.depends_on {
            Some(dep) => println!("{}  (after {})", task.id, dep),
            None => println!("{}", task.id),
        }
        println!("    {} -> {}", task.input_path.display(), task.output_path.display());
    }
    println!(
        "{} variant(s) x {} energ(ies), {} worker(s)",
        cfg.variants.len(),
        cfg.energies.len(),
        cfg.effective_workers()
    );
    Ok(())
}
