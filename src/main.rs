use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use taxon_harvest::config::Config;
use taxon_harvest::logging;
use taxon_harvest::scheduler::{Mode, Scheduler, StopSignal};
use taxon_harvest::source::{create_source, ImageSource};
use taxon_harvest::subject::load_subjects;

struct CliArgs {
    config_path: Option<PathBuf>,
    subjects_path: PathBuf,
    mode: Mode,
    once: bool,
    perpetual: bool,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: None,
            subjects_path: PathBuf::from("subjects.csv"),
            mode: Mode::Both,
            once: false,
            perpetual: false,
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs::default();

    let value = |i: usize, flag: &str| -> String {
        match args.get(i + 1) {
            Some(v) => v.clone(),
            None => {
                eprintln!("Error: {} requires an argument", flag);
                std::process::exit(1);
            }
        }
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("taxon-harvest {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                cli.config_path = Some(PathBuf::from(value(i, "--config")));
                i += 1;
            }
            "--subjects" | "-s" => {
                cli.subjects_path = PathBuf::from(value(i, "--subjects"));
                i += 1;
            }
            "--mode" | "-m" => {
                cli.mode = match value(i, "--mode").parse() {
                    Ok(mode) => mode,
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                };
                i += 1;
            }
            "--once" | "-1" => {
                cli.once = true;
            }
            "--perpetual" | "-p" => {
                cli.perpetual = true;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn print_help() {
    println!(
        r#"taxon-harvest - Collect images per subject and remove near-duplicates

USAGE:
    taxon-harvest [OPTIONS]

OPTIONS:
    --config, -c PATH     Path to config file
    --subjects, -s CSV    Subject list (default: subjects.csv)
    --mode, -m MODE       dedupe, acquire, both or sweep (default: both)
    --once, -1            Run a single cycle and exit
    --perpetual, -p       Keep running cycles until interrupted
    --version, -V         Show version
    --help, -h            Show this help message

ENVIRONMENT:
    HARVEST_CONFIG        Path to config file (overrides default location)
    HARVEST_LOG           Log level (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/taxon-harvest/config.toml

Modes:
  dedupe   Remove near-duplicates in existing subject folders
  acquire  Fetch new images for each subject, dropping duplicates on arrival
  both     dedupe, then acquire
  sweep    Remove near-duplicates in every image folder under the downloads root"#
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_args();

    // Journald on Linux, rolling file otherwise
    let _ = logging::init(Some(Config::config_dir().join("logs")));

    let mut config = match &cli.config_path {
        Some(path) => Config::load_or_create(path)?,
        None => Config::load()?,
    };
    if cli.perpetual {
        config.scheduler.perpetual = true;
    }
    if cli.once {
        config.scheduler.perpetual = false;
    }

    let subjects = if cli.mode.uses_subjects() {
        load_subjects(&cli.subjects_path, &config.subjects)?
    } else {
        Vec::new()
    };
    info!(
        mode = %cli.mode,
        subjects = subjects.len(),
        root = %config.downloads.root.display(),
        perpetual = config.scheduler.perpetual,
        "taxon-harvest starting"
    );

    let source: Arc<dyn ImageSource> = Arc::from(create_source(&config.source));
    let mut scheduler = Scheduler::new(&config, source)?;

    let stop = StopSignal::new();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current cycle");
            interrupt.stop();
        }
    });

    let mode = cli.mode;
    let cycles = tokio::task::spawn_blocking(move || scheduler.run(&subjects, mode, &stop))
        .await
        .context("Scheduler thread failed")?;

    info!(cycles, "taxon-harvest stopped");
    Ok(())
}
