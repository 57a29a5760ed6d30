//! v6lab CLI entrypoint.
//!
//! This is the main entrypoint for the v6lab command-line tool. Every
//! command runs against the bundled simulated provider.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use v6lab::cli::{Cli, Commands, OutputFormatter, StateCommands};
use v6lab::config::{ConfigParser, ConfigValidator, TopologyConfig, find_config_file};
use v6lab::error::{Result, V6labError};
use v6lab::provider::SimulatedProvider;
use v6lab::reconciler::Reconciler;
use v6lab::state::{LocalStateStore, RunOutcome, STATE_DIR, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for runs aborted before execution (invalid graph or plan).
const EXIT_ABORTED: u8 = 2;

/// Exit code for partial or cancelled runs.
const EXIT_PARTIAL: u8 = 3;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_json);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            if e.is_abort() {
                ExitCode::from(EXIT_ABORTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence unless `--verbose` is given.
fn init_logging(verbose: bool, json: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, &formatter),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply { yes } => cmd_apply(cli.config.as_ref(), yes, &formatter).await,
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new lab topology.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    info!("Initializing new v6lab project in: {}", path.display());

    let config_path = path.join("v6lab.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/v6lab.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# v6lab")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    println!("{}", formatter.message("success", "Project initialized"));
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and set V6LAB_VAR_SSH_KEY_NAME");
    eprintln!("  2. Run 'v6lab validate' to check the topology");
    eprintln!("  3. Run 'v6lab plan' to see what will be created");
    eprintln!("  4. Run 'v6lab apply' to converge the lab");

    Ok(ExitCode::SUCCESS)
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = parse_config(&config_file)?;
    let result = ConfigValidator::new().check(&config);

    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, state_store) = load_config_and_state(config_path)?;
    let provider = simulated_provider(&config, &state_store).await?;

    let reconciler = Reconciler::new(&config, &state_store, provider);
    let preview = reconciler.plan(&CancellationToken::new()).await?;

    println!("{}", formatter.format_plan(&preview, detailed));
    Ok(ExitCode::SUCCESS)
}

/// Apply the plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, state_store) = load_config_and_state(config_path)?;
    let provider = simulated_provider(&config, &state_store).await?;
    let reconciler = Reconciler::new(&config, &state_store, provider);

    let cancel = CancellationToken::new();
    let preview = reconciler.plan(&cancel).await?;

    if preview.plan.is_empty() && preview.snapshot.fingerprint == preview.fingerprint {
        println!("{}", formatter.message("success", "No changes to apply."));
        return Ok(ExitCode::SUCCESS);
    }

    if !formatter.is_json() {
        eprintln!("{}", formatter.format_plan(&preview, false));
    }

    if !auto_approve {
        eprint!("Do you want to apply this plan? [y/N]: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !input.trim().eq_ignore_ascii_case("y") {
            eprintln!("Apply cancelled.");
            return Ok(ExitCode::SUCCESS);
        }
    }

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for in-flight operations to finish");
            interrupt.cancel();
        }
    });

    let report = reconciler.apply_approved(&preview, cancel).await?;
    println!("{}", formatter.format_report(&report));

    Ok(match report.status {
        RunOutcome::Complete => ExitCode::SUCCESS,
        RunOutcome::Partial | RunOutcome::Cancelled => ExitCode::from(EXIT_PARTIAL),
    })
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (_config, state_store) = load_config_and_state(config_path)?;

    match command {
        StateCommands::Show => {
            if let Some(state) = state_store.load().await? {
                let lock = state_store.get_lock_info().await?;
                println!("{}", formatter.format_state(&state, lock.as_ref()));
            } else {
                println!("{}", formatter.message("warning", "No state found."));
            }
        }
        StateCommands::Unlock { lock_id } => {
            let current = state_store.get_lock_info().await?;
            match (lock_id, current) {
                (_, None) => {
                    println!("{}", formatter.message("success", "State is not locked."));
                }
                (Some(id), Some(lock)) if id != lock.lock_id => {
                    println!(
                        "{}",
                        formatter.message("error", &format!("Lock {id} is not held; current lock is {}", lock.lock_id))
                    );
                    return Ok(ExitCode::FAILURE);
                }
                (_, Some(lock)) => {
                    state_store.release_lock(&lock.lock_id).await?;
                    println!(
                        "{}",
                        formatter.message("success", &format!("Released lock held by {}", lock.holder))
                    );
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.clone()),
        None => find_config_file(std::env::current_dir()?),
    }
}

fn config_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads `.env` and the topology file with environment overrides.
fn parse_config(config_file: &Path) -> Result<TopologyConfig> {
    let parser = ConfigParser::new().with_base_path(config_dir(config_file));
    parser.load_dotenv()?;
    parser.load_with_env(config_file)
}

/// Loads and validates configuration and opens the local state store.
fn load_config_and_state(config_path: Option<&PathBuf>) -> Result<(TopologyConfig, LocalStateStore)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let config = parse_config(&config_file)?;
    let validation = ConfigValidator::new().validate(&config)?;
    for warning in &validation.warnings {
        warn!("{warning}");
    }

    let state_dir = config_dir(&config_file).join(config.state.path.as_deref().unwrap_or(STATE_DIR));
    Ok((config, LocalStateStore::with_base_dir(state_dir)))
}

/// Creates the simulated provider, aware of every object already recorded.
async fn simulated_provider(
    config: &TopologyConfig,
    state_store: &LocalStateStore,
) -> Result<Arc<SimulatedProvider>> {
    let provider = SimulatedProvider::new().with_images(config.simulation.images.clone());
    match state_store.load().await {
        Ok(Some(snapshot)) => provider.adopt(&snapshot),
        Ok(None) => {}
        Err(e @ V6labError::State(_)) => return Err(e),
        Err(e) => warn!("Could not read recorded objects: {e}"),
    }
    Ok(Arc::new(provider))
}
