//! Forgeplan CLI entrypoint.
//!
//! This is the main entrypoint for the forgeplan command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use forgeplan::cli::{Cli, Commands, OutputFormatter, StateCommands};
use forgeplan::config::{find_config_file, ConfigParser, ConfigValidator, Configuration, ResourceAddress, StateBackend};
use forgeplan::error::{ForgeError, Result, StateError};
use forgeplan::graph::ResourceGraph;
use forgeplan::planner::{Plan, Planner, RunReport, Scheduler, SchedulerOptions};
use forgeplan::provider::ProviderRegistry;
use forgeplan::refresh::Refresher;
use forgeplan::state::{
    forget_record, generate_holder_id, move_record, LocalStateStore, MemoryStateStore, RunHistoryEntry,
    RunOperation, StateLock, StateStore, STATE_DIR,
};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of `plan` and `drift` when there is something to do.
const EXIT_CHANGES: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

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
            if e.is_retryable() {
                eprintln!("State changed underneath this run; re-run plan and try again.");
            }
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over `--verbose`.
fn init_logging(verbose: bool, json: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();
    let vars = &cli.vars;

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, vars, warnings),
        Commands::Plan { out, detailed } => {
            let ws = Workspace::load(config_path, vars).await?;
            cmd_plan(&ws, out.as_deref(), detailed, formatter).await
        }
        Commands::Apply {
            yes,
            plan_file,
            parallelism,
        } => {
            let ws = Workspace::load(config_path, vars).await?;
            ws.locked(cmd_apply(&ws, yes, plan_file.as_deref(), parallelism, formatter))
                .await
        }
        Commands::Destroy { yes, parallelism } => {
            let ws = Workspace::load(config_path, vars).await?;
            ws.locked(cmd_destroy(&ws, yes, parallelism, formatter)).await
        }
        Commands::Refresh => {
            let ws = Workspace::load(config_path, vars).await?;
            ws.locked(cmd_refresh(&ws, formatter)).await
        }
        Commands::Drift => {
            let ws = Workspace::load(config_path, vars).await?;
            cmd_drift(&ws, formatter).await
        }
        Commands::Graph => {
            let ws = Workspace::load(config_path, vars).await?;
            let graph = ResourceGraph::build(&ws.config.resources)?;
            write_stdout(&graph.to_dot())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command } => {
            let ws = Workspace::load(config_path, vars).await?;
            cmd_state(&ws, command, formatter).await
        }
    }
}

/// Loaded configuration with its store and provisioning clients.
struct Workspace {
    config: Configuration,
    store: Arc<dyn StateStore>,
    registry: ProviderRegistry,
}

impl Workspace {
    /// Loads configuration and opens the configured state store.
    async fn load(config_path: Option<&PathBuf>, vars: &[(String, String)]) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let base_dir = base_dir(&config_file);
        debug!("Loading configuration from: {}", config_file.display());

        let parser = parser(&base_dir, vars);
        parser.load_dotenv()?;
        let config = parser.load(&config_file)?;

        let store: Arc<dyn StateStore> = match config.state.backend {
            StateBackend::Local => {
                let store = config.state.path.as_ref().map_or_else(
                    || LocalStateStore::with_base_dir(base_dir.join(STATE_DIR)),
                    |path| LocalStateStore::with_state_path(base_dir.join(path)),
                );
                debug!("Using state file {}", store.state_path().display());
                Arc::new(store)
            }
            StateBackend::Memory => {
                warn!("Memory state backend selected; nothing will be persisted");
                Arc::new(MemoryStateStore::new())
            }
        };
        store.open().await?;

        Ok(Self {
            config,
            store,
            registry: ProviderRegistry::with_builtins(base_dir),
        })
    }

    fn planner(&self) -> Planner<'_> {
        Planner::new(&self.registry)
    }

    /// Runs a mutating command under the state lock.
    async fn locked<F>(&self, command: F) -> Result<ExitCode>
    where
        F: std::future::Future<Output = Result<ExitCode>>,
    {
        let lock = StateLock::acquire(self.store.as_ref(), "").await?;
        debug!("Acquired state lock {}", lock.lock_id());
        let result = command.await;
        let flushed = self.store.flush().await;
        lock.release(self.store.as_ref()).await;
        flushed?;
        result
    }

    /// Executes a plan, cancelling on Ctrl-C.
    async fn execute(&self, plan: Plan, parallelism: Option<usize>) -> Result<RunReport> {
        let mut options = SchedulerOptions::from_settings(&self.config.settings);
        if let Some(parallelism) = parallelism {
            options = options.with_parallelism(parallelism);
        }

        let token = CancellationToken::new();
        let interrupt = {
            let token = token.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted; waiting for in-flight steps to finish");
                    token.cancel();
                }
            })
        };

        let report = Scheduler::new(Arc::clone(&self.store), self.registry.clone())
            .with_options(options)
            .with_cancellation(token)
            .execute(plan)
            .await;
        interrupt.abort();
        report
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing new forgeplan project in: {}", path.display());

    let config_path = path.join("forgeplan.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/forgeplan.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    let ignored = [".env", ".forgeplan/", "*.plan.json"];
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = ignored
            .iter()
            .copied()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# forgeplan")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ignored.join("\n") + "\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit forgeplan.yaml with your resources");
    eprintln!("  2. Run 'forgeplan validate' to check your configuration");
    eprintln!("  3. Run 'forgeplan plan' to see what will change");
    eprintln!("  4. Run 'forgeplan apply' to provision");

    Ok(ExitCode::SUCCESS)
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, vars: &[(String, String)], show_warnings: bool) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = parser(&base_dir(&config_file), vars);
    parser.load_dotenv()?;
    let mut file = parser.load_file(&config_file)?;
    ConfigParser::apply_env_overrides(&mut file)?;

    let result = ConfigValidator::new().check(&file);
    for error in &result.errors {
        eprintln!("  error: {error}");
    }
    if show_warnings {
        for warning in &result.warnings {
            eprintln!("  warning: {warning}");
        }
    }
    if !result.is_valid() {
        eprintln!("\nConfiguration has {} error(s).", result.error_count());
        return Ok(ExitCode::FAILURE);
    }

    let config = parser.resolve(&file)?;
    ResourceGraph::build(&config.resources)?;
    ProviderRegistry::with_builtins(base_dir(&config_file)).check(&config.resources)?;

    eprintln!("Configuration is valid!");
    eprintln!("\nConfiguration summary:");
    eprintln!("  Project: {}", config.project.name);
    eprintln!("  Resources: {}", config.resources.len());
    eprintln!("  Moves: {}", config.moves.len());
    if !show_warnings && result.warning_count() > 0 {
        eprintln!("  Warnings: {} (use --warnings to show)", result.warning_count());
    }
    Ok(ExitCode::SUCCESS)
}

/// Show the plan.
async fn cmd_plan(ws: &Workspace, out: Option<&Path>, detailed: bool, formatter: OutputFormatter) -> Result<ExitCode> {
    let plan = ws
        .planner()
        .plan(&ws.config.resources, &ws.config.moves, ws.store.as_ref())
        .await?;

    write_stdout(&formatter.format_plan(&plan, detailed))?;

    if let Some(out) = out {
        plan.save(out).await?;
        eprintln!("Plan saved to {}", out.display());
    }

    Ok(if plan.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CHANGES)
    })
}

/// Apply the configuration or a saved plan.
async fn cmd_apply(
    ws: &Workspace,
    auto_approve: bool,
    plan_file: Option<&Path>,
    parallelism: Option<usize>,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let planner = ws.planner();
    let plan = match plan_file {
        Some(path) => {
            let plan = Plan::load(path).await?;
            planner
                .verify(&plan, &ws.config.resources, &ws.config.moves, ws.store.as_ref())
                .await?;
            info!("Loaded plan {} from {}", plan.id, path.display());
            plan
        }
        None => {
            planner
                .plan(&ws.config.resources, &ws.config.moves, ws.store.as_ref())
                .await?
        }
    };

    if plan.is_empty() {
        write_stdout(&formatter.message("success", "No changes to apply."))?;
        return Ok(ExitCode::SUCCESS);
    }

    write_stdout(&formatter.format_plan(&plan, false))?;

    if !auto_approve && plan_file.is_none() && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = ws.execute(plan, parallelism).await?;
    write_stdout(&formatter.format_report(&report))?;
    Ok(exit_for(&report))
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    ws: &Workspace,
    auto_approve: bool,
    parallelism: Option<usize>,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let plan = ws
        .planner()
        .plan_destroy(&ws.config.resources, &ws.config.moves, ws.store.as_ref())
        .await?;

    if plan.is_empty() {
        write_stdout(&formatter.message("success", "Nothing to destroy."))?;
        return Ok(ExitCode::SUCCESS);
    }

    write_stdout(&formatter.format_plan(&plan, false))?;

    if !auto_approve && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")? {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let report = ws.execute(plan, parallelism).await?;
    write_stdout(&formatter.format_report(&report))?;
    Ok(exit_for(&report))
}

/// Commit real object attributes to state.
async fn cmd_refresh(ws: &Workspace, formatter: OutputFormatter) -> Result<ExitCode> {
    let report = Refresher::new(Arc::clone(&ws.store), ws.registry.clone())
        .refresh()
        .await?;
    write_stdout(&formatter.format_drift(&report))?;
    Ok(if report.errors.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Check for drift.
async fn cmd_drift(ws: &Workspace, formatter: OutputFormatter) -> Result<ExitCode> {
    let report = Refresher::new(Arc::clone(&ws.store), ws.registry.clone())
        .check_drift()
        .await?;
    write_stdout(&formatter.format_drift(&report))?;
    Ok(if !report.errors.is_empty() {
        ExitCode::FAILURE
    } else if report.entries.is_empty() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CHANGES)
    })
}

/// State management commands.
async fn cmd_state(ws: &Workspace, command: StateCommands, formatter: OutputFormatter) -> Result<ExitCode> {
    let store = ws.store.as_ref();

    match command {
        StateCommands::List => {
            let snapshot = store.snapshot().await?;
            write_stdout(&formatter.format_records(&snapshot))?;
        }
        StateCommands::Show { address } => {
            let address: ResourceAddress = address.parse()?;
            let record = store.get(&address).await?.ok_or_else(|| not_in_state(&address))?;
            write_stdout(&formatter.format_record(&record))?;
        }
        StateCommands::Rm { address } => {
            let address: ResourceAddress = address.parse()?;
            ws.locked(async {
                forget_record(store, &address).await?;
                Ok::<_, ForgeError>(ExitCode::SUCCESS)
            })
            .await?;
            write_stdout(&formatter.message(
                "success",
                &format!("Removed {address} from state; the real object was not touched."),
            ))?;
        }
        StateCommands::Mv { from, to } => {
            let from: ResourceAddress = from.parse()?;
            let to: ResourceAddress = to.parse()?;
            ws.locked(async {
                move_record(store, &from, &to).await?;
                let mut entry = RunHistoryEntry::new(RunOperation::Move);
                entry.succeeded = 1;
                store.append_history(entry).await?;
                Ok::<_, ForgeError>(ExitCode::SUCCESS)
            })
            .await?;
            write_stdout(&formatter.message("success", &format!("Moved {from} to {to}.")))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            write_stdout(&formatter.format_lock(Some(&lock)))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock) = store.lock_info().await? {
                    store.release_lock(&lock.lock_id).await?;
                    write_stdout(&formatter.message("success", "State forcefully unlocked."))?;
                } else {
                    write_stdout(&formatter.format_lock(None))?;
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                write_stdout(&formatter.message("success", "State unlocked."))?;
            } else {
                write_stdout(&formatter.format_lock(store.lock_info().await?.as_ref()))?;
                eprintln!("Please provide --lock-id or use --force");
                return Ok(ExitCode::FAILURE);
            }
        }
        StateCommands::History { limit } => {
            let history = store.history().await?;
            let skip = history.len().saturating_sub(limit);
            write_stdout(&formatter.format_history(&history[skip..]))?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory relative paths in the configuration are resolved against.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn parser(base_dir: &Path, vars: &[(String, String)]) -> ConfigParser {
    vars.iter().fold(
        ConfigParser::new().with_base_path(base_dir),
        |parser, (name, value)| parser.with_variable(name, value),
    )
}

fn not_in_state(address: &ResourceAddress) -> ForgeError {
    ForgeError::State(StateError::storage(format!("{address} is not in state")))
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Apply and destroy fail unless every step succeeded.
fn exit_for(report: &RunReport) -> ExitCode {
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn write_stdout(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}
