mod display;
mod file_provider;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use strata_core::config::{self, Configuration, DEFAULT_CONFIG_FILE};
use strata_core::differ::{create_plan, plan_destroy};
use strata_core::executor::{CancelSignal, Executor, ExecutorConfig, Observer, RunReport, cancellation};
use strata_core::graph::{GraphBuilder, ResourceGraph};
use strata_core::plan::Plan;
use strata_core::provider::ProviderRegistry;
use strata_core::refresh::refresh_snapshot;
use strata_core::snapshot::StateSnapshot;
use strata_state::{
    BackendConfig, LocalBackend, LockOptions, StateBackend, StateStore, create_backend, with_state_lock,
};

use file_provider::FileProvider;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Plan and apply declarative resource graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the configuration document
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Maximum number of operations in flight
    #[arg(long, global = true)]
    parallelism: Option<usize>,

    /// Retries for transient provider errors
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Seconds to wait for the state lock (0 fails immediately)
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,

    /// Plan against recorded state without reading resources back from providers
    #[arg(long, global = true)]
    no_refresh: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the state backend
    Init,
    /// Validate the configuration and its dependency graph
    Validate,
    /// Show execution plan without applying changes
    Plan,
    /// Apply changes to reach the desired state
    Apply,
    /// Destroy every resource recorded in state
    Destroy {
        /// Skip confirmation prompt (auto-approve)
        #[arg(long)]
        auto_approve: bool,
    },
    /// Release a state lock left behind by an interrupted run
    ForceUnlock {
        /// ID of the lock to release
        lock_id: String,
    },
    /// Inspect recorded state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// List recorded resources in realization order
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match &cli.command {
        Commands::Init => run_init(&cli).await,
        Commands::Validate => run_validate(&cli),
        Commands::Plan => run_plan(&cli).await,
        Commands::Apply => run_apply(&cli).await,
        Commands::Destroy { auto_approve } => run_destroy(&cli, *auto_approve).await,
        Commands::ForceUnlock { lock_id } => run_force_unlock(&cli, lock_id).await,
        Commands::State {
            command: StateCommands::List,
        } => run_state_list(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp(None)
        .init();
}

/// Everything a command needs, assembled from the document and the flags
struct Workspace {
    configuration: Configuration,
    registry: ProviderRegistry,
    backend: Arc<dyn StateBackend>,
    executor: ExecutorConfig,
    lock: LockOptions,
    refresh: bool,
}

impl Workspace {
    fn load(cli: &Cli) -> Result<Self, String> {
        let configuration = config::load(&cli.config).map_err(|e| e.to_string())?;

        let backend_config = configuration
            .backend
            .as_ref()
            .map(BackendConfig::from)
            .unwrap_or_else(|| BackendConfig::new("local"));
        let backend: Arc<dyn StateBackend> = create_backend(&backend_config)
            .map_err(|e| e.to_string())?
            .into();

        let resource_dir = backend_config
            .get_string("bucket")
            .unwrap_or(LocalBackend::DEFAULT_BUCKET)
            .to_string();
        let registry = ProviderRegistry::new().with_fallback(Arc::new(FileProvider::new(resource_dir)));

        let mut settings = configuration.settings.clone();
        if let Some(parallelism) = cli.parallelism {
            settings.parallelism = parallelism;
        }
        if let Some(max_retries) = cli.max_retries {
            settings.max_retries = max_retries;
        }
        if let Some(lock_timeout) = cli.lock_timeout {
            settings.lock_timeout_secs = lock_timeout;
        }
        if settings.parallelism == 0 {
            return Err("parallelism must be at least 1".to_string());
        }

        Ok(Self {
            registry,
            backend,
            executor: ExecutorConfig::from(&settings),
            lock: LockOptions::from_timeout_secs(settings.lock_timeout_secs),
            refresh: !cli.no_refresh,
            configuration,
        })
    }

    fn graph(&self) -> Result<ResourceGraph, String> {
        GraphBuilder::new(&self.configuration.resources)
            .with_registry(&self.registry)
            .build()
            .map_err(|e| e.to_string())
    }
}

/// Load recorded state, refreshing it through the providers when asked
///
/// Records the providers report as gone are removed from the store, so the
/// plan recreates them or simply stops tracking them.
async fn load_state(
    backend: Arc<dyn StateBackend>,
    registry: &ProviderRegistry,
    refresh: bool,
) -> Result<(StateStore, StateSnapshot), String> {
    let mut store = StateStore::load(backend).await.map_err(|e| e.to_string())?;
    let recorded = store.snapshot().map_err(|e| e.to_string())?;
    if !refresh {
        return Ok((store, recorded));
    }

    println!("{}", "Refreshing state...".cyan());
    let refreshed = refresh_snapshot(&recorded, registry)
        .await
        .map_err(|e| format!("Failed to refresh state: {}", e))?;

    for record in recorded.records() {
        if refreshed.get(&record.id).is_none() {
            println!("  {} {} no longer exists", "!".yellow(), record.id);
            store
                .record_removal(&record.id)
                .await
                .map_err(|e| e.to_string())?;
        }
    }
    Ok((store, refreshed))
}

fn install_interrupt_handler() -> CancelSignal {
    let (trigger, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\n{}",
                "Interrupt received; waiting for in-flight operations to finish...".yellow()
            );
            trigger.cancel();
        }
    });
    signal
}

fn progress_printer() -> Observer {
    Arc::new(display::print_outcome)
}

async fn run_init(cli: &Cli) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    workspace.backend.init().await.map_err(|e| e.to_string())?;
    println!("{}", "✓ State backend initialized.".green().bold());
    Ok(())
}

fn run_validate(cli: &Cli) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;

    println!("{}", "Validating...".cyan());

    let graph = workspace.graph()?;

    println!(
        "{}",
        format!("✓ {} resources validated successfully.", graph.len())
            .green()
            .bold()
    );

    for node in graph.topological_order() {
        let deps: Vec<String> = graph
            .dependencies_of(&node.id)
            .iter()
            .map(|d| d.to_string())
            .collect();
        if deps.is_empty() {
            println!("  • {}", node.id);
        } else {
            println!("  • {} {}", node.id, format!("(after {})", deps.join(", ")).dimmed());
        }
    }

    Ok(())
}

async fn run_plan(cli: &Cli) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    let graph = workspace.graph()?;
    let Workspace {
        registry,
        backend,
        lock,
        refresh,
        ..
    } = workspace;

    let session_backend = backend.clone();
    let plan = with_state_lock(&*backend, "plan", &lock, move |_| async move {
        let (_store, snapshot) = load_state(session_backend, &registry, refresh).await?;
        create_plan(&graph, &snapshot, &registry).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())??;

    display::print_plan(&plan);
    Ok(())
}

async fn run_apply(cli: &Cli) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    let graph = workspace.graph()?;
    let cancel = install_interrupt_handler();
    let Workspace {
        registry,
        backend,
        executor,
        lock,
        refresh,
        ..
    } = workspace;

    let session_backend = backend.clone();
    let report = with_state_lock(&*backend, "apply", &lock, move |_| async move {
        let (mut store, snapshot) = load_state(session_backend, &registry, refresh).await?;
        let plan = create_plan(&graph, &snapshot, &registry).map_err(|e| e.to_string())?;

        if plan.is_empty() {
            println!("{}", "No changes needed.".green());
            return Ok(None);
        }

        display::print_plan(&plan);
        println!();
        println!("{}", "Applying changes...".cyan().bold());
        println!();

        Ok::<_, String>(Some(
            execute(&plan, &snapshot, &mut store, registry, executor, &cancel).await,
        ))
    })
    .await
    .map_err(|e| e.to_string())??;

    match report {
        Some(report) => finish(&report, "Apply"),
        None => Ok(()),
    }
}

async fn run_destroy(cli: &Cli, auto_approve: bool) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    let cancel = install_interrupt_handler();
    let Workspace {
        registry,
        backend,
        executor,
        lock,
        refresh,
        ..
    } = workspace;

    let session_backend = backend.clone();
    let report = with_state_lock(&*backend, "destroy", &lock, move |_| async move {
        let (mut store, snapshot) = load_state(session_backend, &registry, refresh).await?;
        let plan = plan_destroy(&snapshot);

        if plan.is_empty() {
            println!("{}", "No resources to destroy.".green());
            return Ok(None);
        }

        println!("{}", "Destroy Plan:".red().bold());
        println!();
        for effect in plan.effects() {
            println!("  {} {}", "-".red().bold(), effect.id());
        }
        println!();
        println!("Plan: {} to destroy.", plan.len().to_string().red());
        println!();

        if !auto_approve
            && !tokio::task::spawn_blocking(confirm_destroy)
                .await
                .map_err(|e| e.to_string())??
        {
            println!();
            println!("{}", "Destroy cancelled.".yellow());
            return Ok(None);
        }

        println!("{}", "Destroying resources...".red().bold());
        println!();

        Ok::<_, String>(Some(
            execute(&plan, &snapshot, &mut store, registry, executor, &cancel).await,
        ))
    })
    .await
    .map_err(|e| e.to_string())??;

    match report {
        Some(report) => finish(&report, "Destroy"),
        None => Ok(()),
    }
}

fn confirm_destroy() -> Result<bool, String> {
    println!(
        "{}",
        "Do you really want to destroy all resources?"
            .yellow()
            .bold()
    );
    println!(
        "  {}",
        "This action cannot be undone. Type 'yes' to confirm.".yellow()
    );
    print!("\n  Enter a value: ");
    std::io::Write::flush(&mut std::io::stdout()).map_err(|e| e.to_string())?;

    let mut input = String::new();
    std::io::stdin()
        .read_line(&mut input)
        .map_err(|e| e.to_string())?;

    Ok(is_confirmation(&input))
}

fn is_confirmation(input: &str) -> bool {
    input.trim() == "yes"
}

async fn execute(
    plan: &Plan,
    snapshot: &StateSnapshot,
    store: &mut StateStore,
    registry: ProviderRegistry,
    config: ExecutorConfig,
    cancel: &CancelSignal,
) -> RunReport {
    Executor::new(registry)
        .with_config(config)
        .with_observer(progress_printer())
        .apply(plan, snapshot, store, cancel)
        .await
}

fn finish(report: &RunReport, verb: &str) -> Result<(), String> {
    display::print_report(report, verb);
    if report.is_success() {
        Ok(())
    } else {
        Err(format!("{} did not complete ({:?})", verb.to_lowercase(), report.state))
    }
}

async fn run_force_unlock(cli: &Cli, lock_id: &str) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    workspace
        .backend
        .force_unlock(lock_id)
        .await
        .map_err(|e| e.to_string())?;
    println!("{}", format!("✓ Lock {} released.", lock_id).green().bold());
    Ok(())
}

async fn run_state_list(cli: &Cli) -> Result<(), String> {
    let workspace = Workspace::load(cli)?;
    let store = StateStore::load(workspace.backend)
        .await
        .map_err(|e| e.to_string())?;
    let snapshot = store.snapshot().map_err(|e| e.to_string())?;

    if snapshot.is_empty() {
        println!("{}", "No resources recorded in state.".yellow());
        return Ok(());
    }

    for record in snapshot.records() {
        println!("{}  {}", record.id, record.identifier.dimmed());
    }
    println!();
    println!(
        "{}",
        format!("serial {}, lineage {}", store.file().serial, store.file().lineage).dimmed()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_an_explicit_yes_confirms_destroy() {
        assert!(is_confirmation("yes\n"));
        assert!(is_confirmation("  yes  "));
        assert!(!is_confirmation("y\n"));
        assert!(!is_confirmation("YES"));
        assert!(!is_confirmation(""));
    }
}
