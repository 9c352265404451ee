//! ENSEMBLE CLI
//!
//! Register services, preview plans and run ensemble requests against a
//! local registry file.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use ensemble_core::{ExecutionRequest, Service};
use ensemble_runtime::{
    DispatchError, DispatchReport, Engine, EngineConfig, ExecutionBackend, LoopbackBackend, PlanPreview,
    ProcessBackend,
};
use ensemble_storage::{MemoryRegistry, RedbRegistry, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ensemble")]
#[command(about = "ENSEMBLE - content-addressed ensemble pipeline scheduler", long_about = None)]
struct Cli {
    /// Registry file
    #[arg(long, global = true, default_value = "ensemble.redb")]
    db: PathBuf,
    /// Engine configuration (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Base URI for output locators
    #[arg(long, global = true)]
    storage_base: Option<String>,
    /// Units dispatched concurrently per level
    #[arg(long, global = true)]
    fan_out: Option<usize>,
    /// Log level for ensemble crates (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register services from JSON files (one object or an array each)
    Register {
        /// Service description files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// List registered services
    Services,
    /// Show the levels, chains and dataIds a request would dispatch
    Plan {
        /// Execution request file
        request: PathBuf,
        /// Print JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Run a request to completion
    Run {
        /// Execution request file
        request: PathBuf,
        /// Recompute even when results are cached
        #[arg(long)]
        force_rerun: bool,
        /// Simulate with the loopback backend; nothing is recorded in the registry
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => tracing_subscriber::EnvFilter::new(format!("ensemble={}", level)),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ensemble=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(base) = &cli.storage_base {
        config.dispatch = config.dispatch.with_storage_base(base.clone());
    }
    if let Some(fan_out) = cli.fan_out {
        config.dispatch = config.dispatch.with_fan_out(fan_out);
    }
    Ok(config)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).wrap_err_with(|| format!("parsing {}", path.display()))
}

fn read_services(path: &Path) -> Result<Vec<Service>> {
    let value: serde_json::Value = read_json(path)?;
    let services = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(services)
}

fn open_registry(cli: &Cli) -> Result<Arc<RedbRegistry>> {
    let registry =
        RedbRegistry::open(&cli.db).wrap_err_with(|| format!("opening registry {}", cli.db.display()))?;
    Ok(Arc::new(registry))
}

async fn open_engine(cli: &Cli, registry: Arc<dyn Registry>, backend: Arc<dyn ExecutionBackend>) -> Result<Engine> {
    let engine = Engine::new(registry, backend, load_config(cli)?);
    engine.restore().await?;
    Ok(engine)
}

fn print_plan(preview: &PlanPreview) {
    println!("Target: {}", preview.target);
    for level in &preview.levels {
        println!(
            "  level {}: {} | {} chains, {} units ({} shared)",
            level.level,
            level.services.join(", "),
            level.chains,
            level.data_ids.len(),
            level.duplicates
        );
    }
    for warning in &preview.warnings {
        println!("  warning: {}", warning);
    }
}

fn print_report(report: &DispatchReport) {
    println!("Run {} -> {}", report.run_id, report.target);
    for level in &report.levels {
        println!(
            "  level {}: {} units | {} cached, {} submitted, {} waited, {} shared",
            level.level, level.units, level.cached, level.submitted, level.waited, level.deduplicated
        );
    }
    for output in &report.outputs {
        if let Some(locator) = output.output(ensemble_storage::DEFAULT_OUTPUT) {
            println!("  {} -> {}", output.data_id, locator);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match &cli.command {
        Commands::Register { files } => {
            let engine = open_engine(&cli, open_registry(&cli)?, Arc::new(LoopbackBackend::new())).await?;
            for file in files {
                for service in read_services(file)? {
                    let name = service.name.clone();
                    engine
                        .register(service)
                        .await
                        .wrap_err_with(|| format!("registering {} from {}", name, file.display()))?;
                    println!("Registered {}", name);
                }
            }
            Ok(())
        }
        Commands::Services => {
            let engine = open_engine(&cli, open_registry(&cli)?, Arc::new(LoopbackBackend::new())).await?;
            for service in engine.services() {
                println!(
                    "{}  parameters=[{}]  inputs=[{}]",
                    service.name,
                    service.parameters.join(", "),
                    service.inputs.join(", ")
                );
            }
            Ok(())
        }
        Commands::Plan { request, json } => {
            let engine = open_engine(&cli, open_registry(&cli)?, Arc::new(LoopbackBackend::new())).await?;
            let request: ExecutionRequest = read_json(request)?;
            let preview = engine.plan(&request)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&preview)?);
            } else {
                print_plan(&preview);
            }
            Ok(())
        }
        Commands::Run {
            request,
            force_rerun,
            dry_run,
            json,
        } => {
            let durable = open_registry(&cli)?;
            // A dry run never records completions in the durable registry
            let engine = if *dry_run {
                let scratch = MemoryRegistry::with_services_from(&*durable).await?;
                open_engine(&cli, Arc::new(scratch), Arc::new(LoopbackBackend::new())).await?
            } else {
                let process = Arc::new(ProcessBackend::new());
                for service in durable.list_services().await? {
                    process.register_service(&service).await;
                }
                open_engine(&cli, durable, process).await?
            };

            let mut request: ExecutionRequest = read_json(request)?;
            request.force_rerun |= *force_rerun;

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling");
                    on_signal.cancel();
                }
            });

            match engine.execute_with_cancel(&request, &cancel).await {
                Ok(report) => {
                    if *json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        print_report(&report);
                    }
                    Ok(())
                }
                Err(DispatchError::ChainFailed {
                    data_id,
                    service,
                    level,
                    reason,
                }) => bail!("{} failed at level {}: {}\n  retry target: {}", service, level, reason, data_id),
                Err(e) => Err(e.into()),
            }
        }
    }
}
