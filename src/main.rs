use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use selector_memory::config::MemoryConfig;
use selector_memory::context::SystemContext;
use selector_memory::normalizer::normalize_intent;
use selector_memory::telemetry;

#[derive(Parser)]
#[command(name = "selector-memory")]
#[command(about = "Self-learning selector cache with resilience infrastructure", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cache, breaker, and validator statistics
    Stats,

    /// Run one cache cleanup pass and report what was removed
    Cleanup,

    /// Aggregated component health report
    Health,

    /// Attempt coordinated recovery (breaker probe, storage check)
    Recover,

    /// Manually reset the circuit breaker
    ResetBreaker,

    /// Migrate rows from a legacy single-table cache layout
    Migrate,

    /// Manage the scenario library
    Scenarios {
        #[command(subcommand)]
        command: ScenarioCommands,
    },

    /// Normalize an intent and print the canonical form
    Normalize {
        /// Intent text to canonicalize
        input: String,
    },

    /// In-process micro-benchmark of the normalizer and lookup path
    Bench {
        /// Iterations per benchmark
        #[arg(short, long, default_value = "1000")]
        iterations: u64,
    },
}

#[derive(Subcommand)]
enum ScenarioCommands {
    /// List stored scenarios
    List,

    /// Export a scenario as YAML to stdout
    Export { name: String },

    /// Import a scenario from a YAML file
    Import { file: String },

    /// Delete a scenario by name
    Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let config = MemoryConfig::from_env();
    let ctx = SystemContext::initialize(config).await?;

    let result = run(&ctx, cli.command).await;
    ctx.shutdown().await;
    result
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "selector_memory=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(ctx: &SystemContext, command: Commands) -> Result<()> {
    match command {
        Commands::Stats => {
            let stats = ctx.cache.stats().await?;
            let breaker = ctx.breaker.snapshot();
            let validator = ctx.validator.metrics();
            println!("{}", serde_json::to_string_pretty(&stats)?);
            println!("{}", serde_json::to_string_pretty(&breaker)?);
            println!("{}", serde_json::to_string_pretty(&validator)?);
        }
        Commands::Cleanup => {
            let report = ctx.cache.cleanup_pass().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Health => {
            let report = ctx.run_health_check().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Recover => {
            let report = ctx.attempt_recovery().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ResetBreaker => {
            ctx.breaker.reset();
            info!("circuit breaker reset");
        }
        Commands::Migrate => {
            let report = ctx.store.migrate_legacy().await?;
            if report.legacy_table_found {
                println!(
                    "migrated {} selectors, {} snapshots",
                    report.selectors_migrated, report.snapshots_migrated
                );
            } else {
                println!("no legacy cache table found");
            }
        }
        Commands::Scenarios { command } => run_scenarios(ctx, command).await?,
        Commands::Normalize { input } => {
            let intent = normalize_intent(&input);
            println!("{}", serde_json::to_string_pretty(&intent)?);
        }
        Commands::Bench { iterations } => {
            let normalize_report = telemetry::benchmark("normalize", iterations, || {
                let _ = normalize_intent("Click the Add Todo button");
            });
            println!("{}", serde_json::to_string_pretty(&normalize_report)?);

            ctx.cache
                .set("add todo", "http://localhost:3000/", "button#add")
                .await?;
            let start = std::time::Instant::now();
            for _ in 0..iterations {
                ctx.cache.get("add todo", "http://localhost:3000/").await?;
            }
            let elapsed = start.elapsed();
            let lookup_report = telemetry::BenchmarkReport {
                name: "cache_lookup".to_string(),
                iterations,
                total_ms: elapsed.as_millis() as u64,
                avg_micros: if iterations == 0 {
                    0.0
                } else {
                    elapsed.as_micros() as f64 / iterations as f64
                },
            };
            println!("{}", serde_json::to_string_pretty(&lookup_report)?);
        }
    }
    Ok(())
}

async fn run_scenarios(ctx: &SystemContext, command: ScenarioCommands) -> Result<()> {
    match command {
        ScenarioCommands::List => {
            for scenario in ctx.scenarios.list().await? {
                println!(
                    "{}  steps={}  runs={}  success={:.2}  [{}]",
                    scenario.name,
                    scenario.steps.len(),
                    scenario.total_runs,
                    scenario.success_rate,
                    scenario.tags.join(",")
                );
            }
        }
        ScenarioCommands::Export { name } => {
            println!("{}", ctx.scenarios.export_yaml(&name).await?);
        }
        ScenarioCommands::Import { file } => {
            let yaml = std::fs::read_to_string(&file)?;
            let scenario = ctx.scenarios.import_yaml(&yaml).await?;
            info!(name = %scenario.name, "scenario imported");
        }
        ScenarioCommands::Delete { name } => {
            if ctx.scenarios.delete(&name).await? {
                info!(name = %name, "scenario deleted");
            } else {
                println!("no scenario named '{}'", name);
            }
        }
    }
    Ok(())
}
