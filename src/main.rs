//! Autonomy Core - Entry Point
//!
//! Modes:
//! - Default: run the agent with its thinking loop until Ctrl-C
//! - --goal "<text>": plan and execute a single goal, print it as JSON

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use autonomy_core::{
    AutonomousAgent, Collaborators, Config, LlamaWorker, LlamaWorkerConfig, Priority, SqlitePersistence,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// How often one-shot mode checks on a goal that is running in the background
const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let goal = arg_value(&args, "--goal", "-g");
    let user = arg_value(&args, "--user", "-u").unwrap_or_else(|| "local".to_string());
    let priority = match arg_value(&args, "--priority", "-p") {
        Some(p) => Priority::parse(&p).with_context(|| format!("Unknown priority: {}", p))?,
        None => Priority::Medium,
    };

    let config = Config::from_env()?;
    init_logging(&config)?;

    info!("Autonomy Core v{}", env!("CARGO_PKG_VERSION"));

    let persistence = Arc::new(SqlitePersistence::open(&config.db_path)?);
    let llama = Arc::new(LlamaWorker::with_config(LlamaWorkerConfig::from(&config))?);
    if !llama.is_available().await {
        warn!("Ollama is not reachable at {}; planning will fall back to the default step", config.ollama_url);
    }

    let collaborators = Collaborators::new(llama.clone(), llama.clone(), persistence).with_suggestion_source(llama);
    let agent = AutonomousAgent::new(&config, collaborators);

    match goal {
        Some(description) => run_once(&agent, &user, &description, priority).await,
        None => run_daemon(&agent).await,
    }
}

async fn run_once(agent: &AutonomousAgent, user: &str, description: &str, priority: Priority) -> anyhow::Result<()> {
    let goal = agent.set_goal(user, description, priority).await?;
    info!("Executing goal {} ({} steps)", goal.id, goal.steps.len());

    if let Err(e) = agent.execute_goal(&goal.id).await {
        warn!("Goal {} did not complete: {}", goal.id, e);
    }

    // High-priority goals are already running in the background
    loop {
        let current = agent
            .get_goal(&goal.id)
            .await
            .with_context(|| format!("Goal {} disappeared", goal.id))?;
        if !current.status.is_active() {
            println!("{}", serde_json::to_string_pretty(&current)?);
            return Ok(());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn run_daemon(agent: &AutonomousAgent) -> anyhow::Result<()> {
    agent.start().await;
    info!("Thinking loop running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

    agent.shutdown().await;
    let stats = agent.get_memory_stats().await;
    info!("Final stats: {}", serde_json::to_string(&stats)?);
    Ok(())
}

fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.log_json {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Value following `--flag` / `-f`
fn arg_value(args: &[String], long: &str, short: &str) -> Option<String> {
    args.iter()
        .position(|a| a == long || a == short)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn print_help() {
    println!("Autonomy Core v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: autonomy-core [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --goal, -g <text>      Plan and execute one goal, then exit");
    println!("  --user, -u <id>        User owning the goal (default: local)");
    println!("  --priority, -p <p>     low | medium | high | critical (default: medium)");
    println!("  --help, -h             Show this help");
    println!();
    println!("Default: run the thinking loop until Ctrl-C");
    println!();
    println!("Environment variables:");
    println!("  AUTONOMY_DB_PATH                 SQLite state file");
    println!("  OLLAMA_URL                       Ollama endpoint (default: http://localhost:11434)");
    println!("  LLAMA_MODEL                      Model name (default: llama3.2:3b)");
    println!("  AUTONOMY_THINKING_INTERVAL_SECS  Thinking loop period (default: 30)");
    println!("  AUTONOMY_THINKING_ENABLED        Run the thinking loop (default: true)");
    println!("  AUTONOMY_AUTONOMOUS_EXECUTION    Let the loop start goals (default: true)");
    println!("  AUTONOMY_MAX_SUGGESTIONS         Suggestions kept per user (default: 10)");
    println!("  AUTONOMY_SUGGESTION_TTL_HOURS    Suggestion lifetime (default: 24)");
    println!("  AUTONOMY_STEP_MAX_RETRIES        Retries for transient step errors (default: 0)");
    println!("  AUTONOMY_STEP_RETRY_DELAY_MS     Initial retry backoff (default: 500)");
    println!("  AUTONOMY_STEP_TIMEOUT_SECS       Per-step timeout (default: none)");
    println!("  AUTONOMY_LOG_JSON                JSON logs on stderr (default: false)");
}
