use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use riskguard::api::DexScreenerPriceSource;
use riskguard::execution::{
    ExecutionAction, Executor, ExitRuleEngine, OpenRequest, PaperOrderSink, PositionMonitor,
};
use riskguard::persistence::StateFiles;
use riskguard::risk::AccountRiskGuard;
use riskguard::{Config, EventBus, MonitorEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "riskguard", about = "Position risk and exit engine")]
struct Cli {
    /// Path to a TOML config file (env overrides use RISKGUARD__SECTION__KEY)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor persisted positions until Ctrl+C
    Run,
    /// Validate the configuration and print the resolved values
    CheckConfig,
    /// Admit a filled buy as a monitored position
    Open {
        /// Token mint address
        #[arg(long)]
        token: String,
        #[arg(long)]
        symbol: String,
        /// Fill price, in SOL per token
        #[arg(long)]
        entry_price: f64,
        /// Token amount in its smallest unit
        #[arg(long)]
        quantity: u64,
        /// Lamports spent on the buy
        #[arg(long)]
        cost_basis: u64,
        #[arg(long)]
        pattern: Option<String>,
    },
    /// Print the account risk metrics from the saved snapshot
    Status,
    /// Clear the emergency stop in the saved account snapshot
    ResetEmergencyStop,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Invalid configuration")?;

    match cli.command {
        Commands::Run => run(config).await,
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Open {
            token,
            symbol,
            entry_price,
            quantity,
            cost_basis,
            pattern,
        } => {
            let request = OpenRequest {
                token_address: token,
                token_symbol: symbol,
                entry_price,
                quantity,
                cost_basis,
                pattern_tag: pattern,
                current_price: None,
            };
            open(config, request).await
        }
        Commands::Status => {
            let (monitor, _) = build_monitor(&config).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&monitor.guard().metrics().await)?
            );
            Ok(())
        }
        Commands::ResetEmergencyStop => {
            let (monitor, _) = build_monitor(&config).await?;
            monitor.guard().reset_emergency_stop().await;
            monitor.persist_account().await;
            Ok(())
        }
    }
}

fn setup_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("riskguard=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wire the guard, rule engine and monitor from config and saved state
async fn build_monitor(config: &Config) -> Result<(PositionMonitor, EventBus)> {
    let events = EventBus::default();
    let state_files = StateFiles::from_config(&config.persistence);

    let snapshot = match &state_files {
        Some(files) => files.account.load().await?,
        None => None,
    };
    let guard = match snapshot {
        Some(snapshot) => AccountRiskGuard::hydrate(config.risk.clone(), events.clone(), snapshot)?,
        None => AccountRiskGuard::new(config.risk.clone(), events.clone())?,
    };

    let engine = ExitRuleEngine::new(config.exit_rules.clone(), config.patterns.clone())?;
    let prices = DexScreenerPriceSource::new()?;

    let monitor = PositionMonitor::new(
        config.monitor.clone(),
        engine,
        Arc::new(guard),
        Arc::new(prices),
        Arc::new(PaperOrderSink),
        events.clone(),
        state_files,
    )?;
    monitor.restore_from_disk().await?;

    Ok((monitor, events))
}

async fn open(config: Config, request: OpenRequest) -> Result<()> {
    let (monitor, _) = build_monitor(&config).await?;
    let executor = Executor::new(monitor);

    let decision = executor.open_position(request).await?;
    match decision.action {
        ExecutionAction::Opened { position_id } => {
            tracing::info!(%position_id, "{}", decision.reason);
            executor.monitor().persist_account().await;
        }
        ExecutionAction::Skip => tracing::warn!("Skipped: {}", decision.reason),
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    tracing::info!("Risk engine starting");

    let (monitor, events) = build_monitor(&config).await?;

    tracing::info!("Configuration:");
    tracing::info!("  Max positions: {}", config.risk.max_positions);
    tracing::info!("  Max daily loss: {}%", config.risk.max_daily_loss_percent);
    tracing::info!("  Max drawdown: {}%", config.risk.max_drawdown_percent);
    tracing::info!(
        "  Emergency stop: {}%",
        config.risk.emergency_stop_threshold_percent
    );
    tracing::info!("  Pattern overrides: {}", config.patterns.len());
    tracing::info!("  Open positions: {}", monitor.positions().await.len());

    let event_task = tokio::spawn(event_log_loop(events));
    let health_task = {
        let monitor = monitor.clone();
        let period = Duration::from_secs(config.monitor.health_check_secs);
        tokio::spawn(health_check_loop(monitor, period))
    };

    monitor.start().await;

    tracing::info!("Press Ctrl+C to stop...");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        result = health_task => {
            tracing::error!("Health check loop exited: {:?}", result);
        }
    }

    monitor.stop().await;
    monitor.persist_account().await;
    event_task.abort();

    tracing::info!("Risk engine stopped");
    Ok(())
}

async fn health_check_loop(monitor: PositionMonitor, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let report = monitor.guard().check_performance_metrics().await;
        let metrics = monitor.guard().metrics().await;
        match serde_json::to_string(&metrics) {
            Ok(json) => tracing::info!(
                drawdown = report.drawdown_percent,
                daily_loss = report.daily_loss_percent,
                "Health check: {}",
                json
            ),
            Err(e) => tracing::warn!("Failed to encode metrics: {}", e),
        }
        monitor.persist_account().await;
    }
}

async fn event_log_loop(events: EventBus) {
    let mut rx = events.subscribe();

    loop {
        match rx.recv().await {
            Ok(MonitorEvent::PositionClosed {
                position,
                reason,
                pnl,
            }) => {
                tracing::info!(
                    position_id = %position.id,
                    token = %position.token_symbol,
                    pnl,
                    "Closed: {}",
                    reason
                );
            }
            Ok(MonitorEvent::CircuitBreaker { reason }) => {
                tracing::warn!("Circuit breaker tripped: {}", reason);
            }
            Ok(MonitorEvent::EmergencyStop { reason }) => {
                tracing::error!("EMERGENCY STOP: {}", reason);
            }
            // Alerts are logged when raised; adds/removes log at the source
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event log fell behind, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}
