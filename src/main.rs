use anyhow::Context;
use bulwark::config::{ConfigLoader, ConfigValidator, LogFormat, LoggingConfig, ResilienceConfig};
use bulwark::core::{CircuitBreakerConfigUpdate, CircuitBreakerRegistry, ConnectionPoolManager, ServiceRegistration};
use bulwark::monitor::ResourceUsageMonitor;
use bulwark::realtime::{
    subscription_callback, ChangeKind, EventFilter, InMemoryTransport, Priority, SubscriptionConfig,
    SubscriptionManager,
};
use bulwark::utils::{init_tracing, ResilienceError};
use clap::{Parser, Subcommand};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Client-side resilience layer: circuit breakers, bounded pools and realtime subscriptions")]
#[command(version)]
struct Cli {
    /// Log filter, e.g. `info` or `bulwark=debug`
    #[arg(long, global = true, default_value = "info", env = "BULWARK_LOG_LEVEL")]
    log_level: String,
    /// Log output format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a configuration file
    Validate {
        /// Path to a TOML configuration file
        file: String,
    },
    /// Print the configuration JSON Schema
    Schema {
        /// Write the schema to a file instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Run a scripted scenario against every component and print the resulting status
    Simulate {
        /// Configuration file (TOML, JSON or YAML)
        #[arg(short, long)]
        config: Option<String>,
        /// Recovery timeout used for the simulated "payments" service
        #[arg(long, default_value = "500")]
        recovery_ms: u64,
        /// Print resource usage in Prometheus text format as well
        #[arg(long)]
        prometheus: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&LoggingConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    })?;

    match cli.command {
        Command::Validate { file } => validate(&file).await,
        Command::Schema { output } => {
            let schema = ConfigValidator::new().export_schema();
            match output {
                Some(path) => {
                    let path = shellexpand::tilde(&path).to_string();
                    tokio::fs::write(&path, schema)
                        .await
                        .with_context(|| format!("failed to write schema to {}", path))?;
                    info!("Schema written to {}", path);
                }
                None => println!("{}", schema),
            }
            Ok(())
        }
        Command::Simulate {
            config,
            recovery_ms,
            prometheus,
        } => {
            let mut loader = ConfigLoader::new();
            if let Some(path) = &config {
                loader = loader.with_file(path);
            }
            let config = loader.load().context("failed to load configuration")?;
            simulate(&config, Duration::from_millis(recovery_ms), prometheus).await
        }
    }
}

async fn validate(file: &str) -> anyhow::Result<()> {
    match ConfigValidator::new().validate_file(file).await {
        Ok(()) => {
            println!("{}: configuration is valid", file);
            Ok(())
        }
        Err(errors) => {
            for e in &errors {
                error!("{}", e);
                eprintln!("  {}", e);
            }
            anyhow::bail!("{} validation error(s) in {}", errors.len(), file)
        }
    }
}

async fn simulate(config: &ResilienceConfig, recovery: Duration, prometheus: bool) -> anyhow::Result<()> {
    let monitor = Arc::new(ResourceUsageMonitor::new(config.monitor.monitor_config()));

    // Circuit breaker: three failures open "payments", the fallback covers the
    // open window, and a call after recovery closes it again.
    let registry = CircuitBreakerRegistry::from_settings(&config.circuit_breaker)?;
    registry.register(
        ServiceRegistration::new("payments")
            .overrides(CircuitBreakerConfigUpdate {
                failure_threshold: Some(3),
                recovery_timeout: Some(recovery),
                ..Default::default()
            })
            .fallback(|| async { Ok("queued for later".to_string()) })
            .health_check(|| async { Ok(true) }),
    )?;

    for attempt in 1..=3 {
        let result = registry
            .execute::<String, _, _>(
                "payments",
                || async move { Err(ResilienceError::operation(format!("gateway refused charge #{}", attempt))) },
                None,
            )
            .await?;
        info!("payments call {}: state={}, fallback_used={}", attempt, result.state, result.fallback_used);
    }
    let rejected = registry
        .execute::<String, _, _>("payments", || async { Ok("charged".to_string()) }, None)
        .await?;
    info!("payments while open: {:?} (state={})", rejected.data, rejected.state);

    tokio::time::sleep(recovery + Duration::from_millis(10)).await;
    let recovered = registry
        .execute::<String, _, _>("payments", || async { Ok("charged".to_string()) }, None)
        .await?;
    info!("payments after recovery: {:?} (state={})", recovered.data, recovered.state);

    // Pool: more work than slots, plus one flaky operation retried.
    let pool = ConnectionPoolManager::with_monitor(config.pool.pool_config(), monitor.clone())?;
    let burst = pool.config().max_connections + 2;
    let queries = (0..burst).map(|i| {
        let pool = pool.clone();
        async move {
            pool.execute_query(
                || async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, ResilienceError>(i)
                },
                Some("workouts.list"),
            )
            .await
        }
    });
    let completed = futures::future::join_all(queries)
        .await
        .into_iter()
        .filter(|r| r.is_ok())
        .count();
    info!("pool burst: {}/{} queries completed", completed, burst);

    let attempts = Arc::new(AtomicU32::new(0));
    let retried = pool
        .execute_with_retry(
            || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(ResilienceError::Connection("connection reset".to_string()))
                    } else {
                        Ok("profile")
                    }
                }
            },
            Some("profile.get"),
        )
        .await;
    info!(
        "retried query: ok={} after {} attempts",
        retried.is_ok(),
        attempts.load(Ordering::SeqCst)
    );

    // Realtime: shared and dedicated channels, then an inactive period.
    let transport = Arc::new(InMemoryTransport::new());
    let subscriptions =
        SubscriptionManager::with_monitor(transport.clone(), config.realtime.realtime_config(), monitor.clone())?;
    let noop = subscription_callback(|_| Ok(()));
    subscriptions
        .subscribe(
            SubscriptionConfig::new("leaderboard", "scores", noop.clone())
                .priority(Priority::High)
                .event(EventFilter::Update),
        )
        .await?;
    for id in ["feed-main", "feed-sidebar"] {
        subscriptions
            .subscribe(
                SubscriptionConfig::new(id, "activities", noop.clone())
                    .event(EventFilter::Insert)
                    .batchable(true),
            )
            .await?;
    }
    subscriptions
        .subscribe(SubscriptionConfig::new("badges", "achievements", noop).priority(Priority::Low))
        .await?;

    transport.publish("activities", ChangeKind::Insert, serde_json::json!({"id": 1}));
    transport.publish("scores", ChangeKind::Update, serde_json::json!({"id": 7}));
    subscriptions.set_inactive_mode().await;
    info!(
        "inactive: {} live subscriptions on {} channels",
        subscriptions.get_active_subscription_count(),
        transport.channel_count()
    );
    subscriptions.update_user_activity().await;

    let report = serde_json::json!({
        "circuit_breaker": registry.get_all_service_statuses(),
        "pool": pool.get_health_status(),
        "realtime": subscriptions.get_metrics(),
        "resource_usage": monitor.export_json(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if prometheus {
        println!("{}", monitor.export_prometheus());
    }

    subscriptions.destroy().await;
    pool.shutdown().await;
    registry.destroy().await;
    Ok(())
}
