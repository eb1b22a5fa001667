//! fusenet L2 coordinator daemon.
//!
//! Connects to the Redis bus, runs the configured fusion algorithm, and
//! offers a small interactive console (stats / nodes / reset / trigger /
//! quit) plus a periodic statistics printout.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use fusion_bus::RedisBus;
use fusion_core::{
    AlgorithmRegistry, FusionConfig, FusionManager, TargetTrackingAlgorithm,
};

#[derive(Debug, Parser)]
#[command(name = "fusenet-l2", about = "L2 sensor-fusion coordinator", version)]
struct Args {
    /// Redis connection URL
    #[arg(long, default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// Fusion algorithm to run
    #[arg(long, default_value = TargetTrackingAlgorithm::NAME)]
    algorithm: String,

    /// Algorithm update interval in milliseconds
    #[arg(long, default_value_t = 100)]
    update_interval: u64,

    /// Node timeout in seconds
    #[arg(long, default_value_t = 30)]
    node_timeout: u64,

    /// Number of worker tasks
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn print_banner(config: &FusionConfig, algorithm: &str) {
    println!("=== fusenet L2 configuration ===");
    println!("Bus URL:         {}", config.bus_url);
    println!("Algorithm:       {algorithm}");
    println!("Update interval: {} ms", config.algorithm_update_interval.as_millis());
    println!("Node timeout:    {} s", config.node_timeout.as_secs());
    println!("Workers:         {}", config.worker_threads);
    println!("Debug logging:   {}", if config.debug { "enabled" } else { "disabled" });
    println!("================================\n");
}

fn print_stats(manager: &FusionManager) {
    let stats = manager.stats();
    println!("\n=== system statistics ===");
    println!("Uptime:             {} s", stats.uptime.as_secs());
    println!("Messages processed: {}", stats.messages_processed);
    println!("Messages sent:      {}", stats.messages_sent);
    println!("Active nodes:       {}", stats.active_nodes);
    println!("Algorithm state:    {}", stats.current_algorithm_state);
    if stats.messages_processed > 0 && stats.uptime.as_secs() > 0 {
        let rate = stats.messages_processed as f64 / stats.uptime.as_secs_f64();
        println!("Processing rate:    {rate:.2} msg/s");
    }
    println!("=========================\n");
}

fn print_nodes(manager: &FusionManager) {
    let active = manager.registry().active(manager.config().node_timeout);
    println!("Active nodes ({}):", active.len());
    for node_id in active {
        if let Some(node) = manager.registry().get(&node_id) {
            println!("  {} ({}) at {}", node.node_id, node.node_type, node.location);
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = FusionConfig {
        bus_url: args.redis_url.clone(),
        node_timeout: Duration::from_secs(args.node_timeout),
        algorithm_update_interval: Duration::from_millis(args.update_interval),
        worker_threads: args.workers,
        debug: args.debug,
        ..FusionConfig::default()
    };

    print_banner(&config, &args.algorithm);

    let registry = AlgorithmRegistry::new();
    registry.register(|| Box::new(TargetTrackingAlgorithm::new()));

    let Some(algorithm) = registry.create(&args.algorithm) else {
        eprintln!("Error: unknown algorithm '{}'", args.algorithm);
        eprintln!("Available algorithms:");
        for name in registry.available() {
            eprintln!("  - {name}");
        }
        anyhow::bail!("unknown algorithm");
    };

    let bus = RedisBus::connect(&config.bus_url)
        .await
        .with_context(|| format!("connecting to bus at {}", config.bus_url))?;

    let manager = FusionManager::new(config, Arc::new(bus));
    manager
        .set_algorithm(algorithm)
        .context("installing algorithm")?;
    manager.start().await.context("starting fusion manager")?;

    println!("L2 system is running. Commands:");
    println!("  stats            show current statistics");
    println!("  nodes            list active nodes");
    println!("  reset            reset algorithm state");
    println!("  trigger <event>  fire an algorithm event");
    println!("  quit             shut down\n");

    // Periodic stats, the way operators watch a deployment.
    let stats_mgr = Arc::clone(&manager);
    let stats_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(10)).await;
            if !stats_mgr.is_running() {
                break;
            }
            print_stats(&stats_mgr);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nInterrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim();

                match line {
                    "" => {}
                    "quit" | "exit" => break,
                    "stats" => print_stats(&manager),
                    "nodes" => print_nodes(&manager),
                    "reset" => {
                        manager.trigger_algorithm_event("reset", None).await;
                        println!("Algorithm reset triggered");
                    }
                    _ => {
                        if let Some(event) = line.strip_prefix("trigger ") {
                            let event = event.trim();
                            if event.is_empty() {
                                println!("Usage: trigger <event>");
                            } else {
                                manager.trigger_algorithm_event(event, None).await;
                                println!("Triggered event: {event}");
                            }
                        } else {
                            println!("Unknown command. Type 'quit' to exit.");
                        }
                    }
                }
            }
        }
    }

    println!("Shutting down L2 system...");
    if let Err(e) = manager.stop().await {
        warn!(error = %e, "algorithm shutdown reported an error");
    }
    stats_task.abort();
    println!("L2 system stopped.");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // Help and version requests are clean exits; real argument
            // errors are not.
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    let filter = if args.debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}
