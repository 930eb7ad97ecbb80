mod config;

use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Table};
use config::CourierConfig;
use courier_broker::MemoryBroker;
use courier_core::Channel;
use courier_rpc::{AsyncRpcClient, FibonacciService, RpcServer};
use courier_worker::{DispatchPolicy, Dispatcher, Pacing, SleepHandler};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Correlated RPC and fair task dispatch over an in-process broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long)]
    config: Option<String>,

    /// Output format (json, table)
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Dump broker metrics in Prometheus text format when done
    #[arg(long)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call the Fibonacci service for 0..calls
    Rpc {
        /// Number of calls
        #[arg(long, default_value = "32")]
        calls: u64,

        /// Per-call timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Server consumers
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Spread tasks over workers of different speeds
    WorkQueue {
        /// Dispatch policy
        #[arg(short, long, value_enum)]
        policy: Option<PolicyArg>,

        /// Number of tasks to publish
        #[arg(short, long, default_value = "50")]
        tasks: u64,

        /// Simulated cost of one task per worker, in milliseconds
        #[arg(long, value_delimiter = ',', default_value = "1000,3000,5000")]
        costs_ms: Vec<u64>,

        /// Publish delay step; task i waits i times this long
        #[arg(long, default_value = "2")]
        pacing_ms: u64,
    },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    RoundRobin,
    FairShare,
}

impl From<PolicyArg> for DispatchPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::RoundRobin => DispatchPolicy::RoundRobin,
            PolicyArg::FairShare => DispatchPolicy::fair_share(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let mut config = CourierConfig::load(args.config.as_deref())?;
    let broker = MemoryBroker::new(config.broker.clone())?;
    let channel: Arc<dyn Channel> = Arc::new(broker.clone());

    match args.command {
        Commands::Rpc {
            calls,
            timeout_ms,
            concurrency,
        } => {
            if let Some(timeout_ms) = timeout_ms {
                config.rpc_client.default_timeout_ms = timeout_ms;
            }
            if let Some(concurrency) = concurrency {
                config.rpc_server.concurrency = concurrency;
            }
            run_rpc(&config, channel, calls, &args.format).await?;
        }

        Commands::WorkQueue {
            policy,
            tasks,
            costs_ms,
            pacing_ms,
        } => {
            if let Some(policy) = policy {
                config.dispatch.policy = policy.into();
            }
            let pacing = if pacing_ms > 0 {
                Pacing::Linear(Duration::from_millis(pacing_ms))
            } else {
                Pacing::Immediate
            };
            run_work_queue(&config, channel, tasks, &costs_ms, pacing, &args.format).await?;
        }

        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    if args.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&broker.metrics().registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8(buffer)?);
    }

    broker.close();
    Ok(())
}

async fn run_rpc(
    config: &CourierConfig,
    channel: Arc<dyn Channel>,
    calls: u64,
    format: &str,
) -> anyhow::Result<()> {
    channel.declare_queue(&config.rpc_server.request_queue).await?;

    let server = RpcServer::new(
        channel.clone(),
        config.rpc_server.clone(),
        Arc::new(FibonacciService),
    );
    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move { server.run(server_shutdown).await });

    let client = AsyncRpcClient::new(channel, config.rpc_client.request_queue.as_str());
    let timeout = config.rpc_client.default_timeout();
    let mut results = Vec::new();

    for n in 0..calls {
        info!("Requesting fib({})", n);
        let started = Instant::now();
        let outcome = match client.call(n.to_string(), timeout).await {
            Ok(reply) => String::from_utf8_lossy(&reply).into_owned(),
            Err(e) => {
                warn!("fib({}) failed: {}", n, e);
                format!("error: {}", e)
            }
        };
        info!("Got {}", outcome);
        results.push((n, outcome, started.elapsed()));
    }

    client.close().await?;
    shutdown.cancel();
    server_handle.await??;

    match format {
        "json" => {
            let rows: Vec<_> = results
                .iter()
                .map(|(n, reply, elapsed)| {
                    serde_json::json!({
                        "n": n,
                        "reply": reply,
                        "elapsed_us": elapsed.as_micros() as u64,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        _ => {
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["n", "fib(n)", "Round trip"]);
            for (n, reply, elapsed) in &results {
                table.add_row(vec![n.to_string(), reply.clone(), format!("{:?}", elapsed)]);
            }
            println!("{}", table);
        }
    }

    Ok(())
}

async fn run_work_queue(
    config: &CourierConfig,
    channel: Arc<dyn Channel>,
    tasks: u64,
    costs_ms: &[u64],
    pacing: Pacing,
    format: &str,
) -> anyhow::Result<()> {
    if costs_ms.is_empty() {
        anyhow::bail!("at least one worker cost is required");
    }

    let mut dispatcher = Dispatcher::new(channel, config.dispatch.clone()).await?;
    let mut completions = dispatcher.completions();

    let mut costs = HashMap::new();
    for (i, cost) in costs_ms.iter().enumerate() {
        let name = format!("worker-{}", i + 1);
        dispatcher
            .spawn_worker(name.clone(), Arc::new(SleepHandler::from_millis(*cost)))
            .await?;
        costs.insert(name, *cost);
    }

    let producer = dispatcher.producer();
    let publisher = tokio::spawn(async move {
        producer
            .publish_batch(tasks, |i| format!("task..{}", i).into_bytes(), pacing)
            .await
    });

    let started = Instant::now();
    let mut done = 0;
    while done < tasks {
        tokio::select! {
            completion = completions.recv() => match completion {
                Some(completion) => {
                    done += 1;
                    info!(
                        "{} finished task {:?} [{}/{}]",
                        completion.worker, completion.sequence, done, tasks
                    );
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    publisher.abort();
    let elapsed = started.elapsed();
    let policy = dispatcher.config().policy;
    let report = dispatcher.shutdown().await;

    match format {
        "json" => {
            let rows: Vec<_> = report
                .workers
                .iter()
                .map(|w| {
                    serde_json::json!({
                        "worker": w.name,
                        "cost_ms": costs.get(&w.name),
                        "processed": w.processed,
                        "failed": w.failed,
                        "share": report.share(&w.name),
                    })
                })
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "policy": policy.to_string(),
                    "elapsed_ms": elapsed.as_millis() as u64,
                    "workers": rows,
                }))?
            );
        }
        _ => {
            println!("Policy: {} ({} tasks in {:?})", policy, done, elapsed);
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(vec!["Worker", "Cost", "Processed", "Failed", "Share"]);
            for w in &report.workers {
                table.add_row(vec![
                    w.name.clone(),
                    costs
                        .get(&w.name)
                        .map(|c| format!("{}ms", c))
                        .unwrap_or_default(),
                    w.processed.to_string(),
                    w.failed.to_string(),
                    format!("{:.0}%", report.share(&w.name) * 100.0),
                ]);
            }
            println!("{}", table);
        }
    }

    Ok(())
}
