use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tokenguard::config::{KeyedConfig, LoggingConfig, TokenGuardConfig};
use tokenguard::error::TokenGuardError;
use tokenguard::ratelimit::{AdmissionControl, KeyedBuckets, TokenBucket};

/// Token bucket rate limiter demo.
#[derive(Parser, Debug)]
#[command(name = "tokenguard", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tokens added per second (overrides the configuration file)
    #[arg(long)]
    rate: Option<f64>,

    /// Bucket capacity (overrides the configuration file)
    #[arg(long)]
    capacity: Option<f64>,

    /// Log filter directive, e.g. "debug" or "tokenguard=trace"
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON formatted logs
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TokenGuardConfig::from_file(path)?,
        None => TokenGuardConfig::default(),
    };
    apply_overrides(&mut config, &args);

    init_tracing(&config.logging);

    info!("Starting tokenguard demo");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        rate = config.bucket.rate,
        capacity = config.bucket.capacity,
        "Configuration loaded"
    );

    let limiter = config.bucket.build()?;

    burst_demo(&limiter);
    wait_feedback_demo(&limiter);
    refill_demo(&limiter).await;
    variable_cost_demo(&limiter);
    blocking_wait_demo().await?;
    keyed_demo(&config.keyed)?;
    shared_acquire_demo().await?;

    info!("tokenguard demo finished");
    Ok(())
}

fn apply_overrides(config: &mut TokenGuardConfig, args: &Args) {
    if let Some(rate) = args.rate {
        config.bucket.rate = rate;
    }
    if let Some(capacity) = args.capacity {
        config.bucket.capacity = capacity;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json {
        config.logging.json = true;
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn verdict(allowed: bool) -> &'static str {
    if allowed {
        "ALLOW"
    } else {
        "DENY "
    }
}

/// Rapid requests against a full bucket.
fn burst_demo(limiter: &TokenBucket) {
    println!("-- Burst: rapid requests against full bucket --");
    let requests = limiter.capacity().ceil() as usize + 2;
    for i in 0..requests {
        let allowed = limiter.allow(1.0);
        let tokens = limiter.available_tokens();
        println!(
            "  Request {:2}: {} | tokens remaining: {:.2}",
            i + 1,
            verdict(allowed),
            tokens
        );
    }
}

fn wait_feedback_demo(limiter: &TokenBucket) {
    println!("\n-- try_consume: wait time feedback --");
    let outcome = limiter.try_consume(3.0);
    println!(
        "  try_consume(3): success={}, wait={:.2}s",
        outcome.is_granted(),
        outcome.wait_seconds()
    );
}

async fn refill_demo(limiter: &TokenBucket) {
    let pause = Duration::from_secs(2);
    println!(
        "\n-- Refill: sleep {}s, expect ~{:.0} new tokens --",
        pause.as_secs(),
        limiter.rate() * pause.as_secs_f64()
    );
    let before = limiter.available_tokens();
    tokio::time::sleep(pause).await;
    let after = limiter.available_tokens();
    println!(
        "  Tokens before: {:.2} | after {}s sleep: {:.2}",
        before,
        pause.as_secs(),
        after
    );
}

/// Expensive operations consume more tokens.
fn variable_cost_demo(limiter: &TokenBucket) {
    println!("\n-- Variable token cost --");
    limiter.reset();
    println!("  After reset, tokens: {:.2}", limiter.available_tokens());
    for _ in 0..3 {
        let allowed = limiter.allow(5.0);
        println!(
            "  allow(5): {} | tokens remaining: {:.2}",
            verdict(allowed),
            limiter.available_tokens()
        );
    }
}

/// Drain a small bucket, then wait for tokens. Ctrl+C abandons the wait.
async fn blocking_wait_demo() -> anyhow::Result<()> {
    println!("\n-- wait_and_consume: blocks until tokens available --");
    let limiter = TokenBucket::new(5.0, 5.0)?;
    if !limiter.allow(5.0) {
        warn!(
            available = limiter.available_tokens(),
            "Could not drain the bucket before waiting"
        );
    }
    println!("  Bucket drained. Waiting for 3 tokens...");

    match limiter.wait_and_consume_until(3.0, shutdown_signal()).await {
        Ok(waited) => println!(
            "  Consumed after waiting {:.2}s | tokens remaining: {:.2}",
            waited.as_secs_f64(),
            limiter.available_tokens()
        ),
        Err(TokenGuardError::Cancelled) => {
            println!("  Wait cancelled, no tokens consumed");
        }
        Err(e) => return Err(e.into()),
    }

    match limiter.wait_and_consume(limiter.capacity() + 1.0) {
        Err(TokenGuardError::UnsatisfiableRequest {
            requested,
            capacity,
        }) => println!(
            "  wait_and_consume({}) rejected immediately: capacity is {}",
            requested, capacity
        ),
        other => warn!(?other, "Oversized request was not rejected"),
    }
    Ok(())
}

/// Independent buckets per client.
fn keyed_demo(keyed: &KeyedConfig) -> anyhow::Result<()> {
    println!("\n-- Keyed buckets: one bucket per client --");
    let registry: KeyedBuckets<String> = keyed.build()?;
    let heavy = "heavy-client".to_string();
    let light = "light-client".to_string();

    let requests = keyed.template.capacity.ceil() as usize + 2;
    let heavy_allowed = (0..requests).filter(|_| registry.allow(&heavy, 1.0)).count();
    let light_allowed = (0..3).filter(|_| registry.allow(&light, 1.0)).count();

    println!("  {}: {}/{} allowed", heavy, heavy_allowed, requests);
    println!("  {}: {}/3 allowed", light, light_allowed);
    println!("  buckets tracked: {}", registry.len());
    Ok(())
}

/// Several tasks acquiring from one shared limiter.
async fn shared_acquire_demo() -> anyhow::Result<()> {
    println!("\n-- Shared limiter: concurrent async acquires --");
    let limiter: Arc<dyn AdmissionControl> =
        Arc::new(TokenBucket::with_initial_tokens(10.0, 2.0, 0.0)?);

    let waits = futures::future::join_all((0..4).map(|task| {
        let limiter = Arc::clone(&limiter);
        async move { (task, limiter.acquire(1.0).await) }
    }))
    .await;

    for (task, result) in waits {
        let waited = result?;
        println!("  task {}: admitted after {:.2}s", task, waited.as_secs_f64());
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, abandoning wait");
        }
        _ = terminate => {
            info!("Received SIGTERM, abandoning wait");
        }
    }
}
