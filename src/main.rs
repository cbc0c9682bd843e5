use std::path::PathBuf;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{DropTally, ModeName, RateLimiter, RuleDefinition};

/// Run a series of rate limit decisions for one identity.
#[derive(Parser, Debug)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// YAML configuration with limiter settings and rules
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rule to evaluate
    #[arg(short, long, default_value = "login")]
    rule: String,

    /// Identity as JSON; anything that is not valid JSON is used as a string
    #[arg(short, long, default_value = r#"{"ip":"127.0.0.1"}"#)]
    identity: String,

    /// Number of events to send
    #[arg(short = 'n', long, default_value_t = 10)]
    drops: u32,

    /// Only check the limit, never record usage
    #[arg(long)]
    check: bool,

    /// Commit usage of denied events
    #[arg(long)]
    overflow: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => default_config(),
    };
    if args.overflow {
        config.limiter.overflow = true;
    }

    let identity: serde_json::Value = serde_json::from_str(&args.identity)
        .unwrap_or_else(|_| serde_json::Value::String(args.identity.clone()));

    let limiter = RateLimiter::with_memory_store(&config)?;

    info!(
        rule = %args.rule,
        identity = %identity,
        drops = args.drops,
        check_only = args.check,
        options = ?limiter.options(),
        "Starting"
    );

    let mut tally = DropTally::default();
    for attempt in 1..=args.drops {
        let outcome = if args.check {
            limiter.check_limited(&args.rule, &identity, None).await
        } else {
            limiter.drop(&args.rule, &identity, None).await
        };

        match &outcome {
            Ok(decision) => info!(
                attempt = attempt,
                next = %decision.next,
                expiration_ms = decision.expiration.as_millis() as u64,
                info = ?decision.info,
                "Allowed"
            ),
            Err(err) if err.is_rejected() => warn!(attempt = attempt, info = ?err.info(), "Rejected"),
            Err(_) => {}
        }
        tally.record(outcome)?;
    }

    println!("{} allowed, {} rejected", tally.allowed, tally.rejected);

    limiter.shutdown().await?;
    let remaining = limiter.memory_store().map_or(0, |store| store.len());
    info!(remaining_states = remaining, "Stopped");
    Ok(())
}

/// A single `login` rule of 5 events per minute.
fn default_config() -> TollgateConfig {
    let mut config = TollgateConfig::default();
    config.rules.insert(
        "login".to_string(),
        RuleDefinition {
            max: 5,
            interval_ms: 60_000,
            mode: ModeName::Continuous,
        },
    );
    config
}
