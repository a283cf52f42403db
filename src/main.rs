use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bucketgate::config::BucketgateConfig;
use bucketgate::ratelimit::RateLimiterService;
use bucketgate::store;
use bucketgate::violation::LogViolationReporter;

/// Token bucket admission control against a shared bucket store.
#[derive(Debug, Parser)]
#[command(name = "bucketgate", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "bucketgate.yaml")]
    config: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run admission checks and print each decision as JSON
    Check {
        #[command(flatten)]
        bucket: BucketArgs,

        /// Tokens to consume (defaults to the rule's cost)
        #[arg(long)]
        cost: Option<u32>,

        /// Number of consecutive checks to run
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
    /// Print the stored state of a bucket
    Inspect {
        #[command(flatten)]
        bucket: BucketArgs,
    },
    /// Refill a bucket to capacity
    Reset {
        #[command(flatten)]
        bucket: BucketArgs,
    },
    /// List the configured rules
    Rules,
    /// Check that the bucket store is reachable
    Ping,
}

#[derive(Debug, Args)]
struct BucketArgs {
    /// Scope type (ip, user, endpoint, provider, provider_user, ...)
    #[arg(long)]
    scope_type: String,

    /// Scope identifier
    #[arg(long)]
    scope_value: String,

    /// Rule name
    #[arg(long)]
    rule: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = BucketgateConfig::from_file(&cli.config)?;
    info!(
        backend = ?config.store.backend,
        rules = config.rules.len(),
        "Configuration loaded"
    );

    let store = store::connect(&config.store).await?;
    let service = RateLimiterService::new(config.rules, store)
        .with_reporter(Arc::new(LogViolationReporter))
        .with_timeout(config.store.timeout());

    match cli.command {
        Command::Check {
            bucket,
            cost,
            repeat,
        } => {
            for _ in 0..repeat {
                let decision = service
                    .check(&bucket.scope_type, &bucket.scope_value, &bucket.rule, cost)
                    .await?;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
        Command::Inspect { bucket } => {
            let state = service
                .inspect(&bucket.scope_type, &bucket.scope_value, &bucket.rule)
                .await?;
            println!("{}", serde_json::to_string(&state)?);
        }
        Command::Reset { bucket } => {
            service
                .reset(&bucket.scope_type, &bucket.scope_value, &bucket.rule)
                .await?;
            info!(rule = %bucket.rule, "Bucket reset");
        }
        Command::Rules => {
            for (name, rule) in service.rules().iter() {
                println!(
                    "{}",
                    serde_json::json!({
                        "name": name,
                        "max_tokens": rule.max_tokens,
                        "refill_rate": rule.refill_rate,
                        "cost": rule.cost,
                    })
                );
            }
        }
        Command::Ping => {
            service.health_check().await?;
            println!("PONG");
        }
    }

    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info` filter.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
