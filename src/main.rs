//! Agent trading lab CLI.
//!
//! A thin entry point: wire the tracing subscriber, load `Config::from_env()`, build a
//! `Runtime`, and run one of a handful of demo/inspection subcommands. The actual
//! coordination fabric (`trading_lab::acf`) and backtest engine (`trading_lab::bte`) are
//! library surfaces meant to be embedded by a host application; this binary exists to
//! exercise them end-to-end, the way the teacher's `bin/` tools exercise its own
//! subsystems from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use trading_lab::bte::indicators::{rsi, sma};
use trading_lab::{Config, Runtime};

#[derive(Parser, Debug)]
#[command(name = "trading-lab")]
#[command(about = "Agent coordination fabric + backtesting engine demo CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a Runtime and print what got wired (metrics namespace, default tools, rules).
    Inspect,

    /// List the MCP tools registered on a fresh Runtime.
    Tools,

    /// Run a synthetic SMA/RSI pass over a generated close-price series.
    Indicators {
        /// Number of synthetic bars to generate.
        #[arg(long, default_value_t = 120)]
        bars: usize,
        #[arg(long, default_value_t = 20)]
        sma_period: usize,
        #[arg(long, default_value_t = 14)]
        rsi_period: usize,
    },
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env();
    let runtime = Runtime::new(config);

    match cli.command {
        Commands::Inspect => {
            info!(namespace = %runtime.config.metrics_namespace, "runtime wired");
            println!("metrics namespace : {}", runtime.config.metrics_namespace);
            println!("broker queue cap  : {}", runtime.config.broker_max_queue_size);
            println!("tracer sample rate: {}", runtime.config.tracer_sample_rate);
            println!("tools registered  : {}", runtime.tools.list(None, None, false).len());
            println!("default alert rules: {}", runtime.config.alert_default_rules);
        }
        Commands::Tools => {
            for tool in runtime.tools.list(None, None, false) {
                println!("{:<20} [{}] {}", tool.name, tool.category, tool.description);
            }
        }
        Commands::Indicators { bars, sma_period, rsi_period } => {
            let closes: Vec<f64> = (0..bars).map(|i| 100.0 + (i as f64 * 0.1).sin() * 5.0 + i as f64 * 0.02).collect();
            let sma_out = sma(&closes, sma_period);
            let rsi_out = rsi(&closes, rsi_period);
            info!(bars, sma_period, rsi_period, "computed synthetic indicator pass");
            println!("last SMA: {:?}", sma_out.last());
            println!("last RSI: {:?}", rsi_out.last());
        }
    }

    Ok(())
}
