mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;
use tracing_subscriber::EnvFilter;

use commands::optimize::{CheckConstraintsArgs, OptimizeArgs};
use commands::risk::RiskMetricsArgs;
use commands::simulation::{PriceOptionArgs, SimulateArgs, StressTestArgs};
use commands::statistics::StatisticsArgs;

/// Portfolio simulation, optimization and risk analytics
#[derive(Parser)]
#[command(
    name = "qpe",
    version,
    about = "Portfolio simulation, optimization and risk analytics",
    long_about = "A CLI for the quantitative portfolio engine. Builds market statistics \
                  from return histories, simulates correlated portfolio paths, computes \
                  VaR/CVaR and drawdown, and optimizes weights under position, sector, \
                  ESG and turnover constraints."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,

    /// Engine config file (JSON or YAML)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log filter when RUST_LOG is unset (e.g. "info", "quant_engine_core=debug")
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Annualised returns, volatilities and conditioned covariance
    Statistics(StatisticsArgs),
    /// Simulate portfolio value paths
    Simulate(SimulateArgs),
    /// VaR, CVaR, drawdown and Sharpe for a return sample or weighted assets
    RiskMetrics(RiskMetricsArgs),
    /// Check weights against a constraint set
    CheckConstraints(CheckConstraintsArgs),
    /// Optimize portfolio weights
    Optimize(OptimizeArgs),
    /// Price a European option by Monte Carlo against Black-Scholes
    PriceOption(PriceOptionArgs),
    /// Re-run a simulation under stressed volatility and correlation
    StressTest(StressTestArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let engine = match input::config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(2);
        }
    };

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Statistics(args) => commands::statistics::run_statistics(args),
        Commands::Simulate(args) => commands::simulation::run_simulate_command(args, &engine),
        Commands::RiskMetrics(args) => commands::risk::run_risk_metrics_command(args, &engine),
        Commands::CheckConstraints(args) => commands::optimize::run_check_constraints_command(args),
        Commands::Optimize(args) => commands::optimize::run_optimize_command(args, &engine),
        Commands::PriceOption(args) => {
            commands::simulation::run_price_option_command(args, &engine)
        }
        Commands::StressTest(args) => commands::simulation::run_stress_test_command(args, &engine),
        Commands::Version => {
            println!("qpe {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
