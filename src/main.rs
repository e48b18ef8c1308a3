use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use stratlab::api::{self, ApiContext, ApiResult};
use stratlab::batch::JsonDirectoryProvider;
use stratlab::config::EngineRuntimeSettings;
use stratlab::data_context::MarketData;
use stratlab::optimizer_status::OptimizerStatus;

#[derive(Parser)]
#[command(name = "stratlab")]
#[command(about = "Backtest trading strategies and search for robust parameters and allocations")]
struct Cli {
    /// Write the JSON response (or, for export-snapshot, the snapshot) here
    #[arg(short, long, global = true, value_name = "PATH")]
    output: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one strategy over one price series
    Backtest {
        /// JSON request file
        request: PathBuf,
    },
    /// Run every catalog strategy over several tickers
    Batch {
        request: PathBuf,
        /// Directory of <TICKER>.json price files or a market data snapshot
        #[arg(long, value_name = "PATH")]
        data: PathBuf,
    },
    /// Exhaustive (or stride-sampled) parameter grid search
    GridSearch {
        request: PathBuf,
        /// Show a progress bar while combinations are evaluated
        #[arg(long)]
        progress: bool,
    },
    /// Rolling or anchored walk-forward validation
    WalkForward { request: PathBuf },
    /// Shuffle/bootstrap resampling of a trade list
    MonteCarlo { request: PathBuf },
    /// Allocate weights across backtested assets
    Portfolio { request: PathBuf },
    /// Print the strategy catalog
    Strategies,
    /// Build a market data snapshot (written to --output) from a directory of JSON price files
    ExportSnapshot {
        #[arg(long, value_name = "DIR")]
        input: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { mut output, command } = Cli::parse();
    let settings = EngineRuntimeSettings::from_env().context("Invalid runtime settings")?;
    let mut context = ApiContext::new(settings);

    let response = match command {
        Commands::Backtest { request } => {
            respond(read_request(&request), |req: api::BacktestRequest| {
                api::handle_backtest(&req)
            })
        }
        Commands::Batch { request, data } => {
            let body: ApiResult<api::BatchRequest> = read_request(&request);
            if data.is_dir() {
                let provider = JsonDirectoryProvider::new(&data);
                respond(body, |req| api::handle_batch(&context, &provider, &req))
            } else {
                let market = MarketData::load_from_file(&data, &OptimizerStatus::new())?;
                respond(body, |req| api::handle_batch(&context, &market, &req))
            }
        }
        Commands::GridSearch { request, progress } => {
            context.show_progress = progress;
            respond(read_request(&request), |req: api::GridSearchRequest| {
                api::handle_grid_search(&context, &req)
            })
        }
        Commands::WalkForward { request } => {
            respond(read_request(&request), |req: api::WalkForwardRequest| {
                api::handle_walk_forward(&context, &req)
            })
        }
        Commands::MonteCarlo { request } => {
            respond(read_request(&request), |req: api::MonteCarloRequest| {
                api::handle_monte_carlo(&context, &req)
            })
        }
        Commands::Portfolio { request } => {
            respond(read_request(&request), |req: api::PortfolioRequest| {
                api::handle_portfolio(&req)
            })
        }
        Commands::Strategies => api::envelope(Ok(api::list_strategies())),
        Commands::ExportSnapshot { input } => {
            let snapshot = output
                .take()
                .context("export-snapshot requires --output <PATH>")?;
            let market = MarketData::load_json_directory(&input)?;
            market.save_to_file(&snapshot)?;
            info!(
                "Wrote snapshot of {} ticker(s) to {}",
                market.tickers().len(),
                snapshot.display()
            );
            api::envelope(Ok(serde_json::json!({
                "tickers": market.tickers(),
                "path": snapshot.display().to_string(),
            })))
        }
    };

    write_response(&response, output.as_deref())?;
    let ok = response.get("ok").and_then(Value::as_bool).unwrap_or(false);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn read_request<T: DeserializeOwned>(path: &Path) -> ApiResult<T> {
    let body = fs::read_to_string(path).map_err(|err| {
        api::ApiError::validation(format!("Cannot read request {}: {}", path.display(), err))
    })?;
    api::decode_request(&body)
}

fn respond<T, R, F>(request: ApiResult<T>, handler: F) -> Value
where
    R: serde::Serialize,
    F: FnOnce(T) -> ApiResult<R>,
{
    api::envelope(request.and_then(handler))
}

fn write_response(response: &Value, output: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(response).context("Failed to encode response")?;
    match output {
        Some(path) => fs::write(path, text)
            .with_context(|| format!("Failed to write response to {}", path.display())),
        None => {
            println!("{}", text);
            Ok(())
        }
    }
}
