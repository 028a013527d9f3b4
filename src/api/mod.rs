use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, bail};
use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::coordinator::{
    BatchEvent, BatchEventCallback, CoordinatorConfig, DEFAULT_BATCH_SIZE, SimulationJob,
    WorkerCoordinator,
};
use crate::core::{
    Scenario, SimulationResult, StressCatalog, StressScenario, StressTestResult, YearlyProjection,
    aggregate_trials, attach_bands, generate_projections, run_simulation, run_simulation_async,
    run_stress_suite, run_stress_test,
};

pub const DEFAULT_TRIALS: usize = 5_000;
const MAX_API_TRIALS: usize = 100_000;

#[derive(Parser, Debug)]
#[command(
    name = "wealthcast",
    about = "Cash-flow projection, Monte Carlo simulation and stress testing for financial plans"
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level used when RUST_LOG is not set"
    )]
    pub log_level: String,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deterministic year-by-year projection.
    Project(ProjectArgs),
    /// Monte Carlo simulation, optionally spread over worker threads.
    Simulate(SimulateArgs),
    /// Run one or every stress scenario against a base plan.
    Stress(StressArgs),
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Args, Debug)]
pub struct ProjectArgs {
    #[arg(long, help = "Scenario JSON file")]
    scenario: PathBuf,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    #[arg(long, help = "Scenario JSON file")]
    scenario: PathBuf,
    #[arg(long, default_value_t = DEFAULT_TRIALS)]
    trials: usize,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(
        long,
        default_value_t = 0,
        help = "Worker threads to spread batches over; 0 runs in-process"
    )]
    workers: usize,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

#[derive(Args, Debug)]
pub struct StressArgs {
    #[arg(long, help = "Scenario JSON file")]
    scenario: PathBuf,
    #[arg(long, help = "Stress catalog JSON file; defaults to the built-in catalog")]
    catalog: Option<PathBuf>,
    #[arg(long, help = "Run only this stress scenario")]
    id: Option<String>,
    #[arg(long, default_value_t = 1_000)]
    trials: usize,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SimulateRequest {
    scenario: Scenario,
    #[serde(default)]
    trials: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StressRequest {
    scenario: Scenario,
    #[serde(default)]
    stress_id: Option<String>,
    #[serde(default)]
    stress: Option<StressScenario>,
    #[serde(default)]
    trials: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimulateResponse {
    result: SimulationResult,
    projections: Vec<YearlyProjection>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Project(args) => {
            let scenario = load_scenario(&args.scenario)?;
            print_json(&generate_projections(&scenario))
        }
        Command::Simulate(args) => {
            let response = simulate_from_cli(args).await?;
            print_json(&response)
        }
        Command::Stress(args) => {
            let results = stress_from_cli(args)?;
            print_json(&results)
        }
        Command::Serve { port } => {
            run_http_server(port).await?;
            Ok(())
        }
    }
}

async fn simulate_from_cli(args: SimulateArgs) -> anyhow::Result<SimulateResponse> {
    if args.trials == 0 {
        bail!("--trials must be > 0");
    }
    let scenario = load_scenario(&args.scenario)?;

    let result = if args.workers > 0 {
        let config = CoordinatorConfig {
            max_concurrency: args.workers,
            batch_size: args.batch_size,
            ..CoordinatorConfig::default()
        };
        let mut coordinator = WorkerCoordinator::new(config);
        coordinator.start().await?;

        let mut job = SimulationJob::for_scenario(scenario.clone(), args.trials)
            .with_batch_size(args.batch_size);
        if let Some(seed) = args.seed {
            job = job.with_seed(seed);
        }
        let report: BatchEventCallback = std::sync::Arc::new(|event: BatchEvent| match event {
            BatchEvent::Progress(p) => {
                debug!(batch_id = p.batch_id, progress = p.progress, "batch progress");
            }
            BatchEvent::Failed(e) => warn!(batch_id = e.batch_id, error = %e.message, "batch failed"),
        });

        let started = Instant::now();
        let trials = coordinator.run_simulation(&job, Some(report)).await;
        coordinator.destroy();
        aggregate_trials(&trials?, started.elapsed())
    } else {
        let mut rng = make_rng(args.seed);
        let mut report = |p: u8| debug!(progress = p, "simulation progress");
        run_simulation(&scenario, args.trials, &mut rng, Some(&mut report))?
    };

    let mut projections = generate_projections(&scenario);
    attach_bands(&mut projections, &result);
    Ok(SimulateResponse {
        result,
        projections,
    })
}

fn stress_from_cli(args: StressArgs) -> anyhow::Result<Vec<StressTestResult>> {
    if args.trials == 0 {
        bail!("--trials must be > 0");
    }
    let scenario = load_scenario(&args.scenario)?;
    let catalog = match &args.catalog {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read stress catalog {}", path.display()))?;
            StressCatalog::from_json(&text)?
        }
        None => StressCatalog::builtin(),
    };

    let mut rng = make_rng(args.seed);
    let results = match &args.id {
        Some(id) => vec![run_stress_test(
            &scenario,
            catalog.get(id)?,
            args.trials,
            &mut rng,
        )?],
        None => run_stress_suite(&scenario, &catalog, args.trials, &mut rng)?,
    };
    Ok(results)
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    let scenario = parse_scenario(&text)
        .with_context(|| format!("invalid scenario {}", path.display()))?;
    Ok(scenario)
}

fn parse_scenario(json: &str) -> anyhow::Result<Scenario> {
    let scenario: Scenario = serde_json::from_str(json)?;
    scenario.validate()?;
    Ok(scenario)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn make_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/api/project", post(project_handler))
        .route("/api/simulate", post(simulate_handler))
        .route("/api/stress", post(stress_handler))
        .route("/api/stress/scenarios", get(stress_catalog_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "wealthcast HTTP API listening");

    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_handler(Json(scenario): Json<Scenario>) -> Response {
    match project_impl(scenario) {
        Ok(projections) => json_response(StatusCode::OK, projections),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn simulate_handler(Json(request): Json<SimulateRequest>) -> Response {
    match simulate_impl(request).await {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

// Stress runs are whole simulations with no yield points; keep them off the
// async workers.
async fn stress_handler(Json(request): Json<StressRequest>) -> Response {
    match tokio::task::spawn_blocking(move || stress_impl(request)).await {
        Ok(Ok(results)) => json_response(StatusCode::OK, results),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(join_error) => {
            error!(error = %join_error, "stress task did not complete");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Stress test failed")
        }
    }
}

async fn stress_catalog_handler() -> Response {
    json_response(StatusCode::OK, StressCatalog::builtin())
}

fn project_impl(scenario: Scenario) -> Result<Vec<YearlyProjection>, String> {
    scenario.validate().map_err(|e| e.to_string())?;
    Ok(generate_projections(&scenario))
}

async fn simulate_impl(request: SimulateRequest) -> Result<SimulateResponse, String> {
    let trials = api_trial_count(request.trials)?;
    let mut rng = make_rng(request.seed);

    let result = run_simulation_async(&request.scenario, trials, &mut rng, None)
        .await
        .map_err(|e| e.to_string())?;
    let mut projections = generate_projections(&request.scenario);
    attach_bands(&mut projections, &result);

    Ok(SimulateResponse {
        result,
        projections,
    })
}

fn stress_impl(request: StressRequest) -> Result<Vec<StressTestResult>, String> {
    let trials = api_trial_count(request.trials)?;
    let mut rng = make_rng(request.seed);
    let catalog = StressCatalog::builtin();

    let result = match (request.stress, request.stress_id) {
        (Some(stress), _) => run_stress_test(&request.scenario, &stress, trials, &mut rng)
            .map(|r| vec![r]),
        (None, Some(id)) => catalog
            .get(&id)
            .and_then(|stress| run_stress_test(&request.scenario, stress, trials, &mut rng))
            .map(|r| vec![r]),
        (None, None) => run_stress_suite(&request.scenario, &catalog, trials, &mut rng),
    };
    result.map_err(|e| e.to_string())
}

fn api_trial_count(requested: Option<usize>) -> Result<usize, String> {
    let trials = requested.unwrap_or(DEFAULT_TRIALS);
    if trials == 0 || trials > MAX_API_TRIALS {
        return Err(format!("trials must be between 1 and {MAX_API_TRIALS}"));
    }
    Ok(trials)
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
