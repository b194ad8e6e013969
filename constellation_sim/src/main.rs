//! Constellation Simulator CLI
//!
//! Run deterministic sync scenarios under injected network and storage faults.

use clap::Parser;
use constellation_core::SessionConfig;
use constellation_sim::scenarios::ScenarioId;
use constellation_sim::{ScenarioResult, ScenarioRunner, SimConfig};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "constellation-sim")]
#[command(about = "Run deterministic position-sync simulations", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Number of participants
    #[arg(short, long, default_value = "5")]
    participants: usize,

    /// Scenario to run (rendezvous, late_joiner, flaky_network, bot_swarm, stale_eviction, reconnect, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Scenario run length in seconds
    #[arg(short, long, default_value = "30")]
    duration: f64,

    /// Session configuration (JSON); unspecified fields keep their defaults
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export frame-by-frame views of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,
}

fn init_logging(verbose: bool, json: bool) {
    let default = match (verbose, json) {
        (true, _) => "debug",
        (false, true) => "warn",
        (false, false) => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Logs go to stderr so --json output stays parseable
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_session_config(path: Option<&str>) -> Result<SessionConfig, String> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let json = std::fs::read_to_string(path).map_err(|e| format!("cannot read {}: {}", path, e))?;
    SessionConfig::from_json_str(&json).map_err(|e| format!("{}: {}", path, e))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.json);

    if !args.json {
        info!("Constellation Simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                return ExitCode::FAILURE;
            }
        }
    };

    let session = match load_session_config(args.config.as_deref()) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Error: invalid config {}", e);
            return ExitCode::FAILURE;
        }
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    let config = SimConfig {
        seed: base_seed,
        participants: args.participants,
        duration_secs: args.duration,
        session,
        ..SimConfig::default()
    };

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            eprintln!("Error: --export only supports a single scenario, not 'all'");
            return ExitCode::FAILURE;
        }
        return run_export(ScenarioRunner::new(config), scenarios[0], export_path);
    }

    let seeds: Vec<u64> = (0..args.seeds.max(1) as u64)
        .map(|offset| base_seed.wrapping_add(offset))
        .collect();
    let runner = ScenarioRunner::new(config);

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for scenario in &scenarios {
        let results = match runner.run_seeds(*scenario, &seeds) {
            Ok(results) => results,
            Err(e) => {
                error!(scenario = %scenario, error = %e, "Scenario could not run");
                return ExitCode::FAILURE;
            }
        };
        for result in results {
            if !args.json {
                match result.failure_reason() {
                    None => info!("✓ {} (seed={}) PASSED", scenario, result.seed),
                    Some(reason) => error!("✗ {} (seed={}) FAILED: {}", scenario, result.seed, reason),
                }
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed_count,
            "failed": failed_count,
            "results": all_results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: cannot serialize results: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else if failed_count == 0 {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed_count, total);
        for result in all_results.iter().filter(|r| !r.passed) {
            error!(
                "  - {} seed={}: {}",
                result.scenario,
                result.seed,
                result.failure_reason().unwrap_or_default()
            );
        }
    }

    if failed_count > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn run_export(runner: ScenarioRunner, scenario: ScenarioId, export_path: &str) -> ExitCode {
    info!("Running with export to: {}", export_path);

    let (result, export) = match runner.run_with_export(scenario) {
        Ok(output) => output,
        Err(e) => {
            error!(scenario = %scenario, error = %e, "Scenario could not run");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = export.write_to_file(export_path) {
        error!(path = %export_path, error = %e, "Export failed");
        return ExitCode::FAILURE;
    }

    match result.failure_reason() {
        None => {
            info!("✓ {} (seed={}) PASSED - {} frames exported to {}", scenario, result.seed, export.frames.len(), export_path);
            ExitCode::SUCCESS
        }
        Some(reason) => {
            error!("✗ {} FAILED: {}", scenario, reason);
            ExitCode::FAILURE
        }
    }
}
