//! GeoQuest DST Simulator CLI
//!
//! Run deterministic simulation scenarios against the GeoQuest engines.

use clap::Parser;
use geoquest_core::GeoQuestConfig;
use geoquest_sim::scenarios::ScenarioId;
use geoquest_sim::{ScenarioResult, ScenarioRunner};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// GeoQuest Deterministic Simulation Testing CLI
#[derive(Parser, Debug)]
#[command(name = "geoquest-sim")]
#[command(about = "Run deterministic simulation scenarios for GeoQuest", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (city_walk, stationary_jitter, quest_hunt, flaky_oracle, identity_swap, lossy_store, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Engine configuration (JSON); defaults apply to missing fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    total: usize,
    passed: usize,
    failed: usize,
    results: &'a [ScenarioResult],
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Error: cannot install logger: {}", e);
        std::process::exit(2);
    }

    let config = match &args.config {
        Some(path) => GeoQuestConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("Error: {}: {}", path.display(), e);
            std::process::exit(2);
        }),
        None => GeoQuestConfig::default(),
    };

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
            eprintln!("Available scenarios: {}, all", names.join(", "));
            std::process::exit(2);
        })]
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        args.seed
    };

    if !args.json {
        info!("GeoQuest DST Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let mut results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed).with_config(config.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);

            if !args.json {
                if result.passed {
                    info!(
                        "✓ {} (seed={}) PASSED in {:.0}s virtual | cells={} score={} oracle_calls={}",
                        scenario.name(),
                        seed,
                        result.final_time_secs,
                        result.metrics.cells_visited,
                        result.metrics.store_score,
                        result.metrics.oracle_calls
                    );
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
            }
            results.push(result);
        }
    }

    let failed = results.iter().filter(|r| !r.passed).count();
    let total = results.len();

    if args.json {
        let summary = Summary {
            total,
            passed: total - failed,
            failed,
            results: &results,
        };
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("Error: cannot serialize results: {}", e);
                std::process::exit(2);
            }
        }
    } else {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed, total);
            for result in results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if failed > 0 {
        std::process::exit(1);
    }
}
