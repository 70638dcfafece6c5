// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Binary entry point: flags, config load, startup, signal loop.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use ultrabalancer::config::{parse_backend_flag, Algorithm, CheckConfig, Config};
use ultrabalancer::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CliAlgorithm {
    RoundRobin,
    LeastConn,
    IpHash,
    Weighted,
    ResponseTime,
}

impl From<CliAlgorithm> for Algorithm {
    fn from(value: CliAlgorithm) -> Algorithm {
        match value {
            CliAlgorithm::RoundRobin => Algorithm::RoundRobin,
            CliAlgorithm::LeastConn => Algorithm::LeastConn,
            CliAlgorithm::IpHash => Algorithm::Source,
            CliAlgorithm::Weighted => Algorithm::WeightedRandom,
            CliAlgorithm::ResponseTime => Algorithm::ResponseTime,
        }
    }
}

/// Multi-protocol L4/L7 reverse proxy and load balancer.
#[derive(Debug, Parser)]
#[command(name = "ultrabalancer", version, about)]
struct Args {
    /// Configuration file (.cfg or .yaml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Listen port
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Add a backend server (repeatable)
    #[arg(short, long = "backend", value_name = "HOST:PORT[@WEIGHT]")]
    backends: Vec<String>,

    /// Load balancing algorithm
    #[arg(short, long, value_enum, default_value_t = CliAlgorithm::RoundRobin)]
    algorithm: CliAlgorithm,

    /// Number of worker threads (default: 2 x logical cores)
    #[arg(short, long, default_value_t = 0)]
    workers: u32,

    /// Enable health checks (default)
    #[arg(long, overrides_with = "no_health_check")]
    health_check_enabled: bool,

    /// Disable health checks
    #[arg(long)]
    no_health_check: bool,

    /// Health check interval in milliseconds
    #[arg(long, value_name = "MS", default_value_t = 5000)]
    health_check_interval: u64,

    /// Failed checks before marking a server down
    #[arg(long, value_name = "N", default_value_t = 3)]
    health_check_fails: u32,
}

fn build_config(args: &Args) -> Result<Config, String> {
    if let Some(path) = &args.config {
        return Config::load(path).map_err(|e| e.to_string());
    }

    let mut backends = Vec::with_capacity(args.backends.len());
    for raw in &args.backends {
        backends.push(parse_backend_flag(raw)?);
    }

    let enabled = args.health_check_enabled || !args.no_health_check;
    let health = if !enabled {
        None
    } else {
        Some(CheckConfig {
            inter_ms: args.health_check_interval,
            fall: args.health_check_fails,
            ..CheckConfig::default()
        })
    };

    Config::from_cli(
        args.port,
        &backends,
        args.algorithm.into(),
        args.workers,
        health,
    )
    .map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ultrabalancer: {e}");
            return ExitCode::FAILURE;
        }
    };

    if args.check {
        println!("configuration valid");
        return ExitCode::SUCCESS;
    }

    let mut runtime = match Runtime::start(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("ultrabalancer: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(path) = args.config {
        runtime.set_config_path(path);
    }

    if let Err(e) = runtime.run_until_signal() {
        eprintln!("ultrabalancer: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
