// /////////////////////////////////////////////////////////////////////////////
// Tidal Stream Engine
// Copyright (c) 2025 Tidal Stream Contributors
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Engine binary: parse arguments, load configuration, run the node until
//! it is told to stop. Exit codes: 0 on a clean shutdown, 2 on buffer-pool
//! exhaustion, 3 on an invalid plan (including duplicate origins), 4 on a
//! configuration error, 1 otherwise.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use tidal::application::use_cases::run_benchmark::{run_benchmark, BenchmarkOptions};
use tidal::presentation;
use tidal::{EngineError, NodeEngine, WorkerConfiguration};
use tidal_bootstrap::{cli, logger, shutdown, CliArgs, EngineCommand};

fn main() -> ExitCode {
    let args = CliArgs::parse_args();
    logger::init(&args.log);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "engine exited with error");
            ExitCode::from(NodeEngine::exit_code_for(&err) as u8)
        }
    }
}

fn run(args: cli::CliArgs) -> Result<(), EngineError> {
    let config = WorkerConfiguration::load(args.config.as_deref())?;
    let engine = NodeEngine::start(config)?;

    match args.command.unwrap_or(EngineCommand::Serve) {
        EngineCommand::Serve => serve(&engine),
        EngineCommand::Benchmark { buffers, tuples_per_buffer, keys, window_ms } => {
            let report = run_benchmark(
                &engine,
                BenchmarkOptions {
                    buffers_to_produce: buffers,
                    tuples_per_buffer,
                    distinct_keys: keys,
                    window_size_ms: window_ms,
                    ..Default::default()
                },
            )?;
            println!("{}", presentation::render_benchmark_report(&report));
            engine.shutdown();
            Ok(())
        }
    }
}

fn serve(engine: &Arc<NodeEngine>) -> Result<(), EngineError> {
    // Periodic metrics sampling while serving; the collector thread ends
    // with the engine.
    let _sampler = {
        let engine = Arc::clone(engine);
        std::thread::Builder::new()
            .name("tidal-metrics".into())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(10));
                engine.sample_metrics();
            })
            .map_err(|e| EngineError::internal(format!("metrics sampler: {e}")))?
    };

    let reason = shutdown::wait_for_signal();
    println!("{}", presentation::render_statistics(&engine.statistics_all()));
    tracing::info!(?reason, "serve loop ended");
    engine.shutdown();
    Ok(())
}
