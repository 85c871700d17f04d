use anyhow::{Context, Result};
use clap::Parser;
use cloudtee::{cli, instrumentation};
use std::process::ExitCode;

fn main() -> ExitCode {
    let args = cli::cli::Args::parse();

    let _guard = match instrumentation::tracing::init_tracing(&args.log_level) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("cloudtee: {err:#}");
            return ExitCode::FAILURE;
        }
    };
    instrumentation::tracing::init_panic_handler();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "cloudtee failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: cli::cli::Args) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    // Main entrypoint simply delegates control to CLI layer.
    let result = runtime.block_on(cli::cli::run(args));

    // A blocked read of standard input would otherwise keep the process alive
    // after an interrupt ended the tee.
    runtime.shutdown_background();
    result
}
