use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::panic;
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    filter::{Directive, EnvFilter},
    fmt,
    prelude::*,
    registry::Registry,
};

/// Install the global subscriber. Diagnostics go to stderr; stdout carries the
/// teed data. Keep the returned guard alive until exit so buffered lines flush.
pub fn init_tracing(level: &str) -> Result<WorkerGuard> {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let mut filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // The AWS SDK is chatty below warn.
    for directive in ["aws_config=warn", "aws_smithy_runtime=warn", "hyper=warn"] {
        if let Ok(directive) = directive.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let fmt_layer = fmt::layer()
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(non_blocking_writer)
        .with_target(false)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let subscriber = Registry::default()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default());

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global tracing subscriber")?;

    Ok(guard)
}

/// Route panics through `tracing::error!` so they reach the diagnostics log.
pub fn init_panic_handler() {
    panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let msg = payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
            .unwrap_or("Unknown panic");

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            message = %msg,
            location = %location,
            "cloudtee panicked"
        );
    }));
}
