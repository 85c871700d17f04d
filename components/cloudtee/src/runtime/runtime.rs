// Local crates
use crate::{
    cli::cli::Args,
    destination::Destination,
    helpers::{async_read::ReadUntilExt, load_config::Config},
    tee::{reader::DuplicatingReader, tee::Tee},
};

// External crates
use anyhow::{Context, Result, bail};
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::{info, instrument};

/// Version checked against `required_version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// cloudtee runtime: tee standard input to standard output and the configured
/// destinations until end of input (or an interrupt), then drain and close.
///
/// When preparation fails the input is still copied to standard output,
/// unless `--exit-on-error` is set.
pub async fn run(args: Args) -> Result<()> {
    let mut stdin = tokio::io::stdin().read_until_future(Box::pin(interrupted(args.ignore_interrupt)));
    let mut stdout = tokio::io::stdout();

    let destinations = match prepare(&args).await {
        Ok(destinations) => destinations,
        Err(err) if args.exit_on_error => return Err(err),
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Initialization failed");
            tracing::warn!("error occurred during initialization, so only standard output is performed");
            let bytes = tokio::io::copy(&mut stdin, &mut stdout)
                .await
                .context("copy standard input")?;
            stdout.flush().await.context("flush standard output")?;
            tracing::debug!(bytes, interrupted = stdin.is_stopped(), "Standard input ended");
            return Ok(());
        }
    };

    let mut reader = DuplicatingReader::new(stdin, destinations);
    let copied = reader.copy_to(&mut stdout).await;
    let closed = reader.close().await;

    match (copied, closed) {
        (Ok(bytes), Ok(())) => {
            tracing::debug!(bytes, "All destinations closed");
            Ok(())
        }
        (Err(copy_err), closed) => {
            if let Err(close_err) = closed {
                tracing::error!(error = %close_err, "close tee reader");
            }
            Err(copy_err).context("tee standard input")
        }
        (Ok(_), Err(close_err)) => Err(close_err).context("close tee reader"),
    }
}

/// Resolve settings and prepare every destination for the output name.
#[instrument(
    name = "cloudtee_runtime::prepare",
    target = "runtime::runtime",
    skip_all,
    level = "debug"
)]
async fn prepare(args: &Args) -> Result<Vec<Destination>> {
    let paths = args.config_paths();
    let mut config = if paths.is_empty() {
        Config::default()
    } else {
        Config::load_layered(&paths).context("configuration load")?
    };
    args.apply_overrides(&mut config);

    let settings = config.restrict().context("configuration restrict")?;
    settings
        .validate_version(VERSION)
        .context("version validate")?;

    let Some(output_name) = args.output_name.as_deref().filter(|name| !name.is_empty()) else {
        bail!("output name is empty");
    };

    let tee = Tee::new(settings).await.context("cloudtee initialize")?;
    let destinations = tee
        .prepare_destinations(output_name)
        .await
        .context("create tee reader")?;
    info!(count = destinations.len(), "Tee started");
    Ok(destinations)
}

/// Completes on the first interrupt, or never when interrupts are ignored.
async fn interrupted(ignore: bool) {
    loop {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "Unable to listen for interrupt signals");
            std::future::pending::<()>().await;
        }
        if ignore {
            info!("Interrupt received and ignored");
            continue;
        }
        info!("Interrupt received, ending input");
        return;
    }
}
