use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nestcam::{
    Result,
    config::{Args, Command, Config, TargetArgs, check_and_create_config},
    context::Context,
    logging,
    metrics::{self, Metrics},
    task::{BatchRun, LiveLoop, pipeline::Mode},
};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Args<Config> = Args::parse();

    if matches!(args.command, Command::Init) {
        logging::init_logging(None)?;
        return check_and_create_config()
            .await
            .inspect_err(|err| error!(err = ?err, "Error creating config"));
    }

    let config = args
        .get_config()
        .inspect_err(|err| eprintln!("Error getting config: {err}"))?;
    logging::init_logging(config.logging.clone())?;
    debug!(config = ?config, "Parsed config successfully");

    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let metrics = Arc::new(Metrics::default());
    if let Some(metrics_config) = config.metrics.clone() {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(err) =
                metrics::start_metrics_server(metrics, &metrics_config.address, metrics_config.port)
                    .await
            {
                error!(err = ?err, "Metrics server stopped");
            }
        });
    }

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));

    let context = Arc::new(
        Context::new(config.clone(), metrics)
            .await
            .inspect_err(|err| error!(err = ?err, "Error setting up pipeline"))?,
    );

    let result = match args.command {
        Command::Run(target) => {
            LiveLoop::new(
                context.clone(),
                target.device_name,
                target.minutes.unwrap_or(0),
                cancel,
            )
            .run()
            .await
        }
        Command::Process(target) => batch(&context, target, Mode::Score, cancel).await,
        Command::Collect(target) => batch(&context, target, Mode::Collect, cancel).await,
        Command::Init => Ok(()),
    };

    context.close().await;
    if let Err(err) = &result {
        error!(err = %err, "Stopped with an error");
    }

    info!("Exiting...");
    result
}

async fn batch(
    context: &Arc<Context>,
    target: TargetArgs,
    mode: Mode,
    cancel: CancellationToken,
) -> Result<()> {
    let minutes = target
        .minutes
        .unwrap_or(context.config.pipeline.window_minutes);

    BatchRun::new(context.clone(), target.device_name, minutes, mode, cancel)
        .run()
        .await
        .map(|_| ())
}

/// The first Ctrl-C lets the current step finish, the second exits immediately.
async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(err = ?err, "Unable to listen for Ctrl-C");
        return;
    }
    info!("Interrupted, finishing the current step. Press Ctrl-C again to force exit");
    cancel.cancel();

    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Forced exit");
        std::process::exit(130);
    }
}
