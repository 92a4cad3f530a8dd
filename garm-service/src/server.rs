use garm_common::tracing::init_tracing_with_default_env_filter;
use garm_common::SafeDisplay;
use garm_service::config::{make_config_loader, GarmServiceConfig};
use garm_service::{metrics, GarmService};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(config))
    } else {
        Ok(())
    }
}

async fn async_main(config: GarmServiceConfig) -> Result<(), std::io::Error> {
    info!("garm-service {}", garm_service::VERSION);
    info!("config:\n{}", config.to_safe_string());

    let prometheus_registry = metrics::register_all();
    let cancel = CancellationToken::new();

    let service = match GarmService::new(config, prometheus_registry, cancel.clone()).await {
        Ok(service) => service,
        Err(e) => {
            error!("service initialization failed: {e:#}");
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let mut join_set = JoinSet::new();
    if let Err(e) = service.run(&mut join_set).await {
        error!("service startup failed: {e:#}");
        return Err(std::io::Error::other(e.to_string()));
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = sigterm.recv() => {
            info!("termination signal received, shutting down");
        }
        result = join_set.join_next() => {
            if let Some(Ok(Err(e))) = result {
                error!("worker failed: {e:#}");
            }
        }
    }

    cancel.cancel();
    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("worker exited with error: {e:#}"),
            Err(e) => error!("worker panicked: {e}"),
        }
    }

    info!("shutdown complete");
    Ok(())
}
