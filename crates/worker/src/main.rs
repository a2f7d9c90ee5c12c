#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sluice_observability::init();

    let settings = sluice_worker::config::Settings::from_env()?;
    tracing::info!(
        worker_id = %settings.worker.worker_id,
        persistent = settings.database_url.is_some(),
        "starting sluice worker"
    );

    let running = sluice_worker::app::start(settings).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    running.shutdown().await;
    Ok(())
}
