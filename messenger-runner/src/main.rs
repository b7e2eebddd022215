use anyhow::Result;
use messenger_core::Config;
use messenger_core::MessengerContext;
use messenger_push::run as run_push;
use messenger_updates::run as run_updates;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting messenger dispatch service");

    let config = Config::from_env();
    let ctx = MessengerContext::new(config).await?;

    tracing::info!("Messenger context initialized");

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = run_push(ctx_clone).await {
            tracing::error!("Push listener error: {}", e);
        }
    });

    // Update listener runs in the main task.
    run_updates(ctx).await?;

    Ok(())
}
