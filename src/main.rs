use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use promoreel::{api, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("promoreel=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        data_dir = %config.data_dir.display(),
        outputs_dir = %config.outputs_dir.display(),
        "Starting promoreel {}",
        env!("CARGO_PKG_VERSION")
    );

    api::serve(config).await
}
