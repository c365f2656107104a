mod worker;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mr_worker=debug,mr_common=info,reqwest=info")),
        )
        .init();

    worker::run(WorkerSettings::from_env()).await
}
