// Start the reconciler.
use gitops_reconciler::config::Config;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    gitops_reconciler::telemetry::init();
    gitops_reconciler::metrics::init();

    let config = Config::load()?;
    gitops_reconciler::supervisor::run(config).await?;
    Ok(())
}
