use anyhow::Context;

use logistics_infra::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logistics_observability::init();

    let config = RelayConfig::from_env().context("failed to load relay configuration")?;
    logistics_relay::run(config).await
}
