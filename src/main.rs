use edge_runner::{install_tracing, BootstrapConfig, Runner};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_tracing();

    let bootstrap = BootstrapConfig::from_env()?;
    let runner = Runner::new(&bootstrap);

    runner.run().await
}
