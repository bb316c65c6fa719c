use clap::Parser;
use utilities::RealFileSystem;
use xferd::config::{load, CliConfig};
use xferd::Service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();
    utilities::init_logging(&cli.log_path, &RealFileSystem::new())?;

    let cfg = load(&cli.config)?;
    let service = Service::new(cfg)?;
    service.run().await
}
