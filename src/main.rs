use clap::Parser;
use tunnelmux::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    tunnelmux::app::run(config).await
}
