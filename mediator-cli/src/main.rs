use clap::Parser;
use mediator_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    mediator_cli::run(cli).await
}
