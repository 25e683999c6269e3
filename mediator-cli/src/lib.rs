mod cli;
mod client;
mod commands;

use anyhow::Result;

pub use cli::Cli;
pub use cli::Command;

pub async fn run(cli: Cli) -> Result<()> {
    let Cli { api, command } = cli;

    if let Command::Serve(args) = command {
        return commands::serve::run(args).await;
    }

    let client = client::ApiClient::new(api);
    match command {
        Command::Serve(_) => unreachable!("handled above"),
        Command::List => commands::list::run(&client).await,
        Command::Approve(args) => commands::resolve::run(&client, &args, "approved").await,
        Command::Deny(args) => commands::resolve::run(&client, &args, "denied").await,
        Command::Watch => commands::watch::run(&client).await,
        Command::Rules => commands::rules::list(&client).await,
        Command::Allow { rule } => commands::rules::allow(&client, &rule).await,
    }
}
