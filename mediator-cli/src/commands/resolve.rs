use anyhow::Result;

use crate::cli::ResolveArgs;
use crate::client::ApiClient;

/// Shared by `approve` and `deny`: `status` is `"approved"` or `"denied"`,
/// matching `RequestStatus`'s wire representation.
pub async fn run(client: &ApiClient, args: &ResolveArgs, status: &str) -> Result<()> {
    if let Some(category) = &args.all {
        let n = client.bulk(category, status).await?;
        println!("{status} {n} {category} request(s).");
        return Ok(());
    }

    for id in &args.ids {
        if status == "approved" {
            client.approve(id).await?;
        } else {
            client.deny(id).await?;
        }
        println!("{status} {id}");
    }
    Ok(())
}
