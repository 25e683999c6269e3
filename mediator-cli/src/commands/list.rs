use anyhow::Result;

use crate::client::ApiClient;

pub async fn run(client: &ApiClient) -> Result<()> {
    let queue = client.queue().await?;
    if queue.pending.is_empty() {
        println!("No pending requests.");
        return Ok(());
    }
    for req in &queue.pending {
        println!("{:<8} {:<10} {}", req.id, req.category, req.action);
        if let Some(reason) = &req.reason {
            println!("           reason: {reason}");
        }
    }
    Ok(())
}
