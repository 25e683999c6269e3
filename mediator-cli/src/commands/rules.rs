use anyhow::Result;

use crate::client::ApiClient;

pub async fn list(client: &ApiClient) -> Result<()> {
    let rules = client.rules().await?;
    println!("allow:");
    for rule in &rules.allow {
        println!("  {rule}");
    }
    println!("deny:");
    for rule in &rules.deny {
        println!("  {rule}");
    }
    Ok(())
}

pub async fn allow(client: &ApiClient, rule: &str) -> Result<()> {
    if client.add_allow_rule(rule).await? {
        println!("added {rule}");
    } else {
        println!("{rule} was already present or could not be parsed");
    }
    Ok(())
}
