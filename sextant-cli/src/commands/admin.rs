//! `sextant admin ...`: operate a running indexer over its admin API

use crate::cli::{AdminArgs, AdminCommand, ImportKind};
use crate::error::{CliError, Result};

pub async fn run(args: &AdminArgs) -> Result<()> {
    let client = reqwest::Client::new();
    let base = args.indexer.trim_end_matches('/');

    match &args.command {
        AdminCommand::Allow { peer } => {
            post_ok(&client, &format!("{}/admin/allow?peer={}", base, peer)).await?;
            println!("allowing peer {}", peer);
        }
        AdminCommand::Block { peer } => {
            post_ok(&client, &format!("{}/admin/block?peer={}", base, peer)).await?;
            println!("blocking peer {}", peer);
        }
        AdminCommand::ListAllowed => {
            let url = format!("{}/admin/list-allowed", base);
            let response = client
                .get(&url)
                .send()
                .await
                .map_err(|e| CliError::admin(format!("{}: {}", url, e)))?;
            check_status(&url, response.status())?;
            let peers: Vec<String> = response
                .json()
                .await
                .map_err(|e| CliError::admin(e.to_string()))?;
            for peer in peers {
                println!("{}", peer);
            }
        }
        AdminCommand::Reload => {
            post_ok(&client, &format!("{}/admin/reload", base)).await?;
            println!("reloaded configuration");
        }
        AdminCommand::Freeze => {
            post_ok(&client, &format!("{}/admin/freeze", base)).await?;
            println!("indexer frozen");
        }
        AdminCommand::Sync { peer } => {
            post_ok(&client, &format!("{}/admin/sync/{}", base, peer)).await?;
            println!("sync requested for {}", peer);
        }
        AdminCommand::Import {
            kind,
            provider,
            file,
        } => {
            let body = std::fs::read(file)
                .map_err(|e| CliError::admin(format!("cannot read {}: {}", file.display(), e)))?;
            let kind_path = match kind {
                ImportKind::Manifest => "manifest",
                ImportKind::Cidlist => "cidlist",
            };
            let url = format!("{}/admin/import/{}/{}", base, kind_path, provider);
            let response = client
                .post(&url)
                .body(body)
                .send()
                .await
                .map_err(|e| CliError::admin(format!("{}: {}", url, e)))?;
            check_status(&url, response.status())?;
            println!("imported {} for provider {}", file.display(), provider);
        }
    }
    Ok(())
}

async fn post_ok(client: &reqwest::Client, url: &str) -> Result<()> {
    let response = client
        .post(url)
        .send()
        .await
        .map_err(|e| CliError::admin(format!("{}: {}", url, e)))?;
    check_status(url, response.status())
}

fn check_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(CliError::admin(format!("{}: status {}", url, status)))
    }
}
