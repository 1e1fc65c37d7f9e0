//! Status command handler

use anyhow::Result;
use serde::Serialize;

use daybook_core::sync::PullGateState;
use daybook_core::{Domain, Session, SyncClient, SyncStats};

use crate::output::{Output, OutputFormat};

#[derive(Serialize)]
struct DomainStatus {
    domain: &'static str,
    initialized: bool,
    records: usize,
    pending: usize,
    gate: &'static str,
    stats: Option<SyncStats>,
}

fn domain_status<D: Domain>(client: &SyncClient<D>) -> DomainStatus {
    match client.coordinator() {
        Some(coordinator) => DomainStatus {
            domain: D::NAME,
            initialized: true,
            records: coordinator.scan().count(),
            pending: coordinator.pending_count(),
            gate: match coordinator.gate_state() {
                PullGateState::Blocked => "blocked",
                PullGateState::Open => "open",
            },
            stats: Some(coordinator.stats()),
        },
        None => DomainStatus {
            domain: D::NAME,
            initialized: false,
            records: 0,
            pending: 0,
            gate: "blocked",
            stats: None,
        },
    }
}

/// Show status information
pub fn show(session: &Session, output: &Output) -> Result<()> {
    let config = session.config();
    let credential = session.credential();
    let domains = [
        domain_status(session.diary()),
        domain_status(session.food()),
        domain_status(session.ideas()),
    ];

    match output.format {
        OutputFormat::Json => {
            output.json(&serde_json::json!({
                "logged_in": credential.is_some(),
                "user_id": credential.as_ref().and_then(|c| c.user_id.clone()),
                "sync_enabled": config.sync_enabled,
                "server_url": config.server_url,
                "data_dir": config.data_dir,
                "domains": domains,
            }));
        }
        OutputFormat::Quiet => {
            let pending: usize = domains.iter().map(|d| d.pending).sum();
            println!("{}", pending);
        }
        OutputFormat::Human => {
            println!("Daybook Status");
            println!("==============");
            println!();
            println!("Account:");
            match credential {
                Some(ref credential) => println!(
                    "  Logged in{}",
                    credential
                        .user_id
                        .as_ref()
                        .map(|u| format!(" as {}", u))
                        .unwrap_or_default()
                ),
                None => println!("  Not logged in"),
            }
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.server_url {
                println!("  Server: {}", url);
            }
            println!();
            println!("Storage:");
            println!("  Location: {}", config.data_dir.display());
            println!();
            println!("Contents:");
            for status in &domains {
                if status.initialized {
                    println!(
                        "  {:<6} {} record(s), {} pending, pull gate {}",
                        status.domain, status.records, status.pending, status.gate
                    );
                } else {
                    println!("  {:<6} (not initialized)", status.domain);
                }
            }
        }
    }

    Ok(())
}
