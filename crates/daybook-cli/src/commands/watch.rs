//! Watch command handler
//!
//! Keeps the invalidation stream open and pulls whenever the server signals
//! a change, printing each domain's record count as it moves.

use anyhow::{bail, Result};
use tracing::debug;

use daybook_core::sync::ConnectionStatus;
use daybook_core::{Domain, Session, Subscription, SyncClient};

use crate::output::Output;

fn report_changes<D: Domain>(client: &SyncClient<D>, quiet: bool) -> Result<Subscription> {
    Ok(client.subscribe(move |entries| {
        if !quiet {
            println!("{}: {} record(s)", D::NAME, entries.len());
        }
    })?)
}

/// Run until interrupted
pub async fn watch(session: &Session, output: &Output) -> Result<()> {
    if session.config().server_url.is_none() {
        bail!(
            "Sync server not configured. Set it with:\n  \
             daybook config set server_url https://your-server"
        );
    }
    if session.credential().is_none() {
        bail!("Not logged in. Run:\n  daybook login --token <token>");
    }

    let quiet = output.is_quiet();
    let _subscriptions = [
        report_changes(session.diary(), quiet)?,
        report_changes(session.food(), quiet)?,
        report_changes(session.ideas(), quiet)?,
    ];

    let channel = session.listen()?;
    let mut status = channel.status();
    output.message("Watching for changes (Ctrl-C to stop)...");

    // Catch up on anything missed while offline
    for (domain, result) in session.pull_all().await {
        if let Err(e) = result {
            output.warn(&format!("Initial pull of {} failed: {}", domain, e));
        }
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                debug!("Event stream status: {:?}", current);
                match current {
                    ConnectionStatus::Connected => output.message("Connected"),
                    ConnectionStatus::Disconnected => output.message("Disconnected, reconnecting..."),
                    ConnectionStatus::Connecting => {}
                }
            }
        }
    }

    session.shutdown();
    output.message("Stopped");
    Ok(())
}
