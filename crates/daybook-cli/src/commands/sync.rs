//! Sync command handler

use anyhow::{bail, Result};
use serde_json::json;

use daybook_core::{PullOutcome, PushOutcome, Session};

use crate::output::{Output, OutputFormat};

/// Pull then push every domain
pub async fn sync(session: &Session, output: &Output) -> Result<()> {
    if session.config().server_url.is_none() {
        bail!(
            "Sync server not configured. Set it with:\n  \
             daybook config set server_url https://your-server"
        );
    }
    if session.credential().is_none() {
        bail!("Not logged in. Run:\n  daybook login --token <token>");
    }

    output.message("Syncing...");

    let pulls = session.pull_all().await;
    let pushes = session.flush_all().await;

    let mut failed = 0;
    let mut report = Vec::new();
    for ((domain, pull), (_, push)) in pulls.into_iter().zip(pushes) {
        let pull_text = match &pull {
            Ok(PullOutcome::Applied { ops, .. }) => format!("{} change(s)", ops),
            Ok(PullOutcome::Gated) => "not ready".to_string(),
            Err(e) => {
                failed += 1;
                format!("failed: {}", e)
            }
        };
        let push_text = match &push {
            Ok(PushOutcome::Idle) => "nothing to push".to_string(),
            Ok(PushOutcome::Pushed { count, .. }) => format!("{} pushed", count),
            Err(e) => {
                failed += 1;
                format!("failed: {}", e)
            }
        };

        match output.format {
            OutputFormat::Human => println!("  {:<6} pull: {}, push: {}", domain, pull_text, push_text),
            OutputFormat::Json => report.push(json!({
                "domain": domain,
                "pull": pull_text,
                "push": push_text,
            })),
            OutputFormat::Quiet => {}
        }
    }

    if output.is_json() {
        output.json(&report);
    }
    if failed > 0 {
        bail!("{} sync step(s) failed", failed);
    }
    output.success("Sync complete");
    Ok(())
}

/// Whether background sync applies to this session
pub fn auto_sync_enabled(session: &Session) -> bool {
    let config = session.config();
    config.sync_enabled && config.server_url.is_some() && session.credential().is_some()
}

/// Pull before a read command; failures only warn
pub async fn refresh(session: &Session, output: &Output) {
    if !auto_sync_enabled(session) {
        return;
    }
    for (domain, result) in session.pull_all().await {
        if let Err(e) = result {
            output.warn(&format!("Auto-sync of {} failed: {}", domain, e));
        }
    }
}

/// Push pending mutations after a write command; failures only warn
pub async fn flush_pending(session: &Session, output: &Output) {
    if !auto_sync_enabled(session) {
        return;
    }
    for (domain, result) in session.flush_all().await {
        if let Err(e) = result {
            output.warn(&format!(
                "Could not push {} changes, they will be sent next time: {}",
                domain, e
            ));
        }
    }
}
