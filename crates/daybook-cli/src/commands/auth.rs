//! Login and logout handlers

use anyhow::{bail, Result};

use daybook_core::{Credential, Session};

use crate::output::Output;

/// Store a bearer token (and optional user id) for the sync server
pub fn login(
    session: &Session,
    token: String,
    user_id: Option<String>,
    output: &Output,
) -> Result<()> {
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("Token must not be empty");
    }

    let mut credential = Credential::new(token);
    if let Some(user_id) = user_id.filter(|u| !u.trim().is_empty()) {
        credential = credential.with_user_id(user_id);
    }
    session.login(&credential)?;

    output.success("Logged in");
    if credential.user_id.is_none() {
        output.message("No user id given; other devices will not be poked after pushes.");
    }
    if session.config().server_url.is_none() {
        output.message("Sync server not configured. Set one with:");
        output.message("  daybook config set server_url https://your-server");
    }
    Ok(())
}

/// Forget the stored credential; local records stay on disk
pub fn logout(session: &Session, output: &Output) -> Result<()> {
    if session.credential().is_none() {
        output.message("Not logged in.");
        return Ok(());
    }
    session.logout()?;
    output.success("Logged out");
    Ok(())
}
