//! Poke notifier
//!
//! After a push lands, ask the server to tell the user's other sessions to
//! pull. One attempt, no retry; failures only get logged.

use std::sync::Arc;

use tracing::{debug, warn};

use super::transport::SyncTransport;
use crate::credentials::TokenProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PokeOutcome {
    Sent,
    /// No credential or no user id to address the poke to
    Skipped,
    Failed,
}

pub struct PokeNotifier {
    transport: Arc<dyn SyncTransport>,
    url: String,
    tokens: TokenProvider,
}

impl PokeNotifier {
    pub fn new(transport: Arc<dyn SyncTransport>, url: impl Into<String>, tokens: TokenProvider) -> Self {
        Self {
            transport,
            url: url.into(),
            tokens,
        }
    }

    pub async fn poke(&self) -> PokeOutcome {
        let Some(credential) = self.tokens.current() else {
            debug!("No credential, skipping poke");
            return PokeOutcome::Skipped;
        };
        let Some(user_id) = credential.user_id.as_deref().filter(|id| !id.is_empty()) else {
            debug!("No user id cached, skipping poke");
            return PokeOutcome::Skipped;
        };

        match self.transport.poke(&self.url, &credential.token, user_id).await {
            Ok(()) => {
                debug!("Poked sessions of user {}", user_id);
                PokeOutcome::Sent
            }
            Err(e) => {
                warn!("Poke failed: {}", e);
                PokeOutcome::Failed
            }
        }
    }
}
