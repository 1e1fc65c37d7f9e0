//! Push/pull synchronization
//!
//! Each domain gets a [`SyncClient`], which owns a [`SyncCoordinator`] while
//! a credential is available. Coordinators push queued mutations, pull the
//! server's patch once their [`PullGate`] opens, and react to `sync` events
//! from the session's shared [`InvalidationChannel`].
//!
//! ## Wire format
//!
//! - Push: `POST <push_url>` with `{"clientID", "mutations": [...]}`
//! - Pull: `POST <pull_url>` with `{"clientID"}`, answered by
//!   `{"lastMutationID", "patch": [{"op": "clear" | "put" | "del", ...}]}`
//! - Poke: `POST <poke_url>?userId=<id>`
//! - Events: server-sent events or WebSocket text frames carrying
//!   `connected`, `ping` or `sync`

pub mod client;
pub mod config;
pub mod coordinator;
pub mod gate;
pub mod invalidation;
pub mod poke;
pub mod transport;

pub use client::SyncClient;
pub use config::{RetryConfig, SyncConfig};
pub use coordinator::{PullOutcome, PushOutcome, SyncCoordinator, SyncStats};
pub use gate::{PullGate, PullGateState};
pub use invalidation::{
    source_for_url, ChannelEventSource, ConnectionStatus, EventSource, InvalidationChannel,
    InvalidationEvent, SseEventSource, WebSocketEventSource,
};
pub use poke::{PokeNotifier, PokeOutcome};
pub use transport::{
    HttpTransport, MockTransport, PullRequest, PullResponse, PushRequest, SyncTransport,
};
