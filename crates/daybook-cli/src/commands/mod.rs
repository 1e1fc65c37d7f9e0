pub mod auth;
pub mod config;
pub mod entries;
pub mod status;
pub mod sync;
pub mod watch;
