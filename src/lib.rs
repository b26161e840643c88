//! Chrome DevTools Protocol relay.
//!
//! Sits between a browser-extension producer (connected on `/extension`)
//! and any number of CDP automation clients (connected on `/cdp`),
//! multiplexing client sessions onto the one page the extension exposes.
//! Clients speak standard CDP and believe they are driving a browser; the
//! extension sees a single well-behaved automation peer.

pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod synthetic;

pub use config::RelayConfig;
pub use error::RelayError;
pub use relay::{Relay, RelayStatus};
pub use server::{spawn_timeout_sweep, RelayServer};
