//! Pool of always-online platform sessions
//!
//! Keeps one live session per desired credential. The desired set lives in
//! `CredentialStore` (single source of truth); the pool converges live
//! sessions onto it whenever a reconciliation pass runs.
//!
//! Session lifecycle:
//! 1. Credential added to the store → next pass starts a connect attempt
//! 2. Attempt succeeds → session held `Online`, identity published on the bus
//! 3. Attempt rejected (or fails transiently, by policy) → credential pruned from the store
//! 4. Session drops offline → next pass releases it and reconnects
//! 5. Credential removed from the store → next pass releases the session
//! 6. Shutdown → every session goes invisible, is released, then a grace delay

pub mod driver;
pub mod error;
pub mod events;
pub mod manager;
pub mod store;

#[cfg(test)]
mod testing;

pub use driver::{Command, PoolHandle, spawn_driver};
pub use error::{Error, Result};
pub use events::{EventBus, EventReceiver, PoolEvent, spawn_log_sink};
pub use manager::{Pass, PassSummary, PoolManager, PoolPolicy, PoolState};
pub use store::{CredentialStore, normalize};
