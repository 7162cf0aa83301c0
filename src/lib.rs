//! Cash-prize payout pipeline
//!
//! Turns "user won money" events into exactly-once, auditable transfers
//! through an unreliable payment provider.

pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod payouts;
pub mod providers;
pub mod queue;
pub mod services;
pub mod workers;
