//! HTTP middleware for the payout API

pub mod logging;
