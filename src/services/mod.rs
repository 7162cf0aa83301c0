//! Services module for the payout business operations

pub mod payout_initiator;
pub mod webhook_reconciler;

pub use payout_initiator::{
    InitiatePayout, InitiatorConfig, Pagination, PayoutInitiator, PayoutRecords, PayoutStats,
    PayoutStatusView,
};
pub use webhook_reconciler::{WebhookAck, WebhookReconciler};
