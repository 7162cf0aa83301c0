pub mod ledger;
pub mod memory;
pub mod models;
#[cfg(feature = "database")]
pub mod postgres;
pub mod state_machine;

pub use ledger::{LedgerError, PayoutLedger};
pub use memory::MemoryLedger;
pub use models::{
    AuditAction, AuditActor, PayoutAuditEntry, PayoutId, PayoutIntent, PayoutStatus, StatusCount,
};
pub use state_machine::PayoutStateMachine;
