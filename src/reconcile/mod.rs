//! Webhook-driven payment reconciliation
//!
//! Transfer events from the custody provider are matched against pending
//! obligations with relative tolerance. Each (tx_hash, address) pair
//! triggers at most one state change no matter how often it is delivered.

pub mod error;
pub mod event;
pub mod obligation;
pub mod reconciler;

pub use error::ReconcileError;
pub use event::{EventKey, TransferEvent, TransferState, WebhookPayload};
pub use obligation::{
    Discrepancy, MemoryObligationStore, ObligationKind, ObligationStatus, ObligationStore,
    PendingObligation, PgObligationStore, SettleOutcome, Settlement,
};
pub use reconciler::{PaymentReconciler, ReconcilerConfig, ReconciliationResult};
