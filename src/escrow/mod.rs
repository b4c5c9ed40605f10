//! Escrow addresses
//!
//! Allocation, reuse and release of per-trade deposit addresses.
//!
//! # Address lifecycle
//!
//! ```text
//! PENDING → CONFIRMED → RELEASED
//!    ↓  ↘
//! EXPIRED  FUNDED (received, not reconciled; manual review)
//! ```
//!
//! # Invariants
//!
//! 1. **One live address**: at most one live record per (trade_id, asset),
//!    enforced by the storage key, not by application logic
//! 2. **Record after success**: the ledger is only written once the custody
//!    provider returned a non-empty address
//! 3. **Claim before send**: release flips `confirmed → released` before
//!    calling the provider and restores it only on a definite refusal

pub mod custody;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod notifier;

pub use custody::{CustodyClient, HttpCustodyClient, MockCustody};
pub use error::{CustodyError, EscrowError};
pub use ledger::{
    AddressLedger, AddressStatus, EscrowAddress, MemoryAddressLedger, PgAddressLedger,
};
pub use manager::{EscrowAddressManager, ManagerConfig};
pub use notifier::{EscrowStatusNotifier, EscrowStatusSnapshot, Subscription};
