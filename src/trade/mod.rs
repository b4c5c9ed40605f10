//! Trade lifecycle
//!
//! # State Machine
//!
//! ```text
//! trade:  PENDING_ACCEPTANCE → ACCEPTED → PAYMENT_SENT → CASH_DELIVERED | CRYPTO_RELEASED → COMPLETED
//!         (any non-terminal) → CANCELLED | DISPUTED
//! escrow: PENDING → CRYPTO_RECEIVED → CASH_RECEIVED → COMPLETED
//!         (any non-completed) → DISPUTED
//! ```
//!
//! `COMPLETED` and `CANCELLED` are terminal. `DISPUTED` is left only by
//! cancellation or by an explicit `resolve_dispute`.

pub mod error;
pub mod machine;
pub mod repository;
pub mod state;

pub use error::{InvalidTransition, TradeError};
pub use machine::{DisputeResolution, TradeStateMachine};
pub use repository::{MemoryTradeRepository, PgTradeRepository, TradeRecord, TradeRepository};
pub use state::{EscrowStatus, Lifecycle, TradeStatus, TransitionAxis};
