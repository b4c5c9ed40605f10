//! escrow_hub - Custodial escrow for crypto-for-cash trades
//!
//! # Modules
//!
//! - [`core_types`] - Assets, id aliases, clock
//! - [`money`] - Smallest-unit conversion and tolerance checks
//! - [`escrow`] - Deposit address ledger, custody client, release, status notifier
//! - [`reconcile`] - Webhook transfer events matched against pending obligations
//! - [`funding`] - Opening obligations for credit purchases and trade escrows
//! - [`trade`] - Trade and escrow state machine
//! - [`session`] - Resumable multi-step payment sessions
//! - [`rates`] - Cached exchange-rate quotes
//! - [`worker`] - Background maintenance sweeps
//! - [`gateway`] - HTTP surface

// Core types - must be first!
pub mod core_types;
pub mod money;
pub mod store;

// Ambient
pub mod config;
pub mod db;
pub mod logging;

// Components
pub mod escrow;
pub mod funding;
pub mod rates;
pub mod reconcile;
pub mod session;
pub mod trade;
pub mod worker;

// HTTP surface
pub mod gateway;

// Convenient re-exports at crate root
pub use core_types::{Asset, Clock, ObligationId, SystemClock, TradeId, UserId};
pub use escrow::{EscrowAddressManager, EscrowStatusNotifier};
pub use reconcile::{PaymentReconciler, ReconciliationResult};
pub use session::{SessionRecoveryCoordinator, SessionStore};
pub use trade::TradeStateMachine;
