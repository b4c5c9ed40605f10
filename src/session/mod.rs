//! Resumable payment sessions
//!
//! Persists in-flight multi-step flows in two storage tiers and offers them
//! back to the user on safe entry routes.

pub mod error;
pub mod marker;
pub mod model;
pub mod recovery;
pub mod registry;
pub mod scope;
pub mod store;

pub use error::SessionError;
pub use marker::{LastPromptMarker, MarkerStore};
pub use model::{
    CreditPurchaseData, CryptoBuyData, CryptoSellData, EscrowData, EscrowMode, Session,
    SessionPayload, SessionType,
};
pub use recovery::{ResumeIntent, SessionRecoveryCoordinator, resume_route};
pub use registry::{SessionRegistry, UserSessions};
pub use scope::{FileScope, KvScope, MemoryScope};
pub use store::SessionStore;
