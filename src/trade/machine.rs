//! Trade State Machine
//!
//! Drives both status axes of a trade through the adjacency tables in
//! `state`. A rejected transition leaves the stored state untouched and is
//! logged; a lost compare-and-set is re-evaluated against the fresh state.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use super::error::{InvalidTransition, TradeError};
use super::repository::{TradeRecord, TradeRepository};
use super::state::{EscrowStatus, Lifecycle, TradeStatus};

/// Attempts before a contended transition gives up
const MAX_CAS_ATTEMPTS: u32 = 3;

/// Check `from -> to` against the adjacency table
pub fn validate<S: Lifecycle>(from: S, to: S) -> Result<(), InvalidTransition> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(InvalidTransition {
            axis: S::AXIS,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Out-of-band dispute outcome: the status the trade resumes at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "axis", content = "resume_to", rename_all = "snake_case")]
pub enum DisputeResolution {
    Trade(TradeStatus),
    Escrow(EscrowStatus),
}

pub struct TradeStateMachine {
    repo: Arc<dyn TradeRepository>,
}

impl TradeStateMachine {
    pub fn new(repo: Arc<dyn TradeRepository>) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &Arc<dyn TradeRepository> {
        &self.repo
    }

    pub async fn open(&self, trade: TradeRecord) -> Result<TradeRecord, TradeError> {
        if !self.repo.insert(&trade).await? {
            return Err(TradeError::AlreadyExists(trade.id));
        }
        info!(trade_id = %trade.id, asset = %trade.asset, amount = %trade.amount_crypto, "Trade opened");
        Ok(trade)
    }

    pub async fn get(&self, trade_id: &str) -> Result<TradeRecord, TradeError> {
        self.repo
            .get(trade_id)
            .await?
            .ok_or_else(|| TradeError::NotFound(trade_id.to_string()))
    }

    /// Move the trade axis to `to`
    pub async fn advance(&self, trade_id: &str, to: TradeStatus) -> Result<TradeRecord, TradeError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trade = self.get(trade_id).await?;
            if let Err(e) = validate(trade.status, to) {
                warn!(trade_id, from = %trade.status, %to, "Trade transition rejected");
                return Err(e.into());
            }
            if self.repo.update_status_if(trade_id, trade.status, to).await? {
                info!(trade_id, from = %trade.status, %to, "Trade status advanced");
                return self.get(trade_id).await;
            }
        }
        Err(self.contended(trade_id, to))
    }

    /// Move the escrow axis to `to`
    pub async fn advance_escrow(
        &self,
        trade_id: &str,
        to: EscrowStatus,
    ) -> Result<TradeRecord, TradeError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let trade = self.get(trade_id).await?;
            if let Err(e) = validate(trade.escrow_status, to) {
                warn!(trade_id, from = %trade.escrow_status, %to, "Escrow transition rejected");
                return Err(e.into());
            }
            if self
                .repo
                .update_escrow_status_if(trade_id, trade.escrow_status, to)
                .await?
            {
                info!(trade_id, from = %trade.escrow_status, %to, "Escrow status advanced");
                return self.get(trade_id).await;
            }
        }
        Err(self.contended(trade_id, to))
    }

    /// Move the escrow axis on behalf of an API caller.
    ///
    /// `crypto_received` is reached only when a matching deposit settles
    /// through reconciliation, never on request.
    pub async fn advance_escrow_manual(
        &self,
        trade_id: &str,
        to: EscrowStatus,
    ) -> Result<TradeRecord, TradeError> {
        if to == EscrowStatus::CryptoReceived {
            warn!(trade_id, %to, "Manual escrow transition refused, deposits drive this status");
            return Err(TradeError::ReservedTransition(format!(
                "escrow status {} is set by deposit reconciliation",
                to
            )));
        }
        self.advance_escrow(trade_id, to).await
    }

    /// Leave `disputed` at an explicitly chosen status.
    ///
    /// The resume status is never inferred: whoever settled the dispute
    /// names it.
    pub async fn resolve_dispute(
        &self,
        trade_id: &str,
        resolution: DisputeResolution,
    ) -> Result<TradeRecord, TradeError> {
        let trade = self.get(trade_id).await?;

        let applied = match resolution {
            DisputeResolution::Trade(resume_to) => {
                if resume_to == TradeStatus::Disputed {
                    return Err(TradeError::InvalidResolution("cannot resume into disputed".into()));
                }
                if trade.status != TradeStatus::Disputed {
                    return Err(not_disputed(trade.status, resume_to).into());
                }
                self.repo
                    .update_status_if(trade_id, TradeStatus::Disputed, resume_to)
                    .await?
            }
            DisputeResolution::Escrow(resume_to) => {
                if resume_to == EscrowStatus::Disputed {
                    return Err(TradeError::InvalidResolution("cannot resume into disputed".into()));
                }
                if trade.escrow_status != EscrowStatus::Disputed {
                    return Err(not_disputed(trade.escrow_status, resume_to).into());
                }
                self.repo
                    .update_escrow_status_if(trade_id, EscrowStatus::Disputed, resume_to)
                    .await?
            }
        };

        if !applied {
            let current = self.get(trade_id).await?;
            warn!(trade_id, ?resolution, status = %current.status, escrow_status = %current.escrow_status, "Dispute resolution lost a concurrent update");
            return Err(TradeError::InvalidResolution(format!(
                "trade {} changed while resolving",
                trade_id
            )));
        }

        info!(trade_id, ?resolution, "Dispute resolved");
        self.get(trade_id).await
    }

    fn contended<S: Lifecycle>(&self, trade_id: &str, to: S) -> TradeError {
        warn!(trade_id, %to, attempts = MAX_CAS_ATTEMPTS, "Transition abandoned after repeated contention");
        InvalidTransition {
            axis: S::AXIS,
            from: "contended".to_string(),
            to: to.to_string(),
        }
        .into()
    }
}

fn not_disputed<S: Lifecycle>(current: S, resume_to: S) -> InvalidTransition {
    InvalidTransition {
        axis: S::AXIS,
        from: current.to_string(),
        to: resume_to.to_string(),
    }
}
