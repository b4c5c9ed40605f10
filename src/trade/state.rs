//! Trade and escrow status definitions
//!
//! Two orthogonal axes are tracked per trade. Each status carries its own
//! adjacency list; anything not listed is an invalid transition.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which status axis a transition applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionAxis {
    Trade,
    Escrow,
}

impl TransitionAxis {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionAxis::Trade => "trade",
            TransitionAxis::Escrow => "escrow",
        }
    }
}

impl fmt::Display for TransitionAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A status enumeration with an explicit adjacency table
pub trait Lifecycle: Copy + Eq + fmt::Display + Send + Sync + 'static {
    const AXIS: TransitionAxis;

    /// Legal next states
    fn successors(&self) -> &'static [Self];

    fn is_terminal(&self) -> bool;

    fn as_str(&self) -> &'static str;

    #[inline]
    fn can_transition_to(&self, to: Self) -> bool {
        self.successors().contains(&to)
    }
}

// ============================================================================
// Trade axis
// ============================================================================

/// Trade status
///
/// ```text
/// PENDING_ACCEPTANCE → ACCEPTED → PAYMENT_SENT → CASH_DELIVERED  ─┐
///                                              → CRYPTO_RELEASED ─┴→ COMPLETED
/// any non-terminal → CANCELLED | DISPUTED;  DISPUTED → CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    PendingAcceptance,
    Accepted,
    PaymentSent,
    CashDelivered,
    CryptoReleased,
    Completed,
    Cancelled,
    Disputed,
}

impl Lifecycle for TradeStatus {
    const AXIS: TransitionAxis = TransitionAxis::Trade;

    fn successors(&self) -> &'static [Self] {
        use TradeStatus::*;
        match self {
            PendingAcceptance => &[Accepted, Cancelled, Disputed],
            Accepted => &[PaymentSent, Cancelled, Disputed],
            PaymentSent => &[CashDelivered, CryptoReleased, Cancelled, Disputed],
            CashDelivered | CryptoReleased => &[Completed, Cancelled, Disputed],
            // Leaving a dispute other than by cancellation is an explicit resolution
            Disputed => &[Cancelled],
            Completed | Cancelled => &[],
        }
    }

    #[inline]
    fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Completed | TradeStatus::Cancelled)
    }

    fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::PendingAcceptance => "pending_acceptance",
            TradeStatus::Accepted => "accepted",
            TradeStatus::PaymentSent => "payment_sent",
            TradeStatus::CashDelivered => "cash_delivered",
            TradeStatus::CryptoReleased => "crypto_released",
            TradeStatus::Completed => "completed",
            TradeStatus::Cancelled => "cancelled",
            TradeStatus::Disputed => "disputed",
        }
    }
}

impl TradeStatus {
    pub const ALL: [TradeStatus; 8] = [
        TradeStatus::PendingAcceptance,
        TradeStatus::Accepted,
        TradeStatus::PaymentSent,
        TradeStatus::CashDelivered,
        TradeStatus::CryptoReleased,
        TradeStatus::Completed,
        TradeStatus::Cancelled,
        TradeStatus::Disputed,
    ];
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Lifecycle::as_str(self))
    }
}

impl FromStr for TradeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TradeStatus::ALL
            .into_iter()
            .find(|st| Lifecycle::as_str(st) == s)
            .ok_or_else(|| format!("unknown trade status: {}", s))
    }
}

// ============================================================================
// Escrow axis
// ============================================================================

/// Escrow status
///
/// ```text
/// PENDING → CRYPTO_RECEIVED → CASH_RECEIVED → COMPLETED
/// any non-completed → DISPUTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    CryptoReceived,
    CashReceived,
    Completed,
    Disputed,
}

impl Lifecycle for EscrowStatus {
    const AXIS: TransitionAxis = TransitionAxis::Escrow;

    fn successors(&self) -> &'static [Self] {
        use EscrowStatus::*;
        match self {
            Pending => &[CryptoReceived, Disputed],
            CryptoReceived => &[CashReceived, Disputed],
            CashReceived => &[Completed, Disputed],
            Completed | Disputed => &[],
        }
    }

    #[inline]
    fn is_terminal(&self) -> bool {
        matches!(self, EscrowStatus::Completed)
    }

    fn as_str(&self) -> &'static str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::CryptoReceived => "crypto_received",
            EscrowStatus::CashReceived => "cash_received",
            EscrowStatus::Completed => "completed",
            EscrowStatus::Disputed => "disputed",
        }
    }
}

impl EscrowStatus {
    pub const ALL: [EscrowStatus; 5] = [
        EscrowStatus::Pending,
        EscrowStatus::CryptoReceived,
        EscrowStatus::CashReceived,
        EscrowStatus::Completed,
        EscrowStatus::Disputed,
    ];
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Lifecycle::as_str(self))
    }
}

impl FromStr for EscrowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EscrowStatus::ALL
            .into_iter()
            .find(|st| Lifecycle::as_str(st) == s)
            .ok_or_else(|| format!("unknown escrow status: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_happy_paths() {
        use TradeStatus::*;
        assert!(PendingAcceptance.can_transition_to(Accepted));
        assert!(Accepted.can_transition_to(PaymentSent));
        assert!(PaymentSent.can_transition_to(CashDelivered));
        assert!(PaymentSent.can_transition_to(CryptoReleased));
        assert!(CashDelivered.can_transition_to(Completed));
        assert!(CryptoReleased.can_transition_to(Completed));
    }

    #[test]
    fn test_trade_no_backward_or_skipping() {
        use TradeStatus::*;
        assert!(!Accepted.can_transition_to(PendingAcceptance));
        assert!(!PendingAcceptance.can_transition_to(PaymentSent));
        assert!(!PaymentSent.can_transition_to(Completed));
        assert!(!CashDelivered.can_transition_to(CryptoReleased));
    }

    #[test]
    fn test_cancel_and_dispute_from_every_non_terminal() {
        for st in TradeStatus::ALL {
            if st.is_terminal() || st == TradeStatus::Disputed {
                continue;
            }
            assert!(st.can_transition_to(TradeStatus::Cancelled), "{} -> cancelled", st);
            assert!(st.can_transition_to(TradeStatus::Disputed), "{} -> disputed", st);
        }
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        for st in TradeStatus::ALL {
            assert_eq!(st.is_terminal(), st.successors().is_empty() && st != TradeStatus::Disputed);
        }
        assert!(EscrowStatus::Completed.successors().is_empty());
    }

    #[test]
    fn test_disputed_only_cancels() {
        assert_eq!(TradeStatus::Disputed.successors(), &[TradeStatus::Cancelled]);
        assert!(!TradeStatus::Disputed.is_terminal());
        assert!(EscrowStatus::Disputed.successors().is_empty());
    }

    #[test]
    fn test_escrow_sequence() {
        use EscrowStatus::*;
        assert!(Pending.can_transition_to(CryptoReceived));
        assert!(CryptoReceived.can_transition_to(CashReceived));
        assert!(CashReceived.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(CashReceived));
        assert!(!CryptoReceived.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Disputed));
        for st in [Pending, CryptoReceived, CashReceived] {
            assert!(st.can_transition_to(Disputed));
        }
    }

    #[test]
    fn test_string_roundtrip_and_serde() {
        for st in TradeStatus::ALL {
            assert_eq!(st.to_string().parse::<TradeStatus>().unwrap(), st);
        }
        for st in EscrowStatus::ALL {
            assert_eq!(st.to_string().parse::<EscrowStatus>().unwrap(), st);
        }
        assert_eq!(
            serde_json::to_string(&TradeStatus::PendingAcceptance).unwrap(),
            "\"pending_acceptance\""
        );
        assert!("bogus".parse::<TradeStatus>().is_err());
    }
}
