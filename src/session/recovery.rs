//! Session Recovery Coordinator
//!
//! Offers interrupted flows back to a user on safe entry routes, at most
//! once per UTC calendar day. Restoring yields a `ResumeIntent` addressed
//! to the single flow that owns the session type.

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use super::error::SessionError;
use super::marker::{LastPromptMarker, MarkerStore};
use super::model::{Session, SessionPayload};
use super::store::SessionStore;
use crate::core_types::UserId;

/// Route of the flow that resumes a payload
pub fn resume_route(payload: &SessionPayload) -> &'static str {
    match payload {
        SessionPayload::CreditPurchase(_) => "/credits-purchase",
        SessionPayload::CryptoBuy(_) => "/buy-crypto-flow",
        SessionPayload::CryptoSell(_) => "/sell-crypto-flow",
        SessionPayload::Escrow(_) => "/escrow-flow",
    }
}

/// Typed "I am resuming" message carrying the validated session
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeIntent {
    pub route: &'static str,
    pub session: Session,
}

#[derive(Serialize)]
struct ResumeIntentWire<'a> {
    route: &'a str,
    session: Value,
}

impl ResumeIntent {
    /// `{route, session: {id, type, step, data, timestamp, expiresAt}}`
    pub fn to_json(&self) -> Result<Value, SessionError> {
        serde_json::to_value(ResumeIntentWire {
            route: self.route,
            session: self.session.to_json()?,
        })
        .map_err(|e| SessionError::Corrupt(e.to_string()))
    }
}

pub struct SessionRecoveryCoordinator {
    user_id: UserId,
    store: Arc<SessionStore>,
    markers: MarkerStore,
    safe_routes: Vec<String>,
}

impl SessionRecoveryCoordinator {
    pub fn new(
        user_id: &str,
        store: Arc<SessionStore>,
        markers: MarkerStore,
        safe_routes: Vec<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            store,
            markers,
            safe_routes,
        }
    }

    /// Live sessions to offer on `route`, or `None` when no prompt is due.
    ///
    /// Storage failures degrade to `None`: the user starts fresh instead of
    /// being blocked.
    pub fn maybe_present_recovery(&self, route: &str) -> Option<Vec<Session>> {
        if !self.safe_routes.iter().any(|r| r == route) {
            return None;
        }

        let today = self.store.clock().now().date_naive();
        match self.markers.read(&self.user_id) {
            Ok(Some(marker)) if marker.shown_on == today => return None,
            Ok(_) => {}
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Recovery marker unavailable, skipping prompt");
                return None;
            }
        }

        let sessions = match self.store.list_live() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Session lookup failed, skipping prompt");
                return None;
            }
        };
        if sessions.is_empty() {
            return None;
        }

        let marker = LastPromptMarker {
            user_id: self.user_id.clone(),
            shown_on: today,
        };
        if let Err(e) = self.markers.write(&marker) {
            // prompt anyway; worst case the user is asked again today
            warn!(user_id = %self.user_id, error = %e, "Failed to record recovery prompt");
        }

        info!(user_id = %self.user_id, route, count = sessions.len(), "Offering session recovery");
        Some(sessions)
    }

    /// Resolve a session into the intent its owning flow consumes
    pub fn restore(&self, session_id: &str) -> Result<ResumeIntent, SessionError> {
        let session = match self.store.load(session_id) {
            Ok(Some(session)) => session,
            Ok(None) => return Err(SessionError::NotFound(session_id.to_string())),
            Err(e) => {
                warn!(user_id = %self.user_id, session_id, error = %e, "Unable to resume session");
                return Err(e);
            }
        };

        let route = resume_route(&session.payload);
        info!(user_id = %self.user_id, session_id, route, step = session.step, "Session restored");
        Ok(ResumeIntent { route, session })
    }

    /// Remove only the dismissed session
    pub fn dismiss(&self, session_id: &str) -> Result<(), SessionError> {
        self.store.remove(session_id)?;
        info!(user_id = %self.user_id, session_id, "Session dismissed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Asset, Clock, ManualClock};
    use crate::session::model::{CreditPurchaseData, CryptoBuyData, EscrowData, EscrowMode, SessionType};
    use crate::session::scope::{KvScope, MemoryScope};
    use chrono::{Duration, TimeZone, Utc};

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<SessionStore>,
        durable: Arc<MemoryScope>,
        coordinator: SessionRecoveryCoordinator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()));
        let durable = Arc::new(MemoryScope::new());
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryScope::new()),
            durable.clone(),
            clock.clone(),
            Duration::hours(24),
        ));
        let coordinator = SessionRecoveryCoordinator::new(
            "u1",
            store.clone(),
            MarkerStore::new(durable.clone()),
            vec!["/home".to_string()],
        );
        Fixture {
            clock,
            store,
            durable,
            coordinator,
        }
    }

    fn credit() -> SessionPayload {
        SessionPayload::CreditPurchase(CreditPurchaseData {
            credits: 100,
            amount: "0.01".parse().unwrap(),
            asset: Asset::Btc,
            payment_address: None,
            obligation_id: None,
        })
    }

    fn buy() -> SessionPayload {
        SessionPayload::CryptoBuy(CryptoBuyData {
            asset: Asset::Eth,
            amount_crypto: "0.5".parse().unwrap(),
            amount_fiat: None,
            merchant_id: Some("m1".into()),
            escrow_address: None,
        })
    }

    fn save(f: &Fixture, id: &str, payload: SessionPayload) {
        f.store.save(&f.store.create(id, 2, payload).unwrap()).unwrap();
    }

    #[test]
    fn test_only_safe_routes() {
        let f = fixture();
        save(&f, "s1", credit());
        assert!(f.coordinator.maybe_present_recovery("/settings").is_none());
        assert_eq!(f.coordinator.maybe_present_recovery("/home").unwrap().len(), 1);
    }

    #[test]
    fn test_once_per_day() {
        let f = fixture();
        save(&f, "s1", credit());
        assert!(f.coordinator.maybe_present_recovery("/home").is_some());
        assert!(f.coordinator.maybe_present_recovery("/home").is_none());

        // next calendar day, session still live
        f.clock.set(Utc.with_ymd_and_hms(2026, 5, 5, 0, 30, 0).unwrap());
        assert!(f.coordinator.maybe_present_recovery("/home").is_some());
    }

    #[test]
    fn test_no_sessions_does_not_consume_the_day() {
        let f = fixture();
        assert!(f.coordinator.maybe_present_recovery("/home").is_none());
        save(&f, "s1", credit());
        assert!(f.coordinator.maybe_present_recovery("/home").is_some());
    }

    #[test]
    fn test_stale_session_not_offered() {
        let f = fixture();
        save(&f, "s1", credit());
        f.clock.advance(Duration::hours(25));
        assert!(f.coordinator.maybe_present_recovery("/home").is_none());
    }

    #[test]
    fn test_collects_all_types() {
        let f = fixture();
        save(&f, "s1", credit());
        save(&f, "s2", buy());
        let offered = f.coordinator.maybe_present_recovery("/home").unwrap();
        let mut types: Vec<SessionType> = offered.iter().map(Session::session_type).collect();
        types.sort_by_key(|t| t.as_str());
        assert_eq!(types, vec![SessionType::CreditPurchase, SessionType::CryptoBuy]);
    }

    #[test]
    fn test_restore_routes_by_type() {
        let f = fixture();
        save(&f, "s1", credit());
        save(
            &f,
            "e1",
            SessionPayload::Escrow(EscrowData {
                trade_id: "t1".into(),
                trade_amount: "1".parse().unwrap(),
                mode: EscrowMode::Buy,
                delivery_type: None,
                delivery_address: None,
                service_fee: None,
            }),
        );

        let intent = f.coordinator.restore("s1").unwrap();
        assert_eq!(intent.route, "/credits-purchase");
        assert_eq!(intent.session.step, 2);
        assert_eq!(intent.to_json().unwrap()["session"]["type"], "credit_purchase");

        assert_eq!(f.coordinator.restore("e1").unwrap().route, "/escrow-flow");
        assert_eq!(
            f.coordinator.restore("missing"),
            Err(SessionError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_restore_unknown_type_fails_safely() {
        let f = fixture();
        let now = f.clock.now().timestamp_millis();
        let raw = serde_json::json!([{"id":"x","type":"staking","step":1,"data":{},"timestamp":now,"expiresAt":now}]);
        f.durable.write("sessions.crypto_buy", &raw.to_string()).unwrap();

        assert_eq!(
            f.coordinator.restore("x"),
            Err(SessionError::UnsupportedType("staking".into()))
        );
    }

    #[test]
    fn test_dismiss_removes_only_that_session() {
        let f = fixture();
        save(&f, "s1", credit());
        save(&f, "s2", buy());

        f.coordinator.dismiss("s1").unwrap();
        let remaining = f.store.list_live().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "s2");
    }
}
