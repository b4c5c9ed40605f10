//! Session Store
//!
//! Each session type is kept as a JSON array under `sessions.{type}` in both
//! tiers. Reads prefer the primary tier and fall back to the durable one
//! only when the primary holds nothing for that type. A record that fails
//! to parse is dropped with a warning; the rest of the list is still served.

use chrono::Duration;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::SessionError;
use super::model::{Session, SessionPayload, SessionType};
use super::scope::KvScope;
use crate::core_types::Clock;

pub struct SessionStore {
    primary: Arc<dyn KvScope>,
    durable: Arc<dyn KvScope>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(
        primary: Arc<dyn KvScope>,
        durable: Arc<dyn KvScope>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            primary,
            durable,
            clock,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Build a fresh session stamped with the store's clock and TTL
    pub fn create(&self, id: &str, step: u32, payload: SessionPayload) -> Result<Session, SessionError> {
        Session::new(id, step, payload, self.clock.now(), self.ttl)
    }

    /// Write to both tiers, replacing any session with the same id
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let record = session.to_json()?;
        for scope in [&self.durable, &self.primary] {
            for kind in SessionType::ALL {
                let mut entries = read_entries(scope.as_ref(), kind)?;
                let before = entries.len();
                entries.retain(|v| entry_id(v) != Some(session.id.as_str()));
                if kind == session.session_type() {
                    entries.push(record.clone());
                } else if entries.len() == before {
                    continue;
                }
                write_entries(scope.as_ref(), kind, &entries)?;
            }
        }
        debug!(session_id = %session.id, session_type = %session.session_type(), step = session.step, "Session saved");
        Ok(())
    }

    /// Every live session of one type
    pub fn get(&self, kind: SessionType) -> Result<Vec<Session>, SessionError> {
        let now = self.clock.now();
        let mut entries = read_entries(self.primary.as_ref(), kind)?;
        if entries.is_empty() {
            entries = read_entries(self.durable.as_ref(), kind)?;
        }

        Ok(entries
            .into_iter()
            .filter_map(|v| parse_or_discard(kind, v))
            .filter(|s| s.is_live(now, self.ttl))
            .collect())
    }

    /// Live sessions across all four types
    pub fn list_live(&self) -> Result<Vec<Session>, SessionError> {
        let mut all = Vec::new();
        for kind in SessionType::ALL {
            all.extend(self.get(kind)?);
        }
        Ok(all)
    }

    /// A live session by id.
    ///
    /// Unlike `get`, a matching record with an unknown type is reported as
    /// `UnsupportedType` instead of being skipped.
    pub fn load(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let now = self.clock.now();
        for kind in SessionType::ALL {
            let mut entries = read_entries(self.primary.as_ref(), kind)?;
            if entries.is_empty() {
                entries = read_entries(self.durable.as_ref(), kind)?;
            }
            for v in entries.into_iter().filter(|v| entry_id(v) == Some(id)) {
                match Session::from_json(v) {
                    Ok(s) if s.session_type() != kind => {
                        warn!(session_id = id, stored_under = %kind, "Session stored under wrong type, discarded");
                    }
                    Ok(s) if s.is_live(now, self.ttl) => return Ok(Some(s)),
                    Ok(_) => {}
                    Err(e @ SessionError::UnsupportedType(_)) => return Err(e),
                    Err(e) => warn!(session_id = id, error = %e, "Corrupt session discarded"),
                }
            }
        }
        Ok(None)
    }

    /// Advance a live session's step, optionally replacing its data.
    /// The creation timestamp is kept, so updating never extends its life.
    pub fn update(
        &self,
        id: &str,
        step: u32,
        payload: Option<SessionPayload>,
    ) -> Result<Session, SessionError> {
        if step < 1 {
            return Err(SessionError::InvalidStep(step as i64));
        }
        let mut session = self
            .load(id)?
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if let Some(payload) = payload {
            if payload.session_type() != session.session_type() {
                return Err(SessionError::UnsupportedType(format!(
                    "cannot change {} session to {}",
                    session.session_type(),
                    payload.session_type()
                )));
            }
            session.payload = payload;
        }
        session.step = step;
        self.save(&session)?;
        Ok(session)
    }

    /// Remove a session from both tiers
    pub fn remove(&self, id: &str) -> Result<(), SessionError> {
        for scope in [&self.primary, &self.durable] {
            for kind in SessionType::ALL {
                let mut entries = read_entries(scope.as_ref(), kind)?;
                let before = entries.len();
                entries.retain(|v| entry_id(v) != Some(id));
                if entries.len() != before {
                    write_entries(scope.as_ref(), kind, &entries)?;
                }
            }
        }
        debug!(session_id = id, "Session removed");
        Ok(())
    }

    /// Drop expired and unreadable records from both tiers.
    /// Returns how many distinct sessions were removed.
    pub fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = self.clock.now();
        let mut removed: HashSet<String> = HashSet::new();
        let mut unreadable = 0;

        for scope in [&self.primary, &self.durable] {
            for kind in SessionType::ALL {
                let entries = read_entries(scope.as_ref(), kind)?;
                let before = entries.len();
                let kept: Vec<Value> = entries
                    .into_iter()
                    .filter(|v| match Session::from_json(v.clone()) {
                        Ok(s) if s.is_live(now, self.ttl) => true,
                        Ok(s) => {
                            removed.insert(s.id);
                            false
                        }
                        Err(_) => {
                            match entry_id(v) {
                                Some(id) => {
                                    removed.insert(id.to_string());
                                }
                                None => unreadable += 1,
                            }
                            false
                        }
                    })
                    .collect();
                if kept.len() != before {
                    write_entries(scope.as_ref(), kind, &kept)?;
                }
            }
        }

        let count = removed.len() + unreadable;
        if count > 0 {
            debug!(count, "Expired sessions purged");
        }
        Ok(count)
    }

    /// Forget every session in both tiers
    pub fn clear_all(&self) -> Result<(), SessionError> {
        for scope in [&self.primary, &self.durable] {
            for kind in SessionType::ALL {
                scope.remove(&kind.storage_key())?;
            }
        }
        Ok(())
    }

    /// Logical session end: the ephemeral tier is wiped, durable copies stay
    pub fn end_primary_scope(&self) -> Result<(), SessionError> {
        self.primary.clear()
    }
}

fn entry_id(v: &Value) -> Option<&str> {
    v.get("id").and_then(Value::as_str)
}

fn parse_or_discard(kind: SessionType, v: Value) -> Option<Session> {
    let id = entry_id(&v).unwrap_or("?").to_string();
    match Session::from_json(v) {
        Ok(s) if s.session_type() == kind => Some(s),
        Ok(_) => {
            warn!(session_id = %id, stored_under = %kind, "Session stored under wrong type, discarded");
            None
        }
        Err(e) => {
            warn!(session_id = %id, error = %e, "Corrupt session discarded");
            None
        }
    }
}

fn read_entries(scope: &dyn KvScope, kind: SessionType) -> Result<Vec<Value>, SessionError> {
    let Some(raw) = scope.read(&kind.storage_key())? else {
        return Ok(Vec::new());
    };
    match serde_json::from_str::<Vec<Value>>(&raw) {
        Ok(entries) => Ok(entries),
        Err(e) => {
            warn!(key = %kind.storage_key(), error = %e, "Session list unreadable, discarded");
            Ok(Vec::new())
        }
    }
}

fn write_entries(scope: &dyn KvScope, kind: SessionType, entries: &[Value]) -> Result<(), SessionError> {
    if entries.is_empty() {
        return scope.remove(&kind.storage_key());
    }
    let raw = serde_json::to_string(entries).map_err(|e| SessionError::Scope(e.to_string()))?;
    scope.write(&kind.storage_key(), &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Asset, ManualClock};
    use crate::session::model::{CreditPurchaseData, CryptoSellData};
    use crate::session::scope::MemoryScope;
    use chrono::Utc;
    use serde_json::json;

    struct Fixture {
        clock: Arc<ManualClock>,
        primary: Arc<MemoryScope>,
        durable: Arc<MemoryScope>,
        store: SessionStore,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let primary = Arc::new(MemoryScope::new());
        let durable = Arc::new(MemoryScope::new());
        let store = SessionStore::new(primary.clone(), durable.clone(), clock.clone(), Duration::hours(24));
        Fixture {
            clock,
            primary,
            durable,
            store,
        }
    }

    fn credit(credits: i64) -> SessionPayload {
        SessionPayload::CreditPurchase(CreditPurchaseData {
            credits,
            amount: "0.01".parse().unwrap(),
            asset: Asset::Btc,
            payment_address: None,
            obligation_id: None,
        })
    }

    fn sell() -> SessionPayload {
        SessionPayload::CryptoSell(CryptoSellData {
            asset: Asset::Usdt,
            amount_crypto: "10".parse().unwrap(),
            payment_method: Some("bank".into()),
            bank_account: None,
        })
    }

    #[test]
    fn test_save_overwrites_same_id() {
        let f = fixture();
        f.store.save(&f.store.create("s1", 1, credit(10)).unwrap()).unwrap();
        f.store.save(&f.store.create("s1", 2, credit(20)).unwrap()).unwrap();

        let sessions = f.store.get(SessionType::CreditPurchase).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].step, 2);
    }

    #[test]
    fn test_save_moves_id_across_types() {
        let f = fixture();
        f.store.save(&f.store.create("s1", 1, credit(10)).unwrap()).unwrap();
        f.store.save(&f.store.create("s1", 1, sell()).unwrap()).unwrap();

        assert!(f.store.get(SessionType::CreditPurchase).unwrap().is_empty());
        assert_eq!(f.store.get(SessionType::CryptoSell).unwrap().len(), 1);
    }

    #[test]
    fn test_expired_sessions_hidden() {
        let f = fixture();
        f.store.save(&f.store.create("s1", 2, credit(10)).unwrap()).unwrap();
        f.clock.advance(Duration::hours(24) + Duration::seconds(1));

        assert!(f.store.get(SessionType::CreditPurchase).unwrap().is_empty());
        assert!(f.store.load("s1").unwrap().is_none());
        assert_eq!(f.store.purge_expired().unwrap(), 1);
        assert!(f.durable.is_empty());
        assert!(f.primary.is_empty());
    }

    #[test]
    fn test_durable_tier_used_when_primary_empty() {
        let f = fixture();
        f.store.save(&f.store.create("s1", 1, credit(10)).unwrap()).unwrap();
        f.store.end_primary_scope().unwrap();
        assert!(f.primary.is_empty());

        let sessions = f.store.get(SessionType::CreditPurchase).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "s1");
    }

    #[test]
    fn test_corrupt_record_discarded_others_served() {
        let f = fixture();
        f.store.save(&f.store.create("good", 1, credit(10)).unwrap()).unwrap();

        let mut entries: Vec<Value> =
            serde_json::from_str(&f.primary.read("sessions.credit_purchase").unwrap().unwrap()).unwrap();
        entries.push(json!({"id":"bad","type":"credit_purchase","step":1,"data":{"credits":"x"},"timestamp":0,"expiresAt":0}));
        entries.push(json!(42));
        f.primary
            .write("sessions.credit_purchase", &serde_json::to_string(&entries).unwrap())
            .unwrap();

        let sessions = f.store.get(SessionType::CreditPurchase).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, "good");
    }

    #[test]
    fn test_load_reports_unsupported_type() {
        let f = fixture();
        let now = f.clock.now().timestamp_millis();
        let entries = json!([{"id":"x1","type":"loan","step":1,"data":{},"timestamp":now,"expiresAt":now}]);
        f.primary
            .write("sessions.escrow", &entries.to_string())
            .unwrap();

        assert_eq!(
            f.store.load("x1"),
            Err(SessionError::UnsupportedType("loan".into()))
        );
        assert!(f.store.get(SessionType::Escrow).unwrap().is_empty());
    }

    #[test]
    fn test_update_keeps_timestamp() {
        let f = fixture();
        let created = f.store.create("s1", 1, credit(10)).unwrap();
        f.store.save(&created).unwrap();
        f.clock.advance(Duration::hours(2));

        let updated = f.store.update("s1", 3, Some(credit(30))).unwrap();
        assert_eq!(updated.step, 3);
        assert_eq!(updated.timestamp, created.timestamp);
        assert!(matches!(
            f.store.update("s1", 4, Some(sell())),
            Err(SessionError::UnsupportedType(_))
        ));
        assert_eq!(f.store.update("nope", 2, None), Err(SessionError::NotFound("nope".into())));
        assert_eq!(f.store.update("s1", 0, None), Err(SessionError::InvalidStep(0)));
    }

    #[test]
    fn test_remove_and_clear_all() {
        let f = fixture();
        f.store.save(&f.store.create("s1", 1, credit(10)).unwrap()).unwrap();
        f.store.save(&f.store.create("s2", 1, sell()).unwrap()).unwrap();

        f.store.remove("s1").unwrap();
        assert_eq!(f.store.list_live().unwrap().len(), 1);

        f.store.clear_all().unwrap();
        assert!(f.store.list_live().unwrap().is_empty());
    }
}
