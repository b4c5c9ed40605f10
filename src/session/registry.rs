//! Per-user session wiring
//!
//! Each user gets an ephemeral in-memory primary tier and a durable file
//! under `sessions.data_dir`, opened on first use and kept for the life of
//! the process.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::SessionError;
use super::marker::MarkerStore;
use super::recovery::SessionRecoveryCoordinator;
use super::scope::{FileScope, MemoryScope};
use super::store::SessionStore;
use crate::config::SessionConfig;
use crate::core_types::{Clock, UserId};

/// One user's store and recovery coordinator
pub struct UserSessions {
    pub store: Arc<SessionStore>,
    pub recovery: SessionRecoveryCoordinator,
}

pub struct SessionRegistry {
    data_dir: PathBuf,
    ttl: chrono::Duration,
    safe_routes: Vec<String>,
    clock: Arc<dyn Clock>,
    users: DashMap<UserId, Arc<UserSessions>>,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            data_dir: PathBuf::from(&config.data_dir),
            ttl: config.ttl(),
            safe_routes: config.safe_routes.clone(),
            clock,
            users: DashMap::new(),
        }
    }

    /// Sessions of `user_id`, opening the durable file on first access
    pub fn for_user(&self, user_id: &str) -> Result<Arc<UserSessions>, SessionError> {
        if user_id.trim().is_empty() {
            return Err(SessionError::Corrupt("empty user id".into()));
        }
        if let Some(existing) = self.users.get(user_id) {
            return Ok(existing.clone());
        }

        let opened = Arc::new(self.open(user_id)?);
        let entry = self
            .users
            .entry(user_id.to_string())
            .or_insert(opened)
            .clone();
        Ok(entry)
    }

    fn open(&self, user_id: &str) -> Result<UserSessions, SessionError> {
        let durable = Arc::new(FileScope::open(&self.data_dir, user_id)?);
        debug!(user_id, path = %durable.path().display(), "Session scope opened");
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryScope::new()),
            durable.clone(),
            self.clock.clone(),
            self.ttl,
        ));
        let recovery = SessionRecoveryCoordinator::new(
            user_id,
            store.clone(),
            MarkerStore::new(durable),
            self.safe_routes.clone(),
        );
        Ok(UserSessions { store, recovery })
    }

    /// Purge expired sessions of every user seen by this process
    pub fn purge_expired(&self) -> usize {
        let users: Vec<(UserId, Arc<UserSessions>)> = self
            .users
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut purged = 0;
        for (user_id, sessions) in users {
            match sessions.store.purge_expired() {
                Ok(n) => purged += n,
                Err(e) => warn!(user_id = %user_id, error = %e, "Session purge failed"),
            }
        }
        purged
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{Asset, ManualClock};
    use crate::session::model::{CreditPurchaseData, SessionPayload, SessionType};
    use chrono::{Duration, Utc};

    struct TempDir(PathBuf);

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn registry(clock: Arc<ManualClock>) -> (TempDir, SessionRegistry) {
        let dir = std::env::temp_dir().join(format!("escrow_hub_registry_{}", uuid::Uuid::new_v4().simple()));
        let config = SessionConfig {
            ttl_hours: 24,
            safe_routes: vec!["/home".to_string()],
            data_dir: dir.to_string_lossy().into_owned(),
        };
        (TempDir(dir), SessionRegistry::new(&config, clock))
    }

    fn credits() -> SessionPayload {
        SessionPayload::CreditPurchase(CreditPurchaseData {
            credits: 100,
            amount: "0.01".parse().unwrap(),
            asset: Asset::Btc,
            payment_address: None,
            obligation_id: None,
        })
    }

    #[test]
    fn test_same_user_shares_store() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (_dir, registry) = registry(clock);
        let a = registry.for_user("u1").unwrap();
        let b = registry.for_user("u1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        registry.for_user("u2").unwrap();
        assert_eq!(registry.user_count(), 2);
        assert!(registry.for_user(" ").is_err());
    }

    #[test]
    fn test_durable_tier_lives_under_data_dir() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (dir, registry) = registry(clock.clone());
        let user = registry.for_user("u1").unwrap();
        let session = user.store.create("s1", 1, credits()).unwrap();
        user.store.save(&session).unwrap();
        assert!(dir.0.join("u1.json").exists());

        // a fresh registry over the same directory sees the durable copy
        let config = SessionConfig {
            ttl_hours: 24,
            safe_routes: vec!["/home".to_string()],
            data_dir: dir.0.to_string_lossy().into_owned(),
        };
        let reopened = SessionRegistry::new(&config, clock);
        let found = reopened.for_user("u1").unwrap().store.get(SessionType::CreditPurchase).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "s1");
    }

    #[test]
    fn test_purge_covers_every_user() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (_dir, registry) = registry(clock.clone());
        for user_id in ["u1", "u2"] {
            let user = registry.for_user(user_id).unwrap();
            let session = user.store.create("s1", 1, credits()).unwrap();
            user.store.save(&session).unwrap();
        }
        clock.advance(Duration::hours(25));
        assert_eq!(registry.purge_expired(), 2);
    }
}
