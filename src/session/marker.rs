//! Last-prompt marker: the day a user was last offered recovery

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::SessionError;
use super::scope::KvScope;
use crate::core_types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPromptMarker {
    pub user_id: UserId,
    pub shown_on: NaiveDate,
}

pub struct MarkerStore {
    scope: Arc<dyn KvScope>,
}

impl MarkerStore {
    pub fn new(scope: Arc<dyn KvScope>) -> Self {
        Self { scope }
    }

    fn key(user_id: &str) -> String {
        format!("recovery.last_prompt.{}", user_id)
    }

    /// An unreadable marker counts as absent
    pub fn read(&self, user_id: &str) -> Result<Option<LastPromptMarker>, SessionError> {
        let Some(raw) = self.scope.read(&Self::key(user_id))? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Unreadable recovery marker ignored");
                Ok(None)
            }
        }
    }

    pub fn write(&self, marker: &LastPromptMarker) -> Result<(), SessionError> {
        let raw = serde_json::to_string(marker).map_err(|e| SessionError::Scope(e.to_string()))?;
        self.scope.write(&Self::key(&marker.user_id), &raw)
    }

    pub fn clear(&self, user_id: &str) -> Result<(), SessionError> {
        self.scope.remove(&Self::key(user_id))
    }
}
