//! Tenant sessions.
//!
//! A session owns the target API URL and credentials. It is created by
//! init-session, shared read-only by all of its jobs, and lives until
//! explicit deletion or TTL expiry. Credentials only ever enter through the
//! session record; the engine carries no defaults.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::SessionId;

/// Credentials for the tenant API (sent as HTTP basic auth).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAuth {
    pub user_id: String,
    pub api_key: String,
}

/// A tenant session referenced by every job.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub api_url: String,
    pub auth: SessionAuth,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_user_id: Option<String>,
}

impl Session {
    pub fn new(
        session_id: impl Into<SessionId>,
        api_url: impl Into<String>,
        auth: SessionAuth,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            api_url: api_url.into(),
            auth,
            created_at: Utc::now(),
            owner_user_id: None,
        }
    }

    pub fn with_owner(mut self, owner_user_id: impl Into<String>) -> Self {
        self.owner_user_id = Some(owner_user_id.into());
        self
    }
}
