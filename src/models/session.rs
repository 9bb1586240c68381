use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::user::Identity;

/// Token pair carried by the session cookies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access_token: String,
    pub refresh_token: String,
}

/// A session as handed out by the backend at sign-in or refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: Identity,
    pub tokens: SessionTokens,
}

/// Outcome of verifying the cookie tokens. `refreshed` is set when the backend
/// rotated the tokens and the new pair has to reach the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCheck {
    pub identity: Identity,
    pub refreshed: Option<SessionTokens>,
}

/// Who is making a data call. Row access is scoped to `identity.id`, and the
/// hosted backend checks its row policies against `access_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub identity: Identity,
    pub access_token: String,
}

impl Caller {
    pub fn user_id(&self) -> &str {
        &self.identity.id
    }
}

/// Row of the local backend's `sessions` table.
#[derive(Debug, Clone, FromRow)]
pub struct StoredSession {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}
