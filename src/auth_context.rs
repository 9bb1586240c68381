//! Client-side view of "who is signed in", kept current from backend auth
//! events.
//!
//! An [`AuthContext`] is an explicit value: whoever needs the current identity
//! and profile holds a clone or a [`watch::Receiver`] from
//! [`AuthContext::subscribe`].

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::{
    backend::{AuthEvent, Backend, BackendError},
    models::{
        session::{Caller, Session, SessionTokens},
        user::{Identity, Profile, UserRole},
    },
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthSnapshot {
    pub identity: Option<Identity>,
    pub profile: Option<Profile>,
}

impl AuthSnapshot {
    pub fn is_signed_in(&self) -> bool {
        self.identity.is_some()
    }

    pub fn role(&self) -> Option<UserRole> {
        self.profile.as_ref().map(Profile::role)
    }

    pub fn is_admin(&self) -> bool {
        self.role().is_some_and(|role| role.is_admin())
    }
}

#[derive(Clone)]
pub struct AuthContext {
    backend: Arc<dyn Backend>,
    snapshot: Arc<watch::Sender<AuthSnapshot>>,
}

impl AuthContext {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (snapshot, _) = watch::channel(AuthSnapshot::default());
        Self {
            backend,
            snapshot: Arc::new(snapshot),
        }
    }

    /// Resolves `tokens` (if any) and loads the matching profile row.
    pub async fn init(
        backend: Arc<dyn Backend>,
        tokens: Option<&SessionTokens>,
    ) -> Result<Self, BackendError> {
        let context = Self::new(backend);
        let Some(tokens) = tokens else {
            return Ok(context);
        };
        if let Some(check) = context.backend.verify_session(tokens).await? {
            let access_token = check
                .refreshed
                .as_ref()
                .map(|fresh| fresh.access_token.clone())
                .unwrap_or_else(|| tokens.access_token.clone());
            let caller = Caller {
                identity: check.identity,
                access_token,
            };
            context.load(caller).await;
        }
        Ok(context)
    }

    pub fn current(&self) -> AuthSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn clear(&self) {
        self.snapshot.send_replace(AuthSnapshot::default());
    }

    pub async fn apply(&self, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) | AuthEvent::TokenRefreshed(session) => {
                self.load(caller_for(session)).await;
            }
            AuthEvent::SignedOut { user_id } => {
                let ours = self
                    .snapshot
                    .borrow()
                    .identity
                    .as_ref()
                    .is_some_and(|identity| identity.id == user_id);
                if ours {
                    self.clear();
                }
            }
        }
    }

    /// Applies events until the backend drops its sender.
    pub async fn watch(&self, mut events: broadcast::Receiver<AuthEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auth context fell behind on auth events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("auth event stream closed");
    }

    /// Concurrent loads overwrite each other; the last one to finish wins.
    async fn load(&self, caller: Caller) {
        let profile = match self.backend.fetch_profile(&caller, caller.user_id()).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(user_id = %caller.user_id(), "profile fetch failed: {err}");
                None
            }
        };
        self.snapshot.send_replace(AuthSnapshot {
            identity: Some(caller.identity),
            profile,
        });
    }
}

fn caller_for(session: Session) -> Caller {
    Caller {
        identity: session.identity,
        access_token: session.tokens.access_token,
    }
}
