use std::{path::PathBuf, sync::Arc};

use axum::extract::FromRef;
use axum_extra::extract::cookie::Key;
use sha2::{Digest, Sha512};

use crate::{backend::Backend, config::AppConfig, services::mail::Mailer};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub backend: Arc<dyn Backend>,
    pub mailer: Arc<dyn Mailer>,
    pub cookie_key: Key,
    /// Directory served under `/storage` when photos live on local disk.
    pub local_storage: Option<PathBuf>,
}

impl AppState {
    pub fn new(config: AppConfig, backend: Arc<dyn Backend>, mailer: Arc<dyn Mailer>) -> Self {
        let digest = Sha512::digest(config.cookie_secret.as_bytes());
        let cookie_key = Key::from(&digest[..]);
        Self {
            config,
            backend,
            mailer,
            cookie_key,
            local_storage: None,
        }
    }

    pub fn with_local_storage(mut self, root: PathBuf) -> Self {
        self.local_storage = Some(root);
        self
    }
}

impl FromRef<AppState> for Key {
    fn from_ref(state: &AppState) -> Self {
        state.cookie_key.clone()
    }
}
