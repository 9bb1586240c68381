//! Access to the backend-as-a-service: auth, rows and object storage.
//!
//! Handlers only see [`Backend`]. `RemoteBackend` talks to the hosted service,
//! `LocalBackend` keeps everything in SQLite and on disk for development.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::models::{
    appointment::{Appointment, AppointmentDetails, AppointmentStatus, NewAppointment},
    pet::{Pet, PetDraft},
    session::{Caller, Session, SessionCheck, SessionTokens},
    user::{NewAccount, Profile, UserRole},
};

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Bucket that holds uploaded pet photos.
pub const PET_PHOTO_BUCKET: &str = "pet-photos";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("{0}")]
    Conflict(String),
    #[error("not found")]
    NotFound,
    #[error("backend rejected the request ({status}): {message}")]
    Status { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("password hashing failed: {0}")]
    Hash(String),
}

/// Auth state changes published by a backend to anyone holding a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut { user_id: String },
}

pub(crate) fn event_channel() -> broadcast::Sender<AuthEvent> {
    broadcast::channel(EVENT_CAPACITY).0
}

pub(crate) fn publish(events: &broadcast::Sender<AuthEvent>, event: AuthEvent) {
    // No subscribers is the normal case for a server without an auth context.
    let _ = events.send(event);
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates the auth account and its `client` profile row. `None` means the
    /// account exists but the backend wants the email confirmed before issuing
    /// a session.
    async fn sign_up(&self, account: NewAccount) -> Result<Option<Session>, BackendError>;

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError>;

    async fn sign_out(&self, tokens: &SessionTokens) -> Result<(), BackendError>;

    async fn send_password_reset(&self, email: &str) -> Result<(), BackendError>;

    /// Resolves the cookie tokens to an identity, refreshing them if the access
    /// token has expired but the refresh token is still good. `Ok(None)` means
    /// the tokens do not belong to a live session.
    async fn verify_session(
        &self,
        tokens: &SessionTokens,
    ) -> Result<Option<SessionCheck>, BackendError>;

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    async fn fetch_role(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<Option<UserRole>, BackendError>;

    async fn fetch_profile(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<Option<Profile>, BackendError>;

    async fn list_profiles(&self, caller: &Caller) -> Result<Vec<Profile>, BackendError>;

    async fn update_role(
        &self,
        caller: &Caller,
        user_id: &str,
        role: UserRole,
    ) -> Result<(), BackendError>;

    async fn list_pets(&self, caller: &Caller) -> Result<Vec<Pet>, BackendError>;

    async fn get_pet(&self, caller: &Caller, pet_id: &str) -> Result<Option<Pet>, BackendError>;

    async fn create_pet(&self, caller: &Caller, draft: PetDraft) -> Result<Pet, BackendError>;

    async fn update_pet(
        &self,
        caller: &Caller,
        pet_id: &str,
        draft: PetDraft,
    ) -> Result<Pet, BackendError>;

    async fn set_pet_photo(
        &self,
        caller: &Caller,
        pet_id: &str,
        photo_url: &str,
    ) -> Result<Pet, BackendError>;

    async fn delete_pet(&self, caller: &Caller, pet_id: &str) -> Result<(), BackendError>;

    /// Stores the photo bytes and returns the public URL of the object.
    async fn upload_pet_photo(
        &self,
        caller: &Caller,
        object_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError>;

    async fn list_appointments(&self, caller: &Caller) -> Result<Vec<Appointment>, BackendError>;

    async fn create_appointment(
        &self,
        caller: &Caller,
        new: NewAppointment,
    ) -> Result<Appointment, BackendError>;

    async fn appointment_details(
        &self,
        caller: &Caller,
        appointment_id: &str,
    ) -> Result<Option<AppointmentDetails>, BackendError>;

    async fn list_appointment_details(
        &self,
        caller: &Caller,
    ) -> Result<Vec<AppointmentDetails>, BackendError>;

    async fn set_appointment_status(
        &self,
        caller: &Caller,
        appointment_id: &str,
        status: AppointmentStatus,
    ) -> Result<Appointment, BackendError>;
}

/// Object key for a pet photo: owner folder, pet id, random suffix, original extension.
pub fn photo_object_name(owner_id: &str, pet_id: &str, file_name: &str) -> String {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "jpg".into());
    format!(
        "{owner_id}/{pet_id}-{}.{extension}",
        uuid::Uuid::new_v4().simple()
    )
}
