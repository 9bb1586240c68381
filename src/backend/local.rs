use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::Row;
use tokio::{fs, sync::broadcast};
use tracing::{debug, info};
use uuid::Uuid;

use super::{event_channel, publish, AuthEvent, Backend, BackendError, PET_PHOTO_BUCKET};
use crate::{
    db::{self, DbPool},
    models::{
        appointment::{Appointment, AppointmentDetails, AppointmentStatus, NewAppointment},
        pet::{Pet, PetDraft},
        session::{Caller, Session, SessionCheck, SessionTokens, StoredSession},
        user::{Identity, NewAccount, Profile, UserRole},
    },
};

const PET_COLUMNS: &str =
    "id, owner_id, name, species, breed, size, notes, photo_url, created_at";
const APPOINTMENT_COLUMNS: &str =
    "id, owner_id, pet_id, service, scheduled_at, status, notes, created_at";
const DETAILS_QUERY: &str = r#"
    SELECT a.id, a.owner_id, a.pet_id, a.service, a.scheduled_at, a.status, a.notes, a.created_at,
           p.name AS pet_name, acc.email AS owner_email, u.full_name AS owner_name
    FROM appointments a
    JOIN pets p ON p.id = a.pet_id
    JOIN accounts acc ON acc.id = a.owner_id
    LEFT JOIN users u ON u.id = a.owner_id
"#;

/// How long a rotated-away token pair still resolves to its successor, so
/// parallel requests that carried the old cookies keep their session.
const REFRESH_REUSE_SECONDS: i64 = 10;

/// Self-hosted backend: SQLite for accounts, sessions and rows, a directory for photos.
#[derive(Clone)]
pub struct LocalBackend {
    db: DbPool,
    storage_root: Arc<PathBuf>,
    public_base: Arc<String>,
    access_ttl: Duration,
    refresh_ttl: Duration,
    events: broadcast::Sender<AuthEvent>,
}

impl LocalBackend {
    pub fn new(db: DbPool, storage_root: PathBuf, public_base: impl Into<String>) -> Self {
        Self {
            db,
            storage_root: Arc::new(storage_root),
            public_base: Arc::new(public_base.into()),
            access_ttl: Duration::hours(1),
            refresh_ttl: Duration::days(30),
            events: event_channel(),
        }
    }

    /// Connects, migrates and prepares the photo directory.
    pub async fn open(
        database_url: &str,
        storage_root: PathBuf,
        public_base: impl Into<String>,
    ) -> Result<Self, BackendError> {
        let pool = db::init_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        let backend = Self::new(pool, storage_root, public_base);
        backend.ensure_structure().await?;
        Ok(backend)
    }

    pub fn with_session_ttls(mut self, access: Duration, refresh: Duration) -> Self {
        self.access_ttl = access;
        self.refresh_ttl = refresh;
        self
    }

    pub fn storage_root(&self) -> &Path {
        &self.storage_root
    }

    pub async fn ensure_structure(&self) -> Result<(), BackendError> {
        fs::create_dir_all(self.storage_root().join(PET_PHOTO_BUCKET)).await?;
        Ok(())
    }

    async fn identity_for(&self, user_id: &str) -> Result<Option<Identity>, BackendError> {
        let email: Option<String> = sqlx::query_scalar("SELECT email FROM accounts WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(email.map(|email| Identity {
            id: user_id.to_string(),
            email,
        }))
    }

    async fn create_session(&self, identity: Identity) -> Result<Session, BackendError> {
        let now = Utc::now();
        let tokens = new_tokens();
        sqlx::query(
            r#"INSERT INTO sessions (access_token, refresh_token, user_id, created_at, access_expires_at, refresh_expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(&identity.id)
        .bind(now)
        .bind(now + self.access_ttl)
        .bind(now + self.refresh_ttl)
        .execute(&self.db)
        .await?;
        Ok(Session { identity, tokens })
    }

    async fn rotate_session(
        &self,
        stored: &StoredSession,
    ) -> Result<Option<SessionTokens>, BackendError> {
        let now = Utc::now();
        let tokens = new_tokens();
        let result = sqlx::query(
            r#"UPDATE sessions
               SET previous_access_token = access_token, previous_refresh_token = refresh_token,
                   rotated_at = ?1, access_token = ?2, refresh_token = ?3,
                   access_expires_at = ?4, refresh_expires_at = ?5
               WHERE access_token = ?6 AND refresh_token = ?7"#,
        )
        .bind(now)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(now + self.access_ttl)
        .bind(now + self.refresh_ttl)
        .bind(&stored.access_token)
        .bind(&stored.refresh_token)
        .execute(&self.db)
        .await?;
        // Another request rotated this pair first.
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(tokens))
    }

    /// Resolves a pair that was rotated within the reuse window to the pair
    /// that replaced it.
    async fn successor_of(
        &self,
        tokens: &SessionTokens,
    ) -> Result<Option<SessionCheck>, BackendError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"SELECT access_token, refresh_token, user_id FROM sessions
               WHERE previous_access_token = ?1 AND previous_refresh_token = ?2
                 AND rotated_at > ?3 AND refresh_expires_at > ?4"#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(now - Duration::seconds(REFRESH_REUSE_SECONDS))
        .bind(now)
        .fetch_optional(&self.db)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let user_id: String = row.get("user_id");
        let Some(identity) = self.identity_for(&user_id).await? else {
            return Ok(None);
        };
        debug!(%user_id, "rotated token pair reused, handing out its successor");
        Ok(Some(SessionCheck {
            identity,
            refreshed: Some(SessionTokens {
                access_token: row.get("access_token"),
                refresh_token: row.get("refresh_token"),
            }),
        }))
    }

    async fn fetch_appointment(&self, appointment_id: &str) -> Result<Appointment, BackendError> {
        let query = format!("SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE id = ?1");
        sqlx::query_as::<_, Appointment>(&query)
            .bind(appointment_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(BackendError::NotFound)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn sign_up(&self, account: NewAccount) -> Result<Option<Session>, BackendError> {
        let email = normalize_email(&account.email);
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM accounts WHERE email = ?1")
            .bind(&email)
            .fetch_optional(&self.db)
            .await?;
        if exists.is_some() {
            return Err(BackendError::Conflict(
                "An account with this email already exists.".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let password_hash = hash_password(&account.password)?;
        let now = Utc::now();
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "INSERT INTO accounts (id, email, password_hash, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&id)
        .bind(&email)
        .bind(&password_hash)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO users (id, email, full_name, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&id)
        .bind(&email)
        .bind(&account.full_name)
        .bind(UserRole::Client.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(user_id = %id, "account registered");
        let session = self.create_session(Identity { id, email }).await?;
        publish(&self.events, AuthEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let email = normalize_email(email);
        let row = sqlx::query("SELECT id, password_hash FROM accounts WHERE email = ?1")
            .bind(&email)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else {
            return Err(BackendError::InvalidCredentials);
        };
        let hash: String = row.get("password_hash");
        if !verify_password(password, &hash) {
            return Err(BackendError::InvalidCredentials);
        }
        let session = self
            .create_session(Identity {
                id: row.get("id"),
                email,
            })
            .await?;
        publish(&self.events, AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, tokens: &SessionTokens) -> Result<(), BackendError> {
        let user_id: Option<String> = sqlx::query_scalar(
            "SELECT user_id FROM sessions WHERE access_token = ?1 OR previous_access_token = ?1",
        )
        .bind(&tokens.access_token)
        .fetch_optional(&self.db)
        .await?;
        sqlx::query(
            r#"DELETE FROM sessions
               WHERE access_token = ?1 OR refresh_token = ?2
                  OR previous_access_token = ?1 OR previous_refresh_token = ?2"#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .execute(&self.db)
        .await?;
        if let Some(user_id) = user_id {
            publish(&self.events, AuthEvent::SignedOut { user_id });
        }
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), BackendError> {
        let email = normalize_email(email);
        let known: Option<String> = sqlx::query_scalar("SELECT id FROM accounts WHERE email = ?1")
            .bind(&email)
            .fetch_optional(&self.db)
            .await?;
        if known.is_some() {
            info!(%email, "password reset requested, local backend does not deliver reset mail");
        }
        Ok(())
    }

    async fn verify_session(
        &self,
        tokens: &SessionTokens,
    ) -> Result<Option<SessionCheck>, BackendError> {
        let stored = sqlx::query_as::<_, StoredSession>(
            r#"SELECT access_token, refresh_token, user_id, created_at, access_expires_at, refresh_expires_at
               FROM sessions WHERE access_token = ?1 AND refresh_token = ?2"#,
        )
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .fetch_optional(&self.db)
        .await?;
        let Some(stored) = stored else {
            return self.successor_of(tokens).await;
        };
        let Some(identity) = self.identity_for(&stored.user_id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        if stored.access_expires_at > now {
            return Ok(Some(SessionCheck {
                identity,
                refreshed: None,
            }));
        }
        if stored.refresh_expires_at <= now {
            sqlx::query("DELETE FROM sessions WHERE access_token = ?1")
                .bind(&stored.access_token)
                .execute(&self.db)
                .await?;
            debug!(user_id = %stored.user_id, "session expired");
            return Ok(None);
        }

        let Some(refreshed) = self.rotate_session(&stored).await? else {
            return self.successor_of(tokens).await;
        };
        publish(
            &self.events,
            AuthEvent::TokenRefreshed(Session {
                identity: identity.clone(),
                tokens: refreshed.clone(),
            }),
        );
        Ok(Some(SessionCheck {
            identity,
            refreshed: Some(refreshed),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn fetch_role(
        &self,
        _caller: &Caller,
        user_id: &str,
    ) -> Result<Option<UserRole>, BackendError> {
        let role: Option<String> = sqlx::query_scalar("SELECT role FROM users WHERE id = ?1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(role.map(|role| role.parse().unwrap_or_default()))
    }

    async fn fetch_profile(
        &self,
        _caller: &Caller,
        user_id: &str,
    ) -> Result<Option<Profile>, BackendError> {
        let profile = sqlx::query_as::<_, Profile>(
            "SELECT id, email, full_name, role, created_at FROM users WHERE id = ?1",
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(profile)
    }

    async fn list_profiles(&self, _caller: &Caller) -> Result<Vec<Profile>, BackendError> {
        let profiles = sqlx::query_as::<_, Profile>(
            "SELECT id, email, full_name, role, created_at FROM users ORDER BY created_at DESC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(profiles)
    }

    async fn update_role(
        &self,
        _caller: &Caller,
        user_id: &str,
        role: UserRole,
    ) -> Result<(), BackendError> {
        let result = sqlx::query("UPDATE users SET role = ?1 WHERE id = ?2")
            .bind(role.as_str())
            .bind(user_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    async fn list_pets(&self, caller: &Caller) -> Result<Vec<Pet>, BackendError> {
        let query =
            format!("SELECT {PET_COLUMNS} FROM pets WHERE owner_id = ?1 ORDER BY created_at ASC");
        let pets = sqlx::query_as::<_, Pet>(&query)
            .bind(caller.user_id())
            .fetch_all(&self.db)
            .await?;
        Ok(pets)
    }

    async fn get_pet(&self, caller: &Caller, pet_id: &str) -> Result<Option<Pet>, BackendError> {
        let query = format!("SELECT {PET_COLUMNS} FROM pets WHERE id = ?1 AND owner_id = ?2");
        let pet = sqlx::query_as::<_, Pet>(&query)
            .bind(pet_id)
            .bind(caller.user_id())
            .fetch_optional(&self.db)
            .await?;
        Ok(pet)
    }

    async fn create_pet(&self, caller: &Caller, draft: PetDraft) -> Result<Pet, BackendError> {
        let pet = Pet {
            id: Uuid::new_v4().to_string(),
            owner_id: caller.user_id().to_string(),
            name: draft.name,
            species: draft.species,
            breed: draft.breed,
            size: draft.size,
            notes: draft.notes,
            photo_url: None,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO pets (id, owner_id, name, species, breed, size, notes, photo_url, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
        )
        .bind(&pet.id)
        .bind(&pet.owner_id)
        .bind(&pet.name)
        .bind(&pet.species)
        .bind(&pet.breed)
        .bind(pet.size)
        .bind(&pet.notes)
        .bind(&pet.photo_url)
        .bind(pet.created_at)
        .execute(&self.db)
        .await?;
        Ok(pet)
    }

    async fn update_pet(
        &self,
        caller: &Caller,
        pet_id: &str,
        draft: PetDraft,
    ) -> Result<Pet, BackendError> {
        let result = sqlx::query(
            r#"UPDATE pets SET name = ?1, species = ?2, breed = ?3, size = ?4, notes = ?5
               WHERE id = ?6 AND owner_id = ?7"#,
        )
        .bind(&draft.name)
        .bind(&draft.species)
        .bind(&draft.breed)
        .bind(draft.size)
        .bind(&draft.notes)
        .bind(pet_id)
        .bind(caller.user_id())
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        self.get_pet(caller, pet_id).await?.ok_or(BackendError::NotFound)
    }

    async fn set_pet_photo(
        &self,
        caller: &Caller,
        pet_id: &str,
        photo_url: &str,
    ) -> Result<Pet, BackendError> {
        let result = sqlx::query("UPDATE pets SET photo_url = ?1 WHERE id = ?2 AND owner_id = ?3")
            .bind(photo_url)
            .bind(pet_id)
            .bind(caller.user_id())
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        self.get_pet(caller, pet_id).await?.ok_or(BackendError::NotFound)
    }

    async fn delete_pet(&self, caller: &Caller, pet_id: &str) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM pets WHERE id = ?1 AND owner_id = ?2")
            .bind(pet_id)
            .bind(caller.user_id())
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        Ok(())
    }

    async fn upload_pet_photo(
        &self,
        caller: &Caller,
        object_name: &str,
        _content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let owner_prefix = format!("{}/", caller.user_id());
        let relative = Path::new(object_name);
        let escapes = relative
            .components()
            .any(|part| !matches!(part, Component::Normal(_)));
        if !object_name.starts_with(&owner_prefix) || escapes {
            return Err(BackendError::Status {
                status: 403,
                message: "photos must be stored under the owner's folder".into(),
            });
        }
        let path = self.storage_root().join(PET_PHOTO_BUCKET).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(format!(
            "{}/{PET_PHOTO_BUCKET}/{object_name}",
            self.public_base.trim_end_matches('/')
        ))
    }

    async fn list_appointments(&self, caller: &Caller) -> Result<Vec<Appointment>, BackendError> {
        let query = format!(
            "SELECT {APPOINTMENT_COLUMNS} FROM appointments WHERE owner_id = ?1 ORDER BY scheduled_at ASC"
        );
        let items = sqlx::query_as::<_, Appointment>(&query)
            .bind(caller.user_id())
            .fetch_all(&self.db)
            .await?;
        Ok(items)
    }

    async fn create_appointment(
        &self,
        caller: &Caller,
        new: NewAppointment,
    ) -> Result<Appointment, BackendError> {
        if self.get_pet(caller, &new.pet_id).await?.is_none() {
            return Err(BackendError::NotFound);
        }
        let appointment = Appointment {
            id: Uuid::new_v4().to_string(),
            owner_id: caller.user_id().to_string(),
            pet_id: new.pet_id,
            service: new.service,
            scheduled_at: new.scheduled_at,
            status: AppointmentStatus::Pending,
            notes: new.notes,
            created_at: Utc::now(),
        };
        sqlx::query(
            r#"INSERT INTO appointments (id, owner_id, pet_id, service, scheduled_at, status, notes, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
        )
        .bind(&appointment.id)
        .bind(&appointment.owner_id)
        .bind(&appointment.pet_id)
        .bind(appointment.service)
        .bind(appointment.scheduled_at)
        .bind(appointment.status)
        .bind(&appointment.notes)
        .bind(appointment.created_at)
        .execute(&self.db)
        .await?;
        Ok(appointment)
    }

    async fn appointment_details(
        &self,
        _caller: &Caller,
        appointment_id: &str,
    ) -> Result<Option<AppointmentDetails>, BackendError> {
        let query = format!("{DETAILS_QUERY} WHERE a.id = ?1");
        let details = sqlx::query_as::<_, AppointmentDetails>(&query)
            .bind(appointment_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(details)
    }

    async fn list_appointment_details(
        &self,
        _caller: &Caller,
    ) -> Result<Vec<AppointmentDetails>, BackendError> {
        let query = format!("{DETAILS_QUERY} ORDER BY a.scheduled_at ASC");
        let items = sqlx::query_as::<_, AppointmentDetails>(&query)
            .fetch_all(&self.db)
            .await?;
        Ok(items)
    }

    async fn set_appointment_status(
        &self,
        _caller: &Caller,
        appointment_id: &str,
        status: AppointmentStatus,
    ) -> Result<Appointment, BackendError> {
        let result = sqlx::query("UPDATE appointments SET status = ?1 WHERE id = ?2")
            .bind(status)
            .bind(appointment_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BackendError::NotFound);
        }
        self.fetch_appointment(appointment_id).await
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn new_tokens() -> SessionTokens {
    SessionTokens {
        access_token: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
        refresh_token: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
    }
}

fn hash_password(password: &str) -> Result<String, BackendError> {
    let salt = SaltString::encode_b64(Uuid::new_v4().as_bytes())
        .map_err(|err| BackendError::Hash(err.to_string()))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| BackendError::Hash(err.to_string()))
}

fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}
