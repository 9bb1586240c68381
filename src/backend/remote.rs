use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use url::Url;

use super::{event_channel, publish, AuthEvent, Backend, BackendError, PET_PHOTO_BUCKET};
use crate::models::{
    appointment::{Appointment, AppointmentDetails, AppointmentStatus, NewAppointment, ServiceKind},
    pet::{Pet, PetDraft},
    session::{Caller, Session, SessionCheck, SessionTokens},
    user::{Identity, NewAccount, Profile, UserRole},
};

const DETAILS_SELECT: &str = "*,pet:pets(name),owner:users(email,full_name)";

/// Client for the hosted backend: GoTrue-style auth under `/auth/v1`,
/// PostgREST-style rows under `/rest/v1` and object storage under `/storage/v1`.
#[derive(Clone)]
pub struct RemoteBackend {
    base: Url,
    anon_key: String,
    http: Client,
    events: broadcast::Sender<AuthEvent>,
}

#[derive(Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

impl From<AuthUser> for Identity {
    fn from(user: AuthUser) -> Self {
        Identity {
            id: user.id,
            email: user.email.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    user: AuthUser,
}

impl From<TokenResponse> for Session {
    fn from(token: TokenResponse) -> Self {
        Session {
            identity: token.user.into(),
            tokens: SessionTokens {
                access_token: token.access_token,
                refresh_token: token.refresh_token,
            },
        }
    }
}

/// Sign-up answers with a full session, or with the bare user when the
/// project requires email confirmation first.
#[derive(Deserialize)]
#[serde(untagged)]
enum SignUpResponse {
    Session(TokenResponse),
    User(AuthUser),
}

#[derive(Deserialize)]
struct RoleRow {
    role: String,
}

#[derive(Serialize)]
struct ProfileInsert<'a> {
    id: &'a str,
    email: &'a str,
    full_name: Option<&'a str>,
    role: &'a str,
}

#[derive(Serialize)]
struct PetInsert<'a> {
    owner_id: &'a str,
    #[serde(flatten)]
    draft: &'a PetDraft,
}

#[derive(Serialize)]
struct AppointmentInsert<'a> {
    owner_id: &'a str,
    pet_id: &'a str,
    service: ServiceKind,
    scheduled_at: DateTime<Utc>,
    status: AppointmentStatus,
    notes: Option<&'a str>,
}

#[derive(Deserialize)]
struct PetName {
    name: String,
}

#[derive(Deserialize)]
struct OwnerInfo {
    email: String,
    full_name: Option<String>,
}

#[derive(Deserialize)]
struct DetailsRow {
    #[serde(flatten)]
    appointment: Appointment,
    pet: Option<PetName>,
    owner: Option<OwnerInfo>,
}

impl From<DetailsRow> for AppointmentDetails {
    fn from(row: DetailsRow) -> Self {
        let (owner_email, owner_name) = row
            .owner
            .map(|owner| (owner.email, owner.full_name))
            .unwrap_or_default();
        AppointmentDetails {
            appointment: row.appointment,
            pet_name: row.pet.map(|pet| pet.name).unwrap_or_default(),
            owner_email,
            owner_name,
        }
    }
}

/// Auth errors carry `error_description` or `msg`; row errors carry `message`.
#[derive(Deserialize, Default)]
struct ErrorBody {
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
}

impl ErrorBody {
    fn into_message(self) -> Option<String> {
        self.message
            .or(self.msg)
            .or(self.error_description)
            .or(self.error)
    }
}

impl RemoteBackend {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, BackendError> {
        let base = Url::parse(base_url)?;
        let http = Client::builder()
            .connect_timeout(StdDuration::from_secs(10))
            .timeout(StdDuration::from_secs(30))
            .build()?;
        Ok(Self {
            base,
            anon_key: anon_key.into(),
            http,
            events: event_channel(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        Ok(self.base.join(path)?)
    }

    fn public_object_url(&self, bucket: &str, object_name: &str) -> Result<Url, BackendError> {
        self.endpoint(&format!("storage/v1/object/public/{bucket}/{object_name}"))
    }

    /// Request carrying the project key, authorised as `bearer` (the anon key
    /// for calls made before a session exists).
    fn request(&self, method: reqwest::Method, url: Url, bearer: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    fn rest(
        &self,
        method: reqwest::Method,
        table: &str,
        caller: &Caller,
    ) -> Result<RequestBuilder, BackendError> {
        let url = self.endpoint(&format!("rest/v1/{table}"))?;
        Ok(self.request(method, url, &caller.access_token))
    }

    /// `None` when the access token is expired or revoked.
    async fn current_user(&self, access_token: &str) -> Result<Option<Identity>, BackendError> {
        let url = self.endpoint("auth/v1/user")?;
        let response = self
            .request(reqwest::Method::GET, url, access_token)
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Ok(None);
        }
        let user: AuthUser = decode(response).await?;
        Ok(Some(user.into()))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Option<Session>, BackendError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");
        let response = self
            .request(reqwest::Method::POST, url, &self.anon_key)
            .json(&json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            debug!("refresh token rejected");
            return Ok(None);
        }
        let token: TokenResponse = decode(response).await?;
        Ok(Some(token.into()))
    }

    async fn fetch_rows<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Vec<T>, BackendError> {
        decode(builder.send().await?).await
    }

    async fn fetch_one<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<Option<T>, BackendError> {
        let rows: Vec<T> = self.fetch_rows(builder).await?;
        Ok(rows.into_iter().next())
    }

    /// Mutations use `return=representation`; an empty array means no row matched
    /// the filters, which includes rows owned by someone else.
    async fn mutate_one<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let builder = builder.header("Prefer", "return=representation");
        self.fetch_one(builder).await?.ok_or(BackendError::NotFound)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn sign_up(&self, account: NewAccount) -> Result<Option<Session>, BackendError> {
        let url = self.endpoint("auth/v1/signup")?;
        let response = self
            .request(reqwest::Method::POST, url, &self.anon_key)
            .json(&json!({
                "email": account.email.trim(),
                "password": account.password,
                "data": { "full_name": account.full_name },
            }))
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
        ) {
            let body: ErrorBody = response.json().await.unwrap_or_default();
            return Err(BackendError::Conflict(body.into_message().unwrap_or_else(|| {
                "That email cannot be registered.".into()
            })));
        }
        let session = match decode::<SignUpResponse>(response).await? {
            SignUpResponse::Session(token) => Session::from(token),
            SignUpResponse::User(user) => {
                debug!(user_id = %user.id, "sign-up awaits email confirmation");
                return Ok(None);
            }
        };

        let caller = Caller {
            identity: session.identity.clone(),
            access_token: session.tokens.access_token.clone(),
        };
        let insert = ProfileInsert {
            id: &session.identity.id,
            email: &session.identity.email,
            full_name: account.full_name.as_deref(),
            role: UserRole::Client.as_str(),
        };
        let response = self
            .rest(reqwest::Method::POST, "users", &caller)?
            .header("Prefer", "return=minimal")
            .json(&insert)
            .send()
            .await?;
        // A database trigger may already have created the row.
        if response.status() == StatusCode::CONFLICT {
            debug!(user_id = %caller.user_id(), "profile row already present");
        } else {
            check(response).await?;
        }

        publish(&self.events, AuthEvent::SignedIn(session.clone()));
        Ok(Some(session))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        let mut url = self.endpoint("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let response = self
            .request(reqwest::Method::POST, url, &self.anon_key)
            .json(&json!({ "email": email.trim(), "password": password }))
            .send()
            .await?;
        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            return Err(BackendError::InvalidCredentials);
        }
        let session: Session = decode::<TokenResponse>(response).await?.into();
        publish(&self.events, AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    async fn sign_out(&self, tokens: &SessionTokens) -> Result<(), BackendError> {
        let identity = self.current_user(&tokens.access_token).await.ok().flatten();
        let url = self.endpoint("auth/v1/logout")?;
        let response = self
            .request(reqwest::Method::POST, url, &tokens.access_token)
            .send()
            .await?;
        // An already invalid token is as good as signed out.
        if response.status() != StatusCode::UNAUTHORIZED {
            check(response).await?;
        }
        if let Some(identity) = identity {
            publish(&self.events, AuthEvent::SignedOut { user_id: identity.id });
        }
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), BackendError> {
        let url = self.endpoint("auth/v1/recover")?;
        let response = self
            .request(reqwest::Method::POST, url, &self.anon_key)
            .json(&json!({ "email": email.trim() }))
            .send()
            .await?;
        check(response).await
    }

    async fn verify_session(
        &self,
        tokens: &SessionTokens,
    ) -> Result<Option<SessionCheck>, BackendError> {
        if let Some(identity) = self.current_user(&tokens.access_token).await? {
            return Ok(Some(SessionCheck {
                identity,
                refreshed: None,
            }));
        }

        let Some(session) = self.refresh(&tokens.refresh_token).await? else {
            return Ok(None);
        };
        publish(&self.events, AuthEvent::TokenRefreshed(session.clone()));
        Ok(Some(SessionCheck {
            identity: session.identity,
            refreshed: Some(session.tokens),
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    async fn fetch_role(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<Option<UserRole>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "users", caller)?
            .query(&[("select", "role".to_string()), ("id", format!("eq.{user_id}"))]);
        let row: Option<RoleRow> = self.fetch_one(builder).await?;
        Ok(row.map(|row| row.role.parse().unwrap_or_default()))
    }

    async fn fetch_profile(
        &self,
        caller: &Caller,
        user_id: &str,
    ) -> Result<Option<Profile>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "users", caller)?
            .query(&[("select", "*".to_string()), ("id", format!("eq.{user_id}"))]);
        self.fetch_one(builder).await
    }

    async fn list_profiles(&self, caller: &Caller) -> Result<Vec<Profile>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "users", caller)?
            .query(&[("select", "*"), ("order", "created_at.desc")]);
        self.fetch_rows(builder).await
    }

    async fn update_role(
        &self,
        caller: &Caller,
        user_id: &str,
        role: UserRole,
    ) -> Result<(), BackendError> {
        let builder = self
            .rest(reqwest::Method::PATCH, "users", caller)?
            .query(&[("id", format!("eq.{user_id}"))])
            .json(&json!({ "role": role.as_str() }));
        let _: Profile = self.mutate_one(builder).await?;
        Ok(())
    }

    async fn list_pets(&self, caller: &Caller) -> Result<Vec<Pet>, BackendError> {
        let builder = self.rest(reqwest::Method::GET, "pets", caller)?.query(&[
            ("select", "*".to_string()),
            ("owner_id", format!("eq.{}", caller.user_id())),
            ("order", "created_at.asc".to_string()),
        ]);
        self.fetch_rows(builder).await
    }

    async fn get_pet(&self, caller: &Caller, pet_id: &str) -> Result<Option<Pet>, BackendError> {
        let builder = self.rest(reqwest::Method::GET, "pets", caller)?.query(&[
            ("select", "*".to_string()),
            ("id", format!("eq.{pet_id}")),
            ("owner_id", format!("eq.{}", caller.user_id())),
        ]);
        self.fetch_one(builder).await
    }

    async fn create_pet(&self, caller: &Caller, draft: PetDraft) -> Result<Pet, BackendError> {
        let builder = self
            .rest(reqwest::Method::POST, "pets", caller)?
            .json(&PetInsert {
                owner_id: caller.user_id(),
                draft: &draft,
            });
        self.mutate_one(builder).await
    }

    async fn update_pet(
        &self,
        caller: &Caller,
        pet_id: &str,
        draft: PetDraft,
    ) -> Result<Pet, BackendError> {
        let builder = self
            .rest(reqwest::Method::PATCH, "pets", caller)?
            .query(&[
                ("id", format!("eq.{pet_id}")),
                ("owner_id", format!("eq.{}", caller.user_id())),
            ])
            .json(&draft);
        self.mutate_one(builder).await
    }

    async fn set_pet_photo(
        &self,
        caller: &Caller,
        pet_id: &str,
        photo_url: &str,
    ) -> Result<Pet, BackendError> {
        let builder = self
            .rest(reqwest::Method::PATCH, "pets", caller)?
            .query(&[
                ("id", format!("eq.{pet_id}")),
                ("owner_id", format!("eq.{}", caller.user_id())),
            ])
            .json(&json!({ "photo_url": photo_url }));
        self.mutate_one(builder).await
    }

    async fn delete_pet(&self, caller: &Caller, pet_id: &str) -> Result<(), BackendError> {
        let builder = self
            .rest(reqwest::Method::DELETE, "pets", caller)?
            .query(&[
                ("id", format!("eq.{pet_id}")),
                ("owner_id", format!("eq.{}", caller.user_id())),
            ]);
        let _: Pet = self.mutate_one(builder).await?;
        Ok(())
    }

    async fn upload_pet_photo(
        &self,
        caller: &Caller,
        object_name: &str,
        content_type: &str,
        bytes: Vec<u8>,
    ) -> Result<String, BackendError> {
        let url = self.endpoint(&format!("storage/v1/object/{PET_PHOTO_BUCKET}/{object_name}"))?;
        let response = self
            .request(reqwest::Method::POST, url, &caller.access_token)
            .header(header::CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await?;
        check(response).await?;
        Ok(self
            .public_object_url(PET_PHOTO_BUCKET, object_name)?
            .to_string())
    }

    async fn list_appointments(&self, caller: &Caller) -> Result<Vec<Appointment>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "appointments", caller)?
            .query(&[
                ("select", "*".to_string()),
                ("owner_id", format!("eq.{}", caller.user_id())),
                ("order", "scheduled_at.asc".to_string()),
            ]);
        self.fetch_rows(builder).await
    }

    async fn create_appointment(
        &self,
        caller: &Caller,
        new: NewAppointment,
    ) -> Result<Appointment, BackendError> {
        if self.get_pet(caller, &new.pet_id).await?.is_none() {
            return Err(BackendError::NotFound);
        }
        let builder = self
            .rest(reqwest::Method::POST, "appointments", caller)?
            .json(&AppointmentInsert {
                owner_id: caller.user_id(),
                pet_id: &new.pet_id,
                service: new.service,
                scheduled_at: new.scheduled_at,
                status: AppointmentStatus::Pending,
                notes: new.notes.as_deref(),
            });
        self.mutate_one(builder).await
    }

    async fn appointment_details(
        &self,
        caller: &Caller,
        appointment_id: &str,
    ) -> Result<Option<AppointmentDetails>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "appointments", caller)?
            .query(&[
                ("select", DETAILS_SELECT.to_string()),
                ("id", format!("eq.{appointment_id}")),
            ]);
        let row: Option<DetailsRow> = self.fetch_one(builder).await?;
        Ok(row.map(AppointmentDetails::from))
    }

    async fn list_appointment_details(
        &self,
        caller: &Caller,
    ) -> Result<Vec<AppointmentDetails>, BackendError> {
        let builder = self
            .rest(reqwest::Method::GET, "appointments", caller)?
            .query(&[("select", DETAILS_SELECT), ("order", "scheduled_at.asc")]);
        let rows: Vec<DetailsRow> = self.fetch_rows(builder).await?;
        Ok(rows.into_iter().map(AppointmentDetails::from).collect())
    }

    async fn set_appointment_status(
        &self,
        caller: &Caller,
        appointment_id: &str,
        status: AppointmentStatus,
    ) -> Result<Appointment, BackendError> {
        let builder = self
            .rest(reqwest::Method::PATCH, "appointments", caller)?
            .query(&[("id", format!("eq.{appointment_id}"))])
            .json(&json!({ "status": status }));
        self.mutate_one(builder).await
    }
}

async fn check(response: Response) -> Result<(), BackendError> {
    if response.status().is_success() {
        return Ok(());
    }
    Err(status_error(response).await)
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn status_error(response: Response) -> BackendError {
    let status = response.status().as_u16();
    let raw = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&raw)
        .ok()
        .and_then(ErrorBody::into_message)
        .unwrap_or(raw);
    warn!(status, %message, "backend call failed");
    BackendError::Status { status, message }
}
