use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use axum_extra::extract::cookie::{Cookie, PrivateCookieJar, SameSite};
use tracing::warn;

use crate::{
    backend::Backend,
    error::AppError,
    models::{
        session::{Caller, SessionTokens},
        user::UserRole,
    },
};

pub const ACCESS_COOKIE: &str = "petcare-access-token";
pub const REFRESH_COOKIE: &str = "petcare-refresh-token";

/// Identity resolved by the session gate, stored in the request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub caller: Caller,
    /// Present when the gate already read the role for an admin path.
    pub role: Option<UserRole>,
}

impl AuthenticatedUser {
    pub fn id(&self) -> &str {
        self.caller.user_id()
    }

    pub fn email(&self) -> &str {
        &self.caller.identity.email
    }
}

#[derive(Debug, Clone, Default)]
pub struct CurrentUser(pub Option<AuthenticatedUser>);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(parts.extensions.get::<AuthenticatedUser>().cloned()))
    }
}

impl CurrentUser {
    pub fn require_user(&self) -> Result<&AuthenticatedUser, AppError> {
        self.0.as_ref().ok_or(AppError::Unauthorized)
    }

    /// Reads the role fresh unless the gate already did for this request. A
    /// missing profile row or a failed lookup counts as not admin.
    pub async fn require_admin(&self, backend: &dyn Backend) -> Result<&AuthenticatedUser, AppError> {
        let user = self.require_user()?;
        let role = match user.role {
            Some(role) => Some(role),
            None => match backend.fetch_role(&user.caller, user.id()).await {
                Ok(role) => role,
                Err(err) => {
                    warn!(user_id = %user.id(), "role lookup failed: {err}");
                    None
                }
            },
        };
        if role.is_some_and(|role| role.is_admin()) {
            Ok(user)
        } else {
            Err(AppError::Forbidden)
        }
    }
}

pub fn read_session_tokens(jar: &PrivateCookieJar) -> Option<SessionTokens> {
    let access_token = jar.get(ACCESS_COOKIE)?.value().to_string();
    let refresh_token = jar.get(REFRESH_COOKIE)?.value().to_string();
    Some(SessionTokens {
        access_token,
        refresh_token,
    })
}

pub fn has_session_cookies(jar: &PrivateCookieJar) -> bool {
    jar.get(ACCESS_COOKIE).is_some() || jar.get(REFRESH_COOKIE).is_some()
}

pub fn apply_session_cookies(
    jar: PrivateCookieJar,
    tokens: &SessionTokens,
    secure: bool,
) -> PrivateCookieJar {
    jar.add(session_cookie(ACCESS_COOKIE, tokens.access_token.clone(), secure))
        .add(session_cookie(REFRESH_COOKIE, tokens.refresh_token.clone(), secure))
}

pub fn clear_session_cookies(jar: PrivateCookieJar) -> PrivateCookieJar {
    jar.remove(Cookie::build(ACCESS_COOKIE).path("/"))
        .remove(Cookie::build(REFRESH_COOKIE).path("/"))
}

fn session_cookie(name: &'static str, value: String, secure: bool) -> Cookie<'static> {
    Cookie::build((name, value))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .build()
}
