//! Request-time session and role gate.
//!
//! Every request passes through [`session_gate`]. It resolves the identity
//! behind the session cookies, classifies the path and either lets the
//! request through or redirects it. Tokens rotated by the backend while
//! resolving the identity are written back onto whatever response leaves.

use axum::{
    extract::{OriginalUri, Request, State},
    http::header::SET_COOKIE,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::PrivateCookieJar;
use tracing::{debug, warn};

use crate::{
    auth::{self, AuthenticatedUser},
    backend::Backend,
    models::{
        session::{Caller, SessionTokens},
        user::UserRole,
    },
    state::AppState,
};

pub const PUBLIC_ROUTES: [&str; 3] = ["/login", "/register", "/forgot-password"];
pub const LOGIN_PATH: &str = "/login";
pub const HOME_PATH: &str = "/";
const ADMIN_PREFIX: &str = "/admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathClass {
    Public,
    Root,
    Admin,
    /// Anything not listed elsewhere needs a session.
    Protected,
    /// JSON endpoints answer 401/403 themselves instead of redirecting.
    Api,
    /// Static files and health checks skip identity resolution entirely.
    Asset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Continue,
    RedirectToLogin,
    RedirectToHome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    Anonymous,
    /// `role` is only looked up for admin paths; `None` there means the
    /// profile row is missing or could not be read.
    Authenticated { role: Option<UserRole> },
}

pub fn classify(path: &str) -> PathClass {
    if PUBLIC_ROUTES.iter().any(|route| path.starts_with(route)) {
        PathClass::Public
    } else if path == "/" || path.is_empty() {
        PathClass::Root
    } else if path.starts_with(ADMIN_PREFIX) {
        PathClass::Admin
    } else if path == "/api" || path.starts_with("/api/") {
        PathClass::Api
    } else if path.starts_with("/storage/") || path == "/healthz" {
        PathClass::Asset
    } else {
        PathClass::Protected
    }
}

/// First match wins.
pub fn decide(viewer: Viewer, class: PathClass) -> GateDecision {
    use GateDecision::*;
    use PathClass::*;

    match (viewer, class) {
        (_, Api | Asset) => Continue,
        (Viewer::Anonymous, Public | Root) => Continue,
        (Viewer::Anonymous, Admin) => RedirectToLogin,
        (Viewer::Anonymous, Protected) => RedirectToLogin,
        (Viewer::Authenticated { .. }, Public) => RedirectToHome,
        (Viewer::Authenticated { role }, Admin) => {
            if role.is_some_and(|role| role.is_admin()) {
                Continue
            } else {
                RedirectToHome
            }
        }
        (Viewer::Authenticated { .. }, Root | Protected) => Continue,
    }
}

/// What the gate learned from the session cookies.
#[derive(Debug, Default)]
struct Resolution {
    caller: Option<Caller>,
    /// Tokens in effect after verification, rotated or not.
    tokens: Option<SessionTokens>,
    refreshed: Option<SessionTokens>,
    /// The backend answered and the cookies belong to no live session.
    stale: bool,
}

async fn resolve_identity(backend: &dyn Backend, jar: &PrivateCookieJar) -> Resolution {
    let Some(tokens) = auth::read_session_tokens(jar) else {
        return Resolution {
            stale: auth::has_session_cookies(jar),
            ..Resolution::default()
        };
    };
    match backend.verify_session(&tokens).await {
        Ok(Some(check)) => {
            let effective = check.refreshed.clone().unwrap_or(tokens);
            Resolution {
                caller: Some(Caller {
                    identity: check.identity,
                    access_token: effective.access_token.clone(),
                }),
                tokens: Some(effective),
                refreshed: check.refreshed,
                stale: false,
            }
        }
        Ok(None) => Resolution {
            stale: true,
            ..Resolution::default()
        },
        Err(err) => {
            warn!("session verification failed, treating request as anonymous: {err}");
            Resolution::default()
        }
    }
}

async fn lookup_role(backend: &dyn Backend, caller: &Caller) -> Option<UserRole> {
    match backend.fetch_role(caller, caller.user_id()).await {
        Ok(role) => role,
        Err(err) => {
            warn!(user_id = %caller.user_id(), "role lookup failed: {err}");
            None
        }
    }
}

pub async fn session_gate(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request
        .extensions()
        .get::<OriginalUri>()
        .map(|uri| uri.path().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let class = classify(&path);
    if class == PathClass::Asset {
        return next.run(request).await;
    }

    let backend = state.backend.as_ref();
    let resolution = resolve_identity(backend, &jar).await;

    let secure = !state.config.is_development();
    let jar = match (&resolution.refreshed, resolution.stale) {
        (Some(tokens), _) => auth::apply_session_cookies(jar, tokens, secure),
        (None, true) => auth::clear_session_cookies(jar),
        (None, false) => jar,
    };

    let mut role = None;
    let viewer = match &resolution.caller {
        None => Viewer::Anonymous,
        Some(caller) => {
            if class == PathClass::Admin {
                role = lookup_role(backend, caller).await;
            }
            Viewer::Authenticated { role }
        }
    };

    let decision = decide(viewer, class);
    debug!(%path, ?class, ?decision, "session gate");

    match decision {
        GateDecision::Continue => {
            if let Some(caller) = resolution.caller {
                request
                    .extensions_mut()
                    .insert(AuthenticatedUser { caller, role });
            }
            if let Some(tokens) = resolution.tokens {
                request.extensions_mut().insert(tokens);
            }
            let response = next.run(request).await;
            // Sign-in and sign-out handlers own the session cookies they set.
            if sets_session_cookie(&response) {
                response
            } else {
                (jar, response).into_response()
            }
        }
        GateDecision::RedirectToLogin => (jar, Redirect::to(LOGIN_PATH)).into_response(),
        GateDecision::RedirectToHome => (jar, Redirect::to(HOME_PATH)).into_response(),
    }
}

fn sets_session_cookie(response: &Response) -> bool {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value.starts_with(&format!("{}=", auth::ACCESS_COOKIE))
                || value.starts_with(&format!("{}=", auth::REFRESH_COOKIE))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN_PATHS: [&str; 4] = [
        "/admin",
        "/admin/",
        "/admin/users",
        "/admin/appointments/42/status",
    ];
    const PROTECTED_PATHS: [&str; 4] = ["/pets", "/pets/7", "/appointments", "/logout"];

    fn member(role: Option<UserRole>) -> Viewer {
        Viewer::Authenticated { role }
    }

    #[test]
    fn classifies_paths() {
        assert_eq!(classify("/"), PathClass::Root);
        assert_eq!(classify("/login"), PathClass::Public);
        assert_eq!(classify("/register"), PathClass::Public);
        assert_eq!(classify("/forgot-password"), PathClass::Public);
        assert_eq!(classify("/login/callback"), PathClass::Public);
        assert_eq!(classify("/admin/users"), PathClass::Admin);
        assert_eq!(classify("/api/test-email"), PathClass::Api);
        assert_eq!(classify("/storage/pet-photos/u/p.png"), PathClass::Asset);
        assert_eq!(classify("/healthz"), PathClass::Asset);
        assert_eq!(classify("/pets"), PathClass::Protected);
        assert_eq!(classify("/apiary"), PathClass::Protected);
    }

    #[test]
    fn decision_table() {
        use GateDecision::*;
        use PathClass::*;

        let cases = [
            (Viewer::Anonymous, Public, Continue),
            (Viewer::Anonymous, Root, Continue),
            (Viewer::Anonymous, Admin, RedirectToLogin),
            (Viewer::Anonymous, Protected, RedirectToLogin),
            (member(None), Public, RedirectToHome),
            (member(Some(UserRole::Client)), Admin, RedirectToHome),
            (member(None), Admin, RedirectToHome),
            (member(Some(UserRole::Admin)), Admin, Continue),
            (member(None), Root, Continue),
            (member(None), Protected, Continue),
            (Viewer::Anonymous, Api, Continue),
            (member(Some(UserRole::Client)), Api, Continue),
        ];
        for (viewer, class, expected) in cases {
            assert_eq!(decide(viewer, class), expected, "{viewer:?} on {class:?}");
        }
    }

    #[test]
    fn anonymous_never_reaches_admin_or_protected_paths() {
        for path in ADMIN_PATHS.iter().chain(PROTECTED_PATHS.iter()) {
            assert_eq!(
                decide(Viewer::Anonymous, classify(path)),
                GateDecision::RedirectToLogin,
                "{path}"
            );
        }
    }

    #[test]
    fn only_admins_pass_admin_paths() {
        for path in ADMIN_PATHS {
            let class = classify(path);
            assert_eq!(decide(member(Some(UserRole::Admin)), class), GateDecision::Continue);
            assert_eq!(
                decide(member(Some(UserRole::Client)), class),
                GateDecision::RedirectToHome
            );
        }
    }

    #[test]
    fn signed_in_users_are_sent_home_from_public_routes() {
        for path in PUBLIC_ROUTES {
            for role in [None, Some(UserRole::Client), Some(UserRole::Admin)] {
                assert_eq!(decide(member(role), classify(path)), GateDecision::RedirectToHome);
            }
        }
    }
}
