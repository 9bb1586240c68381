use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Extension, Form, Router,
};
use axum_extra::extract::cookie::PrivateCookieJar;
use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use crate::{
    auth::{self, CurrentUser},
    backend::BackendError,
    error::AppError,
    models::{
        appointment::AppointmentStatus,
        session::{Session, SessionTokens},
        user::{NewAccount, UserRole},
    },
    routes::{format_timestamp, normalize_optional},
    state::AppState,
};

const MIN_PASSWORD_LEN: usize = 8;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/login", get(login_form).post(login_submit))
        .route("/register", get(register_form).post(register_submit))
        .route(
            "/forgot-password",
            get(forgot_password_form).post(forgot_password_submit),
        )
        .route("/logout", post(logout))
}

#[derive(Template)]
#[template(path = "landing.html")]
struct LandingTemplate;

#[derive(Template)]
#[template(path = "home.html")]
struct HomeTemplate {
    display_name: String,
    is_admin: bool,
    pets: Vec<HomePet>,
    upcoming: Vec<UpcomingAppointment>,
}

#[derive(Clone)]
struct HomePet {
    id: String,
    name: String,
    species: String,
}

#[derive(Clone)]
struct UpcomingAppointment {
    when: String,
    service: String,
    pet_name: String,
    status: String,
}

async fn root(State(state): State<AppState>, current: CurrentUser) -> Result<Response, AppError> {
    let Some(user) = current.0.as_ref() else {
        return Ok(AskamaTemplateResponse::into_response(LandingTemplate));
    };
    let backend = state.backend.as_ref();
    let profile = backend.fetch_profile(&user.caller, user.id()).await?;
    let pets = backend.list_pets(&user.caller).await?;
    let appointments = backend.list_appointments(&user.caller).await?;

    let now = Utc::now();
    let upcoming = appointments
        .into_iter()
        .filter(|a| a.scheduled_at >= now && !a.status.is_terminal())
        .take(5)
        .map(|a| UpcomingAppointment {
            when: format_timestamp(a.scheduled_at),
            service: a.service.label().to_string(),
            pet_name: pets
                .iter()
                .find(|pet| pet.id == a.pet_id)
                .map(|pet| pet.name.clone())
                .unwrap_or_else(|| "?".into()),
            status: match a.status {
                AppointmentStatus::Pending => "awaiting confirmation".into(),
                other => other.to_string(),
            },
        })
        .collect();

    Ok(AskamaTemplateResponse::into_response(HomeTemplate {
        display_name: profile
            .as_ref()
            .map(|p| p.display_name().to_string())
            .unwrap_or_else(|| user.email().to_string()),
        is_admin: profile.is_some_and(|p| p.role() == UserRole::Admin),
        pets: pets
            .into_iter()
            .map(|pet| HomePet {
                id: pet.id,
                name: pet.name,
                species: pet.species,
            })
            .collect(),
        upcoming,
    }))
}

#[derive(Template)]
#[template(path = "auth/login.html")]
pub struct LoginTemplate {
    show_error: bool,
    error_message: String,
    email: String,
}

async fn login_form() -> impl IntoResponse {
    AskamaTemplateResponse::into_response(LoginTemplate {
        show_error: false,
        error_message: String::new(),
        email: String::new(),
    })
}

#[derive(Deserialize)]
struct LoginForm {
    email: String,
    password: String,
}

async fn login_submit(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Form(form): Form<LoginForm>,
) -> Result<Response, AppError> {
    match state.backend.sign_in(&form.email, &form.password).await {
        Ok(session) => Ok(signed_in(&state, jar, &session)),
        Err(BackendError::InvalidCredentials) => Ok(render_login_error(
            form.email,
            "That email and password combination did not work.".into(),
        )),
        Err(err) => Err(err.into()),
    }
}

fn render_login_error(email: String, message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        AskamaTemplateResponse::into_response(LoginTemplate {
            show_error: true,
            error_message: message,
            email,
        }),
    )
        .into_response()
}

fn signed_in(state: &AppState, jar: PrivateCookieJar, session: &Session) -> Response {
    let secure = !state.config.is_development();
    (
        auth::apply_session_cookies(jar, &session.tokens, secure),
        Redirect::to("/"),
    )
        .into_response()
}

#[derive(Template)]
#[template(path = "auth/register.html")]
pub struct RegisterTemplate {
    show_error: bool,
    error_message: String,
    full_name: String,
    email: String,
}

async fn register_form() -> impl IntoResponse {
    AskamaTemplateResponse::into_response(RegisterTemplate {
        show_error: false,
        error_message: String::new(),
        full_name: String::new(),
        email: String::new(),
    })
}

#[derive(Deserialize)]
struct RegisterForm {
    #[serde(default)]
    full_name: Option<String>,
    email: String,
    password: String,
    password_confirm: String,
}

#[derive(Template)]
#[template(path = "auth/notice.html")]
struct NoticeTemplate {
    title: String,
    message: String,
}

async fn register_submit(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    Form(form): Form<RegisterForm>,
) -> Result<Response, AppError> {
    let full_name = normalize_optional(form.full_name);
    let email = form.email.trim().to_string();
    let reject = |message: &str| -> Result<Response, AppError> {
        Ok(render_register_error(
            full_name.clone().unwrap_or_default(),
            email.clone(),
            message.to_string(),
        ))
    };

    if !email.contains('@') {
        return reject("Please enter a valid email address.");
    }
    if form.password.chars().count() < MIN_PASSWORD_LEN {
        return reject("Passwords need at least 8 characters.");
    }
    if form.password != form.password_confirm {
        return reject("The passwords do not match.");
    }

    let account = NewAccount {
        email: email.clone(),
        password: form.password,
        full_name: full_name.clone(),
    };
    match state.backend.sign_up(account).await {
        Ok(Some(session)) => Ok(signed_in(&state, jar, &session)),
        Ok(None) => Ok(AskamaTemplateResponse::into_response(NoticeTemplate {
            title: "Check your inbox".into(),
            message: format!(
                "We sent a confirmation link to {email}. Follow it, then log in."
            ),
        })),
        Err(BackendError::Conflict(message)) => reject(&message),
        Err(err) => Err(err.into()),
    }
}

fn render_register_error(full_name: String, email: String, message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        AskamaTemplateResponse::into_response(RegisterTemplate {
            show_error: true,
            error_message: message,
            full_name,
            email,
        }),
    )
        .into_response()
}

#[derive(Template)]
#[template(path = "auth/forgot_password.html")]
struct ForgotPasswordTemplate {
    show_error: bool,
    error_message: String,
    email: String,
}

async fn forgot_password_form() -> impl IntoResponse {
    AskamaTemplateResponse::into_response(ForgotPasswordTemplate {
        show_error: false,
        error_message: String::new(),
        email: String::new(),
    })
}

#[derive(Deserialize)]
struct ForgotPasswordForm {
    email: String,
}

async fn forgot_password_submit(
    State(state): State<AppState>,
    Form(form): Form<ForgotPasswordForm>,
) -> Result<Response, AppError> {
    let email = form.email.trim().to_string();
    if !email.contains('@') {
        return Ok((
            StatusCode::BAD_REQUEST,
            AskamaTemplateResponse::into_response(ForgotPasswordTemplate {
                show_error: true,
                error_message: "Please enter a valid email address.".into(),
                email,
            }),
        )
            .into_response());
    }
    // Same answer whether or not the account exists.
    if let Err(err) = state.backend.send_password_reset(&email).await {
        warn!("password reset request failed: {err}");
    }
    Ok(AskamaTemplateResponse::into_response(NoticeTemplate {
        title: "Check your inbox".into(),
        message: format!(
            "If an account exists for {email}, a link to reset the password is on its way."
        ),
    }))
}

async fn logout(
    State(state): State<AppState>,
    jar: PrivateCookieJar,
    verified: Option<Extension<SessionTokens>>,
) -> Result<(PrivateCookieJar, Redirect), AppError> {
    let tokens = verified
        .map(|Extension(tokens)| tokens)
        .or_else(|| auth::read_session_tokens(&jar));
    if let Some(tokens) = tokens {
        if let Err(err) = state.backend.sign_out(&tokens).await {
            warn!("sign-out at backend failed: {err}");
        }
    }
    Ok((auth::clear_session_cookies(jar), Redirect::to("/")))
}
