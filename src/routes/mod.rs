pub mod admin;
pub mod api;
pub mod appointments;
pub mod pets;
pub mod public;

use axum::{middleware::from_fn_with_state, routing::get, Router};
use chrono::{DateTime, Local, Utc};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::{gate::session_gate, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let mut router = Router::new()
        .merge(public::router())
        .nest("/pets", pets::router())
        .nest("/appointments", appointments::router())
        .nest("/admin", admin::router())
        .nest("/api", api::router())
        .route("/healthz", get(healthz));
    if let Some(root) = &state.local_storage {
        router = router.nest_service("/storage", ServeDir::new(root));
    }
    router
        .layer(from_fn_with_state(state.clone(), session_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// `<select>` entry for askama templates.
#[derive(Clone)]
pub(crate) struct SelectOption {
    pub value: String,
    pub label: String,
    pub selected: bool,
}

pub(crate) fn normalize_optional(input: Option<String>) -> Option<String> {
    input.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%d.%m.%Y %H:%M")
        .to_string()
}
