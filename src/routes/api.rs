use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use chrono::{Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    auth::CurrentUser,
    error::{ApiError, AppError},
    models::appointment::{Appointment, AppointmentDetails, AppointmentStatus, ServiceKind},
    services::mail::{is_valid_recipient, send_appointment_email, EmailKind},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/test-email", post(test_email))
}

#[derive(Debug, Deserialize)]
struct TestEmailRequest {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TestEmailResponse {
    success: bool,
    message: String,
    message_id: String,
}

/// Sends one of the appointment emails, filled with a made-up booking, so the
/// mail setup can be checked without touching real appointments.
async fn test_email(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Bytes,
) -> Result<Json<TestEmailResponse>, ApiError> {
    if !state.config.is_development() {
        current.require_admin(state.backend.as_ref()).await?;
    }

    let request: TestEmailRequest = serde_json::from_slice(&body)
        .map_err(|err| AppError::BadRequest(format!("invalid request body: {err}")))?;
    let kind: EmailKind = request.kind.parse().map_err(AppError::BadRequest)?;

    let recipient = request
        .email
        .map(|email| email.trim().to_string())
        .filter(|email| !email.is_empty())
        .or_else(|| current.0.as_ref().map(|user| user.email().to_string()))
        .ok_or_else(|| AppError::BadRequest("no recipient: pass `email` or sign in".into()))?;
    if !is_valid_recipient(&recipient) {
        return Err(AppError::BadRequest(format!("invalid recipient `{recipient}`")).into());
    }

    let details = sample_appointment(&recipient);
    let sent = send_appointment_email(
        state.mailer.as_ref(),
        kind,
        &details,
        &recipient,
        &state.config.public_url,
    )
    .await?;
    info!(%kind, to = %recipient, message_id = %sent.message_id, "test email sent");

    Ok(Json(TestEmailResponse {
        success: true,
        message: format!("{kind} email sent to {recipient}"),
        message_id: sent.message_id,
    }))
}

fn sample_appointment(recipient: &str) -> AppointmentDetails {
    let now = Utc::now();
    let tomorrow = now + Duration::days(1);
    let scheduled_at = tomorrow
        .duration_trunc(Duration::hours(1))
        .unwrap_or(tomorrow);
    AppointmentDetails {
        appointment: Appointment {
            id: "test-appointment".into(),
            owner_id: "test-owner".into(),
            pet_id: "test-pet".into(),
            service: ServiceKind::Grooming,
            scheduled_at,
            status: AppointmentStatus::Confirmed,
            notes: Some("This is a test email. No appointment was booked.".into()),
            created_at: now,
        },
        pet_name: "Biscuit".into(),
        owner_email: recipient.to_string(),
        owner_name: None,
    }
}
