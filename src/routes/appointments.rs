use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_with::{serde_as, NoneAsEmptyString};
use tracing::{info, warn};

use crate::{
    auth::{AuthenticatedUser, CurrentUser},
    error::AppError,
    models::appointment::{AppointmentDetails, AppointmentStatus, NewAppointment, ServiceKind},
    routes::{format_timestamp, SelectOption},
    services::mail::{send_appointment_email, EmailKind},
    state::AppState,
};

const DATETIME_LOCAL_FORMAT: &str = "%Y-%m-%dT%H:%M";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(appointments_list).post(appointment_book))
        .route("/:id/cancel", post(appointment_cancel))
}

#[derive(Clone)]
struct AppointmentRow {
    id: String,
    when: String,
    service: String,
    pet_name: String,
    status: String,
    notes: String,
    can_cancel: bool,
}

#[derive(Template)]
#[template(path = "appointments/list.html")]
struct AppointmentsTemplate {
    appointments: Vec<AppointmentRow>,
    pets: Vec<SelectOption>,
    services: Vec<SelectOption>,
    show_error: bool,
    error_message: String,
}

async fn render_list(
    state: &AppState,
    user: &AuthenticatedUser,
    selected_pet: Option<&str>,
    error: Option<String>,
) -> Result<AppointmentsTemplate, AppError> {
    let pets = state.backend.list_pets(&user.caller).await?;
    let appointments = state.backend.list_appointments(&user.caller).await?;
    let rows = appointments
        .into_iter()
        .map(|a| AppointmentRow {
            when: format_timestamp(a.scheduled_at),
            service: a.service.label().to_string(),
            pet_name: pets
                .iter()
                .find(|pet| pet.id == a.pet_id)
                .map(|pet| pet.name.clone())
                .unwrap_or_else(|| "?".into()),
            status: a.status.to_string(),
            notes: a.notes.clone().unwrap_or_default(),
            can_cancel: a.status.can_become(AppointmentStatus::Cancelled),
            id: a.id,
        })
        .collect();
    Ok(AppointmentsTemplate {
        appointments: rows,
        pets: pets
            .iter()
            .map(|pet| SelectOption {
                value: pet.id.clone(),
                label: pet.name.clone(),
                selected: selected_pet == Some(pet.id.as_str()),
            })
            .collect(),
        services: ServiceKind::ALL
            .into_iter()
            .map(|kind| SelectOption {
                value: kind.as_str().to_string(),
                label: kind.label().to_string(),
                selected: false,
            })
            .collect(),
        show_error: error.is_some(),
        error_message: error.unwrap_or_default(),
    })
}

async fn appointments_list(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let user = current.require_user()?;
    let template = render_list(&state, user, None, None).await?;
    Ok(AskamaTemplateResponse::into_response(template))
}

#[serde_as]
#[derive(Deserialize)]
struct BookingForm {
    pet_id: String,
    service: String,
    scheduled_at: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    notes: Option<String>,
}

/// Reads a `datetime-local` input as wall-clock time of the server.
fn parse_local_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), DATETIME_LOCAL_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn booking_from_form(form: BookingForm, now: DateTime<Utc>) -> Result<NewAppointment, String> {
    let service = form.service.parse::<ServiceKind>()?;
    let scheduled_at = parse_local_datetime(&form.scheduled_at)
        .ok_or_else(|| "Please pick a date and time.".to_string())?;
    if scheduled_at <= now {
        return Err("Appointments have to be in the future.".into());
    }
    Ok(NewAppointment {
        pet_id: form.pet_id,
        service,
        scheduled_at,
        notes: form.notes.map(|n| n.trim().to_string()),
    })
}

async fn appointment_book(
    State(state): State<AppState>,
    current: CurrentUser,
    Form(form): Form<BookingForm>,
) -> Result<Response, AppError> {
    let user = current.require_user()?;
    let pet_id = form.pet_id.clone();

    let owns_pet = state.backend.get_pet(&user.caller, &pet_id).await?.is_some();
    let booking = if owns_pet {
        booking_from_form(form, Utc::now())
    } else {
        Err("Please choose one of your pets.".into())
    };

    match booking {
        Ok(new) => {
            let appointment = state.backend.create_appointment(&user.caller, new).await?;
            info!(
                user_id = %user.id(),
                appointment_id = %appointment.id,
                service = %appointment.service.as_str(),
                "appointment requested"
            );
            Ok(Redirect::to("/appointments").into_response())
        }
        Err(message) => {
            let template = render_list(&state, user, Some(&pet_id), Some(message)).await?;
            Ok((
                StatusCode::BAD_REQUEST,
                AskamaTemplateResponse::into_response(template),
            )
                .into_response())
        }
    }
}

async fn appointment_cancel(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(appointment_id): Path<String>,
) -> Result<Redirect, AppError> {
    let user = current.require_user()?;
    let details = state
        .backend
        .appointment_details(&user.caller, &appointment_id)
        .await?
        .filter(|details| details.appointment.owner_id == user.id())
        .ok_or(AppError::NotFound)?;
    if !details
        .appointment
        .status
        .can_become(AppointmentStatus::Cancelled)
    {
        return Err(AppError::BadRequest(format!(
            "A {} appointment can no longer be cancelled.",
            details.appointment.status
        )));
    }

    let updated = state
        .backend
        .set_appointment_status(&user.caller, &appointment_id, AppointmentStatus::Cancelled)
        .await?;
    info!(user_id = %user.id(), %appointment_id, "appointment cancelled by owner");

    let details = AppointmentDetails {
        appointment: updated,
        ..details
    };
    if let Err(err) = send_appointment_email(
        state.mailer.as_ref(),
        EmailKind::Cancellation,
        &details,
        &details.owner_email,
        &state.config.public_url,
    )
    .await
    {
        warn!(%appointment_id, "cancellation email failed: {err}");
    }
    Ok(Redirect::to("/appointments"))
}
