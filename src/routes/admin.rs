use askama::Template;
use askama_axum::IntoResponse as AskamaTemplateResponse;
use axum::{
    extract::{Path, State},
    response::{IntoResponse, Redirect},
    routing::{get, post},
    Form, Router,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    auth::CurrentUser,
    error::AppError,
    models::{
        appointment::{AppointmentDetails, AppointmentStatus},
        user::UserRole,
    },
    routes::{format_timestamp, SelectOption},
    services::mail::{send_appointment_email, EmailKind},
    state::AppState,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(dashboard))
        .route("/users", get(users_list))
        .route("/users/:id/role", post(update_user_role))
        .route("/appointments", get(appointments_list))
        .route("/appointments/:id/status", post(update_appointment_status))
        .route("/appointments/:id/remind", post(send_reminder))
}

#[derive(Template)]
#[template(path = "admin/dashboard.html")]
struct AdminDashboardTemplate {
    user_count: usize,
    admin_count: usize,
    pending_count: usize,
    upcoming_count: usize,
    /// Next five upcoming appointments.
    appointments: Vec<AdminAppointmentRow>,
}

#[derive(Clone)]
struct AdminAppointmentRow {
    id: String,
    when: String,
    service: String,
    pet_name: String,
    owner: String,
    status: String,
    notes: String,
    next_statuses: Vec<SelectOption>,
    can_remind: bool,
}

impl From<&AppointmentDetails> for AdminAppointmentRow {
    fn from(details: &AppointmentDetails) -> Self {
        let appointment = &details.appointment;
        let status = appointment.status;
        Self {
            id: appointment.id.clone(),
            when: format_timestamp(appointment.scheduled_at),
            service: appointment.service.label().to_string(),
            pet_name: details.pet_name.clone(),
            owner: details.owner_display().to_string(),
            status: status.to_string(),
            notes: appointment.notes.clone().unwrap_or_default(),
            next_statuses: [
                AppointmentStatus::Confirmed,
                AppointmentStatus::Completed,
                AppointmentStatus::Cancelled,
            ]
            .into_iter()
            .filter(|next| status.can_become(*next))
            .map(|next| SelectOption {
                value: next.as_str().to_string(),
                label: next.as_str().to_string(),
                selected: false,
            })
            .collect(),
            can_remind: !status.is_terminal(),
        }
    }
}

async fn dashboard(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let profiles = state.backend.list_profiles(&admin.caller).await?;
    let appointments = state.backend.list_appointment_details(&admin.caller).await?;

    let now = Utc::now();
    let mut upcoming: Vec<&AppointmentDetails> = appointments
        .iter()
        .filter(|d| d.appointment.scheduled_at >= now && !d.appointment.status.is_terminal())
        .collect();
    upcoming.sort_by_key(|d| d.appointment.scheduled_at);

    Ok(AskamaTemplateResponse::into_response(
        AdminDashboardTemplate {
            user_count: profiles.len(),
            admin_count: profiles.iter().filter(|p| p.role().is_admin()).count(),
            pending_count: appointments
                .iter()
                .filter(|d| d.appointment.status == AppointmentStatus::Pending)
                .count(),
            upcoming_count: upcoming.len(),
            appointments: upcoming
                .into_iter()
                .take(5)
                .map(AdminAppointmentRow::from)
                .collect(),
        },
    ))
}

#[derive(Template)]
#[template(path = "admin/users.html")]
struct AdminUsersTemplate {
    users: Vec<AdminUserRow>,
}

#[derive(Clone)]
struct AdminUserRow {
    id: String,
    email: String,
    full_name: String,
    role: String,
    is_admin: bool,
    is_self: bool,
    created_at: String,
}

async fn users_list(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let profiles = state.backend.list_profiles(&admin.caller).await?;
    let users = profiles
        .into_iter()
        .map(|profile| AdminUserRow {
            is_admin: profile.role().is_admin(),
            is_self: profile.id == admin.id(),
            role: profile.role().to_string(),
            created_at: format_timestamp(profile.created_at),
            full_name: profile.full_name.clone().unwrap_or_else(|| "–".into()),
            id: profile.id,
            email: profile.email,
        })
        .collect();
    Ok(AskamaTemplateResponse::into_response(AdminUsersTemplate {
        users,
    }))
}

#[derive(Deserialize)]
struct RoleForm {
    role: String,
}

async fn update_user_role(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(user_id): Path<String>,
    Form(form): Form<RoleForm>,
) -> Result<Redirect, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let role: UserRole = form
        .role
        .parse()
        .map_err(|_| AppError::BadRequest(format!("unknown role `{}`", form.role)))?;
    if user_id == admin.id() && !role.is_admin() {
        return Err(AppError::BadRequest(
            "You cannot remove your own admin role.".into(),
        ));
    }
    state
        .backend
        .update_role(&admin.caller, &user_id, role)
        .await?;
    info!(admin_id = %admin.id(), %user_id, %role, "role changed");
    Ok(Redirect::to("/admin/users"))
}

#[derive(Template)]
#[template(path = "admin/appointments.html")]
struct AdminAppointmentsTemplate {
    appointments: Vec<AdminAppointmentRow>,
}

async fn appointments_list(
    State(state): State<AppState>,
    current: CurrentUser,
) -> Result<impl IntoResponse, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let appointments = state.backend.list_appointment_details(&admin.caller).await?;
    Ok(AskamaTemplateResponse::into_response(
        AdminAppointmentsTemplate {
            appointments: appointments.iter().map(AdminAppointmentRow::from).collect(),
        },
    ))
}

#[derive(Deserialize)]
struct StatusForm {
    status: String,
}

/// Email that goes out when an appointment enters `status`, if any.
fn status_email(status: AppointmentStatus) -> Option<EmailKind> {
    match status {
        AppointmentStatus::Confirmed => Some(EmailKind::Confirmation),
        AppointmentStatus::Cancelled => Some(EmailKind::Cancellation),
        AppointmentStatus::Pending | AppointmentStatus::Completed => None,
    }
}

async fn update_appointment_status(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(appointment_id): Path<String>,
    Form(form): Form<StatusForm>,
) -> Result<Redirect, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let status: AppointmentStatus = form.status.parse().map_err(AppError::BadRequest)?;
    let details = state
        .backend
        .appointment_details(&admin.caller, &appointment_id)
        .await?
        .ok_or(AppError::NotFound)?;
    let current_status = details.appointment.status;
    if !current_status.can_become(status) {
        return Err(AppError::BadRequest(format!(
            "cannot move a {current_status} appointment to {status}"
        )));
    }

    let updated = state
        .backend
        .set_appointment_status(&admin.caller, &appointment_id, status)
        .await?;
    info!(admin_id = %admin.id(), %appointment_id, from = %current_status, to = %status, "appointment status changed");

    if let Some(kind) = status_email(status) {
        let details = AppointmentDetails {
            appointment: updated,
            ..details
        };
        if let Err(err) = send_appointment_email(
            state.mailer.as_ref(),
            kind,
            &details,
            &details.owner_email,
            &state.config.public_url,
        )
        .await
        {
            warn!(%appointment_id, %kind, "status email failed: {err}");
        }
    }
    Ok(Redirect::to("/admin/appointments"))
}

async fn send_reminder(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(appointment_id): Path<String>,
) -> Result<Redirect, AppError> {
    let admin = current.require_admin(state.backend.as_ref()).await?;
    let details = state
        .backend
        .appointment_details(&admin.caller, &appointment_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if details.appointment.status.is_terminal() {
        return Err(AppError::BadRequest(format!(
            "no reminders for {} appointments",
            details.appointment.status
        )));
    }
    let sent = send_appointment_email(
        state.mailer.as_ref(),
        EmailKind::Reminder,
        &details,
        &details.owner_email,
        &state.config.public_url,
    )
    .await?;
    info!(admin_id = %admin.id(), %appointment_id, message_id = %sent.message_id, "reminder sent");
    Ok(Redirect::to("/admin/appointments"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_confirm_and_cancel_send_mail() {
        assert_eq!(status_email(AppointmentStatus::Confirmed), Some(EmailKind::Confirmation));
        assert_eq!(status_email(AppointmentStatus::Cancelled), Some(EmailKind::Cancellation));
        assert_eq!(status_email(AppointmentStatus::Completed), None);
        assert_eq!(status_email(AppointmentStatus::Pending), None);
    }
}
