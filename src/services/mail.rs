use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use askama::Template;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::{config::MailConfig, models::appointment::AppointmentDetails};

#[derive(Debug, Error)]
pub enum MailError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("mail provider rejected the message ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not render email: {0}")]
    Render(#[from] askama::Error),
    #[error("invalid recipient `{0}`")]
    InvalidRecipient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailKind {
    Confirmation,
    Reminder,
    Cancellation,
}

impl EmailKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailKind::Confirmation => "confirmation",
            EmailKind::Reminder => "reminder",
            EmailKind::Cancellation => "cancellation",
        }
    }
}

impl fmt::Display for EmailKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EmailKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmation" => Ok(EmailKind::Confirmation),
            "reminder" => Ok(EmailKind::Reminder),
            "cancellation" => Ok(EmailKind::Cancellation),
            other => Err(format!(
                "invalid email type `{other}`, expected confirmation, reminder or cancellation"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub message_id: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError>;
}

/// Sends through a JSON mail API (`POST {from, to, subject, html, text}` with a
/// bearer key, answering `{"id": ...}`).
#[derive(Clone)]
pub struct HttpMailer {
    http: Client,
    api_url: String,
    api_key: String,
    from: String,
}

#[derive(Deserialize)]
struct ProviderReceipt {
    id: String,
}

impl HttpMailer {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
    ) -> Result<Self, MailError> {
        let http = Client::builder().timeout(Duration::from_secs(15)).build()?;
        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [email.to],
                "subject": email.subject,
                "html": email.html,
                "text": email.text,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(MailError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let receipt: ProviderReceipt = response.json().await?;
        info!(to = %email.to, message_id = %receipt.id, "email sent");
        Ok(SentEmail {
            message_id: receipt.id,
        })
    }
}

/// Development mailer: logs the message instead of delivering it.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutgoingEmail) -> Result<SentEmail, MailError> {
        let message_id = format!("log-{}", Uuid::new_v4());
        info!(
            to = %email.to,
            subject = %email.subject,
            %message_id,
            "email not delivered (no mail API key)\n{}",
            email.text
        );
        Ok(SentEmail { message_id })
    }
}

pub fn mailer_from_config(config: &MailConfig) -> Result<Arc<dyn Mailer>, MailError> {
    Ok(match &config.api_key {
        Some(key) => Arc::new(HttpMailer::new(
            config.api_url.clone(),
            key.clone(),
            config.from.clone(),
        )?),
        None => Arc::new(LogMailer),
    })
}

pub fn is_valid_recipient(address: &str) -> bool {
    let address = address.trim();
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !address.chars().any(char::is_whitespace)
                && !domain.contains('@')
        }
        None => false,
    }
}

#[derive(Template)]
#[template(path = "email/appointment.html")]
struct AppointmentEmailTemplate<'a> {
    headline: &'a str,
    intro: String,
    owner_name: &'a str,
    pet_name: &'a str,
    service: &'a str,
    when: String,
    notes: &'a str,
    link: String,
}

pub fn render_appointment_email(
    kind: EmailKind,
    details: &AppointmentDetails,
    to: &str,
    public_url: &str,
) -> Result<OutgoingEmail, MailError> {
    if !is_valid_recipient(to) {
        return Err(MailError::InvalidRecipient(to.to_string()));
    }
    let appointment = &details.appointment;
    let pet = details.pet_name.as_str();
    let service = appointment.service.label();
    let when = appointment.when_text();

    let (headline, subject, intro) = match kind {
        EmailKind::Confirmation => (
            "Your appointment is confirmed",
            format!("Appointment confirmed: {service} for {pet} on {when}"),
            format!("Good news! We have confirmed {pet}'s {service} appointment."),
        ),
        EmailKind::Reminder => (
            "See you soon",
            format!("Reminder: {pet}'s {service} on {when}"),
            format!("This is a friendly reminder about {pet}'s upcoming {service} appointment."),
        ),
        EmailKind::Cancellation => (
            "Your appointment was cancelled",
            format!("Appointment cancelled: {service} for {pet}"),
            format!("{pet}'s {service} appointment has been cancelled. You can book a new time at any point."),
        ),
    };
    let link = format!("{}/appointments", public_url.trim_end_matches('/'));
    let notes = appointment.notes.as_deref().unwrap_or("");

    let html = AppointmentEmailTemplate {
        headline,
        intro: intro.clone(),
        owner_name: details.owner_display(),
        pet_name: pet,
        service,
        when: when.clone(),
        notes,
        link: link.clone(),
    }
    .render()?;

    let mut text = format!(
        "Hi {},\n\n{intro}\n\nPet: {pet}\nService: {service}\nWhen: {when}\n",
        details.owner_display()
    );
    if !notes.is_empty() {
        text.push_str(&format!("Notes: {notes}\n"));
    }
    text.push_str(&format!("\nManage your appointments: {link}\n"));

    Ok(OutgoingEmail {
        to: to.trim().to_string(),
        subject,
        html,
        text,
    })
}

pub async fn send_appointment_email(
    mailer: &dyn Mailer,
    kind: EmailKind,
    details: &AppointmentDetails,
    to: &str,
    public_url: &str,
) -> Result<SentEmail, MailError> {
    let email = render_appointment_email(kind, details, to, public_url)?;
    mailer.send(email).await
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::models::appointment::{Appointment, AppointmentStatus, ServiceKind};

    fn details(notes: Option<&str>) -> AppointmentDetails {
        AppointmentDetails {
            appointment: Appointment {
                id: "a1".into(),
                owner_id: "u1".into(),
                pet_id: "p1".into(),
                service: ServiceKind::Grooming,
                scheduled_at: Utc.with_ymd_and_hms(2030, 5, 1, 10, 0, 0).unwrap(),
                status: AppointmentStatus::Confirmed,
                notes: notes.map(str::to_string),
                created_at: Utc::now(),
            },
            pet_name: "Biscuit <3".into(),
            owner_email: "kim@example.com".into(),
            owner_name: Some("Kim".into()),
        }
    }

    fn render(kind: EmailKind) -> OutgoingEmail {
        render_appointment_email(kind, &details(None), "kim@example.com", "http://localhost:3000")
            .unwrap()
    }

    #[test]
    fn subjects_follow_the_kind() {
        assert!(render(EmailKind::Confirmation)
            .subject
            .starts_with("Appointment confirmed: Grooming for Biscuit"));
        assert!(render(EmailKind::Reminder)
            .subject
            .starts_with("Reminder: Biscuit <3's Grooming"));
        assert!(render(EmailKind::Cancellation)
            .subject
            .starts_with("Appointment cancelled"));
    }

    #[test]
    fn html_body_is_escaped_and_text_mentions_notes() {
        let email = render_appointment_email(
            EmailKind::Confirmation,
            &details(Some("Sensitive ears")),
            "kim@example.com",
            "https://pets.example.com/",
        )
        .unwrap();
        assert!(email.html.contains("Biscuit &lt;3"));
        assert!(!email.html.contains("Biscuit <3"));
        assert!(email.text.contains("Notes: Sensitive ears"));
        assert!(email.text.contains("https://pets.example.com/appointments"));
    }

    #[test]
    fn rejects_bad_recipients() {
        assert!(is_valid_recipient("kim@example.com"));
        assert!(!is_valid_recipient("kim"));
        assert!(!is_valid_recipient("kim@localhost"));
        assert!(!is_valid_recipient("k im@example.com"));
        assert!(matches!(
            render_appointment_email(EmailKind::Reminder, &details(None), "nope", ""),
            Err(MailError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn parses_kind_names() {
        assert_eq!("reminder".parse::<EmailKind>(), Ok(EmailKind::Reminder));
        assert!("Reminder".parse::<EmailKind>().is_err());
    }
}
