use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ServiceKind {
    Grooming,
    Bathing,
    Walking,
    Boarding,
    VetVisit,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 5] = [
        ServiceKind::Grooming,
        ServiceKind::Bathing,
        ServiceKind::Walking,
        ServiceKind::Boarding,
        ServiceKind::VetVisit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Grooming => "grooming",
            ServiceKind::Bathing => "bathing",
            ServiceKind::Walking => "walking",
            ServiceKind::Boarding => "boarding",
            ServiceKind::VetVisit => "vet_visit",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ServiceKind::Grooming => "Grooming",
            ServiceKind::Bathing => "Bath & brush",
            ServiceKind::Walking => "Dog walking",
            ServiceKind::Boarding => "Boarding",
            ServiceKind::VetVisit => "Vet visit",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim())
            .ok_or_else(|| format!("unknown service `{s}`"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AppointmentStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Cancelled | AppointmentStatus::Completed
        )
    }

    pub fn can_become(&self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            "completed" => Ok(AppointmentStatus::Completed),
            other => Err(format!("unknown appointment status `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Appointment {
    pub id: String,
    pub owner_id: String,
    pub pet_id: String,
    pub service: ServiceKind,
    pub scheduled_at: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Appointment {
    pub fn when_text(&self) -> String {
        format_when(self.scheduled_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAppointment {
    pub pet_id: String,
    pub service: ServiceKind,
    pub scheduled_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// An appointment joined with what the emails and the admin list need.
#[derive(Debug, Clone, FromRow)]
pub struct AppointmentDetails {
    #[sqlx(flatten)]
    pub appointment: Appointment,
    pub pet_name: String,
    pub owner_email: String,
    pub owner_name: Option<String>,
}

impl AppointmentDetails {
    pub fn owner_display(&self) -> &str {
        self.owner_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.owner_email)
    }
}

pub fn format_when(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local)
        .format("%a %d.%m.%Y %H:%M")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_move() {
        use AppointmentStatus::*;
        assert!(Pending.can_become(Confirmed));
        assert!(Confirmed.can_become(Cancelled));
        assert!(!Cancelled.can_become(Confirmed));
        assert!(!Completed.can_become(Pending));
        assert!(!Pending.can_become(Completed));
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn service_kind_uses_snake_case_names() {
        assert_eq!("vet_visit".parse::<ServiceKind>(), Ok(ServiceKind::VetVisit));
        assert_eq!(
            serde_json::to_string(&ServiceKind::VetVisit).unwrap(),
            "\"vet_visit\""
        );
        assert!("spa".parse::<ServiceKind>().is_err());
    }
}
