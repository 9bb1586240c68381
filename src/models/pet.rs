use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum PetSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl PetSize {
    pub const ALL: [PetSize; 3] = [PetSize::Small, PetSize::Medium, PetSize::Large];

    pub fn as_str(&self) -> &'static str {
        match self {
            PetSize::Small => "small",
            PetSize::Medium => "medium",
            PetSize::Large => "large",
        }
    }
}

impl fmt::Display for PetSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PetSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PetSize::ALL
            .into_iter()
            .find(|size| size.as_str() == s.trim())
            .ok_or_else(|| format!("unknown pet size `{s}`"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Pet {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
    pub size: PetSize,
    pub notes: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Pet {
    pub fn breed_text(&self) -> &str {
        self.breed.as_deref().unwrap_or("unknown breed")
    }

    pub fn notes_display(&self) -> &str {
        self.notes.as_deref().unwrap_or("")
    }
}

/// Editable fields of a pet, used for both create and full update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PetDraft {
    pub name: String,
    pub species: String,
    pub breed: Option<String>,
    pub size: PetSize,
    pub notes: Option<String>,
}

impl PetDraft {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Your pet needs a name.".into());
        }
        if self.name.chars().count() > 80 {
            return Err("Pet names are limited to 80 characters.".into());
        }
        if self.species.trim().is_empty() {
            return Err("Please tell us the species.".into());
        }
        Ok(())
    }
}
