use std::{env, net::SocketAddr, path::PathBuf, str::FromStr};

use crate::error::AppError;

const DEV_COOKIE_SECRET: &str = "petcare-development-cookie-secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(AppError::Config(format!("invalid APP_ENV `{other}`"))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Remote { url: String, anon_key: String },
    Local {
        database_url: String,
        storage_root: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_url: String,
    /// Without a key mails are only logged.
    pub api_key: Option<String>,
    pub from: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub environment: Environment,
    pub public_url: String,
    pub cookie_secret: String,
    pub backend: BackendConfig,
    pub mail: MailConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let listen_addr: SocketAddr = var("APP_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3000".to_string())
            .parse()
            .map_err(|err| AppError::Config(format!("invalid APP_LISTEN_ADDR: {err}")))?;

        let environment = match var("APP_ENV") {
            Some(raw) => raw.parse()?,
            None => Environment::Production,
        };

        let public_url = var("APP_PUBLIC_URL")
            .unwrap_or_else(|| "http://localhost:3000".to_string())
            .trim_end_matches('/')
            .to_string();

        let cookie_secret = match (var("COOKIE_SECRET"), environment) {
            (Some(secret), _) => secret,
            (None, Environment::Development) => DEV_COOKIE_SECRET.to_string(),
            (None, Environment::Production) => {
                return Err(AppError::Config(
                    "COOKIE_SECRET must be set in production".into(),
                ))
            }
        };

        let backend = match (var("BACKEND_URL"), var("BACKEND_ANON_KEY")) {
            (Some(url), Some(anon_key)) => BackendConfig::Remote { url, anon_key },
            (Some(_), None) | (None, Some(_)) => {
                return Err(AppError::Config(
                    "BACKEND_URL and BACKEND_ANON_KEY must be set together".into(),
                ))
            }
            (None, None) => BackendConfig::Local {
                database_url: var("DATABASE_URL")
                    .unwrap_or_else(|| "sqlite://petcare.db".to_string()),
                storage_root: var("STORAGE_ROOT")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("storage")),
            },
        };

        let mail = MailConfig {
            api_url: var("MAIL_API_URL")
                .unwrap_or_else(|| "https://api.resend.com/emails".to_string()),
            api_key: var("MAIL_API_KEY"),
            from: var("MAIL_FROM")
                .unwrap_or_else(|| "Pet Care <appointments@petcare.local>".to_string()),
        };

        Ok(Self {
            listen_addr,
            environment,
            public_url,
            cookie_secret,
            backend,
            mail,
        })
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }
}
