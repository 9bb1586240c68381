use std::sync::Arc;

use petcare::backend::{Backend, LocalBackend, RemoteBackend};
use petcare::config::{AppConfig, BackendConfig};
use petcare::error::AppError;
use petcare::routes::create_router;
use petcare::services::mail::mailer_from_config;
use petcare::state::AppState;
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    init_logging();

    let config = AppConfig::from_env()?;
    if config.is_development() {
        warn!("running in development mode, /api/test-email is open to everyone");
    }

    let mailer = mailer_from_config(&config.mail)?;
    if config.mail.api_key.is_none() {
        info!("MAIL_API_KEY not set, outgoing mail is only logged");
    }

    let state = match &config.backend {
        BackendConfig::Remote { url, anon_key } => {
            info!(%url, "using remote backend");
            let backend: Arc<dyn Backend> = Arc::new(RemoteBackend::new(url, anon_key.clone())?);
            AppState::new(config.clone(), backend, mailer)
        }
        BackendConfig::Local {
            database_url,
            storage_root,
        } => {
            info!(%database_url, storage_root = %storage_root.display(), "using local backend");
            let public_base = format!("{}/storage", config.public_url);
            let local =
                LocalBackend::open(database_url, storage_root.clone(), public_base).await?;
            let backend: Arc<dyn Backend> = Arc::new(local);
            AppState::new(config.clone(), backend, mailer).with_local_storage(storage_root.clone())
        }
    };

    let app = create_router(state);

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,petcare=debug".into());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
