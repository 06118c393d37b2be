use actix_web::{
    middleware::{NormalizePath, TrailingSlash},
    web::{Data, JsonConfig},
    App, HttpServer,
};
use auth::middleware::ApiKeyAuth;
use config::Config;
use error::Error;
use tracing::level_filters::LevelFilter;
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod message;
pub mod reaper;
pub mod service;
pub mod store;
pub mod topic;

/// JSON extractor settings shared by the server and the HTTP tests. Body
/// errors are reported like every other validation error.
pub fn json_config() -> JsonConfig {
    JsonConfig::default()
        .content_type_required(false)
        .error_handler(|err, _req| Error::validation(err.to_string()).into())
}

/// Returns a builder for the main application.
///
/// Configuration is read from the environment when not given explicitly.
#[bon::builder(finish_fn = start)]
pub async fn run(config: Option<Config>) -> eyre::Result<()> {
    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("LEASEMQ_LOG")
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .finish()
        .try_init()?;

    let config = match config {
        Some(config) => config,
        None => Config::load()?,
    };

    let api_key_hash = config.api_key_hash()?;
    if api_key_hash.is_none() {
        tracing::warn!("LEASEMQ_API_KEY_HASH is not set, API authentication is disabled");
    }

    let bind = (config.host().to_owned(), config.port());
    let reap_interval = config.reap_interval();

    let service = service::Service::connect_with()
        .config(config)
        .call()
        .await?;

    let reaper = reaper::spawn(service.clone(), reap_interval);

    let data = Data::new(service);
    let auth = ApiKeyAuth::new(api_key_hash);

    tracing::info!(host = %bind.0, port = bind.1, "Starting server");

    HttpServer::new(move || {
        App::new()
            .wrap(NormalizePath::new(TrailingSlash::Trim))
            .wrap(TracingLogger::default())
            .service(api::health::healthz)
            .service(api::queue::service().wrap(auth.clone()))
            .app_data(data.clone())
            .app_data(json_config())
    })
    .bind(bind)?
    .run()
    .await?;

    reaper.abort();

    Ok(())
}
