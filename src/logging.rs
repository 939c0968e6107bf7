use crate::config::Settings;
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Inicjalizacja logowania.
/// `RUST_LOG` ma pierwszeństwo; w przeciwnym razie `logging.level`, a sqlx/serenity
/// przyciszamy do `warn`, bo zalewają logi przy każdym zapytaniu.
pub fn init(settings: &Settings) {
    let level = settings
        .logging
        .level
        .clone()
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},sqlx=warn,serenity=warn,tracing::span=warn")));

    // try_init: w testach subscriber mógł już zostać ustawiony
    let _ = subscriber(env_filter, settings.logging.json.unwrap_or(false), std::io::stdout).try_init();
}

/// `json = true` daje jeden obiekt JSON na linię, inaczej zwykły tekst.
fn subscriber<W>(filter: EnvFilter, json: bool, writer: W) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Clone + Send + Sync + 'static,
{
    let json_layer = json.then(|| {
        fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer.clone())
    });
    let text_layer = (!json).then(|| fmt::layer().with_target(true).with_writer(writer));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
}
