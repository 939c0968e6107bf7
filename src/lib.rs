// src/lib.rs

pub mod antinuke;
pub mod config;
pub mod db;
pub mod discord;
pub mod logging;

use anyhow::Result;
use std::sync::Arc;

use antinuke::audit_cache::AuditSource;
use antinuke::{AntinukeControl, AntinukeService, ConfigStore, ConfigWriter, MemoryStore, PgStore};
use config::Settings;
use db::Db;
use discord::SerenityAdmin;

use serenity::all::GatewayIntents;
use serenity::http::Http;

/// Globalny kontekst aplikacji.
/// Konfiguracja, (opcjonalny) uchwyt do DB i gotowy serwis AntiNuke z panelem sterowania.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Settings,
    pub db: Option<Db>,
    antinuke: Arc<AntinukeService>,
    control: Arc<AntinukeControl>,
}

impl AppContext {
    /// Bootstrap całej aplikacji:
    /// - logi
    /// - połączenie z DB + tabele (albo magazyn w pamięci, gdy brak URL)
    /// - AntiNuke: serwis z workerami + panel sterowania
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        // 1) logi
        logging::init(&settings);

        // 2) magazyn konfiguracji
        let (db, store, writer): (Option<Db>, Arc<dyn ConfigStore>, Arc<dyn ConfigWriter>) =
            if settings.database.url.is_empty() {
                tracing::warn!("database.url is empty, antinuke config lives in memory only");
                let mem = Arc::new(MemoryStore::new());
                (None, mem.clone(), mem)
            } else {
                let db = db::connect(
                    &settings.database.url,
                    settings.database.max_connections,
                    settings.database.statement_timeout_ms,
                )
                .await?;
                db::ensure_tables(&db).await?;
                let pg = Arc::new(PgStore::new(db.clone()));
                (Some(db), pg.clone(), pg)
            };

        // 3) API Discorda dla workerów i audit logu
        let http = Arc::new(Http::new(&settings.discord.token));
        let admin = Arc::new(SerenityAdmin::new(http));
        let audit_source: Arc<dyn AuditSource> = admin.clone();

        // 4) AntiNuke
        let antinuke = AntinukeService::new(settings.antinuke.clone(), store, admin, Some(audit_source));
        let control = Arc::new(AntinukeControl::new(writer, antinuke.clone()));

        Ok(Arc::new(Self {
            settings,
            db,
            antinuke,
            control,
        }))
    }

    /// Wygodny getter: serwis AntiNuke.
    pub fn antinuke(&self) -> Arc<AntinukeService> {
        self.antinuke.clone()
    }

    /// Zapisy konfiguracji (każdy kończy się `refresh` gildii).
    pub fn control(&self) -> Arc<AntinukeControl> {
        self.control.clone()
    }

    /// Środowisko: "production" | "development".
    #[inline]
    pub fn env(&self) -> &str {
        &self.settings.env
    }
}

/// Minimalny zestaw intents dla AntiNuke:
/// - GUILDS (kanały/role), GUILD_MEMBERS (role członków do whitelisty),
/// - GUILD_MODERATION (wpisy audit logu), GUILD_WEBHOOKS.
pub fn default_gateway_intents() -> GatewayIntents {
    GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MEMBERS
        | GatewayIntents::GUILD_MODERATION
        | GatewayIntents::GUILD_WEBHOOKS
}

/// Start klienta Discorda (Gateway).
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    discord::run_bot(ctx).await
}
