// src/discord/mod.rs
use std::sync::Arc;
use anyhow::Result;

use crate::antinuke::model::{audit_codes, AuditEvent};
use crate::AppContext;

use serenity::all::*;
use serenity::async_trait;

pub mod admin;

pub use admin::SerenityAdmin;

pub struct Handler {
    pub app: Arc<AppContext>,
}

fn role_ids(roles: &[RoleId]) -> Vec<String> {
    roles.iter().map(|r| r.get().to_string()).collect()
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(bot=%ready.user.name, guilds = ready.guilds.len(), "Logged in");

        let an = self.app.antinuke();
        an.set_bot_id(&ready.user.id.get().to_string());

        // Rozgrzanie cache konfiguracji (i audit logu, jeśli atrybucja włączona)
        let guild_ids: Vec<String> = ready.guilds.iter().map(|g| g.id.get().to_string()).collect();
        let summary = an.start(&guild_ids).await;
        tracing::info!(
            guilds = summary.guilds,
            enabled = summary.enabled,
            failed = summary.failed,
            attribution = an.attribution_enabled(),
            "AntiNuke ready"
        );
    }

    /// Główne wejście detektora: wpis audit logu z gatewaya (ma już sprawcę).
    async fn guild_audit_log_entry_create(&self, _ctx: Context, entry: AuditLogEntry, guild_id: GuildId) {
        let an = self.app.antinuke();
        let e = admin::audit_entry(&entry);
        // te kody idą przez atrybucję (channel_create / guild_role_create), nie liczymy ich dwa razy
        if an.attribution_covers(e.action_code) {
            return;
        }
        let event = AuditEvent::from_entry(guild_id.get().to_string(), e);
        let verdict = an.process_event(&event);
        tracing::trace!(gid = %guild_id.get(), actor = %event.actor_id, ?verdict, "audit entry processed");
    }

    async fn channel_create(&self, _ctx: Context, channel: GuildChannel) {
        let an = self.app.antinuke();
        if !an.attribution_enabled() {
            return;
        }
        an.push_unattributed(AuditEvent::unattributed(
            channel.guild_id.get().to_string(),
            audit_codes::CHANNEL_CREATE,
            Some(channel.id.get().to_string()),
        ));
    }

    async fn guild_role_create(&self, _ctx: Context, new: Role) {
        let an = self.app.antinuke();
        if !an.attribution_enabled() {
            return;
        }
        an.push_unattributed(AuditEvent::unattributed(
            new.guild_id.get().to_string(),
            audit_codes::ROLE_CREATE,
            Some(new.id.get().to_string()),
        ));
    }

    // _is_new zgodnie z Serenity 0.12
    async fn guild_create(&self, _ctx: Context, guild: Guild, is_new: Option<bool>) {
        let an = self.app.antinuke();
        let gid = guild.id.get().to_string();

        // Role członków (best-effort; duże gildie przychodzą niepełne)
        for (uid, member) in &guild.members {
            an.roles().upsert(&gid, &uid.get().to_string(), role_ids(&member.roles));
        }

        // Nowa gildia po starcie procesu: wczytaj jej konfigurację
        if is_new == Some(true) {
            if let Err(e) = an.refresh(&gid).await {
                tracing::warn!(error=?e, gid=%gid, "antinuke refresh failed (on guild_create)");
            }
        }
        tracing::debug!(guild=%guild.name, gid=%gid, members = guild.members.len(), "guild cached");
    }

    async fn guild_delete(&self, _ctx: Context, incomplete: UnavailableGuild, _full: Option<Guild>) {
        // unavailable => awaria po stronie Discorda, nie wyrzucenie bota
        if !incomplete.unavailable {
            self.app.antinuke().forget_guild(&incomplete.id.get().to_string());
        }
    }

    async fn guild_member_addition(&self, _ctx: Context, member: Member) {
        self.app.antinuke().roles().upsert(
            &member.guild_id.get().to_string(),
            &member.user.id.get().to_string(),
            role_ids(&member.roles),
        );
    }

    async fn guild_member_update(
        &self,
        _ctx: Context,
        _old: Option<Member>,
        _new: Option<Member>,
        event: GuildMemberUpdateEvent,
    ) {
        self.app.antinuke().roles().upsert(
            &event.guild_id.get().to_string(),
            &event.user.id.get().to_string(),
            role_ids(&event.roles),
        );
    }

    async fn guild_member_removal(
        &self,
        _ctx: Context,
        guild_id: GuildId,
        user: User,
        _member: Option<Member>,
    ) {
        self.app
            .antinuke()
            .roles()
            .remove(&guild_id.get().to_string(), &user.id.get().to_string());
    }
}

pub fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            "GUILD_WEBHOOKS" => i |= GatewayIntents::GUILD_WEBHOOKS,
            "GUILD_MESSAGES" => i |= GatewayIntents::GUILD_MESSAGES,
            "GUILD_PRESENCES" => i |= GatewayIntents::GUILD_PRESENCES,
            other => tracing::warn!(intent = other, "unknown gateway intent in config, skipped"),
        }
    }
    i
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD__TOKEN). Uzupełnij w .env.");
    }

    // GUILD_MODERATION niesie zdarzenia audit logu – bez niego detektor nic nie widzi
    let intents = intents_from_settings(&ctx.settings.discord.intents) | GatewayIntents::GUILD_MODERATION;

    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    tracing::info!("Discord client starting…");
    let res = client.start().await;
    ctx.antinuke().shutdown().await;
    res?;
    Ok(())
}
