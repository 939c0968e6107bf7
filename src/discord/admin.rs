// src/discord/admin.rs
//! `AdminApi` i `AuditSource` na serenity `Http`.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use serenity::all::*;
use serenity::async_trait;
use serenity::model::guild::audit_log::Action as AuditAction;

use crate::antinuke::audit_cache::AuditSource;
use crate::antinuke::model::AuditEntry;
use crate::antinuke::workers::{AdminApi, LogRecord};

/// Discord epoch (2015-01-01) w ms.
const DISCORD_EPOCH_MS: u64 = 1_420_070_400_000;

/// Czas utworzenia z samego snowflake'a (dokładność do ms).
pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) + DISCORD_EPOCH_MS;
    DateTime::from_timestamp_millis(ms as i64).unwrap_or_else(Utc::now)
}

/// Snowflake z tekstu; 0 nie jest poprawnym ID (serenity panikuje na `new(0)`).
pub fn parse_id(raw: &str) -> Result<u64> {
    let id: u64 = raw.parse().with_context(|| format!("invalid snowflake `{raw}`"))?;
    anyhow::ensure!(id != 0, "snowflake 0");
    Ok(id)
}

pub fn audit_entry(entry: &AuditLogEntry) -> AuditEntry {
    AuditEntry {
        action_code: entry.action.num(),
        actor_id: entry.user_id.get().to_string(),
        target_id: entry.target_id.map(|t| t.get().to_string()),
        occurred_at: snowflake_time(entry.id.get()),
    }
}

#[derive(Clone)]
pub struct SerenityAdmin {
    http: Arc<Http>,
}

impl SerenityAdmin {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl AdminApi for SerenityAdmin {
    async fn ban_member(&self, guild_id: &str, user_id: &str, reason: &str, delete_days: u8) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        self.http.ban_user(gid, uid, delete_days.min(7), Some(reason)).await?;
        Ok(())
    }

    async fn kick_member(&self, guild_id: &str, user_id: &str, reason: &str) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        self.http.kick_member(gid, uid, Some(reason)).await?;
        Ok(())
    }

    async fn timeout_member(&self, guild_id: &str, user_id: &str, until: DateTime<Utc>) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        let builder = EditMember::new().disable_communication_until(until.to_rfc3339());
        gid.edit_member(&*self.http, uid, builder).await?;
        Ok(())
    }

    async fn list_member_roles(&self, guild_id: &str, user_id: &str) -> Result<Vec<String>> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        let member = self.http.get_member(gid, uid).await?;
        Ok(member.roles.iter().map(|r| r.get().to_string()).collect())
    }

    async fn remove_member_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        let rid = RoleId::new(parse_id(role_id)?);
        self.http
            .remove_member_role(gid, uid, rid, Some("AntiNuke: quarantine"))
            .await?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let cid = ChannelId::new(parse_id(channel_id)?);
        self.http.delete_channel(cid, Some("AntiNuke: revert")).await?;
        Ok(())
    }

    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let rid = RoleId::new(parse_id(role_id)?);
        self.http.delete_role(gid, rid, Some("AntiNuke: revert")).await?;
        Ok(())
    }

    async fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        let wid = WebhookId::new(parse_id(webhook_id)?);
        self.http.delete_webhook(wid, Some("AntiNuke: revert")).await?;
        Ok(())
    }

    async fn unban_user(&self, guild_id: &str, user_id: &str) -> Result<()> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let uid = UserId::new(parse_id(user_id)?);
        self.http.remove_ban(gid, uid, Some("AntiNuke: revert")).await?;
        Ok(())
    }

    async fn send_log(&self, channel_id: &str, record: &LogRecord) -> Result<()> {
        let cid = ChannelId::new(parse_id(channel_id)?);
        let embed = CreateEmbed::new()
            .title("🛡️ AntiNuke")
            .description(format!("Wykryto naruszenie: **{}**", record.action_name))
            .field("Sprawca", format!("<@{}> (`{}`)", record.actor_id, record.actor_id), false)
            .field("Akcje / limit", format!("{} / {}", record.count, record.limit), true)
            .field("Czas wykrycia", format!("{} µs", record.latency_us), true)
            .timestamp(Timestamp::now())
            .colour(Colour::RED);
        cid.send_message(&*self.http, CreateMessage::new().embed(embed)).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSource for SerenityAdmin {
    async fn recent_entries(&self, guild_id: &str, action_code: Option<u8>, limit: u8) -> Result<Vec<AuditEntry>> {
        let gid = GuildId::new(parse_id(guild_id)?);
        let action = action_code.map(AuditAction::from_value);
        let logs = self
            .http
            .get_audit_logs(gid, action, None, None, Some(limit.clamp(1, 100)))
            .await?;
        Ok(logs.entries.iter().map(audit_entry).collect())
    }
}
