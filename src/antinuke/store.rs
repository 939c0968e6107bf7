//! Persistent antinuke configuration: the read port used by the cache warmer,
//! the write port used by the control plane, and two adapters (Postgres and
//! in-memory).

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{ActionKind, GuildConfig, LimitConfig, PunishmentKind};
use crate::db::{self, Db};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    User,
    Role,
}

impl TargetType {
    pub const fn as_str(self) -> &'static str {
        match self {
            TargetType::User => "user",
            TargetType::Role => "role",
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// A guild without a stored row reads as disabled.
    async fn get_antinuke_config(&self, guild_id: &str) -> Result<GuildConfig, StoreError>;
    async fn get_whitelist(&self, guild_id: &str) -> Result<Vec<String>, StoreError>;
    /// Enabled limits only.
    async fn get_action_configs(&self, guild_id: &str) -> Result<Vec<LimitConfig>, StoreError>;
}

#[async_trait]
pub trait ConfigWriter: Send + Sync {
    async fn set_enabled(&self, guild_id: &str, enabled: bool, owner_id: Option<&str>) -> Result<(), StoreError>;
    async fn set_panic(&self, guild_id: &str, panic: bool) -> Result<(), StoreError>;
    async fn set_logs_channel(&self, guild_id: &str, channel_id: Option<&str>) -> Result<(), StoreError>;
    async fn set_owner(&self, guild_id: &str, owner_id: &str) -> Result<(), StoreError>;
    async fn upsert_action_config(&self, limit: &LimitConfig) -> Result<(), StoreError>;
    async fn disable_action(&self, guild_id: &str, action: ActionKind) -> Result<(), StoreError>;
    async fn add_whitelist(
        &self,
        guild_id: &str,
        target_id: &str,
        target_type: TargetType,
        added_by: &str,
    ) -> Result<(), StoreError>;
    async fn remove_whitelist(&self, guild_id: &str, target_id: &str) -> Result<bool, StoreError>;
}

/* ===========================
   Postgres
   =========================== */

#[derive(Clone)]
pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn limit_from_row(guild_id: &str, row: db::ActionRow) -> Result<Option<LimitConfig>, StoreError> {
    let (action_type, enabled, limit_count, window_seconds, punishment) = row;
    let Ok(action) = action_type.parse::<ActionKind>() else {
        tracing::warn!(%guild_id, %action_type, "skipping unknown antinuke action row");
        return Ok(None);
    };
    let punishment = punishment
        .parse::<PunishmentKind>()
        .map_err(|e| StoreError::Invalid(e.to_string()))?;
    let limit = u32::try_from(limit_count)
        .map_err(|_| StoreError::Invalid(format!("{action_type}: limit_count {limit_count}")))?;
    let window_secs = u32::try_from(window_seconds)
        .map_err(|_| StoreError::Invalid(format!("{action_type}: window_seconds {window_seconds}")))?;
    Ok(Some(LimitConfig {
        guild_id: guild_id.to_string(),
        action,
        enabled,
        limit,
        window_secs,
        punishment,
    }))
}

#[async_trait]
impl ConfigStore for PgStore {
    async fn get_antinuke_config(&self, guild_id: &str) -> Result<GuildConfig, StoreError> {
        let row = db::fetch_antinuke_config(&self.db, guild_id).await?;
        Ok(match row {
            Some((enabled, owner_id, logs_channel, panic)) => GuildConfig {
                guild_id: guild_id.to_string(),
                enabled,
                owner_id: owner_id.unwrap_or_default(),
                log_channel: logs_channel.filter(|c| !c.is_empty()),
                panic,
            },
            None => GuildConfig::disabled(guild_id),
        })
    }

    async fn get_whitelist(&self, guild_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(db::fetch_whitelist(&self.db, guild_id).await?)
    }

    async fn get_action_configs(&self, guild_id: &str) -> Result<Vec<LimitConfig>, StoreError> {
        let rows = db::fetch_action_configs(&self.db, guild_id).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(limit) = limit_from_row(guild_id, row)? {
                out.push(limit);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ConfigWriter for PgStore {
    async fn set_enabled(&self, guild_id: &str, enabled: bool, owner_id: Option<&str>) -> Result<(), StoreError> {
        Ok(db::set_enabled(&self.db, guild_id, enabled, owner_id).await?)
    }

    async fn set_panic(&self, guild_id: &str, panic: bool) -> Result<(), StoreError> {
        Ok(db::set_panic(&self.db, guild_id, panic).await?)
    }

    async fn set_logs_channel(&self, guild_id: &str, channel_id: Option<&str>) -> Result<(), StoreError> {
        Ok(db::set_logs_channel(&self.db, guild_id, channel_id).await?)
    }

    async fn set_owner(&self, guild_id: &str, owner_id: &str) -> Result<(), StoreError> {
        Ok(db::set_owner(&self.db, guild_id, owner_id).await?)
    }

    async fn upsert_action_config(&self, limit: &LimitConfig) -> Result<(), StoreError> {
        let count = i32::try_from(limit.limit).map_err(|_| StoreError::Invalid(format!("limit {}", limit.limit)))?;
        let window =
            i32::try_from(limit.window_secs).map_err(|_| StoreError::Invalid(format!("window {}", limit.window_secs)))?;
        Ok(db::upsert_action_config(
            &self.db,
            &limit.guild_id,
            limit.action.as_str(),
            count,
            window,
            limit.punishment.as_str(),
        )
        .await?)
    }

    async fn disable_action(&self, guild_id: &str, action: ActionKind) -> Result<(), StoreError> {
        Ok(db::disable_action(&self.db, guild_id, action.as_str()).await?)
    }

    async fn add_whitelist(
        &self,
        guild_id: &str,
        target_id: &str,
        target_type: TargetType,
        added_by: &str,
    ) -> Result<(), StoreError> {
        Ok(db::add_whitelist(&self.db, guild_id, target_id, target_type.as_str(), added_by).await?)
    }

    async fn remove_whitelist(&self, guild_id: &str, target_id: &str) -> Result<bool, StoreError> {
        Ok(db::remove_whitelist(&self.db, guild_id, target_id).await?)
    }
}

/* ===========================
   In-memory
   =========================== */

/// Store kept entirely in process memory. Used when no database URL is
/// configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: DashMap<String, GuildConfig>,
    whitelists: DashMap<String, Vec<(String, TargetType)>>,
    limits: DashMap<String, Vec<LimitConfig>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every read fails with a storage error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub fn put_config(&self, config: GuildConfig) {
        self.configs.insert(config.guild_id.clone(), config);
    }

    pub fn put_limit(&self, limit: LimitConfig) {
        let mut limits = self.limits.entry(limit.guild_id.clone()).or_default();
        limits.retain(|l| l.action != limit.action);
        limits.push(limit);
    }

    fn config_entry(&self, guild_id: &str) -> dashmap::mapref::one::RefMut<'_, String, GuildConfig> {
        self.configs
            .entry(guild_id.to_string())
            .or_insert_with(|| GuildConfig::disabled(guild_id))
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_antinuke_config(&self, guild_id: &str) -> Result<GuildConfig, StoreError> {
        self.check_available()?;
        Ok(self
            .configs
            .get(guild_id)
            .map(|c| c.clone())
            .unwrap_or_else(|| GuildConfig::disabled(guild_id)))
    }

    async fn get_whitelist(&self, guild_id: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        Ok(self
            .whitelists
            .get(guild_id)
            .map(|w| w.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_action_configs(&self, guild_id: &str) -> Result<Vec<LimitConfig>, StoreError> {
        self.check_available()?;
        Ok(self
            .limits
            .get(guild_id)
            .map(|l| l.iter().filter(|l| l.enabled).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl ConfigWriter for MemoryStore {
    async fn set_enabled(&self, guild_id: &str, enabled: bool, owner_id: Option<&str>) -> Result<(), StoreError> {
        let mut cfg = self.config_entry(guild_id);
        cfg.enabled = enabled;
        if let Some(owner) = owner_id {
            cfg.owner_id = owner.to_string();
        }
        Ok(())
    }

    async fn set_panic(&self, guild_id: &str, panic: bool) -> Result<(), StoreError> {
        self.config_entry(guild_id).panic = panic;
        Ok(())
    }

    async fn set_logs_channel(&self, guild_id: &str, channel_id: Option<&str>) -> Result<(), StoreError> {
        self.config_entry(guild_id).log_channel = channel_id.map(str::to_string);
        Ok(())
    }

    async fn set_owner(&self, guild_id: &str, owner_id: &str) -> Result<(), StoreError> {
        self.config_entry(guild_id).owner_id = owner_id.to_string();
        Ok(())
    }

    async fn upsert_action_config(&self, limit: &LimitConfig) -> Result<(), StoreError> {
        self.put_limit(LimitConfig {
            enabled: true,
            ..limit.clone()
        });
        Ok(())
    }

    async fn disable_action(&self, guild_id: &str, action: ActionKind) -> Result<(), StoreError> {
        if let Some(mut limits) = self.limits.get_mut(guild_id) {
            for l in limits.iter_mut().filter(|l| l.action == action) {
                l.enabled = false;
            }
        }
        Ok(())
    }

    async fn add_whitelist(
        &self,
        guild_id: &str,
        target_id: &str,
        target_type: TargetType,
        _added_by: &str,
    ) -> Result<(), StoreError> {
        let mut list = self.whitelists.entry(guild_id.to_string()).or_default();
        list.retain(|(id, _)| id != target_id);
        list.push((target_id.to_string(), target_type));
        Ok(())
    }

    async fn remove_whitelist(&self, guild_id: &str, target_id: &str) -> Result<bool, StoreError> {
        let Some(mut list) = self.whitelists.get_mut(guild_id) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|(id, _)| id != target_id);
        Ok(list.len() != before)
    }
}
