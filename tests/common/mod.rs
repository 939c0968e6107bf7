#![allow(dead_code)]

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use tigris_antinuke::{
    antinuke::{audit_cache::AuditSource, AdminApi, AuditEntry, GuildConfig, LogRecord},
    config::AntinukeConfig,
};

/// Records every admin call as a short string, e.g. `ban:G1:A`.
#[derive(Default)]
pub struct RecordingAdmin {
    pub calls: Mutex<Vec<String>>,
    pub logs: Mutex<Vec<LogRecord>>,
}

impl RecordingAdmin {
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn push(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    /// Polls until at least `n` calls are recorded (or the deadline passes).
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let calls = self.calls().await;
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls().await
    }
}

#[async_trait]
impl AdminApi for RecordingAdmin {
    async fn ban_member(&self, guild_id: &str, user_id: &str, _reason: &str, _delete_days: u8) -> Result<()> {
        self.push(format!("ban:{guild_id}:{user_id}")).await;
        Ok(())
    }
    async fn kick_member(&self, guild_id: &str, user_id: &str, _reason: &str) -> Result<()> {
        self.push(format!("kick:{guild_id}:{user_id}")).await;
        Ok(())
    }
    async fn timeout_member(&self, guild_id: &str, user_id: &str, _until: DateTime<Utc>) -> Result<()> {
        self.push(format!("timeout:{guild_id}:{user_id}")).await;
        Ok(())
    }
    async fn list_member_roles(&self, _guild_id: &str, _user_id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
    async fn remove_member_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()> {
        self.push(format!("unrole:{guild_id}:{user_id}:{role_id}")).await;
        Ok(())
    }
    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        self.push(format!("delete_channel:{channel_id}")).await;
        Ok(())
    }
    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()> {
        self.push(format!("delete_role:{guild_id}:{role_id}")).await;
        Ok(())
    }
    async fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        self.push(format!("delete_webhook:{webhook_id}")).await;
        Ok(())
    }
    async fn unban_user(&self, guild_id: &str, user_id: &str) -> Result<()> {
        self.push(format!("unban:{guild_id}:{user_id}")).await;
        Ok(())
    }
    async fn send_log(&self, channel_id: &str, record: &LogRecord) -> Result<()> {
        self.logs.lock().await.push(record.clone());
        self.push(format!("log:{channel_id}")).await;
        Ok(())
    }
}

/// Audit log that stays empty for the first `hidden_for` fetches.
pub struct ScriptedAuditSource {
    pub hidden_for: u64,
    pub calls: AtomicU64,
    pub entries: Vec<AuditEntry>,
}

impl ScriptedAuditSource {
    pub fn new(hidden_for: u64, entries: Vec<AuditEntry>) -> Self {
        Self {
            hidden_for,
            calls: AtomicU64::new(0),
            entries,
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuditSource for ScriptedAuditSource {
    async fn recent_entries(&self, _guild_id: &str, action_code: Option<u8>, _limit: u8) -> Result<Vec<AuditEntry>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.hidden_for {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| action_code.map_or(true, |c| e.action_code == c))
            .map(|e| AuditEntry {
                occurred_at: Utc::now(),
                ..e.clone()
            })
            .collect())
    }
}

pub fn enabled(guild_id: &str, owner_id: &str, panic: bool) -> GuildConfig {
    GuildConfig {
        guild_id: guild_id.into(),
        enabled: true,
        owner_id: owner_id.into(),
        log_channel: Some(format!("{guild_id}-logs")),
        panic,
    }
}

/// Engine settings for tests: fast attribution ticks, no fetch shield.
pub fn test_config(attribution: bool) -> AntinukeConfig {
    let mut cfg = AntinukeConfig::default();
    cfg.bot_id = Some("bot".into());
    cfg.rate_limiter.shards = 4;
    cfg.attribution.enabled = attribution;
    cfg.attribution.batch_window_ms = 100;
    cfg.attribution.workers = 1;
    cfg.audit_cache.min_fetch_interval_ms = 0;
    cfg
}
