//! Per-guild cache of recent audit-log entries, shielded against hammering
//! the upstream audit-log endpoint.

use std::{
    collections::HashMap,
    num::NonZeroU32,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde::Serialize;
use tokio::sync::{watch, RwLock};

use super::model::{audit_codes, AuditEntry, BotIdentity};
use crate::config::AuditCacheConfig;

/// Source of audit-log entries (the platform's audit-log endpoint).
#[async_trait]
pub trait AuditSource: Send + Sync {
    /// Most recent entries, any order. `None` means every action kind.
    async fn recent_entries(&self, guild_id: &str, action_code: Option<u8>, limit: u8) -> Result<Vec<AuditEntry>>;
}

#[derive(Debug, Default)]
struct GuildAuditLog {
    by_action: HashMap<u8, Vec<AuditEntry>>,
    last_fetch: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditCacheStats {
    pub guilds: usize,
    pub fetches: u64,
    pub shielded: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fetches: AtomicU64,
    shielded: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(usize),
    /// Inside the per-guild minimum interval; cached data stands.
    Shielded,
}

pub struct AuditCacheManager {
    source: Arc<dyn AuditSource>,
    identity: Arc<BotIdentity>,
    guilds: DashMap<String, Arc<RwLock<GuildAuditLog>>>,
    shield: Option<DefaultKeyedRateLimiter<String>>,
    settings: AuditCacheConfig,
    counters: Counters,
}

impl AuditCacheManager {
    pub fn new(source: Arc<dyn AuditSource>, identity: Arc<BotIdentity>, settings: AuditCacheConfig) -> Self {
        let shield = Quota::with_period(Duration::from_millis(settings.min_fetch_interval_ms))
            .map(|q| RateLimiter::keyed(q.allow_burst(NonZeroU32::MIN)));
        Self {
            source,
            identity,
            guilds: DashMap::new(),
            shield,
            settings,
            counters: Counters::default(),
        }
    }

    fn guild_log(&self, guild_id: &str) -> Arc<RwLock<GuildAuditLog>> {
        if let Some(log) = self.guilds.get(guild_id) {
            return Arc::clone(log.value());
        }
        Arc::clone(self.guilds.entry(guild_id.to_string()).or_default().value())
    }

    /// Pulls fresh entries for every code in `action_codes` in one upstream
    /// call, unless this guild was fetched less than `min_fetch_interval_ms`
    /// ago. A single code is queried with an action filter; several codes
    /// share an unfiltered query so none of them waits behind another.
    pub async fn fetch(&self, guild_id: &str, action_codes: &[u8]) -> Result<FetchOutcome> {
        if action_codes.is_empty() {
            return Ok(FetchOutcome::Fetched(0));
        }
        if let Some(shield) = &self.shield {
            if shield.check_key(&guild_id.to_string()).is_err() {
                self.counters.shielded.fetch_add(1, Ordering::Relaxed);
                return Ok(FetchOutcome::Shielded);
            }
        }
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);

        let filter = match action_codes {
            [code] => Some(*code),
            _ => None,
        };
        let entries = self
            .source
            .recent_entries(guild_id, filter, self.settings.fetch_limit)
            .await?;

        let mut by_action: HashMap<u8, Vec<AuditEntry>> =
            action_codes.iter().map(|&code| (code, Vec::new())).collect();
        for entry in entries {
            if let Some(slot) = by_action.get_mut(&entry.action_code) {
                slot.push(entry);
            }
        }
        let mut n = 0;
        for slot in by_action.values_mut() {
            slot.sort_unstable_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
            slot.truncate(self.settings.entry_cap_per_guild);
            n += slot.len();
        }

        let log = self.guild_log(guild_id);
        let mut log = log.write().await;
        log.by_action.extend(by_action);
        log.last_fetch = Some(Instant::now());
        tracing::trace!(%guild_id, codes = action_codes.len(), entries = n, "audit entries fetched");
        Ok(FetchOutcome::Fetched(n))
    }

    /// Newest cached entry for `action_code` that matches `target_id`, is no
    /// older than `max_age` and was not performed by the bot itself.
    pub async fn find_recent(
        &self,
        guild_id: &str,
        target_id: Option<&str>,
        action_code: u8,
        max_age: Duration,
    ) -> Option<AuditEntry> {
        let log = self.guilds.get(guild_id).map(|l| Arc::clone(l.value()));
        let found = match log {
            Some(log) => {
                let log = log.read().await;
                let now = Utc::now();
                log.by_action.get(&action_code).and_then(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.action_code == action_code)
                        .filter(|e| !self.identity.is_self(&e.actor_id))
                        .filter(|e| {
                            (now - e.occurred_at)
                                .to_std()
                                .map_or(true, |age| age <= max_age)
                        })
                        .filter(|e| target_matches(action_code, target_id, e.target_id.as_deref()))
                        .max_by_key(|e| e.occurred_at)
                        .cloned()
                })
            }
            None => None,
        };
        let counter = if found.is_some() { &self.counters.hits } else { &self.counters.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Drops guilds whose last fetch is older than `stale_after`. Returns how many went.
    pub fn drop_stale(&self, stale_after: Duration) -> usize {
        let before = self.guilds.len();
        self.guilds.retain(|_, log| match log.try_read() {
            Ok(log) => log.last_fetch.is_some_and(|t| t.elapsed() <= stale_after),
            // being written right now, so certainly fresh
            Err(_) => true,
        });
        if let Some(shield) = &self.shield {
            shield.retain_recent();
        }
        before.saturating_sub(self.guilds.len())
    }

    /// One fetch per guild, spaced by the minimum fetch interval.
    pub async fn warm_up(&self, guild_ids: &[String], action_codes: &[u8]) {
        let pause = Duration::from_millis(self.settings.min_fetch_interval_ms);
        let mut warmed = 0usize;
        for (i, guild_id) in guild_ids.iter().enumerate() {
            if i > 0 && !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
            match self.fetch(guild_id, action_codes).await {
                Ok(_) => warmed += 1,
                Err(e) => tracing::warn!(error = ?e, %guild_id, "audit cache warm-up failed"),
            }
        }
        tracing::info!(guilds = guild_ids.len(), warmed, "audit cache warmed");
    }

    pub fn spawn_cleanup(this: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(this);
        let every = Duration::from_secs(this.settings.cleanup_interval_secs.max(1));
        let stale_after = Duration::from_secs(this.settings.max_entry_age_s);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => {}
                }
                let Some(strong) = weak.upgrade() else { break };
                let dropped = strong.drop_stale(stale_after);
                if dropped > 0 {
                    tracing::debug!(dropped, "stale audit caches dropped");
                }
            }
        })
    }

    pub fn stats(&self) -> AuditCacheStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        AuditCacheStats {
            guilds: self.guilds.len(),
            fetches: get(&self.counters.fetches),
            shielded: get(&self.counters.shielded),
            hits: get(&self.counters.hits),
            misses: get(&self.counters.misses),
        }
    }
}

/// An entry without a target matches only for actions that have none.
fn target_matches(action_code: u8, wanted: Option<&str>, entry_target: Option<&str>) -> bool {
    match (wanted, entry_target) {
        (None, _) => true,
        (Some(w), Some(t)) => w == t,
        (Some(_), None) => audit_codes::targetless(action_code),
    }
}
