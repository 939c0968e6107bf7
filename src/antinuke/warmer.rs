use std::sync::Arc;

use serde::Serialize;

use super::{
    cache::AtomicConfigCache,
    model::WhitelistSet,
    store::{ConfigStore, StoreError},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmSummary {
    pub guilds: usize,
    pub enabled: usize,
    pub failed: usize,
}

/// Loads persisted configuration into the cache.
pub struct CacheWarmer {
    cache: Arc<AtomicConfigCache>,
    store: Arc<dyn ConfigStore>,
}

impl CacheWarmer {
    pub fn new(cache: Arc<AtomicConfigCache>, store: Arc<dyn ConfigStore>) -> Self {
        Self { cache, store }
    }

    /// Warms every guild. A guild that fails to load keeps whatever the cache
    /// already held and the rest continue.
    pub async fn warm_all(&self, guild_ids: &[String]) -> WarmSummary {
        let mut summary = WarmSummary {
            guilds: guild_ids.len(),
            ..WarmSummary::default()
        };
        for guild_id in guild_ids {
            match self.warm_guild(guild_id).await {
                Ok(()) => {
                    if self.cache.get_config(guild_id).is_some_and(|c| c.enabled) {
                        summary.enabled += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(error = ?e, %guild_id, "antinuke warm-up failed for guild");
                }
            }
        }
        tracing::info!(
            guilds = summary.guilds,
            enabled = summary.enabled,
            failed = summary.failed,
            "antinuke config cache warmed"
        );
        summary
    }

    /// Reloads one guild. All three reads must succeed before anything is
    /// published; whitelist and limits are then replaced wholesale.
    pub async fn warm_guild(&self, guild_id: &str) -> Result<(), StoreError> {
        let config = self.store.get_antinuke_config(guild_id).await?;
        let whitelist = self.store.get_whitelist(guild_id).await?;
        let limits = self.store.get_action_configs(guild_id).await?;

        let enabled_limits: Vec<_> = limits.into_iter().filter(|l| l.enabled).collect();
        tracing::debug!(
            %guild_id,
            enabled = config.enabled,
            panic = config.panic,
            whitelist = whitelist.len(),
            limits = enabled_limits.len(),
            "antinuke guild config loaded"
        );

        self.cache.set_whitelist(guild_id, whitelist.into_iter().collect::<WhitelistSet>());
        self.cache.replace_limits(guild_id, enabled_limits);
        self.cache.set_config(config);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antinuke::model::{ActionKind, GuildConfig, LimitConfig, PunishmentKind};
    use crate::antinuke::store::{ConfigWriter, MemoryStore, TargetType};

    fn setup() -> (Arc<MemoryStore>, Arc<AtomicConfigCache>, CacheWarmer) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(AtomicConfigCache::new());
        let warmer = CacheWarmer::new(cache.clone(), store.clone());
        (store, cache, warmer)
    }

    #[tokio::test]
    async fn warm_guild_publishes_everything() {
        let (store, cache, warmer) = setup();
        store.put_config(GuildConfig {
            guild_id: "g".into(),
            enabled: true,
            owner_id: "o".into(),
            log_channel: Some("l".into()),
            panic: false,
        });
        store.add_whitelist("g", "u", TargetType::User, "o").await.unwrap();
        store.put_limit(LimitConfig {
            guild_id: "g".into(),
            action: ActionKind::DeleteRoles,
            enabled: true,
            limit: 2,
            window_secs: 30,
            punishment: PunishmentKind::Quarantine,
        });

        warmer.warm_guild("g").await.unwrap();
        assert_eq!(cache.get_config("g").unwrap().owner_id, "o");
        assert!(cache.is_whitelisted("g", "u"));
        assert_eq!(cache.get_limit("g", ActionKind::DeleteRoles).unwrap().limit, 2);
    }

    #[tokio::test]
    async fn disabled_limit_disappears_on_refresh() {
        let (store, cache, warmer) = setup();
        store.set_enabled("g", true, None).await.unwrap();
        store.put_limit(LimitConfig {
            guild_id: "g".into(),
            action: ActionKind::KickMembers,
            enabled: true,
            limit: 1,
            window_secs: 10,
            punishment: PunishmentKind::Ban,
        });
        warmer.warm_guild("g").await.unwrap();
        assert!(cache.get_limit("g", ActionKind::KickMembers).is_some());

        store.disable_action("g", ActionKind::KickMembers).await.unwrap();
        store.remove_whitelist("g", "nobody").await.unwrap();
        warmer.warm_guild("g").await.unwrap();
        assert!(cache.get_limit("g", ActionKind::KickMembers).is_none());
    }

    #[tokio::test]
    async fn storage_error_keeps_prior_value() {
        let (store, cache, warmer) = setup();
        store.set_enabled("g", true, Some("o")).await.unwrap();
        warmer.warm_guild("g").await.unwrap();

        store.set_failing(true);
        store.set_enabled("g", false, None).await.unwrap();
        assert!(warmer.warm_guild("g").await.is_err());
        assert!(cache.get_config("g").unwrap().enabled);
    }

    #[tokio::test]
    async fn warm_all_counts_enabled_and_failed() {
        let (store, _cache, warmer) = setup();
        store.set_enabled("a", true, None).await.unwrap();
        store.set_enabled("b", false, None).await.unwrap();
        let summary = warmer.warm_all(&["a".into(), "b".into(), "c".into()]).await;
        assert_eq!(
            summary,
            WarmSummary {
                guilds: 3,
                enabled: 1,
                failed: 0
            }
        );

        store.set_failing(true);
        let summary = warmer.warm_all(&["a".into()]).await;
        assert_eq!(summary.failed, 1);
    }
}
