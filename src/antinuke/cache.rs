//! Read-mostly cache of published guild configuration.
//!
//! Every value is an `Arc` snapshot. Writers build a new value and swap the
//! slot, so readers on the detection path only clone an `Arc` and never see a
//! partially written config or whitelist.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;

use super::model::{ActionKind, GuildConfig, LimitConfig, WhitelistSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub configs: usize,
    pub whitelists: usize,
    pub limits: usize,
}

#[derive(Debug, Default)]
pub struct AtomicConfigCache {
    configs: DashMap<String, Arc<GuildConfig>>,
    whitelists: DashMap<String, Arc<WhitelistSet>>,
    limits: DashMap<String, DashMap<ActionKind, Arc<LimitConfig>>>,
}

impl AtomicConfigCache {
    pub fn new() -> Self {
        Self::default()
    }

    /* ===========================
       Guild config
       =========================== */

    pub fn get_config(&self, guild_id: &str) -> Option<Arc<GuildConfig>> {
        self.configs.get(guild_id).map(|c| Arc::clone(c.value()))
    }

    pub fn set_config(&self, config: GuildConfig) {
        self.configs.insert(config.guild_id.clone(), Arc::new(config));
    }

    pub fn delete_config(&self, guild_id: &str) {
        self.configs.remove(guild_id);
    }

    /* ===========================
       Whitelist
       =========================== */

    pub fn is_whitelisted(&self, guild_id: &str, target_id: &str) -> bool {
        self.whitelists
            .get(guild_id)
            .is_some_and(|set| set.contains(target_id))
    }

    pub fn whitelist(&self, guild_id: &str) -> Option<Arc<WhitelistSet>> {
        self.whitelists.get(guild_id).map(|s| Arc::clone(s.value()))
    }

    /// Replaces the guild's whitelist wholesale.
    pub fn set_whitelist(&self, guild_id: &str, set: WhitelistSet) {
        self.whitelists.insert(guild_id.to_string(), Arc::new(set));
    }

    pub fn add_to_whitelist(&self, guild_id: &str, target_id: &str) {
        self.update_whitelist(guild_id, true, |set| set.with(target_id));
    }

    pub fn remove_from_whitelist(&self, guild_id: &str, target_id: &str) {
        self.update_whitelist(guild_id, false, |set| set.without(target_id));
    }

    /// Copy-on-write update. The new set is built from a snapshot outside the
    /// shard lock; the lock is only held to check the slot still holds that
    /// snapshot and swap it. A concurrent writer in between forces a retry.
    fn update_whitelist(&self, guild_id: &str, create: bool, edit: impl Fn(&WhitelistSet) -> WhitelistSet) {
        loop {
            let current = self.whitelist(guild_id);
            let next = match &current {
                Some(set) => Arc::new(edit(set)),
                None if create => Arc::new(edit(&WhitelistSet::default())),
                None => return,
            };
            match self.whitelists.entry(guild_id.to_string()) {
                Entry::Occupied(mut slot) => {
                    if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, slot.get())) {
                        slot.insert(next);
                        return;
                    }
                }
                Entry::Vacant(slot) => {
                    if current.is_none() {
                        slot.insert(next);
                        return;
                    }
                }
            }
        }
    }

    /* ===========================
       Per-action limits
       =========================== */

    pub fn get_limit(&self, guild_id: &str, action: ActionKind) -> Option<Arc<LimitConfig>> {
        self.limits
            .get(guild_id)
            .and_then(|m| m.get(&action).map(|l| Arc::clone(l.value())))
    }

    pub fn set_limit(&self, limit: LimitConfig) {
        self.limits
            .entry(limit.guild_id.clone())
            .or_default()
            .insert(limit.action, Arc::new(limit));
    }

    pub fn delete_limit(&self, guild_id: &str, action: ActionKind) {
        if let Some(m) = self.limits.get(guild_id) {
            m.remove(&action);
        }
    }

    /// Publishes a fresh set of limits for one guild; actions absent from
    /// `limits` disappear from the cache.
    pub fn replace_limits(&self, guild_id: &str, limits: impl IntoIterator<Item = LimitConfig>) {
        let fresh: DashMap<ActionKind, Arc<LimitConfig>> = limits
            .into_iter()
            .map(|l| (l.action, Arc::new(l)))
            .collect();
        self.limits.insert(guild_id.to_string(), fresh);
    }

    pub fn forget_guild(&self, guild_id: &str) {
        self.configs.remove(guild_id);
        self.whitelists.remove(guild_id);
        self.limits.remove(guild_id);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            configs: self.configs.len(),
            whitelists: self.whitelists.len(),
            limits: self.limits.iter().map(|m| m.len()).sum(),
        }
    }
}
