use std::sync::Arc;

use dashmap::DashMap;

/// Synchronous view of member roles used on the detection path.
pub trait RoleDirectory: Send + Sync {
    /// Role ids of the member, or `None` when the member is not known.
    fn member_roles(&self, guild_id: &str, user_id: &str) -> Option<Arc<[String]>>;
}

/// Member roles mirrored from gateway events (member add/update/remove).
#[derive(Debug, Default)]
pub struct MemberRoleCache {
    guilds: DashMap<String, DashMap<String, Arc<[String]>>>,
}

impl MemberRoleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, guild_id: &str, user_id: &str, roles: Vec<String>) {
        self.guilds
            .entry(guild_id.to_string())
            .or_default()
            .insert(user_id.to_string(), roles.into());
    }

    pub fn remove(&self, guild_id: &str, user_id: &str) {
        if let Some(members) = self.guilds.get(guild_id) {
            members.remove(user_id);
        }
    }

    pub fn forget_guild(&self, guild_id: &str) {
        self.guilds.remove(guild_id);
    }

    pub fn len(&self) -> usize {
        self.guilds.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RoleDirectory for MemberRoleCache {
    fn member_roles(&self, guild_id: &str, user_id: &str) -> Option<Arc<[String]>> {
        self.guilds
            .get(guild_id)
            .and_then(|m| m.get(user_id).map(|r| Arc::clone(r.value())))
    }
}
