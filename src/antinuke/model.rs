//! Shared antinuke types: action and punishment kinds, published configs,
//! audit events and the tasks handed to workers.

use std::{
    collections::HashSet,
    fmt,
    str::FromStr,
    sync::OnceLock,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Actor id used when attribution could not resolve who performed an action.
pub const UNKNOWN_ACTOR: &str = "0";

/// Numeric audit-log action codes as sent by the platform.
pub mod audit_codes {
    pub const GUILD_UPDATE: u8 = 1;
    pub const CHANNEL_CREATE: u8 = 10;
    pub const CHANNEL_UPDATE: u8 = 11;
    pub const CHANNEL_DELETE: u8 = 12;
    pub const MEMBER_KICK: u8 = 20;
    pub const MEMBER_PRUNE: u8 = 21;
    pub const MEMBER_BAN_ADD: u8 = 22;
    pub const BOT_ADD: u8 = 28;
    pub const ROLE_CREATE: u8 = 30;
    pub const ROLE_UPDATE: u8 = 31;
    pub const ROLE_DELETE: u8 = 32;
    pub const WEBHOOK_CREATE: u8 = 50;
    pub const WEBHOOK_UPDATE: u8 = 51;
    pub const WEBHOOK_DELETE: u8 = 52;
    pub const EMOJI_DELETE: u8 = 62;

    /// Stable snake_case name, used as key in retry tables.
    pub fn name(code: u8) -> Option<&'static str> {
        Some(match code {
            GUILD_UPDATE => "guild_update",
            CHANNEL_CREATE => "channel_create",
            CHANNEL_UPDATE => "channel_update",
            CHANNEL_DELETE => "channel_delete",
            MEMBER_KICK => "member_kick",
            MEMBER_PRUNE => "member_prune",
            MEMBER_BAN_ADD => "member_ban_add",
            BOT_ADD => "bot_add",
            ROLE_CREATE => "role_create",
            ROLE_UPDATE => "role_update",
            ROLE_DELETE => "role_delete",
            WEBHOOK_CREATE => "webhook_create",
            WEBHOOK_UPDATE => "webhook_update",
            WEBHOOK_DELETE => "webhook_delete",
            EMOJI_DELETE => "emoji_delete",
            _ => return None,
        })
    }

    /// Actions whose audit entries may carry no target at all.
    pub fn targetless(code: u8) -> bool {
        matches!(code, GUILD_UPDATE | WEBHOOK_UPDATE)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct ParseKindError {
    pub kind: &'static str,
    pub value: String,
}

/// Administrative operations watched by the antinuke engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BanMembers,
    KickMembers,
    CreateChannels,
    DeleteChannels,
    UpdateChannels,
    CreateRoles,
    DeleteRoles,
    UpdateRoles,
    AddBots,
    PruneMembers,
    CreateWebhooks,
    UpdateWebhooks,
    DeleteWebhooks,
    DeleteEmojis,
    UpdateGuild,
}

impl ActionKind {
    pub const ALL: [ActionKind; 15] = [
        ActionKind::BanMembers,
        ActionKind::KickMembers,
        ActionKind::CreateChannels,
        ActionKind::DeleteChannels,
        ActionKind::UpdateChannels,
        ActionKind::CreateRoles,
        ActionKind::DeleteRoles,
        ActionKind::UpdateRoles,
        ActionKind::AddBots,
        ActionKind::PruneMembers,
        ActionKind::CreateWebhooks,
        ActionKind::UpdateWebhooks,
        ActionKind::DeleteWebhooks,
        ActionKind::DeleteEmojis,
        ActionKind::UpdateGuild,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ActionKind::BanMembers => "ban_members",
            ActionKind::KickMembers => "kick_members",
            ActionKind::CreateChannels => "create_channels",
            ActionKind::DeleteChannels => "delete_channels",
            ActionKind::UpdateChannels => "update_channels",
            ActionKind::CreateRoles => "create_roles",
            ActionKind::DeleteRoles => "delete_roles",
            ActionKind::UpdateRoles => "update_roles",
            ActionKind::AddBots => "add_bots",
            ActionKind::PruneMembers => "prune_members",
            ActionKind::CreateWebhooks => "create_webhooks",
            ActionKind::UpdateWebhooks => "update_webhooks",
            ActionKind::DeleteWebhooks => "delete_webhooks",
            ActionKind::DeleteEmojis => "delete_emojis",
            ActionKind::UpdateGuild => "update_guild",
        }
    }

    /// Strict defaults apply to these when a guild has no explicit limit.
    pub const fn is_dangerous(self) -> bool {
        matches!(
            self,
            ActionKind::AddBots | ActionKind::CreateWebhooks | ActionKind::BanMembers
        )
    }

    /// Maps an audit-log action code onto a monitored kind. Unmapped codes are ignored.
    pub fn from_audit_code(code: u8) -> Option<Self> {
        use audit_codes::*;
        Some(match code {
            MEMBER_BAN_ADD => ActionKind::BanMembers,
            MEMBER_KICK => ActionKind::KickMembers,
            ROLE_CREATE => ActionKind::CreateRoles,
            ROLE_DELETE => ActionKind::DeleteRoles,
            CHANNEL_CREATE => ActionKind::CreateChannels,
            CHANNEL_DELETE => ActionKind::DeleteChannels,
            BOT_ADD => ActionKind::AddBots,
            MEMBER_PRUNE => ActionKind::PruneMembers,
            WEBHOOK_CREATE => ActionKind::CreateWebhooks,
            EMOJI_DELETE => ActionKind::DeleteEmojis,
            _ => return None,
        })
    }

    pub const fn display_name(self) -> &'static str {
        match self {
            ActionKind::BanMembers => "Banning Members",
            ActionKind::KickMembers => "Kicking Members",
            ActionKind::CreateChannels => "Creating Channels",
            ActionKind::DeleteChannels => "Deleting Channels",
            ActionKind::UpdateChannels => "Updating Channels",
            ActionKind::CreateRoles => "Creating Roles",
            ActionKind::DeleteRoles => "Deleting Roles",
            ActionKind::UpdateRoles => "Updating Roles",
            ActionKind::AddBots => "Adding Bots",
            ActionKind::PruneMembers => "Pruning Members",
            ActionKind::CreateWebhooks => "Creating Webhooks",
            ActionKind::UpdateWebhooks => "Updating Webhooks",
            ActionKind::DeleteWebhooks => "Deleting Webhooks",
            ActionKind::DeleteEmojis => "Deleting Emojis",
            ActionKind::UpdateGuild => "Updating Server",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ParseKindError {
                kind: "action kind",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentKind {
    #[default]
    Ban,
    Kick,
    Timeout,
    /// Strip every role from the member.
    Quarantine,
}

impl PunishmentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            PunishmentKind::Ban => "ban",
            PunishmentKind::Kick => "kick",
            PunishmentKind::Timeout => "timeout",
            PunishmentKind::Quarantine => "quarantine",
        }
    }
}

impl fmt::Display for PunishmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PunishmentKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(PunishmentKind::Ban),
            "kick" => Ok(PunishmentKind::Kick),
            "timeout" => Ok(PunishmentKind::Timeout),
            "quarantine" => Ok(PunishmentKind::Quarantine),
            other => Err(ParseKindError {
                kind: "punishment",
                value: other.to_string(),
            }),
        }
    }
}

/// Effective (limit, window, punishment) triple applied to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Policy {
    /// 0 means any single occurrence triggers.
    pub limit: u32,
    pub window_s: u32,
    pub punishment: PunishmentKind,
}

impl Policy {
    pub const PANIC: Policy = Policy {
        limit: 0,
        window_s: 1,
        punishment: PunishmentKind::Ban,
    };
    pub const DANGEROUS: Policy = Policy {
        limit: 1,
        window_s: 1,
        punishment: PunishmentKind::Ban,
    };
}

/// Guild-level antinuke settings. Published into the cache as an immutable value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct GuildConfig {
    pub guild_id: String,
    pub enabled: bool,
    /// Empty when unknown.
    pub owner_id: String,
    pub log_channel: Option<String>,
    pub panic: bool,
}

impl GuildConfig {
    /// What a guild without a stored row looks like.
    pub fn disabled(guild_id: &str) -> Self {
        Self {
            guild_id: guild_id.to_string(),
            ..Self::default()
        }
    }
}

/// Per-action limit, keyed by (guild, action).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LimitConfig {
    pub guild_id: String,
    pub action: ActionKind,
    pub enabled: bool,
    pub limit: u32,
    pub window_secs: u32,
    pub punishment: PunishmentKind,
}

impl LimitConfig {
    pub fn policy(&self) -> Policy {
        Policy {
            limit: self.limit,
            window_s: self.window_secs.max(1),
            punishment: self.punishment,
        }
    }
}

/// Immutable set of whitelisted ids. Users and roles share one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhitelistSet {
    ids: HashSet<String>,
}

impl WhitelistSet {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub(crate) fn with(&self, id: &str) -> Self {
        let mut ids = self.ids.clone();
        ids.insert(id.to_string());
        Self { ids }
    }

    pub(crate) fn without(&self, id: &str) -> Self {
        let mut ids = self.ids.clone();
        ids.remove(id);
        Self { ids }
    }
}

impl<S: Into<String>> FromIterator<S> for WhitelistSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// One audit-log entry as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditEntry {
    pub action_code: u8,
    pub actor_id: String,
    pub target_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Inbound event for the detector: an audit entry scoped to a guild.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AuditEvent {
    pub guild_id: String,
    pub action_code: u8,
    /// `UNKNOWN_ACTOR` (or empty) when nobody could be attributed.
    pub actor_id: String,
    pub target_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        guild_id: impl Into<String>,
        action_code: u8,
        actor_id: impl Into<String>,
        target_id: Option<String>,
    ) -> Self {
        Self {
            guild_id: guild_id.into(),
            action_code,
            actor_id: actor_id.into(),
            target_id,
            occurred_at: Utc::now(),
        }
    }

    /// Gateway event that still needs attribution.
    pub fn unattributed(guild_id: impl Into<String>, action_code: u8, target_id: Option<String>) -> Self {
        Self::new(guild_id, action_code, UNKNOWN_ACTOR, target_id)
    }

    pub fn from_entry(guild_id: impl Into<String>, entry: AuditEntry) -> Self {
        Self {
            guild_id: guild_id.into(),
            action_code: entry.action_code,
            actor_id: entry.actor_id,
            target_id: entry.target_id,
            occurred_at: entry.occurred_at,
        }
    }

    pub fn has_actor(&self) -> bool {
        !self.actor_id.is_empty() && self.actor_id != UNKNOWN_ACTOR
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunishmentTask {
    pub guild_id: String,
    pub actor_id: String,
    pub punishment: PunishmentKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationTask {
    pub guild_id: String,
    pub action: ActionKind,
    pub actor_id: String,
    /// The created/banned/etc. resource; revocation is skipped without it.
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViolationRecord {
    pub guild_id: String,
    pub action: ActionKind,
    pub actor_id: String,
    pub count: u32,
    pub limit: u32,
    pub latency: Duration,
    pub log_channel: Option<String>,
}

/// The bot's own user id. Set once, from config or the gateway `ready` event.
#[derive(Debug, Default)]
pub struct BotIdentity(OnceLock<String>);

impl BotIdentity {
    pub fn new(id: Option<String>) -> Self {
        let cell = OnceLock::new();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            let _ = cell.set(id);
        }
        Self(cell)
    }

    /// Returns false when an id was already recorded.
    pub fn set(&self, id: impl Into<String>) -> bool {
        self.0.set(id.into()).is_ok()
    }

    pub fn get(&self) -> Option<&str> {
        self.0.get().map(String::as_str)
    }

    pub fn is_self(&self, actor_id: &str) -> bool {
        self.get().is_some_and(|me| me == actor_id)
    }
}
