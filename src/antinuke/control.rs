//! Control-plane operations. Each write goes to storage first and is then
//! republished into the cache with `refresh`, so detection never runs on a
//! config that diverges from what was stored.

use std::sync::Arc;

use thiserror::Error;

use super::{
    limiter::RING_CAPACITY,
    model::{ActionKind, LimitConfig, ParseKindError, PunishmentKind},
    service::AntinukeService,
    store::{ConfigWriter, StoreError, TargetType},
};

pub const MAX_LIMIT: u32 = RING_CAPACITY as u32;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid value: {0}")]
    Invalid(String),
    #[error(transparent)]
    Parse(#[from] ParseKindError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which actions a limit command applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTarget {
    All,
    One(ActionKind),
}

impl std::str::FromStr for ActionTarget {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(ActionTarget::All);
        }
        s.parse().map(ActionTarget::One)
    }
}

/// Parses `30`, `10s`, `5m` or `1h` into seconds. Zero is rejected.
pub fn parse_window(input: &str) -> Result<u32, ControlError> {
    let s = input.trim();
    let (digits, mult) = match s.char_indices().last() {
        Some((i, 's')) => (&s[..i], 1),
        Some((i, 'm')) => (&s[..i], 60),
        Some((i, 'h')) => (&s[..i], 3600),
        _ => (s, 1),
    };
    let n: u32 = digits
        .parse()
        .map_err(|_| ControlError::Invalid(format!("window `{input}`")))?;
    let secs = n
        .checked_mul(mult)
        .ok_or_else(|| ControlError::Invalid(format!("window `{input}` too large")))?;
    if secs == 0 {
        return Err(ControlError::Invalid("window must be at least 1s".into()));
    }
    Ok(secs)
}

pub struct AntinukeControl {
    store: Arc<dyn ConfigWriter>,
    service: Arc<AntinukeService>,
}

impl AntinukeControl {
    pub fn new(store: Arc<dyn ConfigWriter>, service: Arc<AntinukeService>) -> Self {
        Self { store, service }
    }

    async fn refresh(&self, guild_id: &str) -> Result<(), ControlError> {
        self.service.refresh(guild_id).await?;
        Ok(())
    }

    pub async fn enable(&self, guild_id: &str, owner_id: &str) -> Result<(), ControlError> {
        self.store.set_enabled(guild_id, true, Some(owner_id)).await?;
        tracing::info!(%guild_id, %owner_id, "antinuke enabled");
        self.refresh(guild_id).await
    }

    pub async fn disable(&self, guild_id: &str) -> Result<(), ControlError> {
        self.store.set_enabled(guild_id, false, None).await?;
        tracing::info!(%guild_id, "antinuke disabled");
        self.refresh(guild_id).await
    }

    pub async fn set_panic(&self, guild_id: &str, panic: bool) -> Result<(), ControlError> {
        self.store.set_panic(guild_id, panic).await?;
        tracing::warn!(%guild_id, panic, "antinuke panic mode changed");
        self.refresh(guild_id).await
    }

    pub async fn set_logs_channel(&self, guild_id: &str, channel_id: Option<&str>) -> Result<(), ControlError> {
        self.store.set_logs_channel(guild_id, channel_id).await?;
        self.refresh(guild_id).await
    }

    pub async fn set_owner(&self, guild_id: &str, owner_id: &str) -> Result<(), ControlError> {
        self.store.set_owner(guild_id, owner_id).await?;
        self.refresh(guild_id).await
    }

    /// Sets (and enables) a limit for one action or for every action kind.
    pub async fn set_limit(
        &self,
        guild_id: &str,
        target: ActionTarget,
        limit: u32,
        window: &str,
        punishment: PunishmentKind,
    ) -> Result<usize, ControlError> {
        if limit > MAX_LIMIT {
            return Err(ControlError::Invalid(format!("limit must be between 0 and {MAX_LIMIT}")));
        }
        let window_secs = parse_window(window)?;
        let actions: Vec<ActionKind> = match target {
            ActionTarget::All => ActionKind::ALL.to_vec(),
            ActionTarget::One(a) => vec![a],
        };
        for action in &actions {
            let cfg = LimitConfig {
                guild_id: guild_id.to_string(),
                action: *action,
                enabled: true,
                limit,
                window_secs,
                punishment,
            };
            self.store.upsert_action_config(&cfg).await?;
        }
        tracing::info!(%guild_id, actions = actions.len(), limit, window_secs, %punishment, "antinuke limit set");
        self.refresh(guild_id).await?;
        Ok(actions.len())
    }

    pub async fn disable_action(&self, guild_id: &str, target: ActionTarget) -> Result<(), ControlError> {
        match target {
            ActionTarget::All => {
                for action in ActionKind::ALL {
                    self.store.disable_action(guild_id, action).await?;
                }
            }
            ActionTarget::One(action) => self.store.disable_action(guild_id, action).await?,
        }
        self.refresh(guild_id).await
    }

    pub async fn whitelist_add(
        &self,
        guild_id: &str,
        target_id: &str,
        target_type: TargetType,
        added_by: &str,
    ) -> Result<(), ControlError> {
        if target_id.is_empty() {
            return Err(ControlError::Invalid("empty whitelist target".into()));
        }
        self.store.add_whitelist(guild_id, target_id, target_type, added_by).await?;
        self.refresh(guild_id).await
    }

    /// `Ok(false)` when the target was not whitelisted.
    pub async fn whitelist_remove(&self, guild_id: &str, target_id: &str) -> Result<bool, ControlError> {
        let removed = self.store.remove_whitelist(guild_id, target_id).await?;
        self.refresh(guild_id).await?;
        Ok(removed)
    }
}
