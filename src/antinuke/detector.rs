//! Hot path: decides, synchronously and without suspending, whether an audit
//! event escalates into a violation.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;

use super::{
    attribution::EventSink,
    cache::AtomicConfigCache,
    limiter::ShardedSlidingRateLimiter,
    model::{
        ActionKind, AuditEvent, BotIdentity, GuildConfig, LimitConfig, Policy, PunishmentTask, RevocationTask,
        ViolationRecord, UNKNOWN_ACTOR,
    },
    roles::RoleDirectory,
    workers::{ActionQueues, PendingPunishments},
};
use crate::config::AntinukeConfig;

#[derive(Debug, Default)]
pub struct DetectorCounters {
    pub events_processed: AtomicU64,
    pub events_dropped_queue: AtomicU64,
    pub detections: AtomicU64,
    pub punishments_executed: AtomicU64,
    pub revocations_successful: AtomicU64,
    pub attribution_resolved: AtomicU64,
    pub attribution_unresolved: AtomicU64,
    pub attribution_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub events_processed: u64,
    pub events_dropped_queue: u64,
    pub detections: u64,
    pub punishments_executed: u64,
    pub revocations_successful: u64,
    pub attribution_resolved: u64,
    pub attribution_unresolved: u64,
    pub attribution_dropped: u64,
}

impl DetectorCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            events_processed: get(&self.events_processed),
            events_dropped_queue: get(&self.events_dropped_queue),
            detections: get(&self.detections),
            punishments_executed: get(&self.punishments_executed),
            revocations_successful: get(&self.revocations_successful),
            attribution_resolved: get(&self.attribution_resolved),
            attribution_unresolved: get(&self.attribution_unresolved),
            attribution_dropped: get(&self.attribution_dropped),
        }
    }
}

/// Why an event did not count against any limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    InvalidGuild,
    SelfAction,
    UnknownActor,
    NotConfigured,
    Disabled,
    Unmapped,
    NotMonitored,
    Owner,
    Whitelisted,
    WhitelistedRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Skipped(Skip),
    /// Counted, still within the limit.
    Allowed { count: u32 },
    Violation {
        action: ActionKind,
        count: u32,
        limit: u32,
        /// False when a punishment for this actor was already pending.
        punished: bool,
    },
}

/// Effective policy for one event. Panic beats an explicit limit, which beats
/// the dangerous-action default.
pub fn resolve_policy(
    config: &GuildConfig,
    limit: Option<&LimitConfig>,
    action: ActionKind,
    panic_defaults: Policy,
    dangerous_defaults: Policy,
) -> Option<Policy> {
    match (config.panic, limit.filter(|l| l.enabled), action.is_dangerous()) {
        (true, _, _) => Some(panic_defaults),
        (false, Some(l), _) => Some(l.policy()),
        (false, None, true) => Some(dangerous_defaults),
        (false, None, false) => None,
    }
}

pub struct Detector {
    cache: Arc<AtomicConfigCache>,
    limiter: Arc<ShardedSlidingRateLimiter>,
    roles: Arc<dyn RoleDirectory>,
    identity: Arc<BotIdentity>,
    queues: ActionQueues,
    pending: PendingPunishments,
    panic_defaults: Policy,
    dangerous_defaults: Policy,
    counters: Arc<DetectorCounters>,
}

impl Detector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &AntinukeConfig,
        cache: Arc<AtomicConfigCache>,
        limiter: Arc<ShardedSlidingRateLimiter>,
        roles: Arc<dyn RoleDirectory>,
        identity: Arc<BotIdentity>,
        queues: ActionQueues,
        pending: PendingPunishments,
        counters: Arc<DetectorCounters>,
    ) -> Self {
        Self {
            cache,
            limiter,
            roles,
            identity,
            queues,
            pending,
            panic_defaults: config.panic_defaults,
            dangerous_defaults: config.dangerous_defaults,
            counters,
        }
    }

    pub fn counters(&self) -> &DetectorCounters {
        &self.counters
    }

    /// Never suspends and never fails; queue saturation degrades to drops.
    pub fn process(&self, event: &AuditEvent) -> Verdict {
        let started = Instant::now();
        self.counters.events_processed.fetch_add(1, Ordering::Relaxed);

        let guild_id = event.guild_id.as_str();
        let actor_id = event.actor_id.as_str();
        if guild_id.is_empty() {
            return Verdict::Skipped(Skip::InvalidGuild);
        }
        if self.identity.is_self(actor_id) {
            return Verdict::Skipped(Skip::SelfAction);
        }
        if actor_id.is_empty() || actor_id == UNKNOWN_ACTOR {
            return Verdict::Skipped(Skip::UnknownActor);
        }

        let Some(config) = self.cache.get_config(guild_id) else {
            return Verdict::Skipped(Skip::NotConfigured);
        };
        if !config.enabled {
            return Verdict::Skipped(Skip::Disabled);
        }
        let Some(action) = ActionKind::from_audit_code(event.action_code) else {
            return Verdict::Skipped(Skip::Unmapped);
        };

        let limit = self.cache.get_limit(guild_id, action);
        let Some(policy) = resolve_policy(
            &config,
            limit.as_deref(),
            action,
            self.panic_defaults,
            self.dangerous_defaults,
        ) else {
            return Verdict::Skipped(Skip::NotMonitored);
        };

        if let Some(skip) = self.bypass(&config, actor_id) {
            return Verdict::Skipped(skip);
        }

        let decision = self
            .limiter
            .check(guild_id, action, actor_id, policy.limit, policy.window_s);
        if !decision.triggered {
            tracing::trace!(
                %guild_id, %actor_id, %action, count = decision.count, limit = policy.limit,
                latency_us = started.elapsed().as_micros() as u64,
                "antinuke event within limit"
            );
            return Verdict::Allowed { count: decision.count };
        }

        self.counters.detections.fetch_add(1, Ordering::Relaxed);
        let punished = self.escalate(event, &config, action, policy, decision.count, started);
        Verdict::Violation {
            action,
            count: decision.count,
            limit: policy.limit,
            punished,
        }
    }

    fn bypass(&self, config: &GuildConfig, actor_id: &str) -> Option<Skip> {
        if !config.owner_id.is_empty() && config.owner_id == actor_id {
            return Some(Skip::Owner);
        }
        let guild_id = config.guild_id.as_str();
        if self.cache.is_whitelisted(guild_id, actor_id) {
            return Some(Skip::Whitelisted);
        }
        let roles = self.roles.member_roles(guild_id, actor_id)?;
        roles
            .iter()
            .any(|r| self.cache.is_whitelisted(guild_id, r))
            .then_some(Skip::WhitelistedRole)
    }

    /// Publishes the three tasks. Each queue is tried independently.
    fn escalate(
        &self,
        event: &AuditEvent,
        config: &GuildConfig,
        action: ActionKind,
        policy: Policy,
        count: u32,
        started: Instant,
    ) -> bool {
        let guild_id = event.guild_id.as_str();
        let actor_id = event.actor_id.as_str();

        let punished = self.pending.try_claim(guild_id, actor_id);
        if punished {
            let task = PunishmentTask {
                guild_id: guild_id.to_string(),
                actor_id: actor_id.to_string(),
                punishment: policy.punishment,
                reason: format!("AntiNuke: exceeded {} limit", action.as_str()),
            };
            if let Err(e) = self.queues.punishment.try_send(task) {
                self.pending.release(guild_id, actor_id);
                self.dropped("punishment", guild_id, actor_id, action, e);
            }
        } else {
            tracing::debug!(%guild_id, %actor_id, %action, "punishment already pending, not queued again");
        }

        let revoke = RevocationTask {
            guild_id: guild_id.to_string(),
            action,
            actor_id: actor_id.to_string(),
            target_id: event.target_id.clone(),
        };
        if let Err(e) = self.queues.revocation.try_send(revoke) {
            self.dropped("revocation", guild_id, actor_id, action, e);
        }

        let record = ViolationRecord {
            guild_id: guild_id.to_string(),
            action,
            actor_id: actor_id.to_string(),
            count,
            limit: policy.limit,
            latency: started.elapsed(),
            log_channel: config.log_channel.clone(),
        };
        if let Err(e) = self.queues.logging.try_send(record) {
            self.dropped("logging", guild_id, actor_id, action, e);
        }

        punished
    }

    fn dropped<T>(&self, queue: &'static str, guild_id: &str, actor_id: &str, action: ActionKind, err: TrySendError<T>) {
        self.counters.events_dropped_queue.fetch_add(1, Ordering::Relaxed);
        let reason = match err {
            TrySendError::Full(_) => "full",
            TrySendError::Closed(_) => "closed",
        };
        tracing::warn!(queue, reason, %guild_id, %actor_id, %action, "antinuke task dropped");
    }
}

impl EventSink for Detector {
    fn deliver(&self, event: AuditEvent) {
        let verdict = self.process(&event);
        tracing::debug!(guild_id = %event.guild_id, actor_id = %event.actor_id, ?verdict, "attributed event processed");
    }
}
