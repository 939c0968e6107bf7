//! Composition root for the antinuke engine. Owns the cache, limiter, queues
//! and every background task, and is the only thing callers talk to.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::Serialize;
use tokio::{sync::watch, task::JoinHandle};

use super::{
    attribution::{AttributionEngine, EventSink},
    audit_cache::{AuditCacheManager, AuditCacheStats, AuditSource},
    cache::{AtomicConfigCache, CacheStats},
    detector::{CounterSnapshot, Detector, DetectorCounters, Verdict},
    limiter::{LimiterStats, ShardedSlidingRateLimiter, RING_CAPACITY},
    model::{AuditEvent, BotIdentity},
    roles::MemberRoleCache,
    store::{ConfigStore, StoreError},
    warmer::{CacheWarmer, WarmSummary},
    workers::{
        action_queues, spawn_workers, AdminApi, LoggingWorker, PendingPunishments, PunishmentWorker,
        RevocationWorker, Workers,
    },
};
use crate::config::AntinukeConfig;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceStats {
    pub counters: CounterSnapshot,
    pub cache: CacheStats,
    pub limiter: LimiterStats,
    pub audit_cache: Option<AuditCacheStats>,
    pub tracked_members: usize,
}

pub struct AntinukeService {
    config: AntinukeConfig,
    cache: Arc<AtomicConfigCache>,
    limiter: Arc<ShardedSlidingRateLimiter>,
    roles: Arc<MemberRoleCache>,
    identity: Arc<BotIdentity>,
    warmer: CacheWarmer,
    detector: Arc<Detector>,
    audit: Option<Arc<AuditCacheManager>>,
    attribution: Option<Arc<AttributionEngine>>,
    counters: Arc<DetectorCounters>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AntinukeService {
    /// Builds the engine and spawns its workers. Must run inside a tokio runtime.
    /// Attribution is only wired when enabled in config and `audit_source` is given.
    pub fn new(
        config: AntinukeConfig,
        store: Arc<dyn ConfigStore>,
        admin: Arc<dyn AdminApi>,
        audit_source: Option<Arc<dyn AuditSource>>,
    ) -> Arc<Self> {
        if config.rate_limiter.ring_capacity != RING_CAPACITY {
            tracing::warn!(
                configured = config.rate_limiter.ring_capacity,
                actual = RING_CAPACITY,
                "antinuke.rate_limiter.ring_capacity is fixed, ignoring configured value"
            );
        }

        let cache = Arc::new(AtomicConfigCache::new());
        let limiter = Arc::new(ShardedSlidingRateLimiter::new(config.rate_limiter.shards));
        let roles = Arc::new(MemberRoleCache::new());
        let identity = Arc::new(BotIdentity::new(config.bot_id.clone()));
        let counters = Arc::new(DetectorCounters::default());
        let pending = PendingPunishments::new(Duration::from_secs(config.punishment_dedup_secs));
        let (queues, receivers) = action_queues(&config.queues);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let detector = Arc::new(Detector::new(
            &config,
            cache.clone(),
            limiter.clone(),
            roles.clone(),
            identity.clone(),
            queues,
            pending.clone(),
            counters.clone(),
        ));

        let mut tasks = spawn_workers(
            Workers {
                punishment: PunishmentWorker::new(
                    admin.clone(),
                    pending,
                    counters.clone(),
                    Duration::from_secs(config.timeout_secs),
                    config.ban_delete_message_days,
                ),
                revocation: RevocationWorker::new(admin.clone(), counters.clone()),
                logging: LoggingWorker::new(admin),
            },
            receivers,
            &shutdown_rx,
        );

        let (audit, attribution) = match (config.attribution.enabled, audit_source) {
            (true, Some(source)) => {
                let audit = Arc::new(AuditCacheManager::new(
                    source,
                    identity.clone(),
                    config.audit_cache.clone(),
                ));
                tasks.push(AuditCacheManager::spawn_cleanup(&audit, shutdown_rx.clone()));
                let sink: Arc<dyn EventSink> = detector.clone();
                let engine = Arc::new(AttributionEngine::new(
                    config.attribution.clone(),
                    Duration::from_secs(config.audit_cache.max_entry_age_s),
                    audit.clone(),
                    sink,
                    counters.clone(),
                ));
                tasks.extend(engine.start(&shutdown_rx));
                (Some(audit), Some(engine))
            }
            (true, None) => {
                tracing::warn!("antinuke attribution enabled but no audit source given, leaving it off");
                (None, None)
            }
            (false, _) => (None, None),
        };

        let this = Arc::new(Self {
            warmer: CacheWarmer::new(cache.clone(), store),
            config,
            cache,
            limiter,
            roles,
            identity,
            detector,
            audit,
            attribution,
            counters,
            shutdown,
            tasks: Mutex::new(tasks),
        });
        let cleanup = Self::spawn_limiter_cleanup(&this, shutdown_rx);
        this.track(cleanup);
        this
    }

    fn track(&self, handle: JoinHandle<()>) {
        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(handle),
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    fn spawn_limiter_cleanup(this: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let weak = Arc::downgrade(this);
        let every = Duration::from_secs(this.config.rate_limiter.cleanup_interval_secs.max(1));
        let max_idle = Duration::from_secs(this.config.rate_limiter.max_idle_seconds);
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
                let removed = strong.limiter.cleanup(max_idle);
                let stats = strong.stats();
                tracing::debug!(
                    removed,
                    stats = %serde_json::to_string(&stats).unwrap_or_default(),
                    "antinuke limiter cleanup"
                );
            }
        })
    }

    /// Warms config for every known guild, then (in the background) the audit cache.
    pub async fn start(&self, guild_ids: &[String]) -> WarmSummary {
        let summary = self.warmer.warm_all(guild_ids).await;
        if let Some(audit) = &self.audit {
            let audit = Arc::clone(audit);
            let guilds = guild_ids.to_vec();
            self.track(tokio::spawn(async move {
                audit.warm_up(&guilds, &AttributionEngine::COVERED).await;
            }));
        }
        summary
    }

    /// Re-reads one guild from storage. Control-plane writes must call this.
    pub async fn refresh(&self, guild_id: &str) -> Result<(), StoreError> {
        self.warmer.warm_guild(guild_id).await
    }

    /// Detector entry for events that already carry an actor.
    pub fn process_event(&self, event: &AuditEvent) -> Verdict {
        self.detector.process(event)
    }

    /// Entry for gateway events without an actor. Falls back to the detector
    /// (which ignores unknown actors) when attribution is off.
    pub fn push_unattributed(&self, event: AuditEvent) -> bool {
        match &self.attribution {
            Some(engine) => engine.push(event),
            None => {
                self.detector.process(&event);
                false
            }
        }
    }

    pub fn attribution_enabled(&self) -> bool {
        self.attribution.is_some()
    }

    /// True when audit-log entries with this code should be left to attribution.
    pub fn attribution_covers(&self, action_code: u8) -> bool {
        self.attribution_enabled() && AttributionEngine::covers(action_code)
    }

    pub fn set_bot_id(&self, id: &str) {
        if !self.identity.set(id) && !self.identity.is_self(id) {
            tracing::warn!(bot_id = %id, known = ?self.identity.get(), "bot identity already set, ignoring");
        }
    }

    pub fn cache(&self) -> &AtomicConfigCache {
        &self.cache
    }

    pub fn limiter(&self) -> &ShardedSlidingRateLimiter {
        &self.limiter
    }

    pub fn roles(&self) -> &MemberRoleCache {
        &self.roles
    }

    pub fn forget_guild(&self, guild_id: &str) {
        self.cache.forget_guild(guild_id);
        self.limiter.reset_guild(guild_id);
        self.roles.forget_guild(guild_id);
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            counters: self.counters.snapshot(),
            cache: self.cache.stats(),
            limiter: self.limiter.stats(),
            audit_cache: self.audit.as_ref().map(|a| a.stats()),
            tracked_members: self.roles.len(),
        }
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles = match self.tasks.lock() {
            Ok(mut t) => std::mem::take(&mut *t),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let n = handles.len();
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(error = ?e, "antinuke task ended abnormally");
            }
        }
        tracing::info!(tasks = n, "antinuke service stopped");
    }
}
