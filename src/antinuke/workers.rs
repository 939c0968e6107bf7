//! Asynchronous side of a detection: the three bounded queues the detector
//! publishes to and the workers that drain them against the platform API.

use std::{
    future::Future,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::sync::Cache;
use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::{
    detector::DetectorCounters,
    model::{ActionKind, PunishmentKind, PunishmentTask, RevocationTask, ViolationRecord},
};
use crate::config::QueueConfig;

/// Administrative calls the workers need from the platform.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn ban_member(&self, guild_id: &str, user_id: &str, reason: &str, delete_days: u8) -> Result<()>;
    async fn kick_member(&self, guild_id: &str, user_id: &str, reason: &str) -> Result<()>;
    async fn timeout_member(&self, guild_id: &str, user_id: &str, until: DateTime<Utc>) -> Result<()>;
    async fn list_member_roles(&self, guild_id: &str, user_id: &str) -> Result<Vec<String>>;
    async fn remove_member_role(&self, guild_id: &str, user_id: &str, role_id: &str) -> Result<()>;
    async fn delete_channel(&self, channel_id: &str) -> Result<()>;
    async fn delete_role(&self, guild_id: &str, role_id: &str) -> Result<()>;
    async fn delete_webhook(&self, webhook_id: &str) -> Result<()>;
    async fn unban_user(&self, guild_id: &str, user_id: &str) -> Result<()>;
    async fn send_log(&self, channel_id: &str, record: &LogRecord) -> Result<()>;
}

/// What the logging worker sends to a guild's log channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogRecord {
    pub guild_id: String,
    pub action: ActionKind,
    pub action_name: &'static str,
    pub actor_id: String,
    pub count: u32,
    pub limit: u32,
    pub latency_us: u64,
    pub detected_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn from_violation(v: &ViolationRecord) -> Self {
        Self {
            guild_id: v.guild_id.clone(),
            action: v.action,
            action_name: v.action.display_name(),
            actor_id: v.actor_id.clone(),
            count: v.count,
            limit: v.limit,
            latency_us: v.latency.as_micros() as u64,
            detected_at: Utc::now(),
        }
    }
}

/* ===========================
   Queues
   =========================== */

/// Producer ends, owned by the detector.
#[derive(Clone)]
pub struct ActionQueues {
    pub punishment: mpsc::Sender<PunishmentTask>,
    pub revocation: mpsc::Sender<RevocationTask>,
    pub logging: mpsc::Sender<ViolationRecord>,
}

/// Consumer ends, handed to the workers.
pub struct QueueReceivers {
    pub punishment: mpsc::Receiver<PunishmentTask>,
    pub revocation: mpsc::Receiver<RevocationTask>,
    pub logging: mpsc::Receiver<ViolationRecord>,
}

pub fn action_queues(caps: &QueueConfig) -> (ActionQueues, QueueReceivers) {
    let (ptx, prx) = mpsc::channel(caps.punishment_cap.max(1));
    let (rtx, rrx) = mpsc::channel(caps.revocation_cap.max(1));
    let (ltx, lrx) = mpsc::channel(caps.logging_cap.max(1));
    (
        ActionQueues {
            punishment: ptx,
            revocation: rtx,
            logging: ltx,
        },
        QueueReceivers {
            punishment: prx,
            revocation: rrx,
            logging: lrx,
        },
    )
}

/// Claims on (guild, actor) while a punishment is queued or recently executed.
/// A second claim inside the TTL is refused, so one burst yields one punishment.
#[derive(Clone)]
pub struct PendingPunishments {
    claims: Cache<(String, String), ()>,
}

impl PendingPunishments {
    pub fn new(ttl: Duration) -> Self {
        Self {
            claims: Cache::builder()
                .max_capacity(100_000)
                .time_to_live(ttl.max(Duration::from_millis(1)))
                .build(),
        }
    }

    pub fn try_claim(&self, guild_id: &str, actor_id: &str) -> bool {
        self.claims
            .entry((guild_id.to_string(), actor_id.to_string()))
            .or_insert(())
            .is_fresh()
    }

    pub fn release(&self, guild_id: &str, actor_id: &str) {
        self.claims.invalidate(&(guild_id.to_string(), actor_id.to_string()));
    }
}

/// Drains `rx` until it closes or `shutdown` flips.
async fn drain<T, F, Fut>(name: &'static str, mut rx: mpsc::Receiver<T>, mut shutdown: watch::Receiver<bool>, mut handle: F)
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ()>,
{
    tracing::debug!(worker = name, "antinuke worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = rx.recv() => match next {
                Some(task) => handle(task).await,
                None => break,
            },
        }
    }
    tracing::debug!(worker = name, "antinuke worker stopped");
}

/* ===========================
   Punishment
   =========================== */

pub struct PunishmentWorker {
    admin: Arc<dyn AdminApi>,
    pending: PendingPunishments,
    counters: Arc<DetectorCounters>,
    timeout: Duration,
    delete_days: u8,
}

impl PunishmentWorker {
    pub fn new(
        admin: Arc<dyn AdminApi>,
        pending: PendingPunishments,
        counters: Arc<DetectorCounters>,
        timeout: Duration,
        delete_days: u8,
    ) -> Self {
        Self {
            admin,
            pending,
            counters,
            timeout,
            delete_days,
        }
    }

    /// Runs one punishment. Never retried: repeating a ban after the fact does harm.
    pub async fn execute(&self, task: &PunishmentTask) -> Result<()> {
        let (g, u) = (task.guild_id.as_str(), task.actor_id.as_str());
        match task.punishment {
            PunishmentKind::Ban => self.admin.ban_member(g, u, &task.reason, self.delete_days).await?,
            PunishmentKind::Kick => self.admin.kick_member(g, u, &task.reason).await?,
            PunishmentKind::Timeout => {
                let until = Utc::now() + chrono::Duration::from_std(self.timeout)?;
                self.admin.timeout_member(g, u, until).await?
            }
            PunishmentKind::Quarantine => {
                let roles = self.admin.list_member_roles(g, u).await?;
                let mut failed = 0usize;
                for role_id in &roles {
                    if let Err(e) = self.admin.remove_member_role(g, u, role_id).await {
                        failed += 1;
                        tracing::warn!(error = ?e, guild_id = g, actor_id = u, %role_id, "quarantine: role removal failed");
                    }
                }
                if failed > 0 && failed == roles.len() {
                    anyhow::bail!("quarantine removed none of {} roles", roles.len());
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, task: PunishmentTask) {
        match self.execute(&task).await {
            Ok(()) => {
                self.counters.punishments_executed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    guild_id = %task.guild_id,
                    actor_id = %task.actor_id,
                    punishment = %task.punishment,
                    "antinuke punishment executed"
                );
            }
            Err(e) => {
                // claim released so a continued attack can be punished again
                self.pending.release(&task.guild_id, &task.actor_id);
                tracing::error!(
                    error = ?e,
                    guild_id = %task.guild_id,
                    actor_id = %task.actor_id,
                    punishment = %task.punishment,
                    "antinuke punishment failed"
                );
            }
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<PunishmentTask>, shutdown: watch::Receiver<bool>) {
        drain("punishment", rx, shutdown, |task| self.handle(task)).await
    }
}

/* ===========================
   Revocation
   =========================== */

pub struct RevocationWorker {
    admin: Arc<dyn AdminApi>,
    counters: Arc<DetectorCounters>,
}

impl RevocationWorker {
    pub fn new(admin: Arc<dyn AdminApi>, counters: Arc<DetectorCounters>) -> Self {
        Self { admin, counters }
    }

    /// Undoes the triggering action. `Ok(false)` when there is nothing to undo.
    pub async fn execute(&self, task: &RevocationTask) -> Result<bool> {
        let revocable = matches!(
            task.action,
            ActionKind::CreateChannels | ActionKind::CreateRoles | ActionKind::CreateWebhooks | ActionKind::BanMembers
        );
        if !revocable {
            return Ok(false);
        }
        let Some(target) = task.target_id.as_deref().filter(|t| !t.is_empty()) else {
            tracing::warn!(
                guild_id = %task.guild_id,
                action = %task.action,
                "revocation skipped: no target id"
            );
            return Ok(false);
        };
        match task.action {
            ActionKind::CreateChannels => self.admin.delete_channel(target).await?,
            ActionKind::CreateRoles => self.admin.delete_role(&task.guild_id, target).await?,
            ActionKind::CreateWebhooks => self.admin.delete_webhook(target).await?,
            ActionKind::BanMembers => self.admin.unban_user(&task.guild_id, target).await?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    async fn handle(&self, task: RevocationTask) {
        match self.execute(&task).await {
            Ok(true) => {
                self.counters.revocations_successful.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    guild_id = %task.guild_id,
                    action = %task.action,
                    target_id = ?task.target_id,
                    "antinuke revocation done"
                );
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(
                error = ?e,
                guild_id = %task.guild_id,
                action = %task.action,
                target_id = ?task.target_id,
                "antinuke revocation failed"
            ),
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<RevocationTask>, shutdown: watch::Receiver<bool>) {
        drain("revocation", rx, shutdown, |task| self.handle(task)).await
    }
}

/* ===========================
   Logging
   =========================== */

pub struct LoggingWorker {
    admin: Arc<dyn AdminApi>,
}

impl LoggingWorker {
    pub fn new(admin: Arc<dyn AdminApi>) -> Self {
        Self { admin }
    }

    /// Best-effort delivery to the guild's log channel, if any.
    pub async fn execute(&self, record: &ViolationRecord) -> Result<bool> {
        let Some(channel) = record.log_channel.as_deref() else {
            return Ok(false);
        };
        self.admin.send_log(channel, &LogRecord::from_violation(record)).await?;
        Ok(true)
    }

    async fn handle(&self, record: ViolationRecord) {
        tracing::warn!(
            guild_id = %record.guild_id,
            actor_id = %record.actor_id,
            action = %record.action,
            count = record.count,
            limit = record.limit,
            latency_us = record.latency.as_micros() as u64,
            "antinuke violation"
        );
        if let Err(e) = self.execute(&record).await {
            tracing::warn!(error = ?e, guild_id = %record.guild_id, "antinuke log delivery failed");
        }
    }

    pub async fn run(self, rx: mpsc::Receiver<ViolationRecord>, shutdown: watch::Receiver<bool>) {
        drain("logging", rx, shutdown, |record| self.handle(record)).await
    }
}

pub struct Workers {
    pub punishment: PunishmentWorker,
    pub revocation: RevocationWorker,
    pub logging: LoggingWorker,
}

/// Spawns one task per queue.
pub fn spawn_workers(workers: Workers, rx: QueueReceivers, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let Workers {
        punishment,
        revocation,
        logging,
    } = workers;
    vec![
        tokio::spawn(punishment.run(rx.punishment, shutdown.clone())),
        tokio::spawn(revocation.run(rx.revocation, shutdown.clone())),
        tokio::spawn(logging.run(rx.logging, shutdown.clone())),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockAdmin {
        calls: Mutex<Vec<String>>,
        roles: Vec<String>,
        fail_ban: bool,
    }

    #[async_trait]
    impl AdminApi for MockAdmin {
        async fn ban_member(&self, _g: &str, u: &str, _r: &str, _d: u8) -> Result<()> {
            if self.fail_ban {
                anyhow::bail!("missing permissions");
            }
            self.calls.lock().await.push(format!("ban:{u}"));
            Ok(())
        }
        async fn kick_member(&self, _g: &str, u: &str, _r: &str) -> Result<()> {
            self.calls.lock().await.push(format!("kick:{u}"));
            Ok(())
        }
        async fn timeout_member(&self, _g: &str, u: &str, until: DateTime<Utc>) -> Result<()> {
            let mins = (until - Utc::now()).num_minutes();
            self.calls.lock().await.push(format!("timeout:{u}:{}", (mins + 1) / 60));
            Ok(())
        }
        async fn list_member_roles(&self, _g: &str, _u: &str) -> Result<Vec<String>> {
            Ok(self.roles.clone())
        }
        async fn remove_member_role(&self, _g: &str, u: &str, r: &str) -> Result<()> {
            self.calls.lock().await.push(format!("unrole:{u}:{r}"));
            Ok(())
        }
        async fn delete_channel(&self, c: &str) -> Result<()> {
            self.calls.lock().await.push(format!("delete_channel:{c}"));
            Ok(())
        }
        async fn delete_role(&self, _g: &str, r: &str) -> Result<()> {
            self.calls.lock().await.push(format!("delete_role:{r}"));
            Ok(())
        }
        async fn delete_webhook(&self, w: &str) -> Result<()> {
            self.calls.lock().await.push(format!("delete_webhook:{w}"));
            Ok(())
        }
        async fn unban_user(&self, _g: &str, u: &str) -> Result<()> {
            self.calls.lock().await.push(format!("unban:{u}"));
            Ok(())
        }
        async fn send_log(&self, c: &str, rec: &LogRecord) -> Result<()> {
            self.calls.lock().await.push(format!("log:{c}:{}/{}", rec.count, rec.limit));
            Ok(())
        }
    }

    fn punisher(admin: Arc<MockAdmin>) -> (PunishmentWorker, Arc<DetectorCounters>, PendingPunishments) {
        let counters = Arc::new(DetectorCounters::default());
        let pending = PendingPunishments::new(Duration::from_secs(30));
        let w = PunishmentWorker::new(admin, pending.clone(), counters.clone(), Duration::from_secs(3600), 0);
        (w, counters, pending)
    }

    fn task(p: PunishmentKind) -> PunishmentTask {
        PunishmentTask {
            guild_id: "g".into(),
            actor_id: "a".into(),
            punishment: p,
            reason: "AntiNuke: exceeded delete_channels limit".into(),
        }
    }

    #[tokio::test]
    async fn punishments_map_to_admin_calls() {
        let admin = Arc::new(MockAdmin {
            roles: vec!["r1".into(), "r2".into()],
            ..Default::default()
        });
        let (w, _, _) = punisher(admin.clone());
        w.execute(&task(PunishmentKind::Ban)).await.unwrap();
        w.execute(&task(PunishmentKind::Kick)).await.unwrap();
        w.execute(&task(PunishmentKind::Timeout)).await.unwrap();
        w.execute(&task(PunishmentKind::Quarantine)).await.unwrap();
        assert_eq!(
            *admin.calls.lock().await,
            vec!["ban:a", "kick:a", "timeout:a:1", "unrole:a:r1", "unrole:a:r2"]
        );
    }

    #[tokio::test]
    async fn failed_punishment_is_not_retried_and_releases_claim() {
        let admin = Arc::new(MockAdmin {
            fail_ban: true,
            ..Default::default()
        });
        let (w, counters, pending) = punisher(admin.clone());
        assert!(pending.try_claim("g", "a"));
        w.handle(task(PunishmentKind::Ban)).await;
        assert!(admin.calls.lock().await.is_empty());
        assert_eq!(counters.punishments_executed.load(Ordering::Relaxed), 0);
        assert!(pending.try_claim("g", "a"));
    }

    #[tokio::test]
    async fn revocation_table() {
        let admin = Arc::new(MockAdmin::default());
        let counters = Arc::new(DetectorCounters::default());
        let w = RevocationWorker::new(admin.clone(), counters.clone());
        let mk = |action, target: Option<&str>| RevocationTask {
            guild_id: "g".into(),
            action,
            actor_id: "a".into(),
            target_id: target.map(str::to_string),
        };

        assert!(w.execute(&mk(ActionKind::CreateChannels, Some("c"))).await.unwrap());
        assert!(w.execute(&mk(ActionKind::CreateRoles, Some("r"))).await.unwrap());
        assert!(w.execute(&mk(ActionKind::CreateWebhooks, Some("w"))).await.unwrap());
        assert!(w.execute(&mk(ActionKind::BanMembers, Some("v"))).await.unwrap());
        assert!(!w.execute(&mk(ActionKind::DeleteChannels, Some("c"))).await.unwrap());
        assert!(!w.execute(&mk(ActionKind::CreateChannels, None)).await.unwrap());

        w.handle(mk(ActionKind::CreateRoles, Some("r2"))).await;
        assert_eq!(counters.revocations_successful.load(Ordering::Relaxed), 1);
        assert_eq!(
            *admin.calls.lock().await,
            vec!["delete_channel:c", "delete_role:r", "delete_webhook:w", "unban:v", "delete_role:r2"]
        );
    }

    #[tokio::test]
    async fn logging_needs_a_channel() {
        let admin = Arc::new(MockAdmin::default());
        let w = LoggingWorker::new(admin.clone());
        let mut rec = ViolationRecord {
            guild_id: "g".into(),
            action: ActionKind::DeleteChannels,
            actor_id: "a".into(),
            count: 4,
            limit: 3,
            latency: Duration::from_micros(120),
            log_channel: None,
        };
        assert!(!w.execute(&rec).await.unwrap());
        rec.log_channel = Some("logs".into());
        assert!(w.execute(&rec).await.unwrap());
        assert_eq!(*admin.calls.lock().await, vec!["log:logs:4/3"]);
    }

    #[test]
    fn claims_are_exclusive_until_released() {
        let pending = PendingPunishments::new(Duration::from_secs(30));
        assert!(pending.try_claim("g", "a"));
        assert!(!pending.try_claim("g", "a"));
        assert!(pending.try_claim("g", "b"));
        pending.release("g", "a");
        assert!(pending.try_claim("g", "a"));
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let admin = Arc::new(MockAdmin::default());
        let counters = Arc::new(DetectorCounters::default());
        let pending = PendingPunishments::new(Duration::from_secs(30));
        let (queues, rx) = action_queues(&QueueConfig::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handles = spawn_workers(
            Workers {
                punishment: PunishmentWorker::new(admin.clone(), pending, counters.clone(), Duration::from_secs(60), 0),
                revocation: RevocationWorker::new(admin.clone(), counters.clone()),
                logging: LoggingWorker::new(admin.clone()),
            },
            rx,
            &stop_rx,
        );
        queues.punishment.send(task(PunishmentKind::Kick)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.punishments_executed.load(Ordering::Relaxed), 1);

        stop_tx.send(true).unwrap();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
        }
    }
}
