//! Joins gateway events that arrive without an actor against the audit log.
//!
//! Events wait in a bounded channel. Workers drain it on a fixed tick (or as
//! soon as a batch fills), refresh the audit cache once per (guild, action) in
//! the batch, then either resolve each event or keep it for the next tick
//! until its retry budget runs out.

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use futures_util::future::join_all;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};

use super::{
    audit_cache::AuditCacheManager,
    detector::DetectorCounters,
    model::{audit_codes, AuditEvent, UNKNOWN_ACTOR},
};
use crate::config::AttributionConfig;

/// Receives events once their actor is known (or known to be unknown).
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: AuditEvent);
}

#[derive(Debug)]
struct PendingEvent {
    event: AuditEvent,
    received_at: Instant,
    attempts: u32,
}

pub struct AttributionEngine {
    tx: mpsc::Sender<PendingEvent>,
    rx: Mutex<mpsc::Receiver<PendingEvent>>,
    audit: Arc<AuditCacheManager>,
    sink: Arc<dyn EventSink>,
    settings: AttributionConfig,
    max_age: Duration,
    counters: Arc<DetectorCounters>,
}

impl AttributionEngine {
    pub fn new(
        settings: AttributionConfig,
        max_age: Duration,
        audit: Arc<AuditCacheManager>,
        sink: Arc<dyn EventSink>,
        counters: Arc<DetectorCounters>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_cap.max(1));
        Self {
            tx,
            rx: Mutex::new(rx),
            audit,
            sink,
            settings,
            max_age,
            counters,
        }
    }

    /// Queues an event for attribution. `false` when the queue is full.
    pub fn push(&self, event: AuditEvent) -> bool {
        let pending = PendingEvent {
            event,
            received_at: Instant::now(),
            attempts: 0,
        };
        match self.tx.try_send(pending) {
            Ok(()) => true,
            Err(e) => {
                self.counters.attribution_dropped.fetch_add(1, Ordering::Relaxed);
                let pending = match e {
                    mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
                };
                tracing::warn!(
                    guild_id = %pending.event.guild_id,
                    action_code = pending.event.action_code,
                    "attribution queue full, event dropped"
                );
                false
            }
        }
    }

    /// Action codes whose gateway events go through attribution.
    pub const COVERED: [u8; 2] = [audit_codes::CHANNEL_CREATE, audit_codes::ROLE_CREATE];

    pub fn covers(action_code: u8) -> bool {
        Self::COVERED.contains(&action_code)
    }

    fn retry_budget(&self, action_code: u8) -> u32 {
        self.settings.retry_budget(audit_codes::name(action_code))
    }

    pub fn start(self: &Arc<Self>, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.settings.workers.max(1))
            .map(|id| {
                let this = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.worker_loop(id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, id: usize, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.settings.batch_window_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let flush_at = self.settings.flush_at.max(1);
        let mut batch: Vec<PendingEvent> = Vec::with_capacity(flush_at);
        let mut retry: Vec<PendingEvent> = Vec::new();

        tracing::debug!(worker = id, "attribution worker started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = tick.tick() => {}
            }
            batch.append(&mut retry);
            loop {
                let full = self.fill(&mut batch, flush_at).await;
                if !batch.is_empty() {
                    self.process_batch(&mut batch, &mut retry).await;
                }
                if !full {
                    break;
                }
            }
        }
        tracing::debug!(worker = id, pending = retry.len(), "attribution worker stopped");
    }

    /// Moves queued events into `batch`; true if it reached `flush_at`.
    async fn fill(&self, batch: &mut Vec<PendingEvent>, flush_at: usize) -> bool {
        let mut rx = self.rx.lock().await;
        while batch.len() < flush_at {
            match rx.try_recv() {
                Ok(p) => batch.push(p),
                Err(_) => break,
            }
        }
        batch.len() >= flush_at
    }

    async fn process_batch(&self, batch: &mut Vec<PendingEvent>, retry: &mut Vec<PendingEvent>) {
        {
            let mut targets: Vec<(&str, u8)> = batch
                .iter()
                .map(|p| (p.event.guild_id.as_str(), p.event.action_code))
                .collect();
            targets.sort_unstable();
            targets.dedup();

            // one upstream call per guild covering all of its pending actions
            let mut per_guild: Vec<(&str, Vec<u8>)> = Vec::new();
            for (guild_id, code) in targets {
                match per_guild.last_mut() {
                    Some((g, codes)) if *g == guild_id => codes.push(code),
                    _ => per_guild.push((guild_id, vec![code])),
                }
            }

            let fetches = per_guild.iter().map(|(g, codes)| self.audit.fetch(g, codes));
            for (res, (guild_id, codes)) in join_all(fetches).await.into_iter().zip(&per_guild) {
                if let Err(e) = res {
                    tracing::warn!(error = ?e, %guild_id, action_codes = ?codes, "audit fetch failed");
                }
            }
        }

        for mut p in batch.drain(..) {
            p.attempts += 1;
            let found = self
                .audit
                .find_recent(&p.event.guild_id, p.event.target_id.as_deref(), p.event.action_code, self.max_age)
                .await;
            match found {
                Some(entry) => {
                    self.counters.attribution_resolved.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        guild_id = %p.event.guild_id,
                        actor_id = %entry.actor_id,
                        attempts = p.attempts,
                        latency_ms = p.received_at.elapsed().as_millis() as u64,
                        "event attributed"
                    );
                    p.event.actor_id = entry.actor_id;
                    self.sink.deliver(p.event);
                }
                None if p.attempts <= self.retry_budget(p.event.action_code) => retry.push(p),
                None => {
                    self.counters.attribution_unresolved.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        guild_id = %p.event.guild_id,
                        action_code = p.event.action_code,
                        attempts = p.attempts,
                        "attribution gave up"
                    );
                    p.event.actor_id = UNKNOWN_ACTOR.to_string();
                    self.sink.deliver(p.event);
                }
            }
        }
    }
}
