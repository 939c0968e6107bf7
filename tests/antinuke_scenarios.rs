mod common;

use std::{sync::Arc, time::Duration};

use common::{enabled, test_config, RecordingAdmin, ScriptedAuditSource};
use tigris_antinuke::{
    antinuke::{
        audit_cache::AuditSource,
        cache::AtomicConfigCache,
        detector::{Detector, DetectorCounters},
        limiter::ShardedSlidingRateLimiter,
        model::{audit_codes, BotIdentity, PunishmentTask},
        roles::MemberRoleCache,
        workers::{action_queues, PendingPunishments, QueueReceivers},
        ActionKind, AntinukeService, AuditEntry, AuditEvent, ConfigWriter, LimitConfig, MemoryStore,
        PunishmentKind, Skip, Verdict,
    },
    config::{AntinukeConfig, QueueConfig},
};

struct Rig {
    detector: Detector,
    cache: Arc<AtomicConfigCache>,
    roles: Arc<MemberRoleCache>,
    counters: Arc<DetectorCounters>,
    rx: QueueReceivers,
}

fn rig(queues: QueueConfig) -> Rig {
    let cache = Arc::new(AtomicConfigCache::new());
    let roles = Arc::new(MemberRoleCache::new());
    let counters = Arc::new(DetectorCounters::default());
    let (tx, rx) = action_queues(&queues);
    let detector = Detector::new(
        &AntinukeConfig::default(),
        cache.clone(),
        Arc::new(ShardedSlidingRateLimiter::new(8)),
        roles.clone(),
        Arc::new(BotIdentity::new(Some("bot".into()))),
        tx,
        PendingPunishments::new(Duration::from_secs(30)),
        counters.clone(),
    );
    Rig {
        detector,
        cache,
        roles,
        counters,
        rx,
    }
}

fn delete_channels_limit(guild: &str) -> LimitConfig {
    LimitConfig {
        guild_id: guild.into(),
        action: ActionKind::DeleteChannels,
        enabled: true,
        limit: 3,
        window_secs: 10,
        punishment: PunishmentKind::Ban,
    }
}

fn ev(guild: &str, code: u8, actor: &str, target: &str) -> AuditEvent {
    AuditEvent::new(guild, code, actor, Some(target.into()))
}

#[test]
fn mass_channel_deletion_is_punished_once() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G1", "O", false));
    r.cache.set_limit(delete_channels_limit("G1"));

    for i in 1..=3 {
        let v = r.detector.process(&ev("G1", audit_codes::CHANNEL_DELETE, "A", &format!("c{i}")));
        assert_eq!(v, Verdict::Allowed { count: i });
    }
    assert!(r.rx.punishment.try_recv().is_err());
    assert!(r.rx.revocation.try_recv().is_err());
    assert!(r.rx.logging.try_recv().is_err());

    let v = r.detector.process(&ev("G1", audit_codes::CHANNEL_DELETE, "A", "c4"));
    assert_eq!(
        v,
        Verdict::Violation {
            action: ActionKind::DeleteChannels,
            count: 4,
            limit: 3,
            punished: true
        }
    );

    let p = r.rx.punishment.try_recv().unwrap();
    assert_eq!(
        p,
        PunishmentTask {
            guild_id: "G1".into(),
            actor_id: "A".into(),
            punishment: PunishmentKind::Ban,
            reason: "AntiNuke: exceeded delete_channels limit".into(),
        }
    );
    let rev = r.rx.revocation.try_recv().unwrap();
    assert_eq!(rev.action, ActionKind::DeleteChannels);
    assert_eq!(rev.actor_id, "A");
    assert_eq!(rev.target_id.as_deref(), Some("c4"));
    let log = r.rx.logging.try_recv().unwrap();
    assert_eq!((log.count, log.limit), (4, 3));
    assert_eq!(log.log_channel.as_deref(), Some("G1-logs"));

    assert!(r.rx.punishment.try_recv().is_err());
    assert!(r.rx.revocation.try_recv().is_err());
    assert!(r.rx.logging.try_recv().is_err());
}

#[test]
fn panic_mode_triggers_on_first_event() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G2", "O", true));

    let v = r.detector.process(&ev("G2", audit_codes::ROLE_CREATE, "X", "r1"));
    assert_eq!(
        v,
        Verdict::Violation {
            action: ActionKind::CreateRoles,
            count: 1,
            limit: 0,
            punished: true
        }
    );
    assert_eq!(r.rx.punishment.try_recv().unwrap().punishment, PunishmentKind::Ban);
}

#[test]
fn whitelisted_role_bypasses_dangerous_default() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G3", "O", false));
    r.cache.add_to_whitelist("G3", "R_admin");
    r.roles.upsert("G3", "A", vec!["R_member".into(), "R_admin".into()]);

    for i in 0..10 {
        let v = r.detector.process(&ev("G3", audit_codes::MEMBER_BAN_ADD, "A", &format!("u{i}")));
        assert_eq!(v, Verdict::Skipped(Skip::WhitelistedRole));
    }
    assert!(r.rx.punishment.try_recv().is_err());
    assert_eq!(r.counters.snapshot().detections, 0);
}

#[test]
fn dangerous_default_applies_without_explicit_limit() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G4", "O", false));

    // limit 1 in 1 s: the first bot is within the limit, a second one in the same second is not
    let first = r.detector.process(&ev("G4", audit_codes::BOT_ADD, "A", "b1"));
    assert_eq!(first, Verdict::Allowed { count: 1 });
    let second = r.detector.process(&ev("G4", audit_codes::BOT_ADD, "A", "b2"));
    assert!(matches!(
        second,
        Verdict::Violation {
            action: ActionKind::AddBots,
            limit: 1,
            punished: true,
            ..
        }
    ));
    assert_eq!(r.rx.punishment.try_recv().unwrap().punishment, PunishmentKind::Ban);

    // a non-dangerous action without a limit is not monitored at all
    let v = r.detector.process(&ev("G4", audit_codes::CHANNEL_DELETE, "A", "c1"));
    assert_eq!(v, Verdict::Skipped(Skip::NotMonitored));
}

#[test]
fn full_punishment_queue_does_not_block_other_queues() {
    let mut r = rig(QueueConfig {
        punishment_cap: 1,
        revocation_cap: 16,
        logging_cap: 16,
    });
    r.cache.set_config(enabled("G1", "O", false));
    r.cache.set_limit(delete_channels_limit("G1"));

    // another actor's punishment fills the queue
    r.cache.set_config(enabled("GX", "O", true));
    assert!(matches!(
        r.detector.process(&ev("GX", audit_codes::ROLE_CREATE, "Z", "r")),
        Verdict::Violation { punished: true, .. }
    ));
    let _ = r.rx.revocation.try_recv();
    let _ = r.rx.logging.try_recv();

    for i in 1..=4 {
        r.detector.process(&ev("G1", audit_codes::CHANNEL_DELETE, "A", &format!("c{i}")));
    }

    assert_eq!(r.counters.snapshot().events_dropped_queue, 1);
    assert_eq!(r.rx.revocation.try_recv().unwrap().target_id.as_deref(), Some("c4"));
    assert_eq!(r.rx.logging.try_recv().unwrap().count, 4);
    // only the filler is in the punishment queue
    assert_eq!(r.rx.punishment.try_recv().unwrap().actor_id, "Z");
    assert!(r.rx.punishment.try_recv().is_err());
}

#[test]
fn bot_never_triggers_on_its_own_actions() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G1", "O", true));
    for _ in 0..20 {
        let v = r.detector.process(&ev("G1", audit_codes::CHANNEL_DELETE, "bot", "c"));
        assert_eq!(v, Verdict::Skipped(Skip::SelfAction));
    }
    assert!(r.rx.punishment.try_recv().is_err());
}

#[test]
fn owner_and_whitelisted_user_never_trigger() {
    let mut r = rig(QueueConfig::default());
    r.cache.set_config(enabled("G1", "O", true));
    r.cache.add_to_whitelist("G1", "W");
    for i in 0..50 {
        let target = format!("t{i}");
        assert_eq!(
            r.detector.process(&ev("G1", audit_codes::MEMBER_BAN_ADD, "O", &target)),
            Verdict::Skipped(Skip::Owner)
        );
        assert_eq!(
            r.detector.process(&ev("G1", audit_codes::MEMBER_BAN_ADD, "W", &target)),
            Verdict::Skipped(Skip::Whitelisted)
        );
    }
    assert!(r.rx.punishment.try_recv().is_err());
}

/* ===========================
   Through the service
   =========================== */

#[tokio::test]
async fn service_bans_and_logs_mass_deleter() {
    let store = Arc::new(MemoryStore::new());
    store.put_config(enabled("G1", "O", false));
    store.put_limit(delete_channels_limit("G1"));
    let admin = Arc::new(RecordingAdmin::default());

    let svc = AntinukeService::new(test_config(false), store, admin.clone(), None);
    let summary = svc.start(&["G1".to_string()]).await;
    assert_eq!((summary.guilds, summary.enabled, summary.failed), (1, 1, 0));

    for i in 1..=4 {
        svc.process_event(&ev("G1", audit_codes::CHANNEL_DELETE, "A", &format!("c{i}")));
    }

    let calls = admin.wait_for(2).await;
    assert_eq!(calls.iter().filter(|c| c.starts_with("ban:")).count(), 1);
    assert!(calls.contains(&"ban:G1:A".to_string()));
    assert!(calls.contains(&"log:G1-logs".to_string()));
    // channel deletions cannot be undone, so no revocation call
    assert!(!calls.iter().any(|c| c.starts_with("delete_")));

    let logs = admin.logs.lock().await;
    assert_eq!((logs[0].count, logs[0].limit), (4, 3));
    drop(logs);

    svc.shutdown().await;
    let stats = svc.stats();
    assert_eq!(stats.counters.detections, 1);
    assert_eq!(stats.counters.punishments_executed, 1);
}

#[tokio::test]
async fn attributed_channel_creation_is_reverted() {
    let store = Arc::new(MemoryStore::new());
    store.put_config(enabled("G6", "O", false));
    store
        .upsert_action_config(&LimitConfig {
            guild_id: "G6".into(),
            action: ActionKind::CreateChannels,
            enabled: true,
            limit: 0,
            window_secs: 10,
            punishment: PunishmentKind::Kick,
        })
        .await
        .unwrap();
    let admin = Arc::new(RecordingAdmin::default());
    // empty on the first two fetches, the entry shows up on the third
    let source = Arc::new(ScriptedAuditSource::new(
        2,
        vec![AuditEntry {
            action_code: audit_codes::CHANNEL_CREATE,
            actor_id: "A".into(),
            target_id: Some("C1".into()),
            occurred_at: chrono::Utc::now(),
        }],
    ));
    let audit: Arc<dyn AuditSource> = source.clone();

    let svc = AntinukeService::new(test_config(true), store, admin.clone(), Some(audit));
    assert!(svc.attribution_enabled());
    assert!(svc.attribution_covers(audit_codes::CHANNEL_CREATE));
    svc.refresh("G6").await.unwrap();

    assert!(svc.push_unattributed(AuditEvent::unattributed(
        "G6",
        audit_codes::CHANNEL_CREATE,
        Some("C1".into())
    )));

    let calls = admin.wait_for(3).await;
    assert!(calls.contains(&"kick:G6:A".to_string()), "{calls:?}");
    assert!(calls.contains(&"delete_channel:C1".to_string()), "{calls:?}");
    assert!(source.calls() >= 3);

    svc.shutdown().await;
    let stats = svc.stats();
    assert_eq!(stats.counters.attribution_resolved, 1);
    assert_eq!(stats.counters.attribution_unresolved, 0);
}

#[tokio::test]
async fn unresolved_actor_is_never_punished() {
    let store = Arc::new(MemoryStore::new());
    store.put_config(enabled("G7", "O", true));
    let admin = Arc::new(RecordingAdmin::default());
    let source = Arc::new(ScriptedAuditSource::new(u64::MAX, Vec::new()));
    let audit: Arc<dyn AuditSource> = source.clone();

    let mut cfg = test_config(true);
    cfg.attribution.max_retries_per_action.insert("role_create".into(), 1);
    let svc = AntinukeService::new(cfg, store, admin.clone(), Some(audit));
    svc.refresh("G7").await.unwrap();

    svc.push_unattributed(AuditEvent::unattributed("G7", audit_codes::ROLE_CREATE, Some("R1".into())));

    for _ in 0..100 {
        if svc.stats().counters.attribution_unresolved == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    svc.shutdown().await;
    let stats = svc.stats();
    assert_eq!(stats.counters.attribution_unresolved, 1);
    assert_eq!(stats.counters.detections, 0);
    assert!(admin.calls().await.is_empty());
}

#[tokio::test]
async fn role_creation_is_attributed_while_channel_creation_waits() {
    let store = Arc::new(MemoryStore::new());
    store.put_config(enabled("G8", "O", true));
    let admin = Arc::new(RecordingAdmin::default());
    // only the role creation ever shows up in the audit log
    let source = Arc::new(ScriptedAuditSource::new(
        0,
        vec![AuditEntry {
            action_code: audit_codes::ROLE_CREATE,
            actor_id: "A".into(),
            target_id: Some("R1".into()),
            occurred_at: chrono::Utc::now(),
        }],
    ));
    let audit: Arc<dyn AuditSource> = source.clone();

    let mut cfg = test_config(true);
    cfg.audit_cache.min_fetch_interval_ms = 200;
    let svc = AntinukeService::new(cfg, store, admin.clone(), Some(audit));
    svc.refresh("G8").await.unwrap();

    assert!(svc.push_unattributed(AuditEvent::unattributed("G8", audit_codes::CHANNEL_CREATE, Some("C1".into()))));
    assert!(svc.push_unattributed(AuditEvent::unattributed("G8", audit_codes::ROLE_CREATE, Some("R1".into()))));

    // ban, role removal and the log message
    let calls = admin.wait_for(3).await;
    assert!(calls.contains(&"ban:G8:A".to_string()), "{calls:?}");
    assert!(calls.contains(&"delete_role:G8:R1".to_string()), "{calls:?}");

    svc.shutdown().await;
    let stats = svc.stats();
    assert_eq!(stats.counters.attribution_resolved, 1);
    assert!(stats.counters.detections >= 1);
}
