//! AntiNuke: detection of mass destructive administrative actions.
//!
//! Audit events go through the [`detector::Detector`] synchronously; on a
//! violation it hands punishment, revocation and logging to bounded queues
//! drained by [`workers`]. Gateway events that lack an actor are first
//! resolved against the audit log by [`attribution`].

pub mod attribution;
pub mod audit_cache;
pub mod cache;
pub mod control;
pub mod detector;
pub mod limiter;
pub mod model;
pub mod roles;
pub mod service;
pub mod store;
pub mod warmer;
pub mod workers;

pub use control::{ActionTarget, AntinukeControl, ControlError};
pub use detector::{Skip, Verdict};
pub use model::{ActionKind, AuditEntry, AuditEvent, GuildConfig, LimitConfig, PunishmentKind, UNKNOWN_ACTOR};
pub use service::{AntinukeService, ServiceStats};
pub use store::{ConfigStore, ConfigWriter, MemoryStore, PgStore, StoreError, TargetType};
pub use workers::{AdminApi, LogRecord};
