//! Sliding-window counters keyed by (guild, action, actor).
//!
//! Each key owns a fixed ring of [`RING_CAPACITY`] second-resolution
//! timestamps. A check counts the slots inside the window, records the new
//! event and reports whether the count went over the limit. Windows are
//! spread over independent shards so unrelated guilds rarely contend.

use std::{
    cell::RefCell,
    fmt::Write as _,
    sync::atomic::{AtomicI64, AtomicU32, Ordering},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::Serialize;

use super::model::ActionKind;

/// Slots per window. Limits above this cannot be represented.
pub const RING_CAPACITY: usize = 128;
pub const DEFAULT_SHARDS: usize = 64;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Whole seconds on a monotonic clock local to this process.
pub fn monotonic_secs() -> i64 {
    EPOCH.elapsed().as_secs() as i64
}

thread_local! {
    static KEY_BUF: RefCell<String> = RefCell::new(String::with_capacity(96));
}

/// Builds `guild:action:actor` into a per-thread buffer and hands it to `f`.
fn with_key<R>(guild_id: &str, action: ActionKind, actor_id: &str, f: impl FnOnce(&str) -> R) -> R {
    KEY_BUF.with(|buf| {
        let mut buf = buf.borrow_mut();
        buf.clear();
        let _ = write!(buf, "{guild_id}:{}:{actor_id}", action.as_str());
        f(buf.as_str())
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub triggered: bool,
    /// Matching events in the window, including this one.
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub active_windows: usize,
    pub total_events: u64,
}

struct EventWindow {
    slots: [AtomicI64; RING_CAPACITY],
    cursor: AtomicU32,
    len: AtomicU32,
}

impl EventWindow {
    fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| AtomicI64::new(0)),
            cursor: AtomicU32::new(0),
            len: AtomicU32::new(0),
        }
    }

    fn count_since(&self, cutoff: i64) -> u32 {
        let len = self.len.load(Ordering::Acquire) as usize;
        self.slots[..len.min(RING_CAPACITY)]
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) >= cutoff)
            .count() as u32
    }

    fn record(&self, ts: i64) {
        // 2^32 is a multiple of RING_CAPACITY, so cursor wrap-around stays aligned
        let pos = self.cursor.fetch_add(1, Ordering::AcqRel) as usize % RING_CAPACITY;
        self.slots[pos].store(ts, Ordering::Relaxed);
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                ((n as usize) < RING_CAPACITY).then_some(n + 1)
            });
    }

    fn last_seen(&self) -> Option<i64> {
        if self.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        let pos = self.cursor.load(Ordering::Acquire).wrapping_sub(1) as usize % RING_CAPACITY;
        Some(self.slots[pos].load(Ordering::Relaxed))
    }

    fn recorded(&self) -> u64 {
        u64::from(self.len.load(Ordering::Acquire))
    }

    fn hit(&self, now: i64, window_s: u32, limit: u32) -> RateDecision {
        let cutoff = now - i64::from(window_s.max(1));
        let count = self.count_since(cutoff) + 1;
        self.record(now);
        RateDecision {
            triggered: count > limit,
            count,
        }
    }
}

/// Unsharded sliding-window limiter. One of these backs every shard of
/// [`ShardedSlidingRateLimiter`].
#[derive(Default)]
pub struct SlidingRateLimiter {
    windows: DashMap<String, Box<EventWindow>>,
}

impl SlidingRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, guild_id: &str, action: ActionKind, actor_id: &str, limit: u32, window_s: u32) -> RateDecision {
        self.check_at(guild_id, action, actor_id, limit, window_s, monotonic_secs())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(
        &self,
        guild_id: &str,
        action: ActionKind,
        actor_id: &str,
        limit: u32,
        window_s: u32,
        now: i64,
    ) -> RateDecision {
        with_key(guild_id, action, actor_id, |key| {
            if let Some(w) = self.windows.get(key) {
                return w.hit(now, window_s, limit);
            }
            let w = self
                .windows
                .entry(key.to_owned())
                .or_insert_with(|| Box::new(EventWindow::new()))
                .downgrade();
            w.hit(now, window_s, limit)
        })
    }

    pub fn reset(&self, guild_id: &str, action: ActionKind, actor_id: &str) {
        with_key(guild_id, action, actor_id, |key| {
            self.windows.remove(key);
        });
    }

    pub fn reset_guild(&self, guild_id: &str) {
        self.windows.retain(|key, _| {
            !(key.starts_with(guild_id) && key.as_bytes().get(guild_id.len()) == Some(&b':'))
        });
    }

    /// Drops windows whose newest event is older than `max_idle`.
    pub fn cleanup_at(&self, max_idle: Duration, now: i64) -> usize {
        let cutoff = now - max_idle.as_secs() as i64;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| w.last_seen().is_some_and(|ts| ts >= cutoff));
        before.saturating_sub(self.windows.len())
    }

    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            active_windows: self.windows.len(),
            total_events: self.windows.iter().map(|w| w.recorded()).sum(),
        }
    }
}

pub struct ShardedSlidingRateLimiter {
    shards: Box<[SlidingRateLimiter]>,
}

impl Default for ShardedSlidingRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}

impl ShardedSlidingRateLimiter {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| SlidingRateLimiter::new()).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, guild_id: &str, action: ActionKind, actor_id: &str) -> &SlidingRateLimiter {
        let parts = [
            guild_id.as_bytes(),
            b":",
            action.as_str().as_bytes(),
            b":",
            actor_id.as_bytes(),
        ];
        let hash = parts
            .iter()
            .flat_map(|p| p.iter())
            .fold(0u32, |h, &b| h.wrapping_mul(31).wrapping_add(u32::from(b)));
        &self.shards[hash as usize % self.shards.len()]
    }

    pub fn check(&self, guild_id: &str, action: ActionKind, actor_id: &str, limit: u32, window_s: u32) -> RateDecision {
        self.check_at(guild_id, action, actor_id, limit, window_s, monotonic_secs())
    }

    pub fn check_at(
        &self,
        guild_id: &str,
        action: ActionKind,
        actor_id: &str,
        limit: u32,
        window_s: u32,
        now: i64,
    ) -> RateDecision {
        self.shard(guild_id, action, actor_id)
            .check_at(guild_id, action, actor_id, limit, window_s, now)
    }

    pub fn reset(&self, guild_id: &str, action: ActionKind, actor_id: &str) {
        self.shard(guild_id, action, actor_id).reset(guild_id, action, actor_id);
    }

    pub fn reset_guild(&self, guild_id: &str) {
        for shard in self.shards.iter() {
            shard.reset_guild(guild_id);
        }
    }

    pub fn cleanup(&self, max_idle: Duration) -> usize {
        self.cleanup_at(max_idle, monotonic_secs())
    }

    pub fn cleanup_at(&self, max_idle: Duration, now: i64) -> usize {
        self.shards.iter().map(|s| s.cleanup_at(max_idle, now)).sum()
    }

    pub fn stats(&self) -> LimiterStats {
        self.shards.iter().fold(LimiterStats::default(), |acc, s| {
            let st = s.stats();
            LimiterStats {
                active_windows: acc.active_windows + st.active_windows,
                total_events: acc.total_events + st.total_events,
            }
        })
    }
}
