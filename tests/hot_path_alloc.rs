//! Counts heap allocations around the limiter check and the config lookup.
//! Kept to a single test: the allocator is global to this binary.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use tigris_antinuke::antinuke::{
    cache::AtomicConfigCache, limiter::ShardedSlidingRateLimiter, ActionKind, GuildConfig,
};

struct CountingAlloc;

static COUNTING: AtomicBool = AtomicBool::new(false);
static ALLOCATIONS: AtomicU64 = AtomicU64::new(0);

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if COUNTING.load(Ordering::Relaxed) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if COUNTING.load(Ordering::Relaxed) {
            ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        }
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static GLOBAL: CountingAlloc = CountingAlloc;

#[test]
fn check_and_get_config_do_not_allocate_on_known_keys() {
    let limiter = ShardedSlidingRateLimiter::new(64);
    let cache = AtomicConfigCache::new();
    cache.set_config(GuildConfig {
        guild_id: "123456789012345678".into(),
        enabled: true,
        owner_id: "876543210987654321".into(),
        log_channel: None,
        panic: false,
    });

    let guild = "123456789012345678";
    let actor = "111111111111111111";
    // first call creates the window and the thread-local key buffer
    limiter.check(guild, ActionKind::DeleteChannels, actor, 1_000, 10);
    assert!(cache.get_config(guild).is_some());

    COUNTING.store(true, Ordering::SeqCst);
    let mut found = 0u32;
    for _ in 0..10_000 {
        let d = limiter.check(guild, ActionKind::DeleteChannels, actor, 1_000, 10);
        if let Some(cfg) = cache.get_config(guild) {
            found += u32::from(cfg.enabled) + u32::from(d.count > 0);
        }
    }
    COUNTING.store(false, Ordering::SeqCst);

    assert_eq!(found, 20_000);
    assert_eq!(ALLOCATIONS.load(Ordering::SeqCst), 0);
}
