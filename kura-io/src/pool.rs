//! # Buffer Pool
//!
//! Size-tiered free lists of fixed-capacity blocks. A checkout never blocks
//! and never fails: an empty free list just means a fresh allocation. Each
//! tier has its own lock, so readers working on different tiers never meet.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use kura_core::config::PoolConfig;

/// Block size class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Small,
    Medium,
    Large,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Small, Tier::Medium, Tier::Large];

    /// Capacity in bytes of every block of this tier
    pub const fn block_size(self) -> usize {
        match self {
            Tier::Small => 4 * 1024,
            Tier::Medium => 64 * 1024,
            Tier::Large => 1024 * 1024,
        }
    }

    /// Smallest tier whose blocks hold `len` bytes, `Large` beyond that.
    pub fn for_len(len: usize) -> Tier {
        if len <= Tier::Small.block_size() {
            Tier::Small
        } else if len <= Tier::Medium.block_size() {
            Tier::Medium
        } else {
            Tier::Large
        }
    }

    fn index(self) -> usize {
        match self {
            Tier::Small => 0,
            Tier::Medium => 1,
            Tier::Large => 2,
        }
    }
}

/// Fixed-capacity byte region owned by exactly one holder.
#[derive(Debug)]
pub struct Block {
    tier: Tier,
    data: Box<[u8]>,
}

impl Block {
    fn new(tier: Tier) -> Self {
        Self {
            tier,
            data: vec![0u8; tier.block_size()].into_boxed_slice(),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Block {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for Block {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

struct TierPool {
    free: Mutex<Vec<Block>>,
    capacity: usize,
    allocations: AtomicU64,
    reuses: AtomicU64,
    discards: AtomicU64,
}

impl TierPool {
    fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }
}

/// Per-tier pool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierStats {
    pub free: usize,
    pub capacity: usize,
    pub allocations: u64,
    pub reuses: u64,
    pub discards: u64,
}

/// Buffer pool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub small: TierStats,
    pub medium: TierStats,
    pub large: TierStats,
}

impl PoolStats {
    pub fn tier(&self, tier: Tier) -> &TierStats {
        match tier {
            Tier::Small => &self.small,
            Tier::Medium => &self.medium,
            Tier::Large => &self.large,
        }
    }

    /// Bytes currently parked in free lists
    pub fn pooled_bytes(&self) -> usize {
        Tier::ALL
            .iter()
            .map(|t| self.tier(*t).free * t.block_size())
            .sum()
    }
}

pub struct BufferPool {
    tiers: [TierPool; 3],
    zero_on_release: bool,
}

impl BufferPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            tiers: [
                TierPool::new(config.small_capacity),
                TierPool::new(config.medium_capacity),
                TierPool::new(config.large_capacity),
            ],
            zero_on_release: config.zero_on_release,
        }
    }

    fn pool(&self, tier: Tier) -> &TierPool {
        &self.tiers[tier.index()]
    }

    /// Take a block from the tier's free list, allocating if it is empty.
    pub fn checkout(&self, tier: Tier) -> Block {
        let pool = self.pool(tier);
        if let Some(block) = pool.free.lock().pop() {
            pool.reuses.fetch_add(1, Ordering::Relaxed);
            return block;
        }
        pool.allocations.fetch_add(1, Ordering::Relaxed);
        Block::new(tier)
    }

    /// Hand a block back. Zeroed first (if configured), then kept only while
    /// the free list is below its cap.
    pub fn release(&self, mut block: Block) {
        let pool = self.pool(block.tier);
        if self.zero_on_release {
            block.data.fill(0);
        }

        let mut free = pool.free.lock();
        if free.len() < pool.capacity {
            free.push(block);
        } else {
            drop(free);
            pool.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pre-allocate up to `count` free blocks, never exceeding the cap.
    /// Returns how many blocks were added.
    pub fn prime(&self, tier: Tier, count: usize) -> usize {
        let pool = self.pool(tier);
        let mut free = pool.free.lock();
        let target = free.len().saturating_add(count).min(pool.capacity);
        let added = target - free.len();
        free.extend((0..added).map(|_| Block::new(tier)));
        pool.allocations.fetch_add(added as u64, Ordering::Relaxed);
        added
    }

    /// Drop every pooled block.
    pub fn clear(&self) {
        for tier in Tier::ALL {
            let released = {
                let mut free = self.pool(tier).free.lock();
                std::mem::take(&mut *free)
            };
            if !released.is_empty() {
                debug!(?tier, blocks = released.len(), "Released pooled blocks");
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let tier_stats = |tier: Tier| {
            let pool = self.pool(tier);
            TierStats {
                free: pool.free.lock().len(),
                capacity: pool.capacity,
                allocations: pool.allocations.load(Ordering::Relaxed),
                reuses: pool.reuses.load(Ordering::Relaxed),
                discards: pool.discards.load(Ordering::Relaxed),
            }
        };
        PoolStats {
            small: tier_stats(Tier::Small),
            medium: tier_stats(Tier::Medium),
            large: tier_stats(Tier::Large),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(cap: usize) -> PoolConfig {
        PoolConfig {
            small_capacity: cap,
            medium_capacity: cap,
            large_capacity: cap,
            zero_on_release: true,
            prime_on_start: false,
        }
    }

    #[test]
    fn test_tier_for_len() {
        assert_eq!(Tier::for_len(0), Tier::Small);
        assert_eq!(Tier::for_len(4096), Tier::Small);
        assert_eq!(Tier::for_len(4097), Tier::Medium);
        assert_eq!(Tier::for_len(64 * 1024), Tier::Medium);
        assert_eq!(Tier::for_len(10 * 1024 * 1024), Tier::Large);
    }

    #[test]
    fn test_checkout_reuses_released_block() {
        let pool = BufferPool::new(&config(2));
        let block = pool.checkout(Tier::Medium);
        assert_eq!(block.capacity(), 64 * 1024);
        pool.release(block);

        let _again = pool.checkout(Tier::Medium);
        let stats = pool.stats();
        assert_eq!(stats.medium.allocations, 1);
        assert_eq!(stats.medium.reuses, 1);
    }

    #[test]
    fn test_released_block_is_zeroed() {
        let pool = BufferPool::new(&config(1));
        let mut block = pool.checkout(Tier::Small);
        block[..5].copy_from_slice(b"hello");
        pool.release(block);

        let block = pool.checkout(Tier::Small);
        assert!(block.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zeroing_can_be_disabled() {
        let pool = BufferPool::new(&PoolConfig {
            zero_on_release: false,
            ..config(1)
        });
        let mut block = pool.checkout(Tier::Small);
        block[0] = 7;
        pool.release(block);
        assert_eq!(pool.checkout(Tier::Small)[0], 7);
    }

    #[test]
    fn test_release_beyond_cap_discards() {
        let pool = BufferPool::new(&config(2));
        let blocks: Vec<_> = (0..5).map(|_| pool.checkout(Tier::Large)).collect();
        for block in blocks {
            pool.release(block);
        }
        let stats = pool.stats();
        assert_eq!(stats.large.free, 2);
        assert_eq!(stats.large.discards, 3);
    }

    #[test]
    fn test_prime_and_clear() {
        let pool = BufferPool::new(&config(3));
        assert_eq!(pool.prime(Tier::Small, 10), 3);
        assert_eq!(pool.prime(Tier::Small, 10), 0);
        assert_eq!(pool.stats().pooled_bytes(), 3 * 4096);

        pool.clear();
        assert_eq!(pool.stats().small.free, 0);
    }
}
