//! Buffer pool tests

use std::sync::Arc;
use std::thread;

use kura_core::config::PoolConfig;
use kura_io::pool::{BufferPool, Tier};
use proptest::prelude::*;

fn pool(cap: usize) -> BufferPool {
    BufferPool::new(&PoolConfig {
        small_capacity: cap,
        medium_capacity: cap,
        large_capacity: cap,
        zero_on_release: true,
        prime_on_start: false,
    })
}

#[test]
fn test_concurrent_checkout_release() {
    let pool = Arc::new(pool(4));
    let mut handles = vec![];

    for t in 0..8u8 {
        let pool = Arc::clone(&pool);
        handles.push(thread::spawn(move || {
            for i in 0..500 {
                let tier = Tier::ALL[i % 3];
                let mut block = pool.checkout(tier);
                assert!(block.iter().all(|b| *b == 0), "block reused without zeroing");
                block[0] = t + 1;
                let last = block.capacity() - 1;
                block[last] = t + 1;
                pool.release(block);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    for tier in Tier::ALL {
        assert!(stats.tier(tier).free <= 4);
    }
}

proptest! {
    #[test]
    fn prop_free_list_bounded(
        cap in 0usize..6,
        steps in prop::collection::vec((0usize..3, any::<bool>()), 1..100),
    ) {
        let pool = pool(cap);
        let mut held = Vec::new();

        for (tier_idx, checkout) in steps {
            let tier = Tier::ALL[tier_idx];
            if checkout || held.is_empty() {
                let mut block = pool.checkout(tier);
                prop_assert_eq!(block.capacity(), tier.block_size());
                prop_assert!(block.iter().all(|b| *b == 0));
                block.fill(0xEE);
                held.push(block);
            } else if let Some(block) = held.pop() {
                pool.release(block);
            }

            let stats = pool.stats();
            for tier in Tier::ALL {
                prop_assert!(stats.tier(tier).free <= cap);
            }
        }
    }
}
