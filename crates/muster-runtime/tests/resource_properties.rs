//! Property tests for the resource ledger.
//!
//! Under arbitrary interleavings of requests and releases the pool must
//! never hand out more units than it has, and a holder can never end up
//! with a negative balance.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use muster_runtime::ResourceManager;
use proptest::prelude::*;
use std::time::Duration;

const CAPACITY: u64 = 8;

#[derive(Debug, Clone)]
enum Op {
    /// Request `amount` units, giving up immediately when saturated.
    Request { holder: usize, amount: u64, priority: u8 },
    /// Release `amount` units, possibly more than held.
    Release { holder: usize, amount: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..4usize, 1..=4u64, 0..=9u8)
            .prop_map(|(holder, amount, priority)| Op::Request { holder, amount, priority }),
        (0..4usize, 1..=4u64).prop_map(|(holder, amount)| Op::Release { holder, amount }),
    ]
}

fn holder_name(index: usize) -> String {
    format!("h-{index}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn ledger_never_exceeds_capacity(ops in proptest::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let pool = ResourceManager::new(Duration::from_secs(60));
            pool.declare("pool", "generic", CAPACITY).await.unwrap();

            for op in ops {
                match op {
                    Op::Request { holder, amount, priority } => {
                        // A zero-wait request either grants immediately or
                        // times out; either way the ledger stays consistent.
                        let _ = pool
                            .request(
                                &holder_name(holder),
                                "pool",
                                amount,
                                priority,
                                Duration::from_millis(0),
                            )
                            .await;
                    }
                    Op::Release { holder, amount } => {
                        // Over-releases are rejected without mutating state.
                        let _ = pool.release(&holder_name(holder), "pool", amount).await;
                    }
                }

                let ledger = pool.ledger("pool").await.unwrap();
                let held: u64 = ledger.values().sum();
                prop_assert!(
                    held <= CAPACITY,
                    "ledger holds {held} of {CAPACITY}: {ledger:?}"
                );
                let utilization = pool.utilization("pool").await.unwrap();
                prop_assert!((0.0..=1.0).contains(&utilization));
            }

            // Draining every holder empties the ledger completely.
            let ledger = pool.ledger("pool").await.unwrap();
            for (holder, held) in ledger {
                pool.release(&holder, "pool", held).await.unwrap();
            }
            let ledger = pool.ledger("pool").await.unwrap();
            prop_assert!(ledger.is_empty(), "ledger not empty after drain: {ledger:?}");
            Ok(())
        })?;
    }
}
