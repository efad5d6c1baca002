//! Randomized writer traffic against a live hot index build.
//!
//! A background thread runs small multi-row transactions against the
//! source while the main thread builds an index over it. Whatever the
//! interleaving, the destination must equal the source once both sides
//! are quiet. Failures reproduce from the seed in the test name.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use kiln_common::config::EngineConfig;
use kiln_common::types::{Key, Value};
use kiln_engine::{Engine, Indexer, IndexerOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

const SEED_ROWS: u32 = 300;
const KEY_SPACE: u32 = 400;
const OPS_PER_TXN: u32 = 4;

fn key_n(i: u32) -> Key {
    Key::from_str(&format!("k{i:04}"))
}

fn run_interleaved(seed: u64) {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(EngineConfig::for_testing(tmp.path())).unwrap();
    let src = engine.create_table("src").unwrap();
    let dest = engine.create_table("dest").unwrap();

    let setup = engine.begin();
    for i in 0..SEED_ROWS {
        engine.put(setup, src, key_n(i), Value::from_str("seed")).unwrap();
    }
    engine.commit(setup).unwrap();

    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
            while !stop.load(Ordering::Relaxed) {
                let txn = engine.begin();
                for _ in 0..OPS_PER_TXN {
                    let k = key_n(rng.gen_range(0..KEY_SPACE));
                    // The single writer thread cannot conflict with
                    // itself, so every op here is expected to succeed.
                    match engine.get(src, &k).unwrap() {
                        Some(old) if rng.gen_bool(0.3) => {
                            engine.del_multiple(txn, src, k, old, &[dest]).unwrap();
                        }
                        _ => {
                            let v = Value::from_str(&format!("v{}", rng.gen_range(0..1000)));
                            engine.put_multiple(txn, src, k, v, &[dest]).unwrap();
                        }
                    }
                }
                if rng.gen_bool(0.1) {
                    engine.abort(txn).unwrap();
                } else {
                    engine.commit(txn).unwrap();
                }
            }
        });

        let txn = engine.begin();
        let mut indexer = Indexer::create(
            &engine,
            txn,
            src,
            &[dest],
            IndexerOptions {
                poll_interval_rows: 16,
            },
        )
        .unwrap();
        indexer.build().unwrap();
        indexer.close().unwrap();
        // Writers keep going while the finished build commits; their
        // fan-out now delivers directly into the new binding.
        engine.commit(txn).unwrap();

        stop.store(true, Ordering::Relaxed);
    });

    let src_rows = engine.scan_committed(src).unwrap();
    let dest_rows = engine.scan_committed(dest).unwrap();
    assert_eq!(dest_rows, src_rows, "diverged with seed {seed}");
}

#[test]
fn test_interleaved_build_seed_7() {
    run_interleaved(7);
}

#[test]
fn test_interleaved_build_seed_42() {
    run_interleaved(42);
}

#[test]
fn test_interleaved_build_seed_1337() {
    run_interleaved(1337);
}
