//! Integration tests for the hash-trie: concurrent writers, snapshot
//! isolation, and model-checked round trips.

use cinder_lockfree::{ErasureOutcome, HashTrie, HashTrieSet, InsertionOutcome};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: u64 = 8;
const PER_THREAD: u64 = 1000;

/// Every distinct insert from every thread survives.
#[test]
fn test_no_lost_update() {
    let trie = Arc::new(HashTrie::new());
    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let trie = trie.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    let insertion = trie.insert(key, t).unwrap();
                    assert_eq!(insertion.outcome, InsertionOutcome::FirstInsertion);
                    assert!(insertion.snapshot.contains(&key));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(trie.len(), (THREADS * PER_THREAD) as usize);
    let snapshot = trie.snapshot().unwrap();
    assert_eq!(snapshot.iter().count(), 8000);
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(snapshot.get(&key), Some(&(key / PER_THREAD)));
    }
}

/// Threads racing on the same keys: exactly one first insertion and one
/// removal per key.
#[test]
fn test_contended_keys_linearize() {
    let trie = Arc::new(HashTrie::new());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let trie = trie.clone();
            thread::spawn(move || {
                let mut firsts = 0;
                let mut removals = 0;
                for key in 0..200u32 {
                    if trie.insert(key, ()).unwrap().outcome == InsertionOutcome::FirstInsertion {
                        firsts += 1;
                    }
                }
                for key in 0..200u32 {
                    if trie.erase(&key).unwrap().outcome == ErasureOutcome::Removed {
                        removals += 1;
                    }
                }
                (firsts, removals)
            })
        })
        .collect();

    let (firsts, removals) = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .fold((0, 0), |acc, (f, r)| (acc.0 + f, acc.1 + r));
    // Every first insertion is matched by a removal, and no key is left.
    assert_eq!(firsts, removals);
    assert!(firsts >= 200);
    assert!(trie.is_empty());
}

/// Snapshots taken while writers run never change afterwards.
#[test]
fn test_snapshots_stay_frozen_under_writes() {
    let trie = Arc::new(HashTrie::new());
    for i in 0..100u64 {
        trie.insert(i, 0u64).unwrap();
    }

    let writer = {
        let trie = trie.clone();
        thread::spawn(move || {
            for round in 1..=50u64 {
                for i in 0..100u64 {
                    trie.insert(i, round).unwrap();
                }
            }
        })
    };

    let mut frozen = Vec::new();
    for _ in 0..20 {
        let snapshot = trie.snapshot().unwrap();
        let values: Vec<u64> = (0..100u64).map(|i| *snapshot.get(&i).unwrap()).collect();
        frozen.push((snapshot, values));
    }
    writer.join().unwrap();

    for (snapshot, values) in &frozen {
        assert_eq!(snapshot.len(), 100);
        let again: Vec<u64> = (0..100u64).map(|i| *snapshot.get(&i).unwrap()).collect();
        assert_eq!(&again, values);
    }
    assert!(trie.snapshot().unwrap().iter().all(|(_, v)| *v == 50));
}

#[test]
fn test_set_concurrent_membership() {
    let set = Arc::new(HashTrieSet::new());
    let handles: Vec<_> = (0..4u32)
        .map(|t| {
            let set = set.clone();
            thread::spawn(move || {
                for i in 0..500u32 {
                    set.insert(i * 4 + t).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(set.len(), 2000);
    assert!((0..2000u32).all(|i| set.contains(&i)));
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u16, u32),
    Erase(u16),
    Snapshot,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u16..64, any::<u32>()).prop_map(|(k, v)| Op::Insert(k, v)),
        3 => (0u16..64).prop_map(Op::Erase),
        1 => Just(Op::Snapshot),
    ]
}

proptest! {
    /// The trie agrees with a `HashMap` after every operation, and every
    /// snapshot keeps agreeing with the model as it was when taken.
    #[test]
    fn prop_matches_hash_map(ops in prop::collection::vec(op(), 1..200)) {
        let trie = HashTrie::new();
        let mut model: HashMap<u16, u32> = HashMap::new();
        let mut frozen = Vec::new();

        for op in ops {
            match op {
                Op::Insert(k, v) => {
                    let insertion = trie.insert(k, v).unwrap();
                    prop_assert_eq!(insertion.prior, model.insert(k, v));
                    prop_assert_eq!(insertion.snapshot.len(), model.len());
                }
                Op::Erase(k) => {
                    let erasure = trie.erase(&k).unwrap();
                    prop_assert_eq!(erasure.removed, model.remove(&k));
                    prop_assert_eq!(erasure.snapshot.len(), model.len());
                }
                Op::Snapshot => frozen.push((trie.snapshot().unwrap(), model.clone())),
            }
            prop_assert_eq!(trie.len(), model.len());
        }

        for (k, v) in &model {
            prop_assert_eq!(trie.get(k), Some(*v));
        }
        for (snapshot, expected) in &frozen {
            let seen: HashMap<u16, u32> = snapshot.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(&seen, expected);
        }
    }
}
