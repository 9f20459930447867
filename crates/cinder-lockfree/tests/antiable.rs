//! Integration tests for the antiable containers. Every scenario runs
//! against all three layouts.

use cinder_base::utils::XorShift64;
use cinder_lockfree::{AntiableHashSet, AntiableHashSetConfig, AntiableHashTrie, AntiableList};
use cinder_reclaim::{collect, EpochCoordinator};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Common surface of the three layouts.
trait Antiable<T>: Send + Sync {
    fn insert(&self, coordinator: &EpochCoordinator, value: T) -> bool;
    fn erase(&self, coordinator: &EpochCoordinator, value: T) -> bool;
    fn count_of(&self, value: &T) -> i64;
    fn values_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> Vec<T>;
    fn purge(&self, coordinator: &EpochCoordinator) -> usize;
}

macro_rules! impl_antiable {
    ($ty:ident, |$this:ident, $coordinator:ident| $purge:expr) => {
        impl<T: Hash + Eq + Clone + Send + Sync + 'static> Antiable<T> for $ty<T> {
            fn insert(&self, coordinator: &EpochCoordinator, value: T) -> bool {
                $ty::insert(self, coordinator, value).unwrap()
            }
            fn erase(&self, coordinator: &EpochCoordinator, value: T) -> bool {
                $ty::erase(self, coordinator, value).unwrap()
            }
            fn count_of(&self, value: &T) -> i64 {
                $ty::count_of(self, value)
            }
            fn values_at(&self, coordinator: &EpochCoordinator, epoch: u64) -> Vec<T> {
                $ty::iter(self, coordinator, epoch).collect()
            }
            fn purge(&self, $coordinator: &EpochCoordinator) -> usize {
                let $this = self;
                $purge
            }
        }
    };
}

impl_antiable!(AntiableList, |this, coordinator| AntiableList::purge(this, coordinator));
impl_antiable!(AntiableHashSet, |this, coordinator| AntiableHashSet::purge(this, coordinator));
impl_antiable!(AntiableHashTrie, |this, coordinator| AntiableHashTrie::purge(this, coordinator).unwrap());

fn layouts<T: Hash + Eq + Clone + Send + Sync + 'static>() -> Vec<(&'static str, Arc<dyn Antiable<T>>)> {
    let list: Arc<dyn Antiable<T>> = Arc::new(AntiableList::new());
    let hash_set: Arc<dyn Antiable<T>> =
        Arc::new(AntiableHashSet::with_config(AntiableHashSetConfig { buckets: 8 }).unwrap());
    let hash_trie: Arc<dyn Antiable<T>> = Arc::new(AntiableHashTrie::new());
    vec![("list", list), ("hash_set", hash_set), ("hash_trie", hash_trie)]
}

/// A value raced by an inserting and an erasing thread ends up absent, and
/// the two calls agree on whether it was ever present.
#[test]
fn test_alice_race() {
    for (name, container) in layouts::<String>() {
        for _ in 0..50 {
            let coordinator = Arc::new(EpochCoordinator::new());
            let barrier = Arc::new(Barrier::new(2));
            let spawn = |insert: bool| {
                let container = container.clone();
                let coordinator = coordinator.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if insert {
                        container.insert(&coordinator, "alice".to_string())
                    } else {
                        container.erase(&coordinator, "alice".to_string())
                    }
                })
            };
            let inserter = spawn(true);
            let eraser = spawn(false);
            let inserted = inserter.join().unwrap();
            let erased = eraser.join().unwrap();

            // Insert first: both report a presence change. Erase first:
            // neither does.
            assert_eq!(inserted, erased, "{name}");
            assert_eq!(container.count_of(&"alice".to_string()), 0, "{name}");
            let reader = coordinator.acquire();
            assert!(container.values_at(&coordinator, reader.epoch()).is_empty(), "{name}");
        }
    }
}

/// Readers pinned at an epoch keep seeing the same values while writers run.
#[test]
fn test_fixed_epoch_iteration_is_repeatable() {
    for (name, container) in layouts::<u32>() {
        let coordinator = Arc::new(EpochCoordinator::new());
        for i in 0..64 {
            container.insert(&coordinator, i);
        }
        let reader = coordinator.acquire();
        let before: HashSet<u32> = container.values_at(&coordinator, reader.epoch()).into_iter().collect();

        let writer = {
            let container = container.clone();
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                for i in 0..64 {
                    container.erase(&coordinator, i);
                    container.insert(&coordinator, i + 100);
                }
            })
        };
        for _ in 0..20 {
            let during: HashSet<u32> =
                container.values_at(&coordinator, reader.epoch()).into_iter().collect();
            assert_eq!(during, before, "{name}");
        }
        writer.join().unwrap();
        let after: HashSet<u32> = container.values_at(&coordinator, reader.epoch()).into_iter().collect();
        assert_eq!(after, before, "{name}");
        reader.release();

        let now = coordinator.acquire();
        let current: HashSet<u32> = container.values_at(&coordinator, now.epoch()).into_iter().collect();
        assert_eq!(current, (100..164).collect::<HashSet<_>>(), "{name}");
    }
}

static LIVE_CANARIES: AtomicUsize = AtomicUsize::new(0);
const MAGIC: u64 = 0x5EED_CAFE_F00D_D00D;

/// A value that checks it is still intact whenever it is touched and
/// tracks how many copies are alive.
struct Canary {
    id: u32,
    magic: u64,
}

impl Canary {
    fn new(id: u32) -> Self {
        LIVE_CANARIES.fetch_add(1, Ordering::SeqCst);
        Self { id, magic: MAGIC }
    }

    fn check(&self) {
        assert_eq!(self.magic, MAGIC, "canary {} read after free", self.id);
    }
}

impl Clone for Canary {
    fn clone(&self) -> Self {
        self.check();
        Self::new(self.id)
    }
}

impl PartialEq for Canary {
    fn eq(&self, other: &Self) -> bool {
        self.check();
        other.check();
        self.id == other.id
    }
}

impl Eq for Canary {}

impl Hash for Canary {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.check();
        self.id.hash(state);
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.check();
        self.magic = 0;
        LIVE_CANARIES.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Heavy concurrent insert/erase/iterate never touches a freed value, and
/// every value is freed once the containers are gone.
#[test]
fn test_reclamation_safety() {
    for (name, container) in layouts::<Canary>() {
        let coordinator = Arc::new(EpochCoordinator::new());
        let stop = Arc::new(AtomicBool::new(false));

        let writers: Vec<_> = (0..4u64)
            .map(|seed| {
                let container = container.clone();
                let coordinator = coordinator.clone();
                thread::spawn(move || {
                    let mut rng = XorShift64::new(seed + 1);
                    for _ in 0..2000 {
                        let id = rng.next_below(32) as u32;
                        if rng.next() % 2 == 0 {
                            container.insert(&coordinator, Canary::new(id));
                        } else {
                            container.erase(&coordinator, Canary::new(id));
                        }
                        if rng.next_below(64) == 0 {
                            container.purge(&coordinator);
                        }
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let container = container.clone();
                let coordinator = coordinator.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        let token = coordinator.acquire();
                        let seen = container.values_at(&coordinator, token.epoch());
                        let again = container.values_at(&coordinator, token.epoch());
                        assert_eq!(seen.len(), again.len(), "{name}");
                        seen.iter().for_each(Canary::check);
                    }
                })
            })
            .collect();

        for w in writers {
            w.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        for r in readers {
            r.join().unwrap();
        }
        container.purge(&coordinator);
        drop(container);
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while LIVE_CANARIES.load(Ordering::SeqCst) != 0 {
        assert!(Instant::now() < deadline, "canaries leaked");
        collect();
        thread::sleep(Duration::from_millis(5));
    }
}

#[derive(Debug, Clone)]
enum Access {
    Insert(u8),
    Erase(u8),
}

fn access() -> impl Strategy<Value = Access> {
    prop_oneof![
        (0u8..16).prop_map(Access::Insert),
        (0u8..16).prop_map(Access::Erase),
    ]
}

proptest! {
    /// A value is present exactly while its inserts outnumber its erases,
    /// and each call reports presence changes the model agrees with.
    #[test]
    fn prop_counting_law(accesses in prop::collection::vec(access(), 1..150)) {
        for (name, container) in layouts::<u8>() {
            let coordinator = EpochCoordinator::new();
            let mut net: HashMap<u8, i64> = HashMap::new();

            for access in &accesses {
                let (value, delta) = match *access {
                    Access::Insert(v) => (v, 1),
                    Access::Erase(v) => (v, -1),
                };
                let before = net.get(&value).copied().unwrap_or(0);
                let after = before + delta;
                net.insert(value, after);

                let changed = if delta > 0 {
                    container.insert(&coordinator, value)
                } else {
                    container.erase(&coordinator, value)
                };
                prop_assert_eq!(changed, (before > 0) != (after > 0), "{}", name);
            }

            for (value, count) in &net {
                prop_assert_eq!(container.count_of(value), *count, "{}", name);
            }
            let reader = coordinator.acquire();
            let present: HashSet<u8> = container.values_at(&coordinator, reader.epoch()).into_iter().collect();
            let expected: HashSet<u8> = net.iter().filter(|(_, c)| **c > 0).map(|(v, _)| *v).collect();
            prop_assert_eq!(present, expected, "{}", name);
        }
    }
}
