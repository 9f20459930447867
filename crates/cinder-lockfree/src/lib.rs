//! # cinder-lockfree
//!
//! Lock-free containers built on the cinder reclamation substrate.
//!
//! - **Hash-trie**: persistent concurrent hash map (Ctrie) with constant-time
//!   snapshots; every write hands back the exact version it produced
//! - **Antiable multisets**: signed-multiplicity sets read at an epoch, as a
//!   list, a bucketed hash set, or per-value buckets in a hash-trie
//! - **Stack**: Treiber stack with whole-batch publication

pub mod antiable;
pub mod ctrie;
pub mod stack;

pub use antiable::{AntiableHashSet, AntiableHashSetConfig, AntiableHashTrie, AntiableList};
pub use ctrie::{
    Erasure, ErasureOutcome, HashTrie, HashTrieSet, Insertion, InsertionOutcome, Lookup, Snapshot,
};
pub use stack::Stack;
