//! Benchmarks for the hash-trie and the stack.

use cinder_lockfree::{HashTrie, Stack};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use std::thread;

fn bench_trie_insert(c: &mut Criterion) {
    c.bench_function("trie_insert", |b| {
        let trie = HashTrie::new();
        let mut i = 0u64;
        b.iter(|| {
            trie.insert(black_box(i), i).unwrap();
            i += 1;
        });
    });
}

fn bench_trie_lookup(c: &mut Criterion) {
    let trie = HashTrie::new();
    for i in 0..10_000u64 {
        trie.insert(i, i).unwrap();
    }
    let mut i = 0u64;
    c.bench_function("trie_lookup", |b| {
        b.iter(|| {
            black_box(trie.get(&(i % 10_000)));
            i += 1;
        });
    });
}

fn bench_trie_snapshot(c: &mut Criterion) {
    let trie = HashTrie::new();
    for i in 0..10_000u64 {
        trie.insert(i, i).unwrap();
    }
    c.bench_function("trie_snapshot", |b| {
        b.iter(|| black_box(trie.snapshot().unwrap()));
    });
}

fn bench_concurrent_insert(c: &mut Criterion) {
    c.bench_function("trie_concurrent_insert", |b| {
        b.iter(|| {
            let trie = Arc::new(HashTrie::new());
            let mut handles = vec![];

            for t in 0..4u64 {
                let trie = trie.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..1000 {
                        trie.insert(t * 1000 + i, i).unwrap();
                    }
                }));
            }

            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

fn bench_stack_concurrent(c: &mut Criterion) {
    c.bench_function("stack_concurrent", |b| {
        b.iter(|| {
            let stack = Arc::new(Stack::new());
            let mut handles = vec![];

            // Producers
            for _ in 0..4 {
                let s = stack.clone();
                handles.push(thread::spawn(move || {
                    for i in 0..1000u64 {
                        s.push(i);
                    }
                }));
            }

            // Consumers
            for _ in 0..4 {
                let s = stack.clone();
                handles.push(thread::spawn(move || {
                    for _ in 0..1000 {
                        let _ = s.pop();
                    }
                }));
            }

            for h in handles {
                h.join().unwrap();
            }
        });
    });
}

criterion_group!(
    benches,
    bench_trie_insert,
    bench_trie_lookup,
    bench_trie_snapshot,
    bench_concurrent_insert,
    bench_stack_concurrent
);
criterion_main!(benches);
