//! Criterion benchmarks for the index lifecycle.
//!
//! Covers the hot paths a worker drives:
//! - Buffered writes and near-real-time refresh
//! - Searches through leased searchers
//! - Job queue submission and draining

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use hoplon::document::{DeleteRule, Document, Term};
use hoplon::job::{Job, JobQueue, Priority};
use hoplon::lifecycle::{LifecycleOptions, ManagedIndex};
use hoplon::query::{Query, SearchPaging};
use hoplon::registry::{IndexRegistry, MemoryEngineFactory};

const WORDS: [&str; 12] = [
    "index", "commit", "refresh", "lease", "reader", "writer", "segment", "merge", "queue",
    "worker", "search", "document",
];

/// Generate test documents for benchmarking.
fn generate_documents(count: usize) -> Vec<Document> {
    (0..count)
        .map(|i| {
            Document::builder()
                .add_field("id", i.to_string())
                .add_field("word", WORDS[i % WORDS.len()])
                .build()
        })
        .collect()
}

fn open_index(registry: &Arc<IndexRegistry>, id: &str) -> Arc<ManagedIndex> {
    registry.get_or_open(id).expect("open index")
}

fn bench_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("writes");
    let registry = IndexRegistry::new(
        Arc::new(MemoryEngineFactory::default()),
        LifecycleOptions::default(),
        4,
    );
    let index = open_index(&registry, "writes");
    let docs = generate_documents(100);

    group.throughput(Throughput::Elements(100));
    group.bench_function("update_100_documents", |b| {
        b.iter(|| {
            for doc in &docs {
                let id = doc.get_values("id")[0].to_string();
                let rule = DeleteRule::Term(Term::new("id", id));
                black_box(index.update_documents(Some(&rule), vec![doc.clone()]).unwrap());
            }
        })
    });

    group.bench_function("update_then_refresh", |b| {
        b.iter(|| {
            index.update_documents(None, docs[..10].to_vec()).unwrap();
            black_box(index.maybe_refresh().unwrap());
        })
    });

    group.sample_size(20);
    group.bench_function("update_then_commit", |b| {
        b.iter(|| {
            index.update_documents(None, docs[..10].to_vec()).unwrap();
            black_box(index.commit().unwrap());
        })
    });

    group.finish();
    registry.stop_all().unwrap();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("search");
    let registry = IndexRegistry::new(
        Arc::new(MemoryEngineFactory::default()),
        LifecycleOptions::default(),
        4,
    );
    let index = open_index(&registry, "search");
    index.update_documents(None, generate_documents(1000)).unwrap();
    index.commit().unwrap();
    index.maybe_refresh().unwrap();

    group.bench_function("term_query", |b| {
        let query = Query::term("word", "segment");
        b.iter(|| black_box(index.search(&query, SearchPaging::default()).unwrap()))
    });

    group.bench_function("book_and_release_searcher", |b| {
        b.iter(|| {
            let lease = index.book_searcher().unwrap();
            index.release_searcher(black_box(lease)).unwrap();
        })
    });

    group.finish();
    registry.stop_all().unwrap();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("job_queue");

    group.throughput(Throughput::Elements(1000));
    group.bench_function("submit_and_drain_1000", |b| {
        b.iter(|| {
            let queue = JobQueue::new();
            for i in 0..1000 {
                let priority = if i % 10 == 0 { Priority::High } else { Priority::Low };
                queue
                    .submit(Arc::new(Job::update(&i.to_string(), "idx", "bench", priority)))
                    .unwrap();
            }
            while let Some(job) = queue.next_job(Duration::ZERO) {
                black_box(job);
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_writes, bench_search, bench_queue);
criterion_main!(benches);
