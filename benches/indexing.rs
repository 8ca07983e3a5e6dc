//! Benchmarks for the write path, the planner, and posting queries.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tgx::{regexp_query, Index, IndexWriter, Version};

/// Deterministic pseudo-source corpus: enough trigram variety to make
/// posting lists non-trivial without touching the real filesystem.
fn synth_corpus(files: usize, lines: usize) -> Vec<(String, String)> {
    let words = [
        "index", "search", "trigram", "posting", "merge", "buffer", "reader", "writer",
        "query", "match", "stream", "delta",
    ];
    let mut corpus = Vec::with_capacity(files);
    for f in 0..files {
        let mut content = String::new();
        for l in 0..lines {
            let a = words[(f + l) % words.len()];
            let b = words[(f * 7 + l * 3) % words.len()];
            content.push_str(&format!("fn {}_{}_{}(x: u32) -> u32 {{ x + {} }}\n", a, b, l, f));
        }
        corpus.push((format!("src/gen/file{:04}.rs", f), content));
    }
    corpus
}

fn bench_index_write(c: &mut Criterion) {
    let corpus = synth_corpus(100, 50);
    c.bench_function("index_write_100_files", |b| {
        b.iter(|| {
            let dir = tempfile::tempdir().unwrap();
            let out = dir.path().join("idx");
            let mut w = IndexWriter::create(&out, Version::V2).unwrap();
            for (name, content) in &corpus {
                w.add(name, content.as_bytes()).unwrap();
            }
            w.flush().unwrap();
        })
    });
}

fn bench_posting_query(c: &mut Criterion) {
    let corpus = synth_corpus(500, 80);
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("idx");
    let mut w = IndexWriter::create(&out, Version::V2).unwrap();
    for (name, content) in &corpus {
        w.add(name, content.as_bytes()).unwrap();
    }
    w.flush().unwrap();
    let ix = Index::open(&out).unwrap();

    let hir = regex_syntax::parse("trigram_posting.*u32").unwrap();
    let q = regexp_query(&hir);
    c.bench_function("posting_query", |b| {
        b.iter(|| black_box(ix.posting_query(black_box(&q)).unwrap()))
    });
}

fn bench_planner(c: &mut Criterion) {
    let patterns = [
        r"Google.*Search",
        r"(?i)error",
        r"fn [a-z_]+\(",
        r"\bindex_(reader|writer)\b",
    ];
    let hirs: Vec<_> = patterns
        .iter()
        .map(|p| regex_syntax::parse(p).unwrap())
        .collect();
    c.bench_function("regexp_query_plan", |b| {
        b.iter(|| {
            for hir in &hirs {
                black_box(regexp_query(black_box(hir)));
            }
        })
    });
}

criterion_group!(benches, bench_index_write, bench_posting_query, bench_planner);
criterion_main!(benches);
